//! Forest merging: tree counts, split-key remapping against reordered
//! predictor columns, and response-domain compatibility.

use foresters::{Data, DenseMatrix, Error, Predictions, RandomForest, RandomForestSettings};

fn names(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|s| s.to_string()).collect()
}

/// The same 40-case data set, with the signal in column "a" and noise in
/// column "b"; `swapped` reverses the physical column order.
fn two_column_data(swapped: bool) -> Data {
    let n = 40;
    let noise = foresters::testing::random_dense(n, 1, 55, 0.0, 1.0);
    let mut values = Vec::with_capacity(n * 2);
    for j in 0..n {
        let a = j as f64;
        let b = noise[j];
        if swapped {
            values.extend([b, a]);
        } else {
            values.extend([a, b]);
        }
    }
    let x = DenseMatrix::from_vec(values, n, 2);
    let y = DenseMatrix::from_column((0..n).map(|j| if j >= 20 { 1.0 } else { 0.0 }).collect());
    Data::from_dense(x, y).unwrap()
}

fn settings(predictor_names: Vec<String>, seed: u64) -> RandomForestSettings {
    RandomForestSettings {
        tree_type: "classification".to_string(),
        n_tree: 3,
        n_try: 2,
        predictor_names,
        seed,
        n_thread: 1,
        replace: false,
        sample_fraction: vec![1.0],
        ..Default::default()
    }
}

#[test]
fn merge_concatenates_trees_and_remaps_nodes() {
    let mut data_ab = two_column_data(false);
    let mut data_ba = two_column_data(true);

    let mut first = RandomForest::train(&settings(names(&["a", "b"]), 1), &mut data_ab, &[]).unwrap();
    let mut second = RandomForest::train(&settings(names(&["b", "a"]), 2), &mut data_ba, &[]).unwrap();

    let mut merged = RandomForest::merge(&first, &second).unwrap();
    assert_eq!(
        merged.forest().n_tree(),
        first.forest().n_tree() + second.forest().n_tree()
    );
    assert_eq!(merged.oob_error(), None);

    // NODES predictions of the merged forest on input in the first model's
    // column order: the leading columns match the first forest, the
    // trailing columns match the second forest evaluated on its own column
    // order.
    let merged_nodes = match merged.predict(&data_ab, "nodes", 9, 1, false).unwrap() {
        Predictions::Nodes(matrix) => matrix,
        Predictions::Values(_) => panic!("expected node matrix"),
    };
    let first_nodes = match first.predict(&data_ab, "nodes", 9, 1, false).unwrap() {
        Predictions::Nodes(matrix) => matrix,
        Predictions::Values(_) => panic!("expected node matrix"),
    };
    let second_nodes = match second.predict(&data_ba, "nodes", 9, 1, false).unwrap() {
        Predictions::Nodes(matrix) => matrix,
        Predictions::Values(_) => panic!("expected node matrix"),
    };

    let n_first = first.forest().n_tree();
    for row in 0..data_ab.n_row() {
        for tree in 0..n_first {
            assert_eq!(merged_nodes[(row, tree)], first_nodes[(row, tree)]);
        }
        for tree in 0..second.forest().n_tree() {
            assert_eq!(merged_nodes[(row, n_first + tree)], second_nodes[(row, tree)]);
        }
    }
}

#[test]
fn merged_bagged_predictions_stay_in_response_domain() {
    let mut data_ab = two_column_data(false);
    let mut data_ba = two_column_data(true);
    let first = RandomForest::train(&settings(names(&["a", "b"]), 1), &mut data_ab, &[]).unwrap();
    let second = RandomForest::train(&settings(names(&["b", "a"]), 2), &mut data_ba, &[]).unwrap();
    let mut merged = RandomForest::merge(&first, &second).unwrap();

    match merged.predict(&data_ab, "bagged", 3, 1, false).unwrap() {
        Predictions::Values(values) => {
            assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
            // The signal column separates the classes cleanly, so the
            // merged forest should recover the labels.
            assert_eq!(values[0], 0.0);
            assert_eq!(values[39], 1.0);
        }
        Predictions::Nodes(_) => panic!("expected values"),
    }
}

#[test]
fn merge_requires_matching_tree_type() {
    let mut data = two_column_data(false);
    let classification =
        RandomForest::train(&settings(names(&["a", "b"]), 1), &mut data, &[]).unwrap();

    let mut regression_data = two_column_data(false);
    let regression_settings = RandomForestSettings {
        tree_type: "regression".to_string(),
        split_rule: "variance".to_string(),
        ..settings(names(&["a", "b"]), 2)
    };
    let regression =
        RandomForest::train(&regression_settings, &mut regression_data, &[]).unwrap();

    assert!(matches!(
        RandomForest::merge(&classification, &regression),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn merge_requires_nested_response_domains() {
    // The second forest sees a third class the first never observed.
    let mut binary_data = two_column_data(false);
    let first = RandomForest::train(&settings(names(&["a", "b"]), 1), &mut binary_data, &[]).unwrap();

    let n = 40;
    let noise = foresters::testing::random_dense(n, 1, 55, 0.0, 1.0);
    let mut values = Vec::with_capacity(n * 2);
    for j in 0..n {
        values.extend([j as f64, noise[j]]);
    }
    let x = DenseMatrix::from_vec(values, n, 2);
    let y = DenseMatrix::from_column((0..n).map(|j| f64::from((j / 14) as u32)).collect());
    let mut ternary_data = Data::from_dense(x, y).unwrap();
    let second = RandomForest::train(&settings(names(&["a", "b"]), 2), &mut ternary_data, &[]).unwrap();

    assert!(matches!(
        RandomForest::merge(&first, &second),
        Err(Error::Domain(_))
    ));
}
