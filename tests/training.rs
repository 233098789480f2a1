//! End-to-end training behaviour: the trivial scenarios, argument guards,
//! determinism, and structural invariants.

use foresters::{
    Data, DenseMatrix, Error, ForestKind, Predictions, RandomForest, RandomForestSettings,
    SplitValue, TreeType,
};

fn names(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|s| s.to_string()).collect()
}

fn trivial_classification_settings() -> RandomForestSettings {
    RandomForestSettings {
        tree_type: "classification".to_string(),
        n_tree: 1,
        predictor_names: names(&["x0"]),
        split_rule: "gini".to_string(),
        min_split_n_sample: 2,
        min_leaf_n_sample: 1,
        n_try: 1,
        seed: 1,
        replace: false,
        sample_fraction: vec![1.0],
        n_thread: 1,
        ..Default::default()
    }
}

fn step_data() -> Data {
    let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0], 4, 1);
    let y = DenseMatrix::from_column(vec![0.0, 0.0, 1.0, 1.0]);
    Data::from_dense(x, y).unwrap()
}

#[test]
fn trivial_classification() {
    let mut data = step_data();
    let mut model = RandomForest::train(&trivial_classification_settings(), &mut data, &[]).unwrap();

    assert_eq!(model.tree_type(), TreeType::Classification);
    assert_eq!(model.n_try(), 1);
    assert_eq!(model.min_split_n_sample(), 2);
    assert_eq!(model.min_leaf_n_sample(), 1);

    // A single split on predictor 0 with the boundary between 1 and 2.
    match model.forest().kind() {
        ForestKind::Classification { trees, .. } => {
            assert_eq!(trees.len(), 1);
            let skeleton = trees[0].skeleton();
            assert_eq!(skeleton.n_node(), 3);
            assert_eq!(skeleton.split_keys()[0], 0);
            match skeleton.split_values()[0] {
                SplitValue::Threshold(v) => assert!((1.0..2.0).contains(&v), "threshold {v}"),
                SplitValue::Partition(_) => panic!("expected threshold"),
            }
        }
        ForestKind::Regression { .. } => panic!("expected classification forest"),
    }

    let predictions = model.predict(&data, "bagged", 1, 1, false).unwrap();
    assert_eq!(predictions, Predictions::Values(vec![0.0, 0.0, 1.0, 1.0]));
}

#[test]
fn trivial_regression() {
    let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0], 4, 1);
    let y = DenseMatrix::from_column(vec![1.0, 2.0, 3.0, 4.0]);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        tree_type: "regression".to_string(),
        split_rule: "variance".to_string(),
        ..trivial_classification_settings()
    };
    let mut model = RandomForest::train(&settings, &mut data, &[]).unwrap();
    assert_eq!(model.tree_type(), TreeType::Regression);

    match model.forest().kind() {
        ForestKind::Regression { trees } => {
            assert!(trees[0].skeleton().n_node() >= 3);
            assert_eq!(trees[0].skeleton().split_keys()[0], 0);
        }
        ForestKind::Classification { .. } => panic!("expected regression forest"),
    }

    match model.predict(&data, "bagged", 1, 1, false).unwrap() {
        Predictions::Values(values) => {
            for pair in values.windows(2) {
                assert!(pair[0] <= pair[1], "predictions not monotone: {values:?}");
            }
        }
        Predictions::Nodes(_) => panic!("expected values"),
    }
}

#[test]
fn hellinger_guard_rejects_three_classes() {
    let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 6, 1);
    let y = DenseMatrix::from_column(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        split_rule: "hellinger".to_string(),
        ..trivial_classification_settings()
    };
    let result = RandomForest::train(&settings, &mut data, &[]);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn response_wise_sampling_excludes_case_weights() {
    let mut data = step_data();
    let settings = RandomForestSettings {
        sample_fraction: vec![0.5, 0.5],
        ..trivial_classification_settings()
    };
    let result = RandomForest::train(&settings, &mut data, &[1.0, 1.0, 1.0, 1.0]);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn unknown_names_are_rejected() {
    let mut data = step_data();
    for (field, settings) in [
        (
            "tree type",
            RandomForestSettings {
                tree_type: "survival".to_string(),
                ..trivial_classification_settings()
            },
        ),
        (
            "split rule",
            RandomForestSettings {
                split_rule: "Gini".to_string(),
                ..trivial_classification_settings()
            },
        ),
    ] {
        let result = RandomForest::train(&settings, &mut data, &[]);
        assert!(
            matches!(result, Err(Error::InvalidArgument(_))),
            "expected rejection for bad {field}"
        );
    }

    let mut model = RandomForest::train(&trivial_classification_settings(), &mut data, &[]).unwrap();
    assert!(matches!(
        model.predict(&data, "Bagged", 1, 1, false),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn maxstat_is_rejected_for_classification() {
    let mut data = step_data();
    let settings = RandomForestSettings {
        split_rule: "maxstat".to_string(),
        ..trivial_classification_settings()
    };
    assert!(matches!(
        RandomForest::train(&settings, &mut data, &[]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn training_is_deterministic_in_seed() {
    let features = foresters::testing::random_dense(60, 4, 11, 0.0, 1.0);
    let targets = foresters::testing::binary_targets(&features, 60, 4, 12, 0.2);

    let settings = RandomForestSettings {
        tree_type: "classification".to_string(),
        n_tree: 8,
        predictor_names: names(&["a", "b", "c", "d"]),
        seed: 99,
        n_thread: 2,
        ..Default::default()
    };

    let train = |settings: &RandomForestSettings| {
        let x = DenseMatrix::from_vec(features.clone(), 60, 4);
        let y = DenseMatrix::from_column(targets.clone());
        let mut data = Data::from_dense(x, y).unwrap();
        RandomForest::train(settings, &mut data, &[]).unwrap()
    };

    let first = train(&settings);
    let second = train(&settings);
    assert_eq!(first.forest(), second.forest());
    assert_eq!(first.oob_error(), second.oob_error());

    // Determinism holds across the save-memory split-search path too.
    let save_memory = RandomForestSettings { save_memory: true, ..settings.clone() };
    let third = train(&save_memory);
    let fourth = train(&save_memory);
    assert_eq!(third.forest(), fourth.forest());
}

#[test]
fn structural_invariants_hold_for_every_tree() {
    let features = foresters::testing::random_dense(80, 3, 21, 0.0, 1.0);
    let targets = foresters::testing::binary_targets(&features, 80, 3, 22, 0.1);
    let x = DenseMatrix::from_vec(features.clone(), 80, 3);
    let y = DenseMatrix::from_column(targets);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        tree_type: "classification".to_string(),
        n_tree: 10,
        predictor_names: names(&["a", "b", "c"]),
        seed: 5,
        ..Default::default()
    };
    let model = RandomForest::train(&settings, &mut data, &[]).unwrap();

    let trees = match model.forest().kind() {
        ForestKind::Classification { trees, .. } => trees,
        ForestKind::Regression { .. } => panic!("expected classification forest"),
    };
    for tree in trees {
        let skeleton = tree.skeleton();
        for node in 0..skeleton.n_node() {
            if skeleton.is_leaf(node) {
                continue;
            }
            let left = skeleton.left_children()[node];
            let right = skeleton.right_children()[node];
            assert_ne!(left, 0, "internal node without left child");
            assert_ne!(right, 0, "internal node without right child");
            assert_ne!(left, right, "children collide");
            assert!(left < skeleton.n_node() && right < skeleton.n_node());
            assert!(skeleton.split_keys()[node] < 3, "split key out of range");

            // Routing consistency: rows reaching the children satisfy the
            // split predicate of the parent.
            let split_key = skeleton.split_keys()[node];
            if let SplitValue::Threshold(threshold) = skeleton.split_values()[node] {
                for row in 0..data.n_row() {
                    let mut cursor = 0;
                    while !skeleton.is_leaf(cursor) && cursor != node {
                        let value = data.get_x(row, skeleton.split_keys()[cursor], false);
                        cursor = if skeleton.split_values()[cursor].goes_left(value) {
                            skeleton.left_children()[cursor]
                        } else {
                            skeleton.right_children()[cursor]
                        };
                    }
                    if cursor == node {
                        let value = data.get_x(row, split_key, false);
                        if value <= threshold {
                            assert!(skeleton.split_values()[node].goes_left(value));
                        } else {
                            assert!(!skeleton.split_values()[node].goes_left(value));
                        }
                    }
                }
            }
        }
    }

    // OOB sanity for classification.
    let oob = model.oob_error().unwrap();
    assert!((0.0..=1.0).contains(&oob), "oob = {oob}");
}

#[test]
fn regression_oob_error_is_non_negative() {
    let features = foresters::testing::random_dense(64, 3, 31, 0.0, 1.0);
    let targets = foresters::testing::linear_targets(&features, 64, 3, 32, 0.05);
    let x = DenseMatrix::from_vec(features, 64, 3);
    let y = DenseMatrix::from_column(targets);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        tree_type: "regression".to_string(),
        split_rule: "variance".to_string(),
        n_tree: 12,
        predictor_names: names(&["a", "b", "c"]),
        seed: 8,
        ..Default::default()
    };
    let model = RandomForest::train(&settings, &mut data, &[]).unwrap();
    assert!(model.oob_error().unwrap() >= 0.0);
}

#[test]
fn all_constant_response_gives_terminal_roots() {
    let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0], 4, 1);
    let y = DenseMatrix::from_column(vec![7.0; 4]);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        n_tree: 3,
        ..trivial_classification_settings()
    };
    let model = RandomForest::train(&settings, &mut data, &[]).unwrap();
    if let ForestKind::Classification { trees, .. } = model.forest().kind() {
        for tree in trees {
            assert_eq!(tree.skeleton().n_node(), 1);
            assert!(tree.skeleton().is_leaf(0));
        }
    }
}

#[test]
fn all_constant_predictor_gives_terminal_roots() {
    let x = DenseMatrix::from_vec(vec![2.0; 4], 4, 1);
    let y = DenseMatrix::from_column(vec![0.0, 1.0, 0.0, 1.0]);
    let mut data = Data::from_dense(x, y).unwrap();

    let model = RandomForest::train(&trivial_classification_settings(), &mut data, &[]).unwrap();
    if let ForestKind::Classification { trees, .. } = model.forest().kind() {
        assert!(trees[0].skeleton().is_leaf(0));
    }
}

#[test]
fn response_wise_fractions_clip_without_overrun() {
    // Rounded cumulative sums ask for more rows than the class holds; the
    // draw must clip instead of reading out of range.
    let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 6, 1);
    let y = DenseMatrix::from_column(vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        sample_fraction: vec![0.9, 0.9],
        n_tree: 4,
        replace: false,
        ..trivial_classification_settings()
    };
    let model = RandomForest::train(&settings, &mut data, &[]).unwrap();
    assert_eq!(model.forest().n_tree(), 4);
}

#[test]
fn default_n_try_is_floor_sqrt() {
    let features = foresters::testing::random_dense(30, 9, 41, 0.0, 1.0);
    let targets = foresters::testing::binary_targets(&features, 30, 9, 42, 0.1);
    let x = DenseMatrix::from_vec(features, 30, 9);
    let y = DenseMatrix::from_column(targets);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        n_tree: 2,
        n_try: 0,
        predictor_names: names(&["a", "b", "c", "d", "e", "f", "g", "h", "i"]),
        tree_type: "classification".to_string(),
        seed: 2,
        ..Default::default()
    };
    let model = RandomForest::train(&settings, &mut data, &[]).unwrap();
    assert_eq!(model.n_try(), 3);
    assert_eq!(model.min_split_n_sample(), 2);
    assert_eq!(model.min_leaf_n_sample(), 1);
}

#[test]
fn sparse_and_dense_predictors_agree() {
    // The same matrix through both backends must grow identical forests.
    let dense_values = vec![
        0.0, 1.0, //
        2.0, 0.0, //
        0.0, 3.0, //
        4.0, 0.0, //
        0.0, 5.0, //
        6.0, 0.0, //
    ];
    let targets = vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0];

    let dense = DenseMatrix::from_vec(dense_values.clone(), 6, 2);
    let sparse = foresters::SparseColMatrix::new(
        6,
        2,
        vec![0, 3, 6],
        vec![1, 3, 5, 0, 2, 4],
        vec![2.0, 4.0, 6.0, 1.0, 3.0, 5.0],
    )
    .unwrap();

    let settings = RandomForestSettings {
        tree_type: "classification".to_string(),
        n_tree: 4,
        n_try: 2,
        predictor_names: names(&["a", "b"]),
        seed: 13,
        n_thread: 1,
        ..Default::default()
    };

    let mut dense_data =
        Data::from_dense(dense, DenseMatrix::from_column(targets.clone())).unwrap();
    let dense_model = RandomForest::train(&settings, &mut dense_data, &[]).unwrap();

    let mut sparse_data =
        Data::new(Box::new(sparse), DenseMatrix::from_column(targets)).unwrap();
    let sparse_model = RandomForest::train(&settings, &mut sparse_data, &[]).unwrap();

    assert_eq!(dense_model.forest(), sparse_model.forest());
}

#[test]
fn case_weights_focus_the_sample() {
    // Rows 0..4 carry all the weight; every in-bag sample must come from
    // them, so the leaves never contain the heavy tail value.
    let x = DenseMatrix::from_vec((0..8).map(f64::from).collect(), 8, 1);
    let y = DenseMatrix::from_column(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    let mut data = Data::from_dense(x, y).unwrap();

    let settings = RandomForestSettings {
        n_tree: 4,
        replace: true,
        sample_fraction: vec![1.0],
        ..trivial_classification_settings()
    };
    let weights = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
    let model = RandomForest::train(&settings, &mut data, &weights).unwrap();

    if let ForestKind::Classification { trees, response_values } = model.forest().kind() {
        let heavy_key = response_values.iter().position(|v| *v == 2.0);
        for tree in trees {
            for leaf in tree.leaf_keys() {
                for key in leaf {
                    assert_ne!(Some(*key), heavy_key, "zero-weight row was drawn in-bag");
                }
            }
        }
    }
}
