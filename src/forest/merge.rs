//! Merging two compatible forests.
//!
//! The second forest's trees are re-keyed onto the first forest's predictor
//! order (and, for classification, its response-value domain) so the merged
//! forest predicts as if every tree had been trained against the first
//! forest's layout. The merged forest carries no out-of-bag error.

use std::collections::HashMap;

use super::{Forest, ForestKind};
use crate::errors::{Error, Result};

/// Map every value of `from_values` to its position in `to_values`.
///
/// Fails when a value is missing from `to_values` (the domains are not
/// nested) or the assignment is not injective.
fn make_key_map<T: PartialEq>(from_values: &[T], to_values: &[T]) -> Result<HashMap<usize, usize>> {
    let mut key_map = HashMap::with_capacity(from_values.len());
    let mut assigned = vec![false; to_values.len()];
    for (from, value) in from_values.iter().enumerate() {
        let to = to_values
            .iter()
            .position(|candidate| candidate == value)
            .ok_or_else(|| Error::domain("mapped value must be from same domain"))?;
        if assigned[to] {
            return Err(Error::domain("mapping must be injective"));
        }
        assigned[to] = true;
        key_map.insert(from, to);
    }
    Ok(key_map)
}

/// Merge two forests; `x` provides the predictor order and (for
/// classification) the response-value domain of the result.
pub fn merge_forests(
    x: &Forest,
    y: &Forest,
    x_predictor_names: &[String],
    y_predictor_names: &[String],
) -> Result<Forest> {
    if x.tree_type() != y.tree_type() {
        return Err(Error::invalid("forest type must match"));
    }
    let n_predictor = x.n_predictor();
    if n_predictor != y.n_predictor() {
        return Err(Error::invalid("forest predictor count must match"));
    }
    if x_predictor_names.len() != n_predictor || y_predictor_names.len() != n_predictor {
        return Err(Error::invalid(
            "predictor names must match the number of predictors",
        ));
    }

    let predictor_map = make_key_map(y_predictor_names, x_predictor_names)?;
    for (&from, &to) in &predictor_map {
        if y.is_ordered()[from] != x.is_ordered()[to] {
            return Err(Error::invalid("predictors must have same ordered property"));
        }
    }

    let kind = match (x.kind(), y.kind()) {
        (
            ForestKind::Classification { response_values: x_values, trees: x_trees },
            ForestKind::Classification { response_values: y_values, trees: y_trees },
        ) => {
            // The second forest's response values must be a subset of the
            // first's so its leaf keys can be rewritten.
            let response_map = make_key_map(y_values, x_values)?;
            let mut trees = x_trees.clone();
            trees.reserve(y_trees.len());
            for tree in y_trees {
                let mut merged = tree.clone();
                merged.transform_split_keys(&predictor_map)?;
                merged.transform_response_keys(&response_map, x_values.len())?;
                trees.push(merged);
            }
            ForestKind::Classification {
                response_values: x_values.clone(),
                trees,
            }
        }
        (
            ForestKind::Regression { trees: x_trees },
            ForestKind::Regression { trees: y_trees },
        ) => {
            let mut trees = x_trees.clone();
            trees.reserve(y_trees.len());
            for tree in y_trees {
                let mut merged = tree.clone();
                merged.transform_split_keys(&predictor_map)?;
                trees.push(merged);
            }
            ForestKind::Regression { trees }
        }
        _ => unreachable!("tree types checked above"),
    };

    Ok(Forest::from_parts(
        x.save_memory(),
        n_predictor,
        x.is_ordered_shared(),
        kind,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Data, DenseMatrix};
    use crate::forest::PlantOptions;
    use crate::params::{SplitRule, TrainingParameters, TreeType};
    use crate::progress::Monitor;

    fn names(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    fn parameters(n_tree: usize, n_try: usize) -> Vec<TrainingParameters> {
        vec![
            TrainingParameters {
                replace: false,
                sample_fraction: vec![1.0],
                n_try,
                draw_always_predictor_keys: Vec::new(),
                draw_predictor_weights: Vec::new(),
                response_weights: Vec::new(),
                split_rule: SplitRule::Logrank,
                min_metric_decrease: 0.0,
                max_depth: 0,
                min_split_n_sample: 2,
                min_leaf_n_sample: 1,
                n_random_split: 0,
                min_prop: 0.1,
            };
            n_tree
        ]
    }

    fn plant_two_column(column_order_swapped: bool, seed: u64) -> Forest {
        // Column "a" carries the signal; column "b" is constant.
        let rows: Vec<[f64; 2]> = (0..6)
            .map(|j| {
                let a = j as f64;
                let b = 1.0;
                if column_order_swapped { [b, a] } else { [a, b] }
            })
            .collect();
        let x = DenseMatrix::from_vec(rows.concat(), 6, 2);
        let y = DenseMatrix::from_column(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let mut data = Data::from_dense(x, y).unwrap();
        let (forest, _) = Forest::plant(
            TreeType::Classification,
            false,
            vec![true, true],
            &parameters(2, 2),
            &mut data,
            &[],
            &PlantOptions { seed, n_thread: 1, compute_oob_error: false },
            &Monitor::silent(),
        )
        .unwrap();
        forest
    }

    #[test]
    fn merged_forest_has_summed_tree_count() {
        let x = plant_two_column(false, 3);
        let y = plant_two_column(true, 4);
        let merged = merge_forests(
            &x,
            &y,
            &names(&["a", "b"]),
            &names(&["b", "a"]),
        )
        .unwrap();
        assert_eq!(merged.n_tree(), x.n_tree() + y.n_tree());
        assert_eq!(merged.tree_type(), TreeType::Classification);
        assert_eq!(merged.response_values(), x.response_values());
    }

    #[test]
    fn merge_remaps_second_forest_split_keys() {
        let x = plant_two_column(false, 3);
        let y = plant_two_column(true, 4);
        // In y the signal lives in column 1 ("a"); after the merge it must
        // be re-keyed to column 0 to match x's layout.
        let merged = merge_forests(&x, &y, &names(&["a", "b"]), &names(&["b", "a"])).unwrap();
        if let ForestKind::Classification { trees, .. } = merged.kind() {
            for tree in trees {
                assert_eq!(tree.skeleton().split_keys()[0], 0);
            }
        } else {
            panic!("expected classification forest");
        }
    }

    #[test]
    fn merge_rejects_mismatched_ordering() {
        let x = plant_two_column(false, 3);
        let mut data = {
            let rows: Vec<[f64; 2]> = (0..6).map(|j| [j as f64, 1.0]).collect();
            let x_matrix = DenseMatrix::from_vec(rows.concat(), 6, 2);
            let y_matrix = DenseMatrix::from_column(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
            Data::from_dense(x_matrix, y_matrix).unwrap()
        };
        let (y, _) = Forest::plant(
            TreeType::Classification,
            false,
            vec![true, false],
            &parameters(1, 2),
            &mut data,
            &[],
            &PlantOptions { seed: 5, n_thread: 1, compute_oob_error: false },
            &Monitor::silent(),
        )
        .unwrap();
        let result = merge_forests(&x, &y, &names(&["a", "b"]), &names(&["a", "b"]));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn merge_rejects_unknown_predictor_names() {
        let x = plant_two_column(false, 3);
        let y = plant_two_column(false, 4);
        let result = merge_forests(&x, &y, &names(&["a", "b"]), &names(&["a", "c"]));
        assert!(matches!(result, Err(Error::Domain(_))));
    }
}
