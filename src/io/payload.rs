//! Payload structures for the binary model format.
//!
//! These mirror the runtime types but flatten per-node containers into
//! packed arrays for compact storage. Growth workspaces are never
//! persisted; loading reconstructs exactly the state needed for
//! prediction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::DeserializeError;
use crate::forest::{Forest, ForestKind};
use crate::params::{SplitRule, TreeType};
use crate::tree::classification::ClassificationTree;
use crate::tree::regression::RegressionTree;
use crate::tree::{SplitValue, TreeSkeleton};

// ============================================================================
// Top level
// ============================================================================

/// Version-tagged payload; new format versions add variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    V1(PayloadV1),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadV1 {
    pub metadata: ModelMetadata,
    pub forest: ForestPayload,
}

/// Training call metadata persisted alongside the forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub tree_type: TreeType,
    pub predictor_names: Vec<String>,
    pub names_of_unordered: Vec<String>,
    pub n_tree: u32,
    pub n_try: u32,
    pub split_rule: SplitRule,
    pub max_depth: u32,
    pub min_metric_decrease: f64,
    pub min_split_n_sample: u32,
    pub min_leaf_n_sample: u32,
    pub seed: u64,
    pub oob_error: Option<f64>,
    /// Present only for the extratrees rule.
    pub n_random_split: Option<u32>,
    /// Observed response values (classification; empty for regression).
    pub response_values: Vec<f64>,
}

/// Forest payload, polymorphic over the tree type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForestPayload {
    Classification(ClassificationForestPayload),
    Regression(RegressionForestPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationForestPayload {
    pub save_memory: bool,
    pub n_predictor: u32,
    pub is_ordered: Vec<bool>,
    pub response_values: Vec<f64>,
    pub trees: Vec<ClassificationTreePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionForestPayload {
    pub save_memory: bool,
    pub n_predictor: u32,
    pub is_ordered: Vec<bool>,
    pub trees: Vec<RegressionTreePayload>,
}

// ============================================================================
// Trees
// ============================================================================

/// Node arrays shared by both tree kinds. Partition masks are packed in
/// node order; `split_kinds[j] == 1` marks node `j` as a partition split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNodesPayload {
    pub n_node: u32,
    pub split_keys: Vec<u32>,
    pub split_kinds: Vec<u8>,
    /// Threshold per node; 0.0 for partition splits and leaves.
    pub thresholds: Vec<f64>,
    /// Masks for partition-split nodes, in node order.
    pub partition_masks: Vec<u64>,
    pub left_children: Vec<u32>,
    pub right_children: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTreePayload {
    pub nodes: TreeNodesPayload,
    pub response_weights: Vec<f64>,
    /// Leaf sizes per node; the keys are packed in node order.
    pub leaf_counts: Vec<u32>,
    pub leaf_keys: Vec<u32>,
    /// Cached majority keys as packed (node, key) pairs.
    pub most_frequent_nodes: Vec<u32>,
    pub most_frequent_keys: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTreePayload {
    pub nodes: TreeNodesPayload,
    /// Leaf sizes per node; the values are packed in node order.
    pub leaf_counts: Vec<u32>,
    pub leaf_values: Vec<f64>,
    /// Cached leaf means as packed (node, mean) pairs.
    pub mean_nodes: Vec<u32>,
    pub mean_values: Vec<f64>,
}

// ============================================================================
// Runtime -> payload
// ============================================================================

fn nodes_to_payload(skeleton: &TreeSkeleton) -> TreeNodesPayload {
    let n_node = skeleton.n_node();
    let mut split_kinds = Vec::with_capacity(n_node);
    let mut thresholds = Vec::with_capacity(n_node);
    let mut partition_masks = Vec::new();
    for value in skeleton.split_values() {
        match value {
            SplitValue::Threshold(threshold) => {
                split_kinds.push(0);
                thresholds.push(*threshold);
            }
            SplitValue::Partition(mask) => {
                split_kinds.push(1);
                thresholds.push(0.0);
                partition_masks.push(*mask);
            }
        }
    }
    TreeNodesPayload {
        n_node: n_node as u32,
        split_keys: skeleton.split_keys().iter().map(|&k| k as u32).collect(),
        split_kinds,
        thresholds,
        partition_masks,
        left_children: skeleton.left_children().iter().map(|&k| k as u32).collect(),
        right_children: skeleton.right_children().iter().map(|&k| k as u32).collect(),
    }
}

fn classification_tree_to_payload(tree: &ClassificationTree) -> ClassificationTreePayload {
    let mut leaf_counts = Vec::with_capacity(tree.leaf_keys().len());
    let mut leaf_keys = Vec::new();
    for leaf in tree.leaf_keys() {
        leaf_counts.push(leaf.len() as u32);
        leaf_keys.extend(leaf.iter().map(|&k| k as u32));
    }
    let mut most_frequent_nodes = Vec::new();
    let mut most_frequent_keys = Vec::new();
    for (node_key, cached) in tree.leaf_most_frequent().iter().enumerate() {
        if let Some(key) = cached {
            most_frequent_nodes.push(node_key as u32);
            most_frequent_keys.push(*key as u32);
        }
    }
    ClassificationTreePayload {
        nodes: nodes_to_payload(tree.skeleton()),
        response_weights: tree.response_weights().to_vec(),
        leaf_counts,
        leaf_keys,
        most_frequent_nodes,
        most_frequent_keys,
    }
}

fn regression_tree_to_payload(tree: &RegressionTree) -> RegressionTreePayload {
    let mut leaf_counts = Vec::with_capacity(tree.leaf_values().len());
    let mut leaf_values = Vec::new();
    for leaf in tree.leaf_values() {
        leaf_counts.push(leaf.len() as u32);
        leaf_values.extend(leaf.iter().copied());
    }
    let mut mean_nodes = Vec::new();
    let mut mean_values = Vec::new();
    for (node_key, cached) in tree.leaf_mean().iter().enumerate() {
        if let Some(mean) = cached {
            mean_nodes.push(node_key as u32);
            mean_values.push(*mean);
        }
    }
    RegressionTreePayload {
        nodes: nodes_to_payload(tree.skeleton()),
        leaf_counts,
        leaf_values,
        mean_nodes,
        mean_values,
    }
}

pub(super) fn forest_to_payload(forest: &Forest) -> ForestPayload {
    match forest.kind() {
        ForestKind::Classification { response_values, trees } => {
            ForestPayload::Classification(ClassificationForestPayload {
                save_memory: forest.save_memory(),
                n_predictor: forest.n_predictor() as u32,
                is_ordered: forest.is_ordered().to_vec(),
                response_values: response_values.clone(),
                trees: trees.iter().map(classification_tree_to_payload).collect(),
            })
        }
        ForestKind::Regression { trees } => ForestPayload::Regression(RegressionForestPayload {
            save_memory: forest.save_memory(),
            n_predictor: forest.n_predictor() as u32,
            is_ordered: forest.is_ordered().to_vec(),
            trees: trees.iter().map(regression_tree_to_payload).collect(),
        }),
    }
}

// ============================================================================
// Payload -> runtime
// ============================================================================

fn corrupt(message: &str) -> DeserializeError {
    DeserializeError::CorruptPayload(message.to_string())
}

fn nodes_from_payload(
    nodes: TreeNodesPayload,
    save_memory: bool,
    n_predictor: usize,
    is_ordered: Arc<Vec<bool>>,
) -> Result<TreeSkeleton, DeserializeError> {
    let n_node = nodes.n_node as usize;
    if nodes.split_keys.len() != n_node
        || nodes.split_kinds.len() != n_node
        || nodes.thresholds.len() != n_node
        || nodes.left_children.len() != n_node
        || nodes.right_children.len() != n_node
    {
        return Err(corrupt("node array lengths disagree"));
    }
    let n_partition = nodes.split_kinds.iter().filter(|&&kind| kind == 1).count();
    if n_partition != nodes.partition_masks.len() {
        return Err(corrupt("partition mask count disagrees with split kinds"));
    }

    let mut masks = nodes.partition_masks.into_iter();
    let mut split_values = Vec::with_capacity(n_node);
    for (&kind, &threshold) in nodes.split_kinds.iter().zip(&nodes.thresholds) {
        split_values.push(match kind {
            0 => SplitValue::Threshold(threshold),
            1 => SplitValue::Partition(masks.next().ok_or_else(|| corrupt("missing mask"))?),
            _ => return Err(corrupt("invalid split kind")),
        });
    }

    let split_keys: Vec<usize> = nodes.split_keys.iter().map(|&k| k as usize).collect();
    if split_keys.iter().any(|&key| key >= n_predictor.max(1)) {
        return Err(corrupt("split key out of range"));
    }
    let left_children: Vec<usize> = nodes.left_children.iter().map(|&k| k as usize).collect();
    let right_children: Vec<usize> = nodes.right_children.iter().map(|&k| k as usize).collect();
    if left_children.iter().chain(&right_children).any(|&key| key >= n_node.max(1)) {
        return Err(corrupt("child index out of range"));
    }

    Ok(TreeSkeleton::from_arrays(
        save_memory,
        n_predictor,
        is_ordered,
        split_keys,
        split_values,
        left_children,
        right_children,
    ))
}

/// Unpack per-node lists from the packed `counts` and `values` arrays.
fn unpack_leaves<T: Copy>(
    counts: &[u32],
    values: &[T],
    n_node: usize,
) -> Result<Vec<Vec<T>>, DeserializeError> {
    if counts.len() != n_node {
        return Err(corrupt("leaf count array length disagrees with nodes"));
    }
    let total: usize = counts.iter().map(|&count| count as usize).sum();
    if total != values.len() {
        return Err(corrupt("packed leaf length disagrees with counts"));
    }
    let mut unpacked = Vec::with_capacity(n_node);
    let mut cursor = 0;
    for &count in counts {
        let next = cursor + count as usize;
        unpacked.push(values[cursor..next].to_vec());
        cursor = next;
    }
    Ok(unpacked)
}

/// Scatter packed (node, value) pairs into a per-node option vector.
fn unpack_cached<T: Copy>(
    node_keys: &[u32],
    values: &[T],
    n_node: usize,
) -> Result<Vec<Option<T>>, DeserializeError> {
    if node_keys.len() != values.len() {
        return Err(corrupt("cached-value arrays disagree"));
    }
    let mut unpacked = vec![None; n_node];
    for (&node_key, &value) in node_keys.iter().zip(values) {
        let slot = unpacked
            .get_mut(node_key as usize)
            .ok_or_else(|| corrupt("cached-value node out of range"))?;
        *slot = Some(value);
    }
    Ok(unpacked)
}

pub(super) fn forest_from_payload(payload: ForestPayload) -> Result<Forest, DeserializeError> {
    match payload {
        ForestPayload::Classification(forest) => {
            let n_predictor = forest.n_predictor as usize;
            if forest.is_ordered.len() != n_predictor {
                return Err(corrupt("is_ordered length disagrees with predictor count"));
            }
            let is_ordered = Arc::new(forest.is_ordered);
            let n_response = forest.response_values.len();
            let mut trees = Vec::with_capacity(forest.trees.len());
            for tree in forest.trees {
                let n_node = tree.nodes.n_node as usize;
                let skeleton = nodes_from_payload(
                    tree.nodes,
                    forest.save_memory,
                    n_predictor,
                    Arc::clone(&is_ordered),
                )?;
                let leaf_keys_u32 = unpack_leaves(&tree.leaf_counts, &tree.leaf_keys, n_node)?;
                let leaf_keys: Vec<Vec<usize>> = leaf_keys_u32
                    .into_iter()
                    .map(|leaf| leaf.into_iter().map(|k| k as usize).collect())
                    .collect();
                if leaf_keys
                    .iter()
                    .flatten()
                    .any(|&key| key >= n_response.max(1))
                {
                    return Err(corrupt("leaf response key out of range"));
                }
                let most_frequent_u32 =
                    unpack_cached(&tree.most_frequent_nodes, &tree.most_frequent_keys, n_node)?;
                let leaf_most_frequent: Vec<Option<usize>> = most_frequent_u32
                    .into_iter()
                    .map(|cached| cached.map(|k| k as usize))
                    .collect();
                trees.push(ClassificationTree::from_parts(
                    skeleton,
                    tree.response_weights,
                    leaf_keys,
                    leaf_most_frequent,
                ));
            }
            Ok(Forest::from_parts(
                forest.save_memory,
                n_predictor,
                is_ordered,
                ForestKind::Classification {
                    response_values: forest.response_values,
                    trees,
                },
            ))
        }
        ForestPayload::Regression(forest) => {
            let n_predictor = forest.n_predictor as usize;
            if forest.is_ordered.len() != n_predictor {
                return Err(corrupt("is_ordered length disagrees with predictor count"));
            }
            let is_ordered = Arc::new(forest.is_ordered);
            let mut trees = Vec::with_capacity(forest.trees.len());
            for tree in forest.trees {
                let n_node = tree.nodes.n_node as usize;
                let skeleton = nodes_from_payload(
                    tree.nodes,
                    forest.save_memory,
                    n_predictor,
                    Arc::clone(&is_ordered),
                )?;
                let leaf_values = unpack_leaves(&tree.leaf_counts, &tree.leaf_values, n_node)?;
                let leaf_mean = unpack_cached(&tree.mean_nodes, &tree.mean_values, n_node)?;
                trees.push(RegressionTree::from_parts(skeleton, leaf_values, leaf_mean));
            }
            Ok(Forest::from_parts(
                forest.save_memory,
                n_predictor,
                is_ordered,
                ForestKind::Regression { trees },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_leaves_splits_by_counts() {
        let unpacked = unpack_leaves(&[2, 0, 1], &[7u32, 8, 9], 3).unwrap();
        assert_eq!(unpacked, vec![vec![7, 8], vec![], vec![9]]);
    }

    #[test]
    fn unpack_leaves_rejects_bad_totals() {
        assert!(unpack_leaves(&[2, 2], &[1u32, 2, 3], 2).is_err());
        assert!(unpack_leaves(&[1], &[1u32], 2).is_err());
    }

    #[test]
    fn unpack_cached_scatters_pairs() {
        let unpacked = unpack_cached(&[2, 0], &[9u32, 4], 3).unwrap();
        assert_eq!(unpacked, vec![Some(4), None, Some(9)]);
        assert!(unpack_cached(&[5], &[1u32], 3).is_err());
    }

    #[test]
    fn nodes_payload_roundtrip() {
        let skeleton = TreeSkeleton::from_arrays(
            false,
            2,
            Arc::new(vec![true, false]),
            vec![1, 0, 0],
            vec![
                SplitValue::Partition(0b101),
                SplitValue::Threshold(0.0),
                SplitValue::Threshold(0.0),
            ],
            vec![1, 0, 0],
            vec![2, 0, 0],
        );
        let payload = nodes_to_payload(&skeleton);
        assert_eq!(payload.split_kinds, vec![1, 0, 0]);
        assert_eq!(payload.partition_masks, vec![0b101]);

        let rebuilt =
            nodes_from_payload(payload, false, 2, Arc::new(vec![true, false])).unwrap();
        assert!(skeleton.same_structure(&rebuilt));
    }

    #[test]
    fn nodes_from_payload_rejects_inconsistent_arrays() {
        let payload = TreeNodesPayload {
            n_node: 2,
            split_keys: vec![0],
            split_kinds: vec![0, 0],
            thresholds: vec![0.0, 0.0],
            partition_masks: vec![],
            left_children: vec![0, 0],
            right_children: vec![0, 0],
        };
        assert!(nodes_from_payload(payload, false, 1, Arc::new(vec![true])).is_err());
    }
}
