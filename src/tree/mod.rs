//! Tree storage and the shared growth machinery.
//!
//! A tree is a flat arena of parallel arrays; node 0 is the root and a node
//! with both child links zero is a leaf. During growth the skeleton also
//! carries a half-open `[start_pos, end_pos)` range per node into a
//! partially sorted sample-key buffer, so the subtree rooted at a node owns
//! a contiguous slice. The response-specific behaviour (leaf payloads, split
//! scoring) is supplied by [`TreeModel`] implementations in the
//! `classification` and `regression` submodules.

pub mod classification;
pub mod regression;

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::Data;
use crate::draw;
use crate::errors::{Error, Result};
use crate::params::TrainingParameters;

// =============================================================================
// SplitValue
// =============================================================================

/// Tagged split payload: a numeric threshold (inclusive upper bound of the
/// left child) or a bit mask of 1-based factor levels routed right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitValue {
    Threshold(f64),
    Partition(u64),
}

impl SplitValue {
    /// Route a predictor value for this split; true means left.
    #[inline]
    pub fn goes_left(self, value: f64) -> bool {
        match self {
            SplitValue::Threshold(threshold) => value <= threshold,
            SplitValue::Partition(mask) => !partition_test(mask, value),
        }
    }
}

/// Whether the factor level encoded by `value` (1-based) has its bit set in
/// the partition mask. Levels outside `[1, 64]` are never in the mask.
#[inline]
pub(crate) fn partition_test(mask: u64, value: f64) -> bool {
    let bit = (value - 1.0).floor();
    bit >= 0.0 && bit < 64.0 && (mask >> bit as u32) & 1 == 1
}

/// Bit masks over the observed factor levels of an unordered predictor:
/// every non-trivial partition (the last observed level is always routed
/// left so complements are not revisited), or `n_random_split` random ones
/// under extratrees.
pub(crate) fn partition_masks<R: Rng>(
    levels: &[f64],
    extra_trees: bool,
    n_random_split: usize,
    rng: &mut R,
) -> Result<Vec<u64>> {
    let n_level = levels.len();
    if n_level < 2 {
        return Ok(Vec::new());
    }
    if n_level > 64 {
        return Err(Error::domain(
            "unordered predictors support at most 64 factor levels",
        ));
    }
    let level_bits: Vec<u32> = levels.iter().map(|v| (v - 1.0).floor() as u32).collect();
    let n_partition: u64 = 1u64 << (n_level - 1);

    let to_mask = |selector: u64| -> u64 {
        let mut mask = 0u64;
        for (i, &bit) in level_bits.iter().enumerate().take(n_level - 1) {
            if (selector >> i) & 1 == 1 && bit < 64 {
                mask |= 1u64 << bit;
            }
        }
        mask
    };

    if extra_trees {
        Ok((0..n_random_split)
            .map(|_| to_mask(rng.gen_range(1..n_partition)))
            .collect())
    } else {
        Ok((1..n_partition).map(to_mask).collect())
    }
}

// =============================================================================
// TreeSkeleton
// =============================================================================

/// Node arenas plus the growth-time workspace shared by both tree kinds.
#[derive(Debug, Clone)]
pub struct TreeSkeleton {
    pub(crate) save_memory: bool,
    pub(crate) n_predictor: usize,
    pub(crate) is_ordered: Arc<Vec<bool>>,
    pub(crate) split_keys: Vec<usize>,
    pub(crate) split_values: Vec<SplitValue>,
    pub(crate) left_children: Vec<usize>,
    pub(crate) right_children: Vec<usize>,
    /// Growth workspace: start of each node's slice of the sample buffer.
    pub(crate) start_pos: Vec<usize>,
    /// Growth workspace: past-the-end of each node's slice.
    pub(crate) end_pos: Vec<usize>,
    pub(crate) rng: StdRng,
}

impl TreeSkeleton {
    pub fn new(save_memory: bool, n_predictor: usize, is_ordered: Arc<Vec<bool>>) -> Self {
        TreeSkeleton {
            save_memory,
            n_predictor,
            is_ordered,
            split_keys: Vec::new(),
            split_values: Vec::new(),
            left_children: Vec::new(),
            right_children: Vec::new(),
            start_pos: Vec::new(),
            end_pos: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Rebuild a skeleton from persisted node arrays (no growth workspace).
    pub(crate) fn from_arrays(
        save_memory: bool,
        n_predictor: usize,
        is_ordered: Arc<Vec<bool>>,
        split_keys: Vec<usize>,
        split_values: Vec<SplitValue>,
        left_children: Vec<usize>,
        right_children: Vec<usize>,
    ) -> Self {
        TreeSkeleton {
            save_memory,
            n_predictor,
            is_ordered,
            split_keys,
            split_values,
            left_children,
            right_children,
            start_pos: Vec::new(),
            end_pos: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed the tree's generator; seed 0 draws from a non-deterministic
    /// source.
    pub fn seed(&mut self, seed: u64) {
        self.rng = if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        };
    }

    #[inline]
    pub fn n_node(&self) -> usize {
        self.split_keys.len()
    }

    #[inline]
    pub fn is_leaf(&self, node_key: usize) -> bool {
        self.left_children[node_key] == 0 && self.right_children[node_key] == 0
    }

    #[inline]
    pub fn n_sample_node(&self, node_key: usize) -> usize {
        self.end_pos[node_key] - self.start_pos[node_key]
    }

    pub fn split_keys(&self) -> &[usize] {
        &self.split_keys
    }

    pub fn split_values(&self) -> &[SplitValue] {
        &self.split_values
    }

    pub fn left_children(&self) -> &[usize] {
        &self.left_children
    }

    pub fn right_children(&self) -> &[usize] {
        &self.right_children
    }

    pub(crate) fn push_empty_node(&mut self) {
        self.split_keys.push(0);
        self.split_values.push(SplitValue::Threshold(0.0));
        self.left_children.push(0);
        self.right_children.push(0);
        self.start_pos.push(0);
        self.end_pos.push(0);
    }

    /// Walk a case from the root to its terminal node.
    pub fn terminal_node_key(&self, data: &Data, sample_key: usize) -> usize {
        let mut node_key = 0;
        while !self.is_leaf(node_key) {
            let value = data.get_x(sample_key, self.split_keys[node_key], false);
            node_key = if self.split_values[node_key].goes_left(value) {
                self.left_children[node_key]
            } else {
                self.right_children[node_key]
            };
        }
        node_key
    }

    /// Rewrite every split key through `key_map`, which must be a total
    /// bijection on `[0, n_predictor)`.
    pub fn transform_split_keys(&mut self, key_map: &HashMap<usize, usize>) -> Result<()> {
        if key_map.len() != self.n_predictor {
            return Err(Error::invalid(
                "require a mapping for all existing predictor keys",
            ));
        }
        let mut seen = vec![false; self.n_predictor];
        for from in 0..self.n_predictor {
            let to = *key_map
                .get(&from)
                .ok_or_else(|| Error::domain("invalid predictor-key value in mapping"))?;
            if to >= self.n_predictor || seen[to] {
                return Err(Error::domain("invalid predictor-key value in mapping"));
            }
            seen[to] = true;
        }
        for key in &mut self.split_keys {
            *key = key_map[key];
        }
        Ok(())
    }

    /// Structural equality of the persisted state (the RNG and growth
    /// workspace are not part of a tree's identity).
    pub(crate) fn same_structure(&self, other: &TreeSkeleton) -> bool {
        self.save_memory == other.save_memory
            && self.n_predictor == other.n_predictor
            && *self.is_ordered == *other.is_ordered
            && self.split_keys == other.split_keys
            && self.split_values == other.split_values
            && self.left_children == other.left_children
            && self.right_children == other.right_children
    }
}

// =============================================================================
// TreeModel
// =============================================================================

/// Response-specific behaviour plugged into the shared growth driver.
pub(crate) trait TreeModel {
    fn base(&self) -> &TreeSkeleton;
    fn base_mut(&mut self) -> &mut TreeSkeleton;

    /// Push one empty node onto the skeleton and any per-node leaf storage.
    fn allocate_node(&mut self);

    /// Validate rule/response compatibility and set up growth workspaces.
    fn begin_growth(&mut self, params: &TrainingParameters, data: &Data) -> Result<()>;

    /// Release growth workspaces and finalise leaf caches.
    fn finalise_growth(&mut self);

    /// Record the leaf payload for a terminal node.
    fn add_terminal_node(&mut self, node_key: usize, data: &Data, sample_keys: &[usize]);

    fn responses_equal(&self, data: &Data, lhs_key: usize, rhs_key: usize) -> bool;

    /// Find the best split over the candidate predictors; on success set
    /// `split_keys[node_key]` / `split_values[node_key]` and return true.
    fn push_best_split(
        &mut self,
        node_key: usize,
        params: &TrainingParameters,
        data: &Data,
        sample_keys: &[usize],
        candidate_keys: &[usize],
    ) -> Result<bool>;

    /// Response-stratified resampling; only classification supports it.
    fn resample_response_wise_impl(
        &mut self,
        _data: &Data,
        _replace: bool,
        _sample_fraction: &[f64],
        _sample_keys: &mut Vec<usize>,
        _inbag_counts: &mut [usize],
    ) -> Result<()> {
        Err(Error::invalid(
            "response-wise sampling not supported for this tree type",
        ))
    }
}

// =============================================================================
// Growth driver
// =============================================================================

/// Grow (train) a tree; returns the out-of-bag row keys when requested.
pub(crate) fn grow<T: TreeModel>(
    tree: &mut T,
    params: &TrainingParameters,
    data: &Data,
    case_weights: &[f64],
    compute_oob: bool,
) -> Result<Vec<usize>> {
    let n_sample = data.n_row();

    if tree.base().n_node() != 0 {
        return Err(Error::runtime("expected to start with an empty tree"));
    }
    if params.n_try > tree.base().n_predictor {
        return Err(Error::domain(
            "'n_try' can not be larger than number of predictors (columns)",
        ));
    }

    tree.begin_growth(params, data)?;
    tree.allocate_node();

    let response_wise = params.is_response_wise();
    let weighted = !case_weights.is_empty();
    if weighted && response_wise {
        return Err(Error::invalid(
            "cannot have both weighted and response-wise (class-wise) sampling",
        ));
    }

    let mut sample_keys = Vec::new();
    let mut oob_keys = Vec::new();
    if weighted {
        resample_weighted(
            n_sample,
            params.replace,
            params.sample_fraction[0],
            case_weights,
            compute_oob,
            &mut tree.base_mut().rng,
            &mut sample_keys,
            &mut oob_keys,
        )?;
    } else if response_wise {
        resample_response_wise(
            tree,
            data,
            params.replace,
            &params.sample_fraction,
            compute_oob,
            &mut sample_keys,
            &mut oob_keys,
        )?;
    } else {
        resample_unweighted(
            n_sample,
            params.replace,
            params.sample_fraction[0],
            compute_oob,
            &mut tree.base_mut().rng,
            &mut sample_keys,
            &mut oob_keys,
        );
    }

    tree.base_mut().start_pos[0] = 0;
    tree.base_mut().end_pos[0] = sample_keys.len();

    // Nodes are visited in creation order; `last_left_node_key` marks the
    // left frontier of the depth level currently being opened.
    let mut depth = 0;
    let mut last_left_node_key = 0;
    let mut n_open_node = 1usize;
    let mut node_key = 0;
    while n_open_node != 0 {
        let did_split = split_node(
            tree,
            node_key,
            depth,
            last_left_node_key,
            params,
            data,
            &mut sample_keys,
        )?;
        if !did_split {
            n_open_node -= 1;
        } else {
            n_open_node += 1;
            if node_key >= last_left_node_key {
                last_left_node_key = tree.base().n_node() - 2;
                depth += 1;
            }
        }
        node_key += 1;
    }

    tree.finalise_growth();
    Ok(oob_keys)
}

fn split_node<T: TreeModel>(
    tree: &mut T,
    node_key: usize,
    depth: usize,
    last_left_node_key: usize,
    params: &TrainingParameters,
    data: &Data,
    sample_keys: &mut [usize],
) -> Result<bool> {
    let n_sample_node = tree.base().n_sample_node(node_key);

    if params.max_depth != 0 && depth > params.max_depth {
        return Err(Error::runtime(
            "cannot split a node that is already at maximum depth of tree",
        ));
    }

    let too_deep =
        node_key >= last_left_node_key && params.max_depth != 0 && depth == params.max_depth;
    if n_sample_node <= params.min_split_n_sample || too_deep {
        tree.add_terminal_node(node_key, data, sample_keys);
        return Ok(false);
    }

    // Terminal if the node is pure.
    let start = tree.base().start_pos[node_key];
    let end = tree.base().end_pos[node_key];
    let first_key = sample_keys[start];
    let pure = sample_keys[start..end]
        .iter()
        .all(|&key| tree.responses_equal(data, first_key, key));
    if pure {
        tree.add_terminal_node(node_key, data, sample_keys);
        return Ok(false);
    }

    let n_predictor = tree.base().n_predictor;
    let candidate_keys = draw_candidates(&mut tree.base_mut().rng, params, n_predictor)?;
    let split_found = tree.push_best_split(node_key, params, data, sample_keys, &candidate_keys)?;
    if !split_found {
        tree.add_terminal_node(node_key, data, sample_keys);
        return Ok(false);
    }

    let split_key = tree.base().split_keys[node_key];
    let split_value = tree.base().split_values[node_key];

    // Allocate children; the left child inherits the node's start position
    // and the right child's slice is carved off the tail.
    let left_key = tree.base().n_node();
    tree.base_mut().left_children[node_key] = left_key;
    tree.allocate_node();
    tree.base_mut().start_pos[left_key] = start;

    let right_key = tree.base().n_node();
    tree.base_mut().right_children[node_key] = right_key;
    tree.allocate_node();

    // Partially sort the node's keys in place so left-routed samples precede
    // right-routed ones.
    let mut right_start = end;
    let mut j = start;
    while j < right_start {
        let value = data.get_x(sample_keys[j], split_key, false);
        if split_value.goes_left(value) {
            j += 1;
        } else {
            right_start -= 1;
            sample_keys.swap(j, right_start);
        }
    }

    let base = tree.base_mut();
    base.start_pos[right_key] = right_start;
    base.end_pos[left_key] = right_start;
    base.end_pos[right_key] = end;
    Ok(true)
}

/// Draw the candidate predictors for one split: `n_try` keys without
/// replacement (weighted when weights are supplied), then the always-draw
/// keys appended.
fn draw_candidates(
    rng: &mut StdRng,
    params: &TrainingParameters,
    n_predictor: usize,
) -> Result<Vec<usize>> {
    let mut result = Vec::with_capacity(params.n_try + params.draw_always_predictor_keys.len());
    let mut inbag_counts = vec![0usize; n_predictor];

    if params.draw_predictor_weights.is_empty() {
        draw::draw_no_replace(
            params.n_try,
            n_predictor,
            &params.draw_always_predictor_keys,
            rng,
            &mut result,
            &mut inbag_counts,
        );
    } else {
        draw::draw_no_replace_weighted(
            params.n_try,
            &params.draw_predictor_weights,
            rng,
            &mut result,
            &mut inbag_counts,
        )?;
    }

    result.extend_from_slice(&params.draw_always_predictor_keys);
    Ok(result)
}

// =============================================================================
// Resampling
// =============================================================================

fn oob_reserve(n_sample: usize, n_inbag: usize, replace: bool) -> usize {
    if replace {
        // Slightly above the expected out-of-bag count, capped at n_sample.
        let fraction = n_inbag as f64 / n_sample as f64;
        (n_sample as f64 * (-fraction + 0.15).exp()) as usize
    } else {
        n_sample - n_inbag.min(n_sample)
    }
}

fn resample_unweighted(
    n_sample: usize,
    replace: bool,
    sample_fraction: f64,
    want_oob: bool,
    rng: &mut StdRng,
    sample_keys: &mut Vec<usize>,
    oob_keys: &mut Vec<usize>,
) {
    let n_inbag = (n_sample as f64 * sample_fraction) as usize;
    sample_keys.clear();
    oob_keys.clear();

    if replace {
        let mut inbag_counts = vec![0usize; n_sample];
        draw::draw_replace(n_inbag, n_sample, rng, sample_keys, &mut inbag_counts);
        if want_oob {
            oob_keys.reserve(oob_reserve(n_sample, n_inbag, true));
            oob_keys.extend(
                inbag_counts
                    .iter()
                    .enumerate()
                    .filter(|(_, &count)| count == 0)
                    .map(|(key, _)| key),
            );
        }
    } else {
        let mut keys = draw::shuffled_keys(n_sample, rng);
        if want_oob {
            oob_keys.extend_from_slice(&keys[n_inbag..]);
        }
        keys.truncate(n_inbag);
        *sample_keys = keys;
    }
}

#[allow(clippy::too_many_arguments)]
fn resample_weighted(
    n_sample: usize,
    replace: bool,
    sample_fraction: f64,
    case_weights: &[f64],
    want_oob: bool,
    rng: &mut StdRng,
    sample_keys: &mut Vec<usize>,
    oob_keys: &mut Vec<usize>,
) -> Result<()> {
    if case_weights.len() != n_sample {
        return Err(Error::invalid(
            "case weights must have the same length as number of rows in data",
        ));
    }
    let n_inbag = (n_sample as f64 * sample_fraction) as usize;
    let mut inbag_counts = vec![0usize; n_sample];
    sample_keys.clear();
    oob_keys.clear();

    if replace {
        draw::draw_replace_weighted(n_inbag, case_weights, rng, sample_keys, &mut inbag_counts)?;
    } else {
        draw::draw_no_replace_weighted(n_inbag, case_weights, rng, sample_keys, &mut inbag_counts)?;
    }

    if want_oob {
        oob_keys.reserve(oob_reserve(n_sample, n_inbag, replace));
        oob_keys.extend(
            inbag_counts
                .iter()
                .enumerate()
                .filter(|(_, &count)| count == 0)
                .map(|(key, _)| key),
        );
    }
    Ok(())
}

fn resample_response_wise<T: TreeModel>(
    tree: &mut T,
    data: &Data,
    replace: bool,
    sample_fraction: &[f64],
    want_oob: bool,
    sample_keys: &mut Vec<usize>,
    oob_keys: &mut Vec<usize>,
) -> Result<()> {
    let n_sample = data.n_row();
    let mut inbag_counts = vec![0usize; n_sample];
    sample_keys.clear();
    oob_keys.clear();

    tree.resample_response_wise_impl(
        data,
        replace,
        sample_fraction,
        sample_keys,
        &mut inbag_counts,
    )?;

    if want_oob {
        oob_keys.reserve(oob_reserve(n_sample, sample_keys.len(), replace));
        oob_keys.extend(
            inbag_counts
                .iter()
                .enumerate()
                .filter(|(_, &count)| count == 0)
                .map(|(key, _)| key),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_value_routing() {
        let threshold = SplitValue::Threshold(1.5);
        assert!(threshold.goes_left(1.5));
        assert!(threshold.goes_left(0.0));
        assert!(!threshold.goes_left(1.6));

        // Levels 1 and 3 routed right.
        let partition = SplitValue::Partition(0b101);
        assert!(!partition.goes_left(1.0));
        assert!(partition.goes_left(2.0));
        assert!(!partition.goes_left(3.0));
        assert!(partition.goes_left(4.0));
    }

    #[test]
    fn partition_test_ignores_out_of_range_levels() {
        assert!(!partition_test(u64::MAX, 0.0));
        assert!(!partition_test(u64::MAX, -3.0));
        assert!(!partition_test(u64::MAX, 66.0));
        assert!(partition_test(u64::MAX, 64.0));
    }

    fn skeleton_with_nodes(n_predictor: usize, split_keys: Vec<usize>) -> TreeSkeleton {
        let n_node = split_keys.len();
        TreeSkeleton::from_arrays(
            false,
            n_predictor,
            Arc::new(vec![true; n_predictor]),
            split_keys,
            vec![SplitValue::Threshold(0.0); n_node],
            vec![0; n_node],
            vec![0; n_node],
        )
    }

    #[test]
    fn transform_split_keys_identity_is_noop() {
        let mut tree = skeleton_with_nodes(3, vec![0, 2, 1]);
        let identity: HashMap<usize, usize> = (0..3).map(|j| (j, j)).collect();
        tree.transform_split_keys(&identity).unwrap();
        assert_eq!(tree.split_keys(), &[0, 2, 1]);
    }

    #[test]
    fn transform_split_keys_applies_bijection() {
        let mut tree = skeleton_with_nodes(2, vec![0, 1, 0]);
        let swap: HashMap<usize, usize> = [(0, 1), (1, 0)].into_iter().collect();
        tree.transform_split_keys(&swap).unwrap();
        assert_eq!(tree.split_keys(), &[1, 0, 1]);
    }

    #[test]
    fn transform_split_keys_rejects_partial_or_noninjective_maps() {
        let mut tree = skeleton_with_nodes(2, vec![0]);
        let short: HashMap<usize, usize> = [(0, 0)].into_iter().collect();
        assert!(matches!(
            tree.transform_split_keys(&short),
            Err(Error::InvalidArgument(_))
        ));

        let doubled: HashMap<usize, usize> = [(0, 1), (1, 1)].into_iter().collect();
        assert!(matches!(
            tree.transform_split_keys(&doubled),
            Err(Error::Domain(_))
        ));

        let out_of_range: HashMap<usize, usize> = [(0, 0), (1, 5)].into_iter().collect();
        assert!(matches!(
            tree.transform_split_keys(&out_of_range),
            Err(Error::Domain(_))
        ));
    }

    #[test]
    fn unweighted_resample_without_replacement_partitions_rows() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut sample_keys = Vec::new();
        let mut oob_keys = Vec::new();
        resample_unweighted(10, false, 0.7, true, &mut rng, &mut sample_keys, &mut oob_keys);
        assert_eq!(sample_keys.len(), 7);
        assert_eq!(oob_keys.len(), 3);
        let mut all: Vec<usize> = sample_keys.iter().chain(oob_keys.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn unweighted_resample_with_replacement_oob_is_undrawn() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut sample_keys = Vec::new();
        let mut oob_keys = Vec::new();
        resample_unweighted(20, true, 1.0, true, &mut rng, &mut sample_keys, &mut oob_keys);
        assert_eq!(sample_keys.len(), 20);
        for &oob in &oob_keys {
            assert!(!sample_keys.contains(&oob));
        }
    }

    #[test]
    fn weighted_resample_requires_matching_length() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut sample_keys = Vec::new();
        let mut oob_keys = Vec::new();
        let result = resample_weighted(
            5,
            true,
            1.0,
            &[1.0, 1.0],
            false,
            &mut rng,
            &mut sample_keys,
            &mut oob_keys,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn weighted_resample_never_draws_zero_weight_rows() {
        let mut rng = StdRng::seed_from_u64(2);
        let weights = [0.0, 1.0, 1.0, 0.0, 1.0];
        let mut sample_keys = Vec::new();
        let mut oob_keys = Vec::new();
        resample_weighted(
            5,
            true,
            1.0,
            &weights,
            true,
            &mut rng,
            &mut sample_keys,
            &mut oob_keys,
        )
        .unwrap();
        assert!(!sample_keys.contains(&0));
        assert!(!sample_keys.contains(&3));
        assert!(oob_keys.contains(&0));
        assert!(oob_keys.contains(&3));
    }
}
