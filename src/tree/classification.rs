//! Classification tree: leaves hold the response keys of the in-bag samples
//! that reached them; split search scores candidate splits with the weighted
//! sum-of-squares (Gini) criterion or the Hellinger distance.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use super::{grow, partition_masks, partition_test, SplitValue, TreeModel, TreeSkeleton};
use crate::data::Data;
use crate::draw;
use crate::errors::{Error, Result};
use crate::params::{SplitRule, TrainingParameters};

// =============================================================================
// Split criteria
// =============================================================================

/// Decrease computed from the per-response counts on each side of a split.
/// Higher is better.
trait ClassificationRule {
    fn decrease(
        node_n_by_response: &[usize],
        n_by_response_lhs: &[usize],
        n_lhs: usize,
        n_rhs: usize,
        response_weights: &[f64],
    ) -> f64;
}

/// Weighted sum of squared per-response counts, normalised per side.
struct SumOfSquares;

impl ClassificationRule for SumOfSquares {
    fn decrease(
        node_n_by_response: &[usize],
        n_by_response_lhs: &[usize],
        n_lhs: usize,
        n_rhs: usize,
        response_weights: &[f64],
    ) -> f64 {
        let mut sum_lhs_sq = 0.0;
        let mut sum_rhs_sq = 0.0;
        for (k, &weight) in response_weights.iter().enumerate() {
            let lhs_k = n_by_response_lhs[k] as f64;
            let rhs_k = (node_n_by_response[k] - n_by_response_lhs[k]) as f64;
            sum_lhs_sq += weight * lhs_k * lhs_k;
            sum_rhs_sq += weight * rhs_k * rhs_k;
        }
        sum_rhs_sq / n_rhs as f64 + sum_lhs_sq / n_lhs as f64
    }
}

/// Hellinger distance between the true- and false-positive rates of the
/// right-hand side; binary responses only.
struct HellingerDistance;

impl ClassificationRule for HellingerDistance {
    fn decrease(
        node_n_by_response: &[usize],
        n_by_response_lhs: &[usize],
        _n_lhs: usize,
        _n_rhs: usize,
        _response_weights: &[f64],
    ) -> f64 {
        let tpr =
            (node_n_by_response[1] - n_by_response_lhs[1]) as f64 / node_n_by_response[1] as f64;
        let fpr =
            (node_n_by_response[0] - n_by_response_lhs[0]) as f64 / node_n_by_response[0] as f64;
        let a1 = tpr.sqrt() - fpr.sqrt();
        let a2 = (1.0 - tpr).sqrt() - (1.0 - fpr).sqrt();
        (a1 * a1 + a2 * a2).sqrt()
    }
}

// =============================================================================
// ClassificationTree
// =============================================================================

/// A grown (or growing) classification tree.
#[derive(Debug, Clone)]
pub struct ClassificationTree {
    pub(crate) base: TreeSkeleton,
    n_response_key: usize,
    response_weights: Vec<f64>,
    /// Response keys of the in-bag samples in each terminal node; empty for
    /// internal nodes.
    leaf_keys: Vec<Vec<usize>>,
    /// Cached weighted-majority key per terminal node.
    leaf_most_frequent: Vec<Option<usize>>,
    // Growth workspaces.
    node_n_by_response: Vec<usize>,
    node_n_by_candidate: Vec<usize>,
    node_n_by_candidate_and_response: Vec<usize>,
    candidate_values: Vec<f64>,
}

impl ClassificationTree {
    pub fn new(save_memory: bool, n_predictor: usize, is_ordered: Arc<Vec<bool>>) -> Self {
        ClassificationTree {
            base: TreeSkeleton::new(save_memory, n_predictor, is_ordered),
            n_response_key: 0,
            response_weights: Vec::new(),
            leaf_keys: Vec::new(),
            leaf_most_frequent: Vec::new(),
            node_n_by_response: Vec::new(),
            node_n_by_candidate: Vec::new(),
            node_n_by_candidate_and_response: Vec::new(),
            candidate_values: Vec::new(),
        }
    }

    /// Rebuild from persisted state.
    pub(crate) fn from_parts(
        base: TreeSkeleton,
        response_weights: Vec<f64>,
        leaf_keys: Vec<Vec<usize>>,
        leaf_most_frequent: Vec<Option<usize>>,
    ) -> Self {
        let n_response_key = response_weights.len();
        ClassificationTree {
            base,
            n_response_key,
            response_weights,
            leaf_keys,
            leaf_most_frequent,
            node_n_by_response: Vec::new(),
            node_n_by_candidate: Vec::new(),
            node_n_by_candidate_and_response: Vec::new(),
            candidate_values: Vec::new(),
        }
    }

    pub fn skeleton(&self) -> &TreeSkeleton {
        &self.base
    }

    pub fn seed(&mut self, seed: u64) {
        self.base.seed(seed);
    }

    pub fn leaf_keys(&self) -> &[Vec<usize>] {
        &self.leaf_keys
    }

    pub fn leaf_most_frequent(&self) -> &[Option<usize>] {
        &self.leaf_most_frequent
    }

    pub fn response_weights(&self) -> &[f64] {
        &self.response_weights
    }

    /// Grow (train) this tree; returns the out-of-bag row keys if requested.
    pub fn grow(
        &mut self,
        params: &TrainingParameters,
        data: &Data,
        case_weights: &[f64],
        compute_oob: bool,
    ) -> Result<Vec<usize>> {
        grow(self, params, data, case_weights, compute_oob)
    }

    pub fn transform_split_keys(&mut self, key_map: &HashMap<usize, usize>) -> Result<()> {
        self.base.transform_split_keys(key_map)
    }

    /// Rewrite leaf response keys, cached majority keys, and the response
    /// weights through `key_map` into a response domain of
    /// `n_response_key_new` values.
    pub fn transform_response_keys(
        &mut self,
        key_map: &HashMap<usize, usize>,
        n_response_key_new: usize,
    ) -> Result<()> {
        let remap = |key: usize| -> Result<usize> {
            key_map
                .get(&key)
                .copied()
                .ok_or_else(|| Error::domain("response key missing from mapping"))
        };

        let mut weights = vec![1.0; n_response_key_new];
        for (from, &to) in key_map {
            if *from >= self.response_weights.len() || to >= n_response_key_new {
                return Err(Error::domain("invalid response-key value in mapping"));
            }
            weights[to] = self.response_weights[*from];
        }

        for leaf in &mut self.leaf_keys {
            for key in leaf.iter_mut() {
                *key = remap(*key)?;
            }
        }
        for cached in self.leaf_most_frequent.iter_mut() {
            if let Some(key) = *cached {
                *cached = Some(remap(key)?);
            }
        }
        self.response_weights = weights;
        self.n_response_key = n_response_key_new;
        Ok(())
    }

    /// Bagged prediction for a case: the cached weighted-majority response
    /// key of its terminal node.
    pub(crate) fn predict_bagged(&self, data: &Data, sample_key: usize) -> Option<usize> {
        let node_key = self.base.terminal_node_key(data, sample_key);
        self.leaf_most_frequent[node_key]
    }

    /// In-bag prediction: a uniform draw from the terminal node's response
    /// keys.
    pub(crate) fn predict_inbag(&mut self, data: &Data, sample_key: usize) -> Option<usize> {
        let node_key = self.base.terminal_node_key(data, sample_key);
        let leaf = &self.leaf_keys[node_key];
        if leaf.is_empty() {
            return None;
        }
        Some(leaf[self.base.rng.gen_range(0..leaf.len())])
    }

    pub(crate) fn predict_node(&self, data: &Data, sample_key: usize) -> usize {
        self.base.terminal_node_key(data, sample_key)
    }

    pub(crate) fn same_structure(&self, other: &ClassificationTree) -> bool {
        self.base.same_structure(&other.base)
            && self.response_weights == other.response_weights
            && self.leaf_keys == other.leaf_keys
            && self.leaf_most_frequent == other.leaf_most_frequent
    }

    // =========================================================================
    // Node aggregates and candidate bucketisation
    // =========================================================================

    /// Count samples per candidate bucket (and per response within each
    /// bucket). `n_bucket` buckets are zeroed; `bucket_of` maps a sample key
    /// to its bucket.
    fn fill_buckets(
        &mut self,
        node_range: (usize, usize),
        n_bucket: usize,
        data: &Data,
        sample_keys: &[usize],
        bucket_of: impl Fn(&Data, usize) -> usize,
    ) {
        let n_response = self.n_response_key;
        self.node_n_by_candidate.clear();
        self.node_n_by_candidate.resize(n_bucket, 0);
        self.node_n_by_candidate_and_response.clear();
        self.node_n_by_candidate_and_response.resize(n_bucket * n_response, 0);

        let response_keys = data.response_index();
        for &sample_key in &sample_keys[node_range.0..node_range.1] {
            let bucket = bucket_of(data, sample_key);
            self.node_n_by_candidate[bucket] += 1;
            self.node_n_by_candidate_and_response[bucket * n_response + response_keys[sample_key]] +=
                1;
        }
    }

    /// Sweep the candidate buckets left to right, returning the best bucket
    /// and its decrease. `n_sweep` is the number of buckets that may serve
    /// as the left side's inclusive upper bound.
    fn scan_buckets<R: ClassificationRule>(
        &self,
        n_sweep: usize,
        n_sample_node: usize,
        min_leaf_n_sample: usize,
    ) -> Option<(usize, f64)> {
        let n_response = self.n_response_key;
        let mut n_lhs = 0usize;
        let mut n_by_response_lhs = vec![0usize; n_response];
        let mut best: Option<(usize, f64)> = None;

        for j in 0..n_sweep {
            if self.node_n_by_candidate[j] == 0 {
                continue;
            }
            n_lhs += self.node_n_by_candidate[j];
            for k in 0..n_response {
                n_by_response_lhs[k] += self.node_n_by_candidate_and_response[j * n_response + k];
            }
            if n_lhs < min_leaf_n_sample {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < min_leaf_n_sample {
                break;
            }
            let decrease = R::decrease(
                &self.node_n_by_response,
                &n_by_response_lhs,
                n_lhs,
                n_rhs,
                &self.response_weights,
            );
            if best.map_or(true, |(_, d)| decrease > d) {
                best = Some((j, decrease));
            }
        }
        best
    }

    /// Best threshold for one ordered candidate predictor.
    fn best_threshold<R: ClassificationRule>(
        &mut self,
        candidate_key: usize,
        node_key: usize,
        params: &TrainingParameters,
        data: &Data,
        sample_keys: &[usize],
        use_index: bool,
    ) -> Result<Option<(SplitValue, f64)>> {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];
        let n_sample_node = end - start;

        if use_index {
            let n_candidate = data.n_unique_value(candidate_key);
            if n_candidate < 2 {
                return Ok(None);
            }
            self.fill_buckets((start, end), n_candidate, data, sample_keys, |d, key| {
                d.unique_key(key, candidate_key, false)
            });
            Ok(self
                .scan_buckets::<R>(n_candidate - 1, n_sample_node, params.min_leaf_n_sample)
                .map(|(j, decrease)| {
                    (SplitValue::Threshold(data.unique_value(candidate_key, j)), decrease)
                }))
        } else {
            let mut values = std::mem::take(&mut self.candidate_values);
            data.get_all_values(&mut values, sample_keys, candidate_key, start, end, false)?;
            self.candidate_values = values;
            let n_candidate = self.candidate_values.len();
            if n_candidate < 2 {
                return Ok(None);
            }
            let candidate_values = std::mem::take(&mut self.candidate_values);
            self.fill_buckets((start, end), n_candidate, data, sample_keys, |d, key| {
                candidate_values.partition_point(|v| *v < d.get_x(key, candidate_key, false))
            });
            let best = self
                .scan_buckets::<R>(n_candidate - 1, n_sample_node, params.min_leaf_n_sample)
                .map(|(j, decrease)| (SplitValue::Threshold(candidate_values[j]), decrease));
            self.candidate_values = candidate_values;
            Ok(best)
        }
    }

    /// Extremely randomised threshold search: `n_random_split` uniform draws
    /// in the node's `[min, max)` range, scored with the sum-of-squares
    /// criterion.
    fn best_threshold_extratrees(
        &mut self,
        candidate_key: usize,
        node_key: usize,
        params: &TrainingParameters,
        data: &Data,
        sample_keys: &[usize],
    ) -> Result<Option<(SplitValue, f64)>> {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];
        let n_sample_node = end - start;

        let (min, max) = data.get_minmax_values(sample_keys, candidate_key, start, end, false)?;
        if !(min < max) {
            return Ok(None);
        }
        let mut thresholds: Vec<f64> = (0..params.n_random_split)
            .map(|_| self.base.rng.gen_range(min..max))
            .collect();
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        thresholds.dedup();
        let n_candidate = thresholds.len();

        // One extra bucket: samples above every drawn threshold.
        self.fill_buckets((start, end), n_candidate + 1, data, sample_keys, |d, key| {
            thresholds.partition_point(|v| *v < d.get_x(key, candidate_key, false))
        });
        Ok(self
            .scan_buckets::<SumOfSquares>(n_candidate, n_sample_node, params.min_leaf_n_sample)
            .map(|(j, decrease)| (SplitValue::Threshold(thresholds[j]), decrease)))
    }

    /// Best level partition for one unordered candidate predictor.
    fn best_partition<R: ClassificationRule>(
        &mut self,
        candidate_key: usize,
        node_key: usize,
        params: &TrainingParameters,
        data: &Data,
        sample_keys: &[usize],
    ) -> Result<Option<(SplitValue, f64)>> {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];
        let n_sample_node = end - start;

        let mut levels = std::mem::take(&mut self.candidate_values);
        data.get_all_values(&mut levels, sample_keys, candidate_key, start, end, false)?;
        let masks = partition_masks(
            &levels,
            params.split_rule == SplitRule::ExtraTrees,
            params.n_random_split,
            &mut self.base.rng,
        )?;
        self.candidate_values = levels;
        if masks.is_empty() {
            return Ok(None);
        }

        let n_response = self.n_response_key;
        let response_keys = data.response_index();
        let mut best: Option<(u64, f64)> = None;
        let mut n_by_response_lhs = vec![0usize; n_response];

        for mask in masks {
            n_by_response_lhs.iter_mut().for_each(|count| *count = 0);
            let mut n_lhs = 0usize;
            for &sample_key in &sample_keys[start..end] {
                let value = data.get_x(sample_key, candidate_key, false);
                if !partition_test(mask, value) {
                    n_lhs += 1;
                    n_by_response_lhs[response_keys[sample_key]] += 1;
                }
            }
            if n_lhs < params.min_leaf_n_sample {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < params.min_leaf_n_sample {
                continue;
            }
            let decrease = R::decrease(
                &self.node_n_by_response,
                &n_by_response_lhs,
                n_lhs,
                n_rhs,
                &self.response_weights,
            );
            if best.map_or(true, |(_, d)| decrease > d) {
                best = Some((mask, decrease));
            }
        }
        Ok(best.map(|(mask, decrease)| (SplitValue::Partition(mask), decrease)))
    }

    fn finalise_candidate_loop(&mut self) {
        if self.base.save_memory {
            self.node_n_by_candidate = Vec::new();
            self.node_n_by_candidate_and_response = Vec::new();
            self.candidate_values = Vec::new();
        }
    }
}

// =============================================================================
// TreeModel
// =============================================================================

impl TreeModel for ClassificationTree {
    fn base(&self) -> &TreeSkeleton {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TreeSkeleton {
        &mut self.base
    }

    fn allocate_node(&mut self) {
        self.base.push_empty_node();
        self.leaf_keys.push(Vec::new());
        self.leaf_most_frequent.push(None);
    }

    fn begin_growth(&mut self, params: &TrainingParameters, data: &Data) -> Result<()> {
        let n_response_key_data = data.response_values().len();

        match params.split_rule {
            SplitRule::Hellinger => {
                if n_response_key_data != 2 {
                    return Err(Error::runtime(
                        "cannot use hellinger metric on non-binary data",
                    ));
                }
            }
            SplitRule::Logrank | SplitRule::ExtraTrees => {}
            SplitRule::Maxstat | SplitRule::Beta => {
                return Err(Error::invalid("unsupported split metric for classification"));
            }
        }

        if !params.response_weights.is_empty()
            && params.response_weights.len() != n_response_key_data
        {
            return Err(Error::invalid(
                "number of response weights does not match number of observed response values",
            ));
        }

        self.n_response_key = n_response_key_data;
        self.response_weights = if params.response_weights.is_empty() {
            vec![1.0; n_response_key_data]
        } else {
            params.response_weights.clone()
        };
        self.node_n_by_response = vec![0; n_response_key_data];
        if data.has_predictor_index() && !self.base.save_memory {
            let n_workspace = data.max_n_unique_value();
            self.node_n_by_candidate.reserve(n_workspace);
            self.node_n_by_candidate_and_response
                .reserve(n_workspace * n_response_key_data);
        }
        self.leaf_keys.clear();
        self.leaf_most_frequent.clear();
        Ok(())
    }

    fn finalise_growth(&mut self) {
        // Resolve the weighted-majority key for every terminal node now so
        // bagged prediction is read-only afterwards.
        let mut counts = vec![0.0; self.n_response_key];
        for node_key in 0..self.base.n_node() {
            if self.leaf_keys[node_key].is_empty() {
                continue;
            }
            counts.iter_mut().for_each(|count| *count = 0.0);
            for &response_key in &self.leaf_keys[node_key] {
                counts[response_key] += self.response_weights[response_key];
            }
            self.leaf_most_frequent[node_key] = draw::most_frequent_key(&counts, &mut self.base.rng);
        }

        self.node_n_by_response = Vec::new();
        self.node_n_by_candidate = Vec::new();
        self.node_n_by_candidate_and_response = Vec::new();
        self.candidate_values = Vec::new();
        self.base.start_pos = Vec::new();
        self.base.end_pos = Vec::new();
    }

    fn add_terminal_node(&mut self, node_key: usize, data: &Data, sample_keys: &[usize]) {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];
        let response_keys = data.response_index();
        let leaf = &mut self.leaf_keys[node_key];
        leaf.clear();
        leaf.reserve(end - start);
        leaf.extend(sample_keys[start..end].iter().map(|&key| response_keys[key]));
    }

    fn responses_equal(&self, data: &Data, lhs_key: usize, rhs_key: usize) -> bool {
        data.get_y(lhs_key, 0) == data.get_y(rhs_key, 0)
    }

    fn push_best_split(
        &mut self,
        node_key: usize,
        params: &TrainingParameters,
        data: &Data,
        sample_keys: &[usize],
        candidate_keys: &[usize],
    ) -> Result<bool> {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];

        // Node aggregates: per-response counts, computed once per node.
        self.node_n_by_response.clear();
        self.node_n_by_response.resize(self.n_response_key, 0);
        let response_keys = data.response_index();
        for &sample_key in &sample_keys[start..end] {
            self.node_n_by_response[response_keys[sample_key]] += 1;
        }

        let use_index = data.has_predictor_index() && !self.base.save_memory;
        let mut best_decrease = f64::NEG_INFINITY;
        let mut best_key = 0usize;
        let mut best_value = SplitValue::Threshold(0.0);

        for &candidate_key in candidate_keys {
            let candidate_best = if self.base.is_ordered[candidate_key] {
                match params.split_rule {
                    SplitRule::ExtraTrees => self.best_threshold_extratrees(
                        candidate_key,
                        node_key,
                        params,
                        data,
                        sample_keys,
                    )?,
                    SplitRule::Hellinger => self.best_threshold::<HellingerDistance>(
                        candidate_key,
                        node_key,
                        params,
                        data,
                        sample_keys,
                        use_index,
                    )?,
                    _ => self.best_threshold::<SumOfSquares>(
                        candidate_key,
                        node_key,
                        params,
                        data,
                        sample_keys,
                        use_index,
                    )?,
                }
            } else {
                match params.split_rule {
                    SplitRule::Hellinger => self.best_partition::<HellingerDistance>(
                        candidate_key,
                        node_key,
                        params,
                        data,
                        sample_keys,
                    )?,
                    _ => self.best_partition::<SumOfSquares>(
                        candidate_key,
                        node_key,
                        params,
                        data,
                        sample_keys,
                    )?,
                }
            };

            if let Some((value, decrease)) = candidate_best {
                if decrease > best_decrease {
                    best_decrease = decrease;
                    best_key = candidate_key;
                    best_value = value;
                }
            }
        }

        self.finalise_candidate_loop();

        if best_decrease > params.min_metric_decrease {
            self.base.split_keys[node_key] = best_key;
            self.base.split_values[node_key] = best_value;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn resample_response_wise_impl(
        &mut self,
        data: &Data,
        replace: bool,
        sample_fraction: &[f64],
        sample_keys: &mut Vec<usize>,
        inbag_counts: &mut [usize],
    ) -> Result<()> {
        let n_sample = data.n_row();
        let buckets = data.sample_keys_by_response();
        if sample_fraction.len() > buckets.len() {
            return Err(Error::invalid(
                "more sample fractions than observed response values",
            ));
        }

        // Per-class counts come from the rounded cumulative fractions, so
        // the fractions need not sum to one.
        let mut cum_start = 0.0f64;
        for (class, &fraction) in sample_fraction.iter().enumerate() {
            let cum_end = cum_start + fraction;
            let n_inbag_class =
                (n_sample as f64 * (cum_end.round() - cum_start.round())) as usize;
            cum_start = cum_end;

            let bucket = &buckets[class];
            if bucket.is_empty() || n_inbag_class == 0 {
                continue;
            }

            if replace {
                for _ in 0..n_inbag_class {
                    let draw = bucket[self.base.rng.gen_range(0..bucket.len())];
                    sample_keys.push(draw);
                    inbag_counts[draw] += 1;
                }
            } else {
                let mut shuffled = bucket.clone();
                use rand::seq::SliceRandom;
                shuffled.shuffle(&mut self.base.rng);
                // Clip so rounded sums past the class size cannot overrun.
                let take = n_inbag_class.min(shuffled.len());
                for &draw in &shuffled[..take] {
                    sample_keys.push(draw);
                    inbag_counts[draw] += 1;
                }
            }
        }
        Ok(())
    }
}
