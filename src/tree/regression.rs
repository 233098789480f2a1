//! Regression tree: leaves hold the response values of the in-bag samples
//! that reached them; split search supports variance reduction, extremely
//! randomised thresholds, the maximally-selected rank statistic, and the
//! beta log-likelihood.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use super::{grow, partition_masks, partition_test, SplitValue, TreeModel, TreeSkeleton};
use crate::data::Data;
use crate::errors::{Error, Result};
use crate::maths;
use crate::params::{SplitRule, TrainingParameters};

/// A grown (or growing) regression tree.
#[derive(Debug, Clone)]
pub struct RegressionTree {
    pub(crate) base: TreeSkeleton,
    /// Response values of the in-bag samples in each terminal node; empty
    /// for internal nodes.
    leaf_values: Vec<Vec<f64>>,
    /// Cached leaf mean per terminal node.
    leaf_mean: Vec<Option<f64>>,
    // Growth workspaces.
    node_sum: f64,
    node_var: f64,
    response_scores: Vec<f64>,
    node_n_by_candidate: Vec<usize>,
    node_sum_by_candidate: Vec<f64>,
    response_by_candidate: Vec<Vec<f64>>,
    candidate_values: Vec<f64>,
}

impl RegressionTree {
    pub fn new(save_memory: bool, n_predictor: usize, is_ordered: Arc<Vec<bool>>) -> Self {
        RegressionTree {
            base: TreeSkeleton::new(save_memory, n_predictor, is_ordered),
            leaf_values: Vec::new(),
            leaf_mean: Vec::new(),
            node_sum: 0.0,
            node_var: 0.0,
            response_scores: Vec::new(),
            node_n_by_candidate: Vec::new(),
            node_sum_by_candidate: Vec::new(),
            response_by_candidate: Vec::new(),
            candidate_values: Vec::new(),
        }
    }

    /// Rebuild from persisted state.
    pub(crate) fn from_parts(
        base: TreeSkeleton,
        leaf_values: Vec<Vec<f64>>,
        leaf_mean: Vec<Option<f64>>,
    ) -> Self {
        RegressionTree {
            base,
            leaf_values,
            leaf_mean,
            node_sum: 0.0,
            node_var: 0.0,
            response_scores: Vec::new(),
            node_n_by_candidate: Vec::new(),
            node_sum_by_candidate: Vec::new(),
            response_by_candidate: Vec::new(),
            candidate_values: Vec::new(),
        }
    }

    pub fn skeleton(&self) -> &TreeSkeleton {
        &self.base
    }

    pub fn seed(&mut self, seed: u64) {
        self.base.seed(seed);
    }

    pub fn leaf_values(&self) -> &[Vec<f64>] {
        &self.leaf_values
    }

    pub fn leaf_mean(&self) -> &[Option<f64>] {
        &self.leaf_mean
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

    /// Bagged prediction for a case: the cached mean of its terminal node.
    pub(crate) fn predict_bagged(&self, data: &Data, sample_key: usize) -> Option<f64> {
        let node_key = self.base.terminal_node_key(data, sample_key);
        self.leaf_mean[node_key]
    }

    /// In-bag prediction: a uniform draw from the terminal node's values.
    pub(crate) fn predict_inbag(&mut self, data: &Data, sample_key: usize) -> Option<f64> {
        let node_key = self.base.terminal_node_key(data, sample_key);
        let leaf = &self.leaf_values[node_key];
        if leaf.is_empty() {
            return None;
        }
        Some(leaf[self.base.rng.gen_range(0..leaf.len())])
    }

    pub(crate) fn predict_node(&self, data: &Data, sample_key: usize) -> usize {
        self.base.terminal_node_key(data, sample_key)
    }

    pub(crate) fn same_structure(&self, other: &RegressionTree) -> bool {
        self.base.same_structure(&other.base)
            && self.leaf_values == other.leaf_values
            && self.leaf_mean == other.leaf_mean
    }

    // =========================================================================
    // Candidate bucketisation
    // =========================================================================

    /// Zero `n_bucket` buckets and fill per-bucket counts and response sums;
    /// optionally keep the raw responses per bucket (beta rule).
    fn fill_buckets(
        &mut self,
        node_range: (usize, usize),
        n_bucket: usize,
        keep_responses: bool,
        data: &Data,
        sample_keys: &[usize],
        bucket_of: impl Fn(&Data, usize) -> usize,
    ) {
        self.node_n_by_candidate.clear();
        self.node_n_by_candidate.resize(n_bucket, 0);
        self.node_sum_by_candidate.clear();
        self.node_sum_by_candidate.resize(n_bucket, 0.0);
        if keep_responses {
            self.response_by_candidate.resize(n_bucket, Vec::new());
            for responses in &mut self.response_by_candidate {
                responses.clear();
            }
        }

        for &sample_key in &sample_keys[node_range.0..node_range.1] {
            let bucket = bucket_of(data, sample_key);
            let response = data.get_y(sample_key, 0);
            self.node_n_by_candidate[bucket] += 1;
            self.node_sum_by_candidate[bucket] += response;
            if keep_responses {
                self.response_by_candidate[bucket].push(response);
            }
        }
    }

    /// Sweep buckets accumulating variance-reduction decreases.
    fn scan_buckets_logrank(
        &self,
        n_sweep: usize,
        n_sample_node: usize,
        min_leaf_n_sample: usize,
    ) -> Option<(usize, f64)> {
        let mut n_lhs = 0usize;
        let mut sum_lhs = 0.0;
        let mut best: Option<(usize, f64)> = None;

        for j in 0..n_sweep {
            if self.node_n_by_candidate[j] == 0 {
                continue;
            }
            n_lhs += self.node_n_by_candidate[j];
            sum_lhs += self.node_sum_by_candidate[j];
            if n_lhs < min_leaf_n_sample {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < min_leaf_n_sample {
                break;
            }
            let sum_rhs = self.node_sum - sum_lhs;
            let decrease =
                sum_rhs * sum_rhs / n_rhs as f64 + sum_lhs * sum_lhs / n_lhs as f64;
            if best.map_or(true, |(_, d)| decrease > d) {
                best = Some((j, decrease));
            }
        }
        best
    }

    /// Sweep buckets accumulating beta log-likelihood decreases.
    fn scan_buckets_beta(
        &self,
        n_sweep: usize,
        n_sample_node: usize,
        min_leaf_n_sample: usize,
    ) -> Option<(usize, f64)> {
        let mut n_lhs = 0usize;
        let mut sum_lhs = 0.0;
        let mut best: Option<(usize, f64)> = None;

        for j in 0..n_sweep {
            if self.node_n_by_candidate[j] == 0 {
                continue;
            }
            n_lhs += self.node_n_by_candidate[j];
            sum_lhs += self.node_sum_by_candidate[j];
            if n_lhs < min_leaf_n_sample {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < min_leaf_n_sample {
                break;
            }
            let sum_rhs = self.node_sum - sum_lhs;
            let decrease = self.beta_decrease(j, n_lhs, n_rhs, sum_lhs, sum_rhs);
            if decrease.is_finite() && best.map_or(true, |(_, d)| decrease > d) {
                best = Some((j, decrease));
            }
        }
        best
    }

    /// Total beta log-likelihood of a method-of-moments fit to each side of
    /// the split after bucket `j_split`.
    fn beta_decrease(
        &self,
        j_split: usize,
        n_lhs: usize,
        n_rhs: usize,
        sum_lhs: f64,
        sum_rhs: f64,
    ) -> f64 {
        if n_lhs < 2 || n_rhs < 2 {
            return f64::NEG_INFINITY;
        }
        let mu_lhs = sum_lhs / n_lhs as f64;
        let mu_rhs = sum_rhs / n_rhs as f64;

        let mut var_lhs = 0.0;
        let mut var_rhs = 0.0;
        for (j, responses) in self.response_by_candidate.iter().enumerate() {
            for &response in responses {
                if j <= j_split {
                    var_lhs += (response - mu_lhs).powi(2);
                } else {
                    var_rhs += (response - mu_rhs).powi(2);
                }
            }
        }
        var_lhs /= (n_lhs - 1) as f64;
        var_rhs /= (n_rhs - 1) as f64;
        if var_lhs <= f64::EPSILON || var_rhs <= f64::EPSILON {
            return f64::NEG_INFINITY;
        }

        let nu_lhs = mu_lhs * (1.0 - mu_lhs) / var_lhs - 1.0;
        let nu_rhs = mu_rhs * (1.0 - mu_rhs) / var_rhs - 1.0;

        let mut log_likelihood = 0.0;
        for (j, responses) in self.response_by_candidate.iter().enumerate() {
            for &response in responses {
                log_likelihood += if j <= j_split {
                    maths::beta_log_likelihood(response, mu_lhs, nu_lhs)
                } else {
                    maths::beta_log_likelihood(response, mu_rhs, nu_rhs)
                };
            }
        }
        if log_likelihood.is_nan() {
            f64::NEG_INFINITY
        } else {
            log_likelihood
        }
    }

    /// Best threshold for one ordered candidate under logrank or beta.
    fn best_threshold(
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
        let keep_responses = params.split_rule == SplitRule::Beta;

        let scan = |tree: &RegressionTree, n_sweep: usize| {
            if keep_responses {
                tree.scan_buckets_beta(n_sweep, n_sample_node, params.min_leaf_n_sample)
            } else {
                tree.scan_buckets_logrank(n_sweep, n_sample_node, params.min_leaf_n_sample)
            }
        };

        if use_index {
            let n_candidate = data.n_unique_value(candidate_key);
            if n_candidate < 2 {
                return Ok(None);
            }
            self.fill_buckets(
                (start, end),
                n_candidate,
                keep_responses,
                data,
                sample_keys,
                |d, key| d.unique_key(key, candidate_key, false),
            );
            Ok(scan(self, n_candidate - 1).map(|(j, decrease)| {
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
            self.fill_buckets(
                (start, end),
                n_candidate,
                keep_responses,
                data,
                sample_keys,
                |d, key| {
                    candidate_values.partition_point(|v| *v < d.get_x(key, candidate_key, false))
                },
            );
            let best = scan(self, n_candidate - 1)
                .map(|(j, decrease)| (SplitValue::Threshold(candidate_values[j]), decrease));
            self.candidate_values = candidate_values;
            Ok(best)
        }
    }

    /// Extremely randomised threshold search with the variance-reduction
    /// objective.
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

        self.fill_buckets(
            (start, end),
            n_candidate + 1,
            false,
            data,
            sample_keys,
            |d, key| thresholds.partition_point(|v| *v < d.get_x(key, candidate_key, false)),
        );
        Ok(self
            .scan_buckets_logrank(n_candidate, n_sample_node, params.min_leaf_n_sample)
            .map(|(j, decrease)| (SplitValue::Threshold(thresholds[j]), decrease)))
    }

    /// Maximally-selected rank statistic for one ordered candidate: the best
    /// standardised score and the smaller of the two p-value approximations.
    fn best_statistic_maxstat(
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

        let mut values = std::mem::take(&mut self.candidate_values);
        data.get_all_values(&mut values, sample_keys, candidate_key, start, end, false)?;
        self.candidate_values = values;
        let n_candidate = self.candidate_values.len();
        if n_candidate < 2 {
            return Ok(None);
        }

        // Bucket the rank scores by candidate value; scores are node-local
        // so the whole-data unique-value index does not apply here.
        self.node_n_by_candidate.clear();
        self.node_n_by_candidate.resize(n_candidate, 0);
        self.node_sum_by_candidate.clear();
        self.node_sum_by_candidate.resize(n_candidate, 0.0);
        for (offset, &sample_key) in sample_keys[start..end].iter().enumerate() {
            let bucket = self
                .candidate_values
                .partition_point(|v| *v < data.get_x(sample_key, candidate_key, false));
            self.node_n_by_candidate[bucket] += 1;
            self.node_sum_by_candidate[bucket] += self.response_scores[offset];
        }

        let min_split = ((n_sample_node as f64 * params.min_prop - 1.0).max(0.0)) as usize;
        let min_count = params.min_leaf_n_sample.max(min_split);

        let mu = self.node_sum / n_sample_node as f64;
        let mut n_lhs = 0usize;
        let mut sum_lhs = 0.0;
        let mut best: Option<(usize, f64)> = None;
        for j in 0..n_candidate - 1 {
            if self.node_n_by_candidate[j] == 0 {
                continue;
            }
            n_lhs += self.node_n_by_candidate[j];
            sum_lhs += self.node_sum_by_candidate[j];
            if n_lhs < min_count {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < min_count {
                break;
            }
            let expectation = n_lhs as f64 * mu;
            let variance =
                n_lhs as f64 * n_rhs as f64 * self.node_var / n_sample_node as f64;
            let statistic = ((sum_lhs - expectation) / variance.sqrt()).abs();
            if best.map_or(true, |(_, s)| statistic > s) {
                best = Some((j, statistic));
            }
        }

        Ok(best.map(|(j, statistic)| {
            let p_92 = maths::maxstat_p_value_lausen92(statistic, params.min_prop);
            let p_94 = maths::maxstat_p_value_lausen94(
                statistic,
                n_sample_node,
                &self.node_n_by_candidate,
                j + 1,
                params.min_prop,
            );
            (
                SplitValue::Threshold(self.candidate_values[j]),
                p_92.min(p_94),
            )
        }))
    }

    /// Best level partition for one unordered candidate predictor.
    fn best_partition(
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
        let beta = params.split_rule == SplitRule::Beta;

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

        let mut best: Option<(u64, f64)> = None;
        let mut lhs_responses = Vec::new();
        let mut rhs_responses = Vec::new();

        for mask in masks {
            let mut n_lhs = 0usize;
            let mut sum_lhs = 0.0;
            if beta {
                lhs_responses.clear();
                rhs_responses.clear();
            }
            for &sample_key in &sample_keys[start..end] {
                let value = data.get_x(sample_key, candidate_key, false);
                let response = data.get_y(sample_key, 0);
                if !partition_test(mask, value) {
                    n_lhs += 1;
                    sum_lhs += response;
                    if beta {
                        lhs_responses.push(response);
                    }
                } else if beta {
                    rhs_responses.push(response);
                }
            }
            if n_lhs < params.min_leaf_n_sample {
                continue;
            }
            let n_rhs = n_sample_node - n_lhs;
            if n_rhs < params.min_leaf_n_sample {
                continue;
            }
            let sum_rhs = self.node_sum - sum_lhs;

            let decrease = if beta {
                beta_decrease_from_sides(&lhs_responses, &rhs_responses)
            } else {
                sum_rhs * sum_rhs / n_rhs as f64 + sum_lhs * sum_lhs / n_lhs as f64
            };
            if decrease.is_finite() && best.map_or(true, |(_, d)| decrease > d) {
                best = Some((mask, decrease));
            }
        }
        Ok(best.map(|(mask, decrease)| (SplitValue::Partition(mask), decrease)))
    }

    fn finalise_candidate_loop(&mut self) {
        if self.base.save_memory {
            self.node_n_by_candidate = Vec::new();
            self.node_sum_by_candidate = Vec::new();
            self.response_by_candidate = Vec::new();
            self.candidate_values = Vec::new();
        }
    }
}

/// Beta log-likelihood of a split given the raw responses on each side.
fn beta_decrease_from_sides(lhs: &[f64], rhs: &[f64]) -> f64 {
    let n_lhs = lhs.len();
    let n_rhs = rhs.len();
    if n_lhs < 2 || n_rhs < 2 {
        return f64::NEG_INFINITY;
    }
    let mu_lhs = lhs.iter().sum::<f64>() / n_lhs as f64;
    let mu_rhs = rhs.iter().sum::<f64>() / n_rhs as f64;
    let var_lhs = maths::sample_variance(lhs);
    let var_rhs = maths::sample_variance(rhs);
    if var_lhs <= f64::EPSILON || var_rhs <= f64::EPSILON {
        return f64::NEG_INFINITY;
    }
    let nu_lhs = mu_lhs * (1.0 - mu_lhs) / var_lhs - 1.0;
    let nu_rhs = mu_rhs * (1.0 - mu_rhs) / var_rhs - 1.0;

    let log_likelihood: f64 = lhs
        .iter()
        .map(|&response| maths::beta_log_likelihood(response, mu_lhs, nu_lhs))
        .chain(
            rhs.iter()
                .map(|&response| maths::beta_log_likelihood(response, mu_rhs, nu_rhs)),
        )
        .sum();
    if log_likelihood.is_nan() {
        f64::NEG_INFINITY
    } else {
        log_likelihood
    }
}

// =============================================================================
// TreeModel
// =============================================================================

impl TreeModel for RegressionTree {
    fn base(&self) -> &TreeSkeleton {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TreeSkeleton {
        &mut self.base
    }

    fn allocate_node(&mut self) {
        self.base.push_empty_node();
        self.leaf_values.push(Vec::new());
        self.leaf_mean.push(None);
    }

    fn begin_growth(&mut self, params: &TrainingParameters, data: &Data) -> Result<()> {
        match params.split_rule {
            SplitRule::Beta
            | SplitRule::ExtraTrees
            | SplitRule::Logrank
            | SplitRule::Maxstat => {}
            SplitRule::Hellinger => {
                return Err(Error::invalid("unsupported split metric for regression"));
            }
        }
        if data.has_predictor_index() && !self.base.save_memory {
            let n_workspace = data.max_n_unique_value();
            self.node_n_by_candidate.reserve(n_workspace);
            self.node_sum_by_candidate.reserve(n_workspace);
        }
        self.leaf_values.clear();
        self.leaf_mean.clear();
        Ok(())
    }

    fn finalise_growth(&mut self) {
        for node_key in 0..self.base.n_node() {
            if self.leaf_values[node_key].is_empty() {
                continue;
            }
            let leaf = &self.leaf_values[node_key];
            self.leaf_mean[node_key] = Some(leaf.iter().sum::<f64>() / leaf.len() as f64);
        }

        self.response_scores = Vec::new();
        self.node_n_by_candidate = Vec::new();
        self.node_sum_by_candidate = Vec::new();
        self.response_by_candidate = Vec::new();
        self.candidate_values = Vec::new();
        self.base.start_pos = Vec::new();
        self.base.end_pos = Vec::new();
    }

    fn add_terminal_node(&mut self, node_key: usize, data: &Data, sample_keys: &[usize]) {
        let start = self.base.start_pos[node_key];
        let end = self.base.end_pos[node_key];
        let leaf = &mut self.leaf_values[node_key];
        leaf.clear();
        leaf.reserve(end - start);
        leaf.extend(sample_keys[start..end].iter().map(|&key| data.get_y(key, 0)));
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
        let n_sample_node = end - start;

        // Node aggregates: plain response sums, or rank scores and their
        // variance for maxstat.
        if params.split_rule == SplitRule::Maxstat {
            let responses: Vec<f64> = sample_keys[start..end]
                .iter()
                .map(|&key| data.get_y(key, 0))
                .collect();
            self.response_scores = maths::rank(&responses);
            self.node_sum = self.response_scores.iter().sum();
            let mean = self.node_sum / n_sample_node as f64;
            self.node_var = self
                .response_scores
                .iter()
                .map(|score| (score - mean).powi(2))
                .sum::<f64>()
                / (n_sample_node - 1) as f64;
        } else {
            self.node_sum = sample_keys[start..end]
                .iter()
                .map(|&key| data.get_y(key, 0))
                .sum();
        }

        let use_index = data.has_predictor_index() && !self.base.save_memory;
        let found = if params.split_rule == SplitRule::Maxstat {
            // Candidates compete on p-value; the split is kept iff the best
            // p-value is at most alpha (= -min_metric_decrease).
            let mut best_p_value = f64::INFINITY;
            let mut best_key = 0usize;
            let mut best_value = SplitValue::Threshold(0.0);
            for &candidate_key in candidate_keys {
                if !self.base.is_ordered[candidate_key] {
                    continue;
                }
                if let Some((value, p_value)) =
                    self.best_statistic_maxstat(candidate_key, node_key, params, data, sample_keys)?
                {
                    if p_value < best_p_value {
                        best_p_value = p_value;
                        best_key = candidate_key;
                        best_value = value;
                    }
                }
            }
            let alpha = -params.min_metric_decrease;
            if best_p_value <= alpha {
                self.base.split_keys[node_key] = best_key;
                self.base.split_values[node_key] = best_value;
                true
            } else {
                false
            }
        } else {
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
                        _ => self.best_threshold(
                            candidate_key,
                            node_key,
                            params,
                            data,
                            sample_keys,
                            use_index,
                        )?,
                    }
                } else {
                    self.best_partition(candidate_key, node_key, params, data, sample_keys)?
                };
                if let Some((value, decrease)) = candidate_best {
                    if decrease > best_decrease {
                        best_decrease = decrease;
                        best_key = candidate_key;
                        best_value = value;
                    }
                }
            }
            if best_decrease > params.min_metric_decrease {
                self.base.split_keys[node_key] = best_key;
                self.base.split_values[node_key] = best_value;
                true
            } else {
                false
            }
        };

        self.response_scores.clear();
        self.finalise_candidate_loop();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Parallelism;
    use crate::data::DenseMatrix;

    fn ramp_data() -> Data {
        let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0], 4, 1);
        let y = DenseMatrix::from_column(vec![1.0, 2.0, 3.0, 4.0]);
        Data::from_dense(x, y).unwrap()
    }

    fn variance_parameters() -> TrainingParameters {
        TrainingParameters {
            replace: false,
            sample_fraction: vec![1.0],
            n_try: 1,
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
        }
    }

    fn grown_tree(data: &Data, params: &TrainingParameters) -> RegressionTree {
        let mut tree = RegressionTree::new(false, 1, Arc::new(vec![true]));
        tree.seed(1);
        tree.grow(params, data, &[], false).unwrap();
        tree
    }

    #[test]
    fn ramp_predictions_are_non_decreasing() {
        let mut data = ramp_data();
        data.new_predictor_index(Parallelism::Sequential);
        let tree = grown_tree(&data, &variance_parameters());

        assert!(tree.base.n_node() >= 3);
        assert_eq!(tree.base.split_keys()[0], 0);
        let predictions: Vec<f64> = (0..4)
            .map(|row| tree.predict_bagged(&data, row).unwrap())
            .collect();
        for pair in predictions.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn constant_response_keeps_root_terminal() {
        let x = DenseMatrix::from_vec(vec![0.0, 1.0, 2.0, 3.0], 4, 1);
        let y = DenseMatrix::from_column(vec![2.5; 4]);
        let mut data = Data::from_dense(x, y).unwrap();
        data.new_predictor_index(Parallelism::Sequential);

        let tree = grown_tree(&data, &variance_parameters());
        assert_eq!(tree.base.n_node(), 1);
        assert_eq!(tree.predict_bagged(&data, 0), Some(2.5));
    }

    #[test]
    fn hellinger_rejected_for_regression() {
        let data = ramp_data();
        let mut params = variance_parameters();
        params.split_rule = SplitRule::Hellinger;
        let mut tree = RegressionTree::new(false, 1, Arc::new(vec![true]));
        assert!(matches!(
            tree.grow(&params, &data, &[], false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn maxstat_splits_a_sharp_step() {
        // A strong location shift: maxstat should find the boundary and the
        // p-value should clear a permissive alpha.
        let n = 40;
        let x = DenseMatrix::from_vec((0..n).map(|j| j as f64).collect(), n, 1);
        let y = DenseMatrix::from_column(
            (0..n).map(|j| if j < n / 2 { 0.0 + j as f64 * 0.01 } else { 10.0 + j as f64 * 0.01 }).collect(),
        );
        let mut data = Data::from_dense(x, y).unwrap();
        data.new_predictor_index(Parallelism::Sequential);

        let mut params = variance_parameters();
        params.split_rule = SplitRule::Maxstat;
        params.min_metric_decrease = -0.5; // alpha = 0.5
        params.min_prop = 0.1;
        params.min_split_n_sample = 5;
        let tree = grown_tree(&data, &params);

        assert!(tree.base.n_node() >= 3);
        match tree.base.split_values()[0] {
            SplitValue::Threshold(v) => assert!((15.0..25.0).contains(&v), "split at {v}"),
            SplitValue::Partition(_) => panic!("expected threshold split"),
        }
    }

    #[test]
    fn maxstat_with_strict_alpha_rejects_noise() {
        // Nearly balanced responses: every candidate's p-value stays above a
        // tiny alpha, so the root remains terminal.
        let x = DenseMatrix::from_vec((0..8).map(f64::from).collect(), 8, 1);
        let y = DenseMatrix::from_column(vec![1.0, 2.0, 1.5, 2.5, 1.2, 2.2, 1.7, 2.7]);
        let mut data = Data::from_dense(x, y).unwrap();
        data.new_predictor_index(Parallelism::Sequential);

        let mut params = variance_parameters();
        params.split_rule = SplitRule::Maxstat;
        params.min_metric_decrease = -1e-12;
        let tree = grown_tree(&data, &params);
        assert_eq!(tree.base.n_node(), 1);
    }

    #[test]
    fn beta_splits_unit_interval_responses() {
        // Two clusters well inside (0, 1).
        let n = 20;
        let x = DenseMatrix::from_vec((0..n).map(|j| j as f64).collect(), n, 1);
        let y = DenseMatrix::from_column(
            (0..n)
                .map(|j| {
                    if j < n / 2 {
                        0.15 + 0.01 * (j % 5) as f64
                    } else {
                        0.75 + 0.01 * (j % 5) as f64
                    }
                })
                .collect(),
        );
        let mut data = Data::from_dense(x, y).unwrap();
        data.new_predictor_index(Parallelism::Sequential);

        let mut params = variance_parameters();
        params.split_rule = SplitRule::Beta;
        params.min_metric_decrease = -f64::MAX;
        params.min_split_n_sample = 5;
        params.min_leaf_n_sample = 2;
        let tree = grown_tree(&data, &params);

        assert!(tree.base.n_node() >= 3);
        let low = tree.predict_bagged(&data, 0).unwrap();
        let high = tree.predict_bagged(&data, n - 1).unwrap();
        assert!(low < 0.5 && high > 0.5);
    }

    #[test]
    fn extratrees_recovers_ramp_direction() {
        let mut data = ramp_data();
        data.new_predictor_index(Parallelism::Sequential);
        let mut params = variance_parameters();
        params.split_rule = SplitRule::ExtraTrees;
        params.n_random_split = 4;
        let tree = grown_tree(&data, &params);
        let low = tree.predict_bagged(&data, 0).unwrap();
        let high = tree.predict_bagged(&data, 3).unwrap();
        assert!(low < high);
    }

    #[test]
    fn inbag_prediction_draws_from_leaf_values() {
        let mut data = ramp_data();
        data.new_predictor_index(Parallelism::Sequential);
        let mut tree = grown_tree(&data, &variance_parameters());
        let node_key = tree.predict_node(&data, 0);
        let leaf = tree.leaf_values()[node_key].clone();
        for _ in 0..10 {
            let drawn = tree.predict_inbag(&data, 0).unwrap();
            assert!(leaf.contains(&drawn));
        }
    }
}
