//! Enumerated model types and per-tree training parameters.
//!
//! The string names accepted by [`TreeType::from_name`],
//! [`SplitRule::from_name`], and [`PredictionType::from_name`] are exact and
//! case-sensitive; they are also the tags written by the model format.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

// =============================================================================
// TreeType
// =============================================================================

/// Kind of response a forest models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeType {
    /// Categorical response; leaves hold response-key multisets.
    Classification,
    /// Scalar response; leaves hold response-value multisets.
    Regression,
}

impl TreeType {
    /// Parse a tree-type name ("classification" or "regression").
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "classification" => Ok(TreeType::Classification),
            "regression" => Ok(TreeType::Regression),
            other => Err(Error::invalid(format!("invalid tree type '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TreeType::Classification => "classification",
            TreeType::Regression => "regression",
        }
    }
}

// =============================================================================
// SplitRule
// =============================================================================

/// Rule used to score candidate splits.
///
/// `Logrank` is the historical tag for the weighted sum-of-squares criterion
/// (Gini for classification, variance reduction for regression); both the
/// "gini" and "variance" names map to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    Logrank,
    Maxstat,
    ExtraTrees,
    Beta,
    Hellinger,
}

impl SplitRule {
    /// Parse a split-rule name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gini" | "variance" => Ok(SplitRule::Logrank),
            "maxstat" => Ok(SplitRule::Maxstat),
            "extratrees" => Ok(SplitRule::ExtraTrees),
            "beta" => Ok(SplitRule::Beta),
            "hellinger" => Ok(SplitRule::Hellinger),
            other => Err(Error::invalid(format!("invalid split rule '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SplitRule::Logrank => "gini",
            SplitRule::Maxstat => "maxstat",
            SplitRule::ExtraTrees => "extratrees",
            SplitRule::Beta => "beta",
            SplitRule::Hellinger => "hellinger",
        }
    }

    /// The minimum metric decrease implied by the rule when none is given:
    /// zero for the impurity-style rules, `-alpha` for maxstat (splits are
    /// kept iff their p-value is at most `alpha`), and the most permissive
    /// bound for beta whose objective is a log-likelihood.
    pub fn default_min_metric_decrease(self, alpha: f64) -> f64 {
        match self {
            SplitRule::Logrank | SplitRule::ExtraTrees | SplitRule::Hellinger => 0.0,
            SplitRule::Beta => -f64::MAX,
            SplitRule::Maxstat => -alpha,
        }
    }
}

// =============================================================================
// PredictionType
// =============================================================================

/// How per-tree predictions are produced and aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Bootstrap-aggregated over all trees (majority vote / mean).
    Bagged,
    /// Each case is answered by one randomly assigned tree drawing uniformly
    /// from that tree's in-bag leaf sample.
    Inbag,
    /// Terminal node index for every tree.
    Nodes,
}

impl PredictionType {
    /// Parse a prediction-type name ("bagged", "inbag" or "nodes").
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bagged" => Ok(PredictionType::Bagged),
            "inbag" => Ok(PredictionType::Inbag),
            "nodes" => Ok(PredictionType::Nodes),
            other => Err(Error::invalid(format!("invalid prediction type '{other}'"))),
        }
    }
}

// =============================================================================
// TrainingParameters
// =============================================================================

/// Parameters that govern resampling, candidate drawing, and node splitting
/// for one tree. A forest takes one of these per tree.
#[derive(Debug, Clone)]
pub struct TrainingParameters {
    /// Sample with replacement when resampling cases.
    pub replace: bool,
    /// Fraction of cases drawn per tree. A single element applies uniformly;
    /// a vector of length R gives per-response-class fractions
    /// (classification only).
    pub sample_fraction: Vec<f64>,
    /// Number of candidate predictors drawn (without replacement) per split.
    pub n_try: usize,
    /// Predictor keys appended to every candidate draw (sorted).
    pub draw_always_predictor_keys: Vec<usize>,
    /// Per-predictor draw weights; empty means uniform.
    pub draw_predictor_weights: Vec<f64>,
    /// Per-response-class weights (classification); empty means uniform.
    pub response_weights: Vec<f64>,
    /// Rule used to score candidate splits.
    pub split_rule: SplitRule,
    /// Minimum decrease in the split metric for an acceptable split.
    pub min_metric_decrease: f64,
    /// Maximum tree depth; 0 means unlimited.
    pub max_depth: usize,
    /// Minimum in-bag samples a node must hold to be considered for splitting.
    pub min_split_n_sample: usize,
    /// Minimum in-bag samples in each child created by a split.
    pub min_leaf_n_sample: usize,
    /// Number of random thresholds drawn per candidate under the extratrees
    /// rule; must be positive iff the rule is extratrees.
    pub n_random_split: usize,
    /// Smallest child proportion considered by the maxstat rule.
    pub min_prop: f64,
}

impl TrainingParameters {
    /// Validate the parameter combination independent of any data set.
    pub fn validate(&self) -> Result<()> {
        if self.n_try == 0 {
            return Err(Error::invalid("'n_try' must be positive"));
        }
        if self.split_rule == SplitRule::ExtraTrees && self.n_random_split == 0 {
            return Err(Error::domain(
                "'n_random_split' must be positive for the extratrees rule",
            ));
        }
        if self.sample_fraction.is_empty() {
            return Err(Error::invalid("'sample_fraction' must not be empty"));
        }
        if self.sample_fraction.iter().any(|&f| f < 0.0) {
            return Err(Error::domain("'sample_fraction' must be non-negative"));
        }
        if self.draw_predictor_weights.iter().any(|&w| w < 0.0) {
            return Err(Error::domain(
                "one or more draw-predictor weights not in range [0, inf)",
            ));
        }
        Ok(())
    }

    /// True when resampling is stratified by response class.
    pub fn is_response_wise(&self) -> bool {
        self.sample_fraction.len() > 1
    }
}

/// Default number of candidate predictors per split: `max(1, floor(sqrt(p)))`.
pub fn default_n_try(n_predictor: usize) -> usize {
    ((n_predictor as f64).sqrt().floor() as usize).max(1)
}

/// Default minimum node size for splitting, by tree type.
pub fn default_min_split_n_sample(tree_type: TreeType) -> usize {
    match tree_type {
        TreeType::Classification => 2,
        TreeType::Regression => 5,
    }
}

/// Default minimum leaf size, by tree type.
pub fn default_min_leaf_n_sample(_tree_type: TreeType) -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_rule_names() {
        assert_eq!(SplitRule::from_name("gini").unwrap(), SplitRule::Logrank);
        assert_eq!(SplitRule::from_name("variance").unwrap(), SplitRule::Logrank);
        assert_eq!(SplitRule::from_name("maxstat").unwrap(), SplitRule::Maxstat);
        assert_eq!(SplitRule::from_name("extratrees").unwrap(), SplitRule::ExtraTrees);
        assert_eq!(SplitRule::from_name("beta").unwrap(), SplitRule::Beta);
        assert_eq!(SplitRule::from_name("hellinger").unwrap(), SplitRule::Hellinger);
        assert!(SplitRule::from_name("Gini").is_err());
        assert!(SplitRule::from_name("").is_err());
    }

    #[test]
    fn tree_type_names() {
        assert_eq!(TreeType::from_name("classification").unwrap(), TreeType::Classification);
        assert_eq!(TreeType::from_name("regression").unwrap(), TreeType::Regression);
        assert!(TreeType::from_name("survival").is_err());
    }

    #[test]
    fn default_resolution() {
        assert_eq!(default_n_try(1), 1);
        assert_eq!(default_n_try(9), 3);
        assert_eq!(default_n_try(10), 3);
        assert_eq!(default_min_split_n_sample(TreeType::Classification), 2);
        assert_eq!(default_min_split_n_sample(TreeType::Regression), 5);
        assert_eq!(SplitRule::Maxstat.default_min_metric_decrease(0.05), -0.05);
        assert_eq!(SplitRule::Logrank.default_min_metric_decrease(0.05), 0.0);
    }

    fn base_parameters() -> TrainingParameters {
        TrainingParameters {
            replace: true,
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

    #[test]
    fn validation_rejects_zero_n_try() {
        let mut params = base_parameters();
        params.n_try = 0;
        assert!(matches!(params.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn validation_rejects_extratrees_without_random_splits() {
        let mut params = base_parameters();
        params.split_rule = SplitRule::ExtraTrees;
        params.n_random_split = 0;
        assert!(params.validate().is_err());
        params.n_random_split = 1;
        assert!(params.validate().is_ok());
    }
}
