//! High-level training and prediction front.
//!
//! [`RandomForestSettings`] carries the string-typed options of the external
//! interface (tree type, split rule, predictor names); [`RandomForest::train`]
//! resolves names and defaults, replicates the per-tree parameters, plants
//! the forest, and records the resolved values alongside the model handle.

use crate::data::Data;
use crate::errors::{Error, Result};
use crate::forest::{merge_forests, Forest, PlantOptions, PredictOptions, Predictions};
use crate::io::payload::ModelMetadata;
use crate::io::{deserialize_forest, serialize_forest, DeserializeError, SerializeError};
use crate::params::{
    default_min_leaf_n_sample, default_min_split_n_sample, default_n_try, PredictionType,
    SplitRule, TrainingParameters, TreeType,
};
use crate::progress::Monitor;

// =============================================================================
// Settings
// =============================================================================

/// Options for a training call. String-typed fields use the exact,
/// case-sensitive names of the external interface; zero-valued counts are
/// resolved to their defaults during training.
#[derive(Debug, Clone)]
pub struct RandomForestSettings {
    /// "classification" or "regression".
    pub tree_type: String,
    pub n_tree: usize,
    /// One name per predictor column.
    pub predictor_names: Vec<String>,
    /// Predictors treated as unordered factors (subset of predictor names).
    pub names_of_unordered: Vec<String>,
    pub replace: bool,
    /// Scalar fraction, or per-response-class fractions (classification).
    pub sample_fraction: Vec<f64>,
    /// Candidates per split; 0 resolves to `max(1, floor(sqrt(p)))`.
    pub n_try: usize,
    /// Candidate-draw weights: empty, a single shared vector, or one vector
    /// per tree.
    pub draw_predictor_weights: Vec<Vec<f64>>,
    /// Predictors added to every candidate draw (subset of predictor names).
    pub names_of_always_draw: Vec<String>,
    /// "gini", "variance", "maxstat", "extratrees", "beta" or "hellinger".
    pub split_rule: String,
    /// 0 means unlimited.
    pub max_depth: usize,
    /// 0 resolves to 2 (classification) or 5 (regression).
    pub min_split_n_sample: usize,
    /// 0 resolves to 1.
    pub min_leaf_n_sample: usize,
    /// Per-class response weights (classification; empty = uniform).
    pub response_weights: Vec<f64>,
    /// Random thresholds per candidate for the extratrees rule.
    pub n_random_split: usize,
    /// Significance level for the maxstat rule.
    pub alpha: f64,
    /// Smallest child proportion for the maxstat rule.
    pub min_prop: f64,
    /// 0 draws from a non-deterministic source.
    pub seed: u64,
    /// Skip the shared predictor index; rebuild candidate values per node.
    pub save_memory: bool,
    /// 0 picks the hardware parallelism.
    pub n_thread: usize,
    pub verbose: bool,
}

impl Default for RandomForestSettings {
    fn default() -> Self {
        RandomForestSettings {
            tree_type: "classification".to_string(),
            n_tree: 500,
            predictor_names: Vec::new(),
            names_of_unordered: Vec::new(),
            replace: true,
            sample_fraction: vec![1.0],
            n_try: 0,
            draw_predictor_weights: Vec::new(),
            names_of_always_draw: Vec::new(),
            split_rule: "gini".to_string(),
            max_depth: 0,
            min_split_n_sample: 0,
            min_leaf_n_sample: 0,
            response_weights: Vec::new(),
            n_random_split: 1,
            alpha: 0.5,
            min_prop: 0.1,
            seed: 0,
            save_memory: false,
            n_thread: 0,
            verbose: false,
        }
    }
}

/// Resolve a subset of predictor names to sorted column keys.
fn resolve_name_keys(names: &[String], predictor_names: &[String]) -> Result<Vec<usize>> {
    let mut keys = Vec::with_capacity(names.len());
    for name in names {
        let key = predictor_names
            .iter()
            .position(|candidate| candidate == name)
            .ok_or_else(|| Error::invalid(format!("unknown predictor name '{name}'")))?;
        keys.push(key);
    }
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

/// Validate and normalise one candidate-draw weight vector: always-draw
/// predictors are zeroed (they are appended to every draw anyway) and at
/// least `n_try` predictors must keep a positive weight.
fn resolve_draw_predictor_weights(
    weights: &[f64],
    n_predictor: usize,
    n_try: usize,
    always_draw_keys: &[usize],
) -> Result<Vec<f64>> {
    if weights.is_empty() {
        return Ok(Vec::new());
    }
    if weights.len() != n_predictor {
        return Err(Error::invalid(
            "number of draw-predictor weights not equal to number of predictors",
        ));
    }
    let mut resolved = weights.to_vec();
    let mut n_zero = 0usize;
    for (key, weight) in resolved.iter_mut().enumerate() {
        if *weight < 0.0 {
            return Err(Error::domain(
                "one or more draw-predictor weights not in range [0, inf)",
            ));
        }
        if *weight == 0.0 || always_draw_keys.binary_search(&key).is_ok() {
            *weight = 0.0;
            n_zero += 1;
        }
    }
    if n_predictor - n_zero < n_try {
        return Err(Error::domain(
            "too many zeros in draw-predictor weights: need at least n_try predictors to split at",
        ));
    }
    Ok(resolved)
}

// =============================================================================
// RandomForest
// =============================================================================

/// A trained model: the forest plus the resolved training record.
#[derive(Debug, Clone)]
pub struct RandomForest {
    tree_type: TreeType,
    n_try: usize,
    min_split_n_sample: usize,
    min_leaf_n_sample: usize,
    oob_error: Option<f64>,
    predictor_names: Vec<String>,
    names_of_unordered: Vec<String>,
    split_rule: SplitRule,
    max_depth: usize,
    min_metric_decrease: f64,
    n_random_split: usize,
    seed: u64,
    forest: Forest,
}

impl RandomForest {
    /// Train a forest on `data`, estimating the out-of-bag error.
    pub fn train(
        settings: &RandomForestSettings,
        data: &mut Data,
        case_weights: &[f64],
    ) -> Result<Self> {
        let monitor = Monitor::verbose(settings.verbose);
        Self::train_with_monitor(settings, data, case_weights, &monitor)
    }

    /// Train with an injected progress sink / interrupt probe.
    pub fn train_with_monitor(
        settings: &RandomForestSettings,
        data: &mut Data,
        case_weights: &[f64],
        monitor: &Monitor<'_>,
    ) -> Result<Self> {
        let tree_type = TreeType::from_name(&settings.tree_type)?;
        let split_rule = SplitRule::from_name(&settings.split_rule)?;

        let n_predictor = settings.predictor_names.len();
        if n_predictor != data.n_col() {
            return Err(Error::invalid(
                "mismatch between length of 'predictor_names' and 'x'",
            ));
        }
        if settings.n_tree == 0 {
            return Err(Error::invalid("'n_tree' must be positive"));
        }

        let n_try = if settings.n_try == 0 {
            default_n_try(n_predictor)
        } else {
            settings.n_try
        };
        let min_split_n_sample = if settings.min_split_n_sample == 0 {
            default_min_split_n_sample(tree_type)
        } else {
            settings.min_split_n_sample
        };
        let min_leaf_n_sample = if settings.min_leaf_n_sample == 0 {
            default_min_leaf_n_sample(tree_type)
        } else {
            settings.min_leaf_n_sample
        };
        let min_metric_decrease = split_rule.default_min_metric_decrease(settings.alpha);

        let unordered_keys =
            resolve_name_keys(&settings.names_of_unordered, &settings.predictor_names)?;
        let mut is_ordered = vec![true; n_predictor];
        for &key in &unordered_keys {
            is_ordered[key] = false;
        }
        let always_draw_keys =
            resolve_name_keys(&settings.names_of_always_draw, &settings.predictor_names)?;

        let forest_parameters: Vec<TrainingParameters> = (0..settings.n_tree)
            .map(|tree_index| -> Result<TrainingParameters> {
                let raw_weights: &[f64] = match settings.draw_predictor_weights.len() {
                    0 => &[],
                    1 => &settings.draw_predictor_weights[0],
                    n if n == settings.n_tree => &settings.draw_predictor_weights[tree_index],
                    _ => {
                        return Err(Error::invalid(
                            "draw-predictor weights must be shared or given once per tree",
                        ))
                    }
                };
                let draw_predictor_weights = resolve_draw_predictor_weights(
                    raw_weights,
                    n_predictor,
                    n_try,
                    &always_draw_keys,
                )?;
                Ok(TrainingParameters {
                    replace: settings.replace,
                    sample_fraction: settings.sample_fraction.clone(),
                    n_try,
                    draw_always_predictor_keys: always_draw_keys.clone(),
                    draw_predictor_weights,
                    response_weights: settings.response_weights.clone(),
                    split_rule,
                    min_metric_decrease,
                    max_depth: settings.max_depth,
                    min_split_n_sample,
                    min_leaf_n_sample,
                    n_random_split: settings.n_random_split,
                    min_prop: settings.min_prop,
                })
            })
            .collect::<Result<_>>()?;

        let (forest, oob_error) = Forest::plant(
            tree_type,
            settings.save_memory,
            is_ordered,
            &forest_parameters,
            data,
            case_weights,
            &PlantOptions {
                seed: settings.seed,
                n_thread: settings.n_thread,
                compute_oob_error: true,
            },
            monitor,
        )?;

        Ok(RandomForest {
            tree_type,
            n_try,
            min_split_n_sample,
            min_leaf_n_sample,
            oob_error,
            predictor_names: settings.predictor_names.clone(),
            names_of_unordered: settings.names_of_unordered.clone(),
            split_rule,
            max_depth: settings.max_depth,
            min_metric_decrease,
            n_random_split: settings.n_random_split,
            seed: settings.seed,
            forest,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn tree_type(&self) -> TreeType {
        self.tree_type
    }

    pub fn n_try(&self) -> usize {
        self.n_try
    }

    pub fn min_split_n_sample(&self) -> usize {
        self.min_split_n_sample
    }

    pub fn min_leaf_n_sample(&self) -> usize {
        self.min_leaf_n_sample
    }

    pub fn oob_error(&self) -> Option<f64> {
        self.oob_error
    }

    pub fn predictor_names(&self) -> &[String] {
        &self.predictor_names
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    // =========================================================================
    // Prediction
    // =========================================================================

    /// Predict new cases; `prediction_type` is "bagged", "inbag" or
    /// "nodes".
    pub fn predict(
        &mut self,
        data: &Data,
        prediction_type: &str,
        seed: u64,
        n_thread: usize,
        verbose: bool,
    ) -> Result<Predictions> {
        let prediction_type = PredictionType::from_name(prediction_type)?;
        let monitor = Monitor::verbose(verbose);
        self.forest
            .predict(data, prediction_type, &PredictOptions { seed, n_thread }, &monitor)
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Merge two compatible models; the result reports no out-of-bag error.
    pub fn merge(x: &RandomForest, y: &RandomForest) -> Result<RandomForest> {
        let forest = merge_forests(
            &x.forest,
            &y.forest,
            &x.predictor_names,
            &y.predictor_names,
        )?;
        Ok(RandomForest {
            tree_type: x.tree_type,
            n_try: x.n_try,
            min_split_n_sample: x.min_split_n_sample,
            min_leaf_n_sample: x.min_leaf_n_sample,
            oob_error: None,
            predictor_names: x.predictor_names.clone(),
            names_of_unordered: x.names_of_unordered.clone(),
            split_rule: x.split_rule,
            max_depth: x.max_depth,
            min_metric_decrease: x.min_metric_decrease,
            n_random_split: x.n_random_split,
            seed: x.seed,
            forest,
        })
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serialize the model to the binary envelope.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, SerializeError> {
        let metadata = ModelMetadata {
            tree_type: self.tree_type,
            predictor_names: self.predictor_names.clone(),
            names_of_unordered: self.names_of_unordered.clone(),
            n_tree: self.forest.n_tree() as u32,
            n_try: self.n_try as u32,
            split_rule: self.split_rule,
            max_depth: self.max_depth as u32,
            min_metric_decrease: self.min_metric_decrease,
            min_split_n_sample: self.min_split_n_sample as u32,
            min_leaf_n_sample: self.min_leaf_n_sample as u32,
            seed: self.seed,
            oob_error: self.oob_error,
            n_random_split: (self.split_rule == SplitRule::ExtraTrees)
                .then_some(self.n_random_split as u32),
            response_values: self
                .forest
                .response_values()
                .map(<[f64]>::to_vec)
                .unwrap_or_default(),
        };
        serialize_forest(&metadata, &self.forest)
    }

    /// Reload a model from the binary envelope.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, DeserializeError> {
        let (metadata, forest) = deserialize_forest(bytes)?;
        Ok(RandomForest {
            tree_type: metadata.tree_type,
            n_try: metadata.n_try as usize,
            min_split_n_sample: metadata.min_split_n_sample as usize,
            min_leaf_n_sample: metadata.min_leaf_n_sample as usize,
            oob_error: metadata.oob_error,
            predictor_names: metadata.predictor_names,
            names_of_unordered: metadata.names_of_unordered,
            split_rule: metadata.split_rule,
            max_depth: metadata.max_depth as usize,
            min_metric_decrease: metadata.min_metric_decrease,
            n_random_split: metadata.n_random_split.unwrap_or(0) as usize,
            seed: metadata.seed,
            forest,
        })
    }
}
