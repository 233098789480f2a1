//! Forest orchestration: parallel growth over tree intervals, out-of-bag
//! error, and the three prediction modes.
//!
//! Trees are split into `n_thread` contiguous intervals with one scoped OS
//! worker per interval; the calling thread runs the progress loop. All
//! per-tree seeds are drawn from the forest generator before workers start,
//! so results are deterministic in the seed for a given interval layout.

mod merge;

pub use merge::merge_forests;

use std::sync::{Arc, Mutex};
use std::thread;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::Data;
use crate::draw;
use crate::errors::{Error, Result};
use crate::params::{PredictionType, SplitRule, TrainingParameters, TreeType};
use crate::progress::{Monitor, ProgressLatch};
use crate::tree::classification::ClassificationTree;
use crate::tree::regression::RegressionTree;
use crate::utils::{contiguous_intervals, Parallelism};

// =============================================================================
// Options and results
// =============================================================================

/// Options for [`Forest::plant`].
#[derive(Debug, Clone)]
pub struct PlantOptions {
    /// Forest seed; 0 draws from a non-deterministic source.
    pub seed: u64,
    /// Worker count; 0 picks the hardware parallelism.
    pub n_thread: usize,
    /// Estimate the out-of-bag error after growth.
    pub compute_oob_error: bool,
}

/// Options for [`Forest::predict`].
#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// Seed for per-tree generators (inbag draws, tie-breaks); 0 draws from
    /// a non-deterministic source.
    pub seed: u64,
    /// Worker count; 0 picks the hardware parallelism.
    pub n_thread: usize,
}

/// Output of a prediction call.
#[derive(Debug, Clone, PartialEq)]
pub enum Predictions {
    /// One value per case (bagged and inbag modes). Cases no tree could
    /// answer hold NaN.
    Values(Vec<f64>),
    /// Terminal node index per case and tree (`n_row x n_tree`).
    Nodes(Array2<usize>),
}

// =============================================================================
// Forest
// =============================================================================

/// The trees of a trained forest, by response kind.
#[derive(Debug, Clone)]
pub enum ForestKind {
    Classification {
        /// Observed response values in first-appearance order; leaf keys
        /// index into this.
        response_values: Vec<f64>,
        trees: Vec<ClassificationTree>,
    },
    Regression {
        trees: Vec<RegressionTree>,
    },
}

/// A random forest: shared predictor metadata plus the grown trees.
#[derive(Debug, Clone)]
pub struct Forest {
    save_memory: bool,
    n_predictor: usize,
    is_ordered: Arc<Vec<bool>>,
    kind: ForestKind,
}

impl PartialEq for Forest {
    fn eq(&self, other: &Self) -> bool {
        if self.save_memory != other.save_memory
            || self.n_predictor != other.n_predictor
            || *self.is_ordered != *other.is_ordered
        {
            return false;
        }
        match (&self.kind, &other.kind) {
            (
                ForestKind::Classification { response_values: a_values, trees: a_trees },
                ForestKind::Classification { response_values: b_values, trees: b_trees },
            ) => {
                a_values == b_values
                    && a_trees.len() == b_trees.len()
                    && a_trees
                        .iter()
                        .zip(b_trees.iter())
                        .all(|(a, b)| a.same_structure(b))
            }
            (
                ForestKind::Regression { trees: a_trees },
                ForestKind::Regression { trees: b_trees },
            ) => {
                a_trees.len() == b_trees.len()
                    && a_trees
                        .iter()
                        .zip(b_trees.iter())
                        .all(|(a, b)| a.same_structure(b))
            }
            _ => false,
        }
    }
}

impl Forest {
    pub(crate) fn from_parts(
        save_memory: bool,
        n_predictor: usize,
        is_ordered: Arc<Vec<bool>>,
        kind: ForestKind,
    ) -> Self {
        Forest {
            save_memory,
            n_predictor,
            is_ordered,
            kind,
        }
    }

    pub fn tree_type(&self) -> TreeType {
        match self.kind {
            ForestKind::Classification { .. } => TreeType::Classification,
            ForestKind::Regression { .. } => TreeType::Regression,
        }
    }

    pub fn n_tree(&self) -> usize {
        match &self.kind {
            ForestKind::Classification { trees, .. } => trees.len(),
            ForestKind::Regression { trees } => trees.len(),
        }
    }

    pub fn n_predictor(&self) -> usize {
        self.n_predictor
    }

    pub fn save_memory(&self) -> bool {
        self.save_memory
    }

    pub fn is_ordered(&self) -> &[bool] {
        &self.is_ordered
    }

    pub(crate) fn is_ordered_shared(&self) -> Arc<Vec<bool>> {
        Arc::clone(&self.is_ordered)
    }

    pub fn kind(&self) -> &ForestKind {
        &self.kind
    }

    /// Response values of a classification forest.
    pub fn response_values(&self) -> Option<&[f64]> {
        match &self.kind {
            ForestKind::Classification { response_values, .. } => Some(response_values),
            ForestKind::Regression { .. } => None,
        }
    }

    // =========================================================================
    // Plant
    // =========================================================================

    /// Grow (train) a forest; returns the forest and, when requested, the
    /// out-of-bag error estimate.
    #[allow(clippy::too_many_arguments)]
    pub fn plant(
        tree_type: TreeType,
        save_memory: bool,
        is_ordered: Vec<bool>,
        forest_parameters: &[TrainingParameters],
        data: &mut Data,
        case_weights: &[f64],
        options: &PlantOptions,
        monitor: &Monitor<'_>,
    ) -> Result<(Forest, Option<f64>)> {
        let n_predictor = is_ordered.len();
        if n_predictor != data.n_col() {
            return Err(Error::invalid(
                "mismatch between number of predictors and data columns",
            ));
        }
        if !case_weights.is_empty() {
            if case_weights.len() != data.n_row() {
                return Err(Error::invalid(
                    "case weights must have the same length as number of rows in data",
                ));
            }
            if case_weights.iter().any(|&w| w < 0.0) {
                return Err(Error::domain("case weights must be non-negative"));
            }
        }
        for parameters in forest_parameters {
            parameters.validate()?;
            if !parameters.draw_predictor_weights.is_empty()
                && parameters.draw_predictor_weights.len() != n_predictor
            {
                return Err(Error::invalid(
                    "number of draw-predictor weights not equal to number of predictors",
                ));
            }
        }

        let n_thread = resolve_n_thread(options.n_thread)?;
        let n_tree = forest_parameters.len();

        let mut forest_rng = new_rng(options.seed);
        let tree_seeds: Vec<u64> = (0..n_tree).map(|_| draw_seed(&mut forest_rng)).collect();

        let any_response_wise = forest_parameters.iter().any(|p| p.is_response_wise());
        let is_ordered = Arc::new(is_ordered);

        // Data-side derived indexes.
        let response_values: Vec<f64> = match tree_type {
            TreeType::Classification => {
                let values = data.new_response_values().to_vec();
                if forest_parameters
                    .iter()
                    .any(|p| p.split_rule == SplitRule::Hellinger)
                    && values.len() != 2
                {
                    return Err(Error::invalid(
                        "hellinger metric only implemented for binary classification",
                    ));
                }
                if forest_parameters.iter().any(|p| {
                    matches!(p.split_rule, SplitRule::Maxstat | SplitRule::Beta)
                }) {
                    return Err(Error::invalid("unsupported split metric for classification"));
                }
                data.new_response_index(&values)?;
                if any_response_wise {
                    data.new_sample_keys_by_response();
                }
                values
            }
            TreeType::Regression => {
                if forest_parameters
                    .iter()
                    .any(|p| p.split_rule == SplitRule::Hellinger)
                {
                    return Err(Error::invalid("unsupported split metric for regression"));
                }
                if any_response_wise {
                    return Err(Error::invalid(
                        "response-wise sampling not supported for this tree type",
                    ));
                }
                Vec::new()
            }
        };
        if !save_memory {
            data.new_predictor_index(Parallelism::from_threads(n_thread));
        }

        let want_oob = options.compute_oob_error;
        let oob_keys: Mutex<Vec<Vec<usize>>> = Mutex::new(vec![Vec::new(); n_tree]);

        // Derived indexes are final; workers share the view read-only.
        let grow_data: &Data = data;
        let kind = match tree_type {
            TreeType::Classification => {
                let mut trees: Vec<ClassificationTree> = (0..n_tree)
                    .map(|j| {
                        let mut tree =
                            ClassificationTree::new(save_memory, n_predictor, Arc::clone(&is_ordered));
                        tree.seed(tree_seeds[j]);
                        tree
                    })
                    .collect();
                run_tree_workers("Growing trees", &mut trees, n_thread, monitor, |index, tree| {
                    let keys = tree.grow(&forest_parameters[index], grow_data, case_weights, want_oob)?;
                    oob_keys.lock().expect("oob store poisoned")[index] = keys;
                    Ok(())
                })?;
                ForestKind::Classification {
                    response_values,
                    trees,
                }
            }
            TreeType::Regression => {
                let mut trees: Vec<RegressionTree> = (0..n_tree)
                    .map(|j| {
                        let mut tree =
                            RegressionTree::new(save_memory, n_predictor, Arc::clone(&is_ordered));
                        tree.seed(tree_seeds[j]);
                        tree
                    })
                    .collect();
                run_tree_workers("Growing trees", &mut trees, n_thread, monitor, |index, tree| {
                    let keys = tree.grow(&forest_parameters[index], grow_data, case_weights, want_oob)?;
                    oob_keys.lock().expect("oob store poisoned")[index] = keys;
                    Ok(())
                })?;
                ForestKind::Regression { trees }
            }
        };

        let forest = Forest {
            save_memory,
            n_predictor,
            is_ordered,
            kind,
        };

        let oob_error = if want_oob {
            let oob_keys = oob_keys.into_inner().expect("oob store poisoned");
            Some(forest.compute_oob_error(data, &oob_keys, n_thread, &mut forest_rng, monitor)?)
        } else {
            None
        };

        data.finalise_sample_keys_by_response();
        data.finalise_response_index();

        Ok((forest, oob_error))
    }

    /// Bagged out-of-bag prediction per tree, aggregated per case.
    fn compute_oob_error(
        &self,
        data: &Data,
        oob_keys: &[Vec<usize>],
        n_thread: usize,
        forest_rng: &mut StdRng,
        monitor: &Monitor<'_>,
    ) -> Result<f64> {
        let n_sample = data.n_row();
        match &self.kind {
            ForestKind::Classification { response_values, trees } => {
                let accumulator: Mutex<Vec<Vec<usize>>> = Mutex::new(vec![Vec::new(); n_sample]);
                let mut tree_refs: Vec<&ClassificationTree> = trees.iter().collect();
                run_tree_workers(
                    "Computing OOB error",
                    &mut tree_refs,
                    n_thread,
                    monitor,
                    |index, tree| {
                        let mut predicted = Vec::with_capacity(oob_keys[index].len());
                        for &sample_key in &oob_keys[index] {
                            if let Some(response_key) = tree.predict_bagged(data, sample_key) {
                                predicted.push((sample_key, response_key));
                            }
                        }
                        let mut shared = accumulator.lock().expect("oob accumulator poisoned");
                        for (sample_key, response_key) in predicted {
                            shared[sample_key].push(response_key);
                        }
                        Ok(())
                    },
                )?;

                let accumulator = accumulator.into_inner().expect("oob accumulator poisoned");
                let n_response = response_values.len();
                let response_index = data.response_index();
                let mut n_misclassification = 0usize;
                let mut n_prediction = 0usize;
                let mut counts = vec![0.0f64; n_response];
                for sample_key in 0..n_sample {
                    if accumulator[sample_key].is_empty() {
                        continue;
                    }
                    counts.iter_mut().for_each(|c| *c = 0.0);
                    for &response_key in &accumulator[sample_key] {
                        counts[response_key] += 1.0;
                    }
                    if let Some(predicted) = draw::most_frequent_key(&counts, forest_rng) {
                        if predicted != response_index[sample_key] {
                            n_misclassification += 1;
                        }
                        n_prediction += 1;
                    }
                }
                Ok(n_misclassification as f64 / n_prediction as f64)
            }
            ForestKind::Regression { trees } => {
                let accumulator: Mutex<Vec<Vec<f64>>> = Mutex::new(vec![Vec::new(); n_sample]);
                let mut tree_refs: Vec<&RegressionTree> = trees.iter().collect();
                run_tree_workers(
                    "Computing OOB error",
                    &mut tree_refs,
                    n_thread,
                    monitor,
                    |index, tree| {
                        let mut predicted = Vec::with_capacity(oob_keys[index].len());
                        for &sample_key in &oob_keys[index] {
                            if let Some(value) = tree.predict_bagged(data, sample_key) {
                                predicted.push((sample_key, value));
                            }
                        }
                        let mut shared = accumulator.lock().expect("oob accumulator poisoned");
                        for (sample_key, value) in predicted {
                            shared[sample_key].push(value);
                        }
                        Ok(())
                    },
                )?;

                let accumulator = accumulator.into_inner().expect("oob accumulator poisoned");
                let mut squared_error = 0.0;
                let mut n_prediction = 0usize;
                for sample_key in 0..n_sample {
                    let predictions = &accumulator[sample_key];
                    if predictions.is_empty() {
                        continue;
                    }
                    let mean = predictions.iter().sum::<f64>() / predictions.len() as f64;
                    squared_error += (mean - data.get_y(sample_key, 0)).powi(2);
                    n_prediction += 1;
                }
                Ok(squared_error / n_prediction as f64)
            }
        }
    }

    // =========================================================================
    // Predict
    // =========================================================================

    /// Predict new cases. `data` must have the same predictor layout as the
    /// training data.
    pub fn predict(
        &mut self,
        data: &Data,
        prediction_type: PredictionType,
        options: &PredictOptions,
        monitor: &Monitor<'_>,
    ) -> Result<Predictions> {
        if data.n_col() != self.n_predictor {
            return Err(Error::invalid(
                "mismatch between number of predictors and data columns",
            ));
        }
        let n_thread = resolve_n_thread(options.n_thread)?;
        let n_tree = self.n_tree();

        let mut forest_rng = new_rng(options.seed);
        let tree_seeds: Vec<u64> = (0..n_tree).map(|_| draw_seed(&mut forest_rng)).collect();
        match &mut self.kind {
            ForestKind::Classification { trees, .. } => {
                for (tree, &seed) in trees.iter_mut().zip(&tree_seeds) {
                    tree.seed(seed);
                }
            }
            ForestKind::Regression { trees } => {
                for (tree, &seed) in trees.iter_mut().zip(&tree_seeds) {
                    tree.seed(seed);
                }
            }
        }

        match prediction_type {
            PredictionType::Nodes => self.predict_nodes(data, n_thread, monitor),
            PredictionType::Bagged => {
                self.predict_bagged(data, n_thread, &mut forest_rng, monitor)
            }
            PredictionType::Inbag => {
                self.predict_inbag(data, n_thread, &mut forest_rng, monitor)
            }
        }
    }

    fn predict_nodes(
        &self,
        data: &Data,
        n_thread: usize,
        monitor: &Monitor<'_>,
    ) -> Result<Predictions> {
        let n_sample = data.n_row();
        let n_tree = self.n_tree();
        let matrix: Mutex<Array2<usize>> = Mutex::new(Array2::zeros((n_sample, n_tree)));

        let fill_column = |tree_index: usize, column: Vec<usize>| {
            let mut shared = matrix.lock().expect("node matrix poisoned");
            for (sample_key, node_key) in column.into_iter().enumerate() {
                shared[(sample_key, tree_index)] = node_key;
            }
        };

        match &self.kind {
            ForestKind::Classification { trees, .. } => {
                let mut tree_refs: Vec<&ClassificationTree> = trees.iter().collect();
                run_tree_workers("Predicting", &mut tree_refs, n_thread, monitor, |index, tree| {
                    let column: Vec<usize> =
                        (0..n_sample).map(|key| tree.predict_node(data, key)).collect();
                    fill_column(index, column);
                    Ok(())
                })?;
            }
            ForestKind::Regression { trees } => {
                let mut tree_refs: Vec<&RegressionTree> = trees.iter().collect();
                run_tree_workers("Predicting", &mut tree_refs, n_thread, monitor, |index, tree| {
                    let column: Vec<usize> =
                        (0..n_sample).map(|key| tree.predict_node(data, key)).collect();
                    fill_column(index, column);
                    Ok(())
                })?;
            }
        }
        Ok(Predictions::Nodes(
            matrix.into_inner().expect("node matrix poisoned"),
        ))
    }

    fn predict_bagged(
        &self,
        data: &Data,
        n_thread: usize,
        forest_rng: &mut StdRng,
        monitor: &Monitor<'_>,
    ) -> Result<Predictions> {
        let n_sample = data.n_row();
        match &self.kind {
            ForestKind::Classification { response_values, trees } => {
                let accumulator: Mutex<Vec<Vec<usize>>> = Mutex::new(vec![Vec::new(); n_sample]);
                let mut tree_refs: Vec<&ClassificationTree> = trees.iter().collect();
                run_tree_workers("Predicting", &mut tree_refs, n_thread, monitor, |_, tree| {
                    let mut predicted = Vec::with_capacity(n_sample);
                    for sample_key in 0..n_sample {
                        if let Some(response_key) = tree.predict_bagged(data, sample_key) {
                            predicted.push((sample_key, response_key));
                        }
                    }
                    let mut shared = accumulator.lock().expect("bagged accumulator poisoned");
                    for (sample_key, response_key) in predicted {
                        shared[sample_key].push(response_key);
                    }
                    Ok(())
                })?;

                // Majority vote per case; tie-breaks use a per-case seed so
                // the aggregation is deterministic under any thread count.
                let accumulator = accumulator.into_inner().expect("bagged accumulator poisoned");
                let row_seeds: Vec<u64> =
                    (0..n_sample).map(|_| draw_seed(forest_rng)).collect();
                let n_response = response_values.len();
                let values = Parallelism::from_threads(n_thread).maybe_par_map(
                    0..n_sample,
                    |sample_key| {
                        if accumulator[sample_key].is_empty() {
                            return f64::NAN;
                        }
                        let mut counts = vec![0.0f64; n_response];
                        for &response_key in &accumulator[sample_key] {
                            counts[response_key] += 1.0;
                        }
                        let mut rng = StdRng::seed_from_u64(row_seeds[sample_key]);
                        match draw::most_frequent_key(&counts, &mut rng) {
                            Some(key) => response_values[key],
                            None => f64::NAN,
                        }
                    },
                );
                Ok(Predictions::Values(values))
            }
            ForestKind::Regression { trees } => {
                let accumulator: Mutex<Vec<Vec<f64>>> = Mutex::new(vec![Vec::new(); n_sample]);
                let mut tree_refs: Vec<&RegressionTree> = trees.iter().collect();
                run_tree_workers("Predicting", &mut tree_refs, n_thread, monitor, |_, tree| {
                    let mut predicted = Vec::with_capacity(n_sample);
                    for sample_key in 0..n_sample {
                        if let Some(value) = tree.predict_bagged(data, sample_key) {
                            predicted.push((sample_key, value));
                        }
                    }
                    let mut shared = accumulator.lock().expect("bagged accumulator poisoned");
                    for (sample_key, value) in predicted {
                        shared[sample_key].push(value);
                    }
                    Ok(())
                })?;

                let accumulator = accumulator.into_inner().expect("bagged accumulator poisoned");
                let values = Parallelism::from_threads(n_thread).maybe_par_map(
                    0..n_sample,
                    |sample_key| {
                        let predictions = &accumulator[sample_key];
                        if predictions.is_empty() {
                            f64::NAN
                        } else {
                            predictions.iter().sum::<f64>() / predictions.len() as f64
                        }
                    },
                );
                Ok(Predictions::Values(values))
            }
        }
    }

    fn predict_inbag(
        &mut self,
        data: &Data,
        n_thread: usize,
        forest_rng: &mut StdRng,
        monitor: &Monitor<'_>,
    ) -> Result<Predictions> {
        let n_sample = data.n_row();
        let n_tree = self.n_tree();

        // Uniformly assign each case to exactly one tree.
        let mut keys_by_tree: Vec<Vec<usize>> = vec![Vec::new(); n_tree];
        for sample_key in 0..n_sample {
            keys_by_tree[forest_rng.gen_range(0..n_tree)].push(sample_key);
        }

        let aggregate: Mutex<Vec<f64>> = Mutex::new(vec![f64::NAN; n_sample]);
        match &mut self.kind {
            ForestKind::Classification { response_values, trees } => {
                let response_values = &*response_values;
                run_tree_workers("Predicting", trees, n_thread, monitor, |index, tree| {
                    let mut predicted = Vec::with_capacity(keys_by_tree[index].len());
                    for &sample_key in &keys_by_tree[index] {
                        if let Some(response_key) = tree.predict_inbag(data, sample_key) {
                            predicted.push((sample_key, response_values[response_key]));
                        }
                    }
                    let mut shared = aggregate.lock().expect("inbag aggregate poisoned");
                    for (sample_key, value) in predicted {
                        shared[sample_key] = value;
                    }
                    Ok(())
                })?;
            }
            ForestKind::Regression { trees } => {
                run_tree_workers("Predicting", trees, n_thread, monitor, |index, tree| {
                    let mut predicted = Vec::with_capacity(keys_by_tree[index].len());
                    for &sample_key in &keys_by_tree[index] {
                        if let Some(value) = tree.predict_inbag(data, sample_key) {
                            predicted.push((sample_key, value));
                        }
                    }
                    let mut shared = aggregate.lock().expect("inbag aggregate poisoned");
                    for (sample_key, value) in predicted {
                        shared[sample_key] = value;
                    }
                    Ok(())
                })?;
            }
        }
        Ok(Predictions::Values(
            aggregate.into_inner().expect("inbag aggregate poisoned"),
        ))
    }
}

// =============================================================================
// Worker scheduling
// =============================================================================

fn resolve_n_thread(requested: usize) -> Result<usize> {
    let n_thread = if requested == 0 {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(0)
    } else {
        requested
    };
    if n_thread == 0 {
        return Err(Error::invalid("'n_thread' must be positive"));
    }
    Ok(n_thread)
}

fn new_rng(seed: u64) -> StdRng {
    if seed == 0 {
        StdRng::from_entropy()
    } else {
        StdRng::seed_from_u64(seed)
    }
}

/// Draw a non-zero seed so a derived generator never falls back to the
/// entropy source.
fn draw_seed(rng: &mut StdRng) -> u64 {
    loop {
        let seed = rng.gen::<u64>();
        if seed != 0 {
            return seed;
        }
    }
}

/// Shard `items` into contiguous intervals, run `work(index, item)` on one
/// scoped worker per interval, and drive the progress loop on the calling
/// thread. Fails atomically: the first worker error (or an observed
/// interrupt) fails the whole call.
fn run_tree_workers<T, F>(
    operation: &str,
    items: &mut [T],
    n_thread: usize,
    monitor: &Monitor<'_>,
    work: F,
) -> Result<()>
where
    T: Send,
    F: Fn(usize, &mut T) -> Result<()> + Sync,
{
    let n_item = items.len();
    let intervals = contiguous_intervals(n_item, n_thread);
    let n_worker = intervals.len();
    let latch = ProgressLatch::new();
    let latch_ref = &latch;
    let work_ref = &work;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(n_worker);
        let mut rest = &mut *items;
        for &(start, end) in &intervals {
            let (chunk, tail) = rest.split_at_mut(end - start);
            rest = tail;
            handles.push(scope.spawn(move || {
                let result = (|| {
                    for (offset, item) in chunk.iter_mut().enumerate() {
                        if latch_ref.is_interrupted() {
                            return Err(Error::Cancelled);
                        }
                        work_ref(start + offset, item)?;
                        latch_ref.notify_event();
                    }
                    Ok(())
                })();
                latch_ref.notify_worker_done();
                result
            }));
        }

        let interrupted = latch_ref.watch(operation, n_item, n_worker, monitor);

        let mut first_error: Option<Error> = None;
        for handle in handles {
            let joined = handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            if let Err(error) = joined {
                if first_error.is_none() && !matches!(error, Error::Cancelled) {
                    first_error = Some(error);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        if interrupted {
            return Err(Error::Cancelled);
        }
        Ok(())
    })
}
