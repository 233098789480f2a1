//! Uniform view over dense or sparse predictors plus the derived indexes
//! used by split search.
//!
//! The view itself is a pure reader. The derived structures (sorted-unique
//! predictor index, response values and per-row response keys,
//! response-stratified sample buckets, row permutation) are built by the
//! forest before workers start and are read-only during growth; each
//! `new_*` builder is idempotent and has a matching `finalise_*` that
//! releases the storage.

mod dense;
mod sparse;

pub use dense::DenseMatrix;
pub use sparse::SparseColMatrix;

use crate::errors::{Error, Result};
use crate::utils::Parallelism;

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Read access to a predictor matrix, dense or sparse.
pub trait PredictorMatrix: Send + Sync {
    fn n_row(&self) -> usize;
    fn n_col(&self) -> usize;
    /// Value at `(row, col)`; sparse backends materialise zero for rows
    /// absent from the column's non-zero list.
    fn value(&self, row: usize, col: usize) -> f64;
}

/// Predictors, responses, and the derived indexes shared read-only by every
/// tree during a training or prediction call.
pub struct Data {
    x: Box<dyn PredictorMatrix>,
    y: DenseMatrix,
    unique_values: Vec<Vec<f64>>,
    predictor_index: Vec<usize>,
    max_n_unique: usize,
    response_values: Vec<f64>,
    response_index: Vec<usize>,
    sample_keys_by_response: Vec<Vec<usize>>,
    permutation: Vec<usize>,
}

impl Data {
    /// Wrap a predictor matrix and a response matrix (one row per case,
    /// at least one response column).
    pub fn new(x: Box<dyn PredictorMatrix>, y: DenseMatrix) -> Result<Self> {
        if y.n_row() != x.n_row() {
            return Err(Error::invalid(
                "response matrix must have one row per predictor row",
            ));
        }
        if y.n_col() == 0 {
            return Err(Error::invalid("response matrix must have at least one column"));
        }
        Ok(Data {
            x,
            y,
            unique_values: Vec::new(),
            predictor_index: Vec::new(),
            max_n_unique: 0,
            response_values: Vec::new(),
            response_index: Vec::new(),
            sample_keys_by_response: Vec::new(),
            permutation: Vec::new(),
        })
    }

    /// Convenience constructor for dense predictors.
    pub fn from_dense(x: DenseMatrix, y: DenseMatrix) -> Result<Self> {
        Data::new(Box::new(x), y)
    }

    #[inline]
    pub fn n_row(&self) -> usize {
        self.x.n_row()
    }

    #[inline]
    pub fn n_col(&self) -> usize {
        self.x.n_col()
    }

    /// Predictor value for a sample, optionally reading through the row
    /// permutation built by [`Data::new_permutation`].
    #[inline]
    pub fn get_x(&self, sample_key: usize, predictor_key: usize, permute: bool) -> f64 {
        self.x.value(self.as_row_offset(sample_key, permute), predictor_key)
    }

    #[inline]
    pub fn get_y(&self, sample_key: usize, column: usize) -> f64 {
        self.y.value(sample_key, column)
    }

    #[inline]
    fn as_row_offset(&self, sample_key: usize, permute: bool) -> usize {
        if permute {
            self.permutation[sample_key]
        } else {
            sample_key
        }
    }

    // =========================================================================
    // Range helpers
    // =========================================================================

    /// Sorted, deduplicated predictor values observed over
    /// `sample_keys[start..end]`.
    pub fn get_all_values(
        &self,
        all_values: &mut Vec<f64>,
        sample_keys: &[usize],
        predictor_key: usize,
        start: usize,
        end: usize,
        permute: bool,
    ) -> Result<()> {
        if start > end {
            return Err(Error::domain("start of interval must not be past end"));
        }
        all_values.clear();
        all_values.reserve(end - start);
        for &key in &sample_keys[start..end] {
            all_values.push(self.get_x(key, predictor_key, permute));
        }
        all_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        all_values.dedup();
        Ok(())
    }

    /// Pointwise minimum and maximum of a predictor over
    /// `sample_keys[start..end]`.
    pub fn get_minmax_values(
        &self,
        sample_keys: &[usize],
        predictor_key: usize,
        start: usize,
        end: usize,
        permute: bool,
    ) -> Result<(f64, f64)> {
        if start > end {
            return Err(Error::domain("start of interval must not be past end"));
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &key in &sample_keys[start..end] {
            let value = self.get_x(key, predictor_key, permute);
            min = min.min(value);
            max = max.max(value);
        }
        Ok((min, max))
    }

    // =========================================================================
    // Predictor index (sorted unique values + per-row offsets)
    // =========================================================================

    /// Build the sorted-unique value index for every predictor.
    ///
    /// Invariant afterwards: `unique_value(col, unique_key(row, col))`
    /// equals `get_x(row, col, false)`.
    pub fn new_predictor_index(&mut self, parallelism: Parallelism) {
        if self.has_predictor_index() {
            return;
        }
        let n_row = self.n_row();
        let x = &self.x;

        let per_column: Vec<(Vec<f64>, Vec<usize>)> =
            parallelism.maybe_par_map(0..self.n_col(), |column| {
                let mut values: Vec<f64> = (0..n_row).map(|row| x.value(row, column)).collect();
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                values.dedup();
                let index: Vec<usize> = (0..n_row)
                    .map(|row| {
                        values
                            .partition_point(|v| *v < x.value(row, column))
                    })
                    .collect();
                (values, index)
            });

        self.predictor_index = Vec::with_capacity(self.n_col() * n_row);
        self.unique_values = Vec::with_capacity(self.n_col());
        self.max_n_unique = 0;
        for (values, index) in per_column {
            self.max_n_unique = self.max_n_unique.max(values.len());
            self.unique_values.push(values);
            self.predictor_index.extend(index);
        }
    }

    pub fn finalise_predictor_index(&mut self) {
        self.predictor_index = Vec::new();
        self.unique_values = Vec::new();
        self.max_n_unique = 0;
    }

    #[inline]
    pub fn has_predictor_index(&self) -> bool {
        self.max_n_unique != 0
    }

    /// Offset of a sample's value in the predictor's sorted-unique vector.
    #[inline]
    pub fn unique_key(&self, sample_key: usize, predictor_key: usize, permute: bool) -> usize {
        let row = self.as_row_offset(sample_key, permute);
        self.predictor_index[predictor_key * self.n_row() + row]
    }

    #[inline]
    pub fn unique_value(&self, predictor_key: usize, offset: usize) -> f64 {
        self.unique_values[predictor_key][offset]
    }

    #[inline]
    pub fn n_unique_value(&self, predictor_key: usize) -> usize {
        self.unique_values[predictor_key].len()
    }

    /// Greatest unique-value count over all predictors, floored at 3 to
    /// shape the split-search workspaces conservatively.
    pub fn max_n_unique_value(&self) -> usize {
        self.max_n_unique.max(3)
    }

    // =========================================================================
    // Response values and index
    // =========================================================================

    /// Record the unique response values in order of first appearance
    /// (classification); idempotent.
    pub fn new_response_values(&mut self) -> &[f64] {
        if self.response_values.is_empty() {
            for sample_key in 0..self.n_row() {
                let value = self.get_y(sample_key, 0);
                if !self.response_values.contains(&value) {
                    self.response_values.push(value);
                }
            }
        }
        &self.response_values
    }

    #[inline]
    pub fn response_values(&self) -> &[f64] {
        &self.response_values
    }

    /// Map every row to its offset in `response_values`.
    pub fn new_response_index(&mut self, response_values: &[f64]) -> Result<()> {
        self.response_index.clear();
        self.response_index.reserve(self.n_row());
        for sample_key in 0..self.n_row() {
            let value = self.get_y(sample_key, 0);
            let key = response_values
                .iter()
                .position(|v| *v == value)
                .ok_or_else(|| {
                    Error::invalid("response values do not contain all values observed in data")
                })?;
            self.response_index.push(key);
        }
        Ok(())
    }

    pub fn finalise_response_index(&mut self) {
        self.response_index = Vec::new();
    }

    #[inline]
    pub fn response_index(&self) -> &[usize] {
        &self.response_index
    }

    // =========================================================================
    // Response-stratified sample buckets
    // =========================================================================

    /// Group row indices by response key; requires the response index.
    pub fn new_sample_keys_by_response(&mut self) {
        self.sample_keys_by_response = vec![Vec::new(); self.response_values.len()];
        for (sample_key, &value_key) in self.response_index.iter().enumerate() {
            self.sample_keys_by_response[value_key].push(sample_key);
        }
    }

    pub fn finalise_sample_keys_by_response(&mut self) {
        self.sample_keys_by_response = Vec::new();
    }

    #[inline]
    pub fn sample_keys_by_response(&self) -> &[Vec<usize>] {
        &self.sample_keys_by_response
    }

    // =========================================================================
    // Row permutation
    // =========================================================================

    /// Build a deterministic per-seed shuffle of the row indices; seed 0
    /// draws from a non-deterministic source.
    pub fn new_permutation(&mut self, seed: u64) {
        let mut rng = if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        };
        self.permutation = crate::draw::shuffled_keys(self.n_row(), &mut rng);
    }

    pub fn finalise_permutation(&mut self) {
        self.permutation = Vec::new();
    }
}
