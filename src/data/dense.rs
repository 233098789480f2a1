//! Dense row-major matrix storage.

use ndarray::ArrayView2;

use super::PredictorMatrix;

/// Dense matrix with rows stored contiguously.
///
/// `index = row * n_col + col`; columns are strided by `n_col`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    values: Vec<f64>,
    n_row: usize,
    n_col: usize,
}

impl DenseMatrix {
    /// Create from a row-major value buffer.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != n_row * n_col`.
    pub fn from_vec(values: Vec<f64>, n_row: usize, n_col: usize) -> Self {
        assert_eq!(
            values.len(),
            n_row * n_col,
            "value buffer length must equal n_row * n_col"
        );
        DenseMatrix { values, n_row, n_col }
    }

    /// Copy from an ndarray view (any layout).
    pub fn from_array(array: ArrayView2<'_, f64>) -> Self {
        let (n_row, n_col) = array.dim();
        let mut values = Vec::with_capacity(n_row * n_col);
        for row in array.rows() {
            values.extend(row.iter().copied());
        }
        DenseMatrix { values, n_row, n_col }
    }

    /// Single-column matrix from a value slice.
    pub fn from_column(values: Vec<f64>) -> Self {
        let n_row = values.len();
        DenseMatrix { values, n_row, n_col: 1 }
    }

    #[inline]
    pub fn n_row(&self) -> usize {
        self.n_row
    }

    #[inline]
    pub fn n_col(&self) -> usize {
        self.n_col
    }

    #[inline]
    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_col + col]
    }
}

impl PredictorMatrix for DenseMatrix {
    #[inline]
    fn n_row(&self) -> usize {
        self.n_row
    }

    #[inline]
    fn n_col(&self) -> usize {
        self.n_col
    }

    #[inline]
    fn value(&self, row: usize, col: usize) -> f64 {
        DenseMatrix::value(self, row, col)
    }
}
