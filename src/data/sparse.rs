//! Compressed sparse column predictor storage.

use super::PredictorMatrix;
use crate::errors::{Error, Result};

/// CSC matrix: for column `j`, the non-zero entries live at
/// `row_index[col_ptr[j]..col_ptr[j + 1]]` (row indices strictly increasing)
/// with values at the same offsets. Absent rows read as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseColMatrix {
    n_row: usize,
    n_col: usize,
    col_ptr: Vec<usize>,
    row_index: Vec<usize>,
    values: Vec<f64>,
}

impl SparseColMatrix {
    /// Create from the CSC triple, validating the structure.
    pub fn new(
        n_row: usize,
        n_col: usize,
        col_ptr: Vec<usize>,
        row_index: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self> {
        if col_ptr.len() != n_col + 1 {
            return Err(Error::invalid(
                "column pointers must have length n_col + 1",
            ));
        }
        if col_ptr.first() != Some(&0) || col_ptr.last() != Some(&row_index.len()) {
            return Err(Error::invalid(
                "column pointers must start at 0 and end at the number of non-zeros",
            ));
        }
        if row_index.len() != values.len() {
            return Err(Error::invalid(
                "row indices and values must have the same length",
            ));
        }
        for j in 0..n_col {
            if col_ptr[j] > col_ptr[j + 1] {
                return Err(Error::invalid("column pointers must be non-decreasing"));
            }
            let rows = &row_index[col_ptr[j]..col_ptr[j + 1]];
            if rows.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::invalid(
                    "row indices must be strictly increasing within a column",
                ));
            }
            if rows.last().is_some_and(|&r| r >= n_row) {
                return Err(Error::invalid("row index out of range"));
            }
        }
        Ok(SparseColMatrix {
            n_row,
            n_col,
            col_ptr,
            row_index,
            values,
        })
    }
}

impl PredictorMatrix for SparseColMatrix {
    #[inline]
    fn n_row(&self) -> usize {
        self.n_row
    }

    #[inline]
    fn n_col(&self) -> usize {
        self.n_col
    }

    fn value(&self, row: usize, col: usize) -> f64 {
        let rows = &self.row_index[self.col_ptr[col]..self.col_ptr[col + 1]];
        match rows.binary_search(&row) {
            Ok(offset) => self.values[self.col_ptr[col] + offset],
            Err(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_three() -> SparseColMatrix {
        // [[0, 5, 0],
        //  [7, 0, 9]]
        SparseColMatrix::new(2, 3, vec![0, 1, 2, 3], vec![1, 0, 1], vec![7.0, 5.0, 9.0]).unwrap()
    }

    #[test]
    fn absent_rows_read_zero() {
        let m = two_by_three();
        assert_eq!(m.value(0, 0), 0.0);
        assert_eq!(m.value(1, 0), 7.0);
        assert_eq!(m.value(0, 1), 5.0);
        assert_eq!(m.value(1, 1), 0.0);
        assert_eq!(m.value(1, 2), 9.0);
    }

    #[test]
    fn rejects_malformed_pointers() {
        assert!(SparseColMatrix::new(2, 2, vec![0, 1], vec![0], vec![1.0]).is_err());
        assert!(SparseColMatrix::new(2, 1, vec![0, 2], vec![1, 0], vec![1.0, 2.0]).is_err());
        assert!(SparseColMatrix::new(2, 1, vec![0, 1], vec![5], vec![1.0]).is_err());
    }
}
