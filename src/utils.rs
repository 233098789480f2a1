//! Shared helpers: the sequential/parallel execution switch and interval
//! sharding.

use rayon::prelude::*;

/// Whether the embarrassingly parallel phases (predictor-index construction,
/// post-barrier prediction aggregation) may use rayon.
///
/// Tree-interval workers are scheduled explicitly and are not governed by
/// this switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    Parallel,
}

impl Parallelism {
    /// Create from thread-count semantics: `1` is sequential, anything else
    /// (including the auto value `0`) is parallel.
    #[inline]
    pub fn from_threads(n_threads: usize) -> Self {
        if n_threads == 1 {
            Parallelism::Sequential
        } else {
            Parallelism::Parallel
        }
    }

    #[inline]
    pub fn is_parallel(self) -> bool {
        matches!(self, Parallelism::Parallel)
    }

    #[inline]
    pub fn maybe_par_for_each<T, I, F>(self, iter: I, f: F)
    where
        T: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        F: Fn(T) + Sync + Send,
    {
        if self.is_parallel() {
            iter.into_par_iter().for_each(f);
        } else {
            iter.into_iter().for_each(f);
        }
    }

    #[inline]
    pub fn maybe_par_map<T, B, I, F>(self, iter: I, f: F) -> Vec<B>
    where
        T: Send,
        B: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        F: Fn(T) -> B + Sync + Send,
    {
        if self.is_parallel() {
            iter.into_par_iter().map(f).collect()
        } else {
            iter.into_iter().map(f).collect()
        }
    }
}

/// Split `[0, n_item)` into at most `n_chunk` contiguous intervals of
/// near-equal length. Returns `(start, end)` pairs; empty intervals are
/// omitted.
pub fn contiguous_intervals(n_item: usize, n_chunk: usize) -> Vec<(usize, usize)> {
    let n_chunk = n_chunk.max(1);
    let base = n_item / n_chunk;
    let remainder = n_item % n_chunk;
    let mut intervals = Vec::with_capacity(n_chunk.min(n_item));
    let mut start = 0;
    for j in 0..n_chunk {
        let len = base + usize::from(j < remainder);
        if len == 0 {
            continue;
        }
        intervals.push((start, start + len));
        start += len;
    }
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_from_threads() {
        assert!(!Parallelism::from_threads(1).is_parallel());
        assert!(Parallelism::from_threads(0).is_parallel());
        assert!(Parallelism::from_threads(4).is_parallel());
    }

    #[test]
    fn maybe_par_map_preserves_order() {
        let seq: Vec<_> = Parallelism::Sequential.maybe_par_map(0..5usize, |j| j * 2);
        let par: Vec<_> = Parallelism::Parallel.maybe_par_map(0..5usize, |j| j * 2);
        assert_eq!(seq, vec![0, 2, 4, 6, 8]);
        assert_eq!(seq, par);
    }

    #[test]
    fn intervals_cover_range_exactly() {
        let intervals = contiguous_intervals(10, 3);
        assert_eq!(intervals, vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(contiguous_intervals(2, 4), vec![(0, 1), (1, 2)]);
        assert!(contiguous_intervals(0, 4).is_empty());
    }
}
