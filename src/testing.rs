//! Deterministic synthetic data for tests.

use rand::prelude::*;

use crate::data::DenseMatrix;

/// Random dense features in row-major order, uniform in `[min, max)`.
pub fn random_dense(rows: usize, cols: usize, seed: u64, min: f64, max: f64) -> Vec<f64> {
    assert!(max >= min);
    let mut rng = StdRng::seed_from_u64(seed);
    let width = max - min;
    (0..rows * cols).map(|_| min + rng.gen::<f64>() * width).collect()
}

/// A [`DenseMatrix`] of random features.
pub fn random_matrix(rows: usize, cols: usize, seed: u64, min: f64, max: f64) -> DenseMatrix {
    DenseMatrix::from_vec(random_dense(rows, cols, seed, min, max), rows, cols)
}

/// Regression targets from a seeded linear model of the features plus
/// uniform noise.
pub fn linear_targets(
    features_row_major: &[f64],
    rows: usize,
    cols: usize,
    seed: u64,
    noise_amplitude: f64,
) -> Vec<f64> {
    assert_eq!(features_row_major.len(), rows * cols);
    let mut rng = StdRng::seed_from_u64(seed);
    let weights: Vec<f64> = (0..cols).map(|_| rng.gen::<f64>() * 2.0 - 1.0).collect();
    let bias: f64 = rng.gen::<f64>() * 0.5 - 0.25;

    (0..rows)
        .map(|row| {
            let base = row * cols;
            let mut target = bias;
            for col in 0..cols {
                target += features_row_major[base + col] * weights[col];
            }
            if noise_amplitude > 0.0 {
                target += (rng.gen::<f64>() * 2.0 - 1.0) * noise_amplitude;
            }
            target
        })
        .collect()
}

/// Binary targets (0/1) by thresholding a linear score at zero.
pub fn binary_targets(
    features_row_major: &[f64],
    rows: usize,
    cols: usize,
    seed: u64,
    noise_amplitude: f64,
) -> Vec<f64> {
    linear_targets(features_row_major, rows, cols, seed, noise_amplitude)
        .into_iter()
        .map(|score| if score > 0.0 { 1.0 } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_dense_is_deterministic_per_seed() {
        assert_eq!(random_dense(4, 2, 9, 0.0, 1.0), random_dense(4, 2, 9, 0.0, 1.0));
        assert!(random_dense(16, 1, 9, -2.0, 2.0).iter().all(|v| (-2.0..2.0).contains(v)));
    }

    #[test]
    fn binary_targets_are_zero_or_one() {
        let features = random_dense(32, 3, 1, -1.0, 1.0);
        let targets = binary_targets(&features, 32, 3, 2, 0.1);
        assert!(targets.iter().all(|t| *t == 0.0 || *t == 1.0));
    }
}
