//! Sampling primitives used by resampling and candidate-predictor draws.
//!
//! All draws are deterministic in the supplied RNG. The `inbag_counts`
//! output records how many times each key was drawn; out-of-bag keys are the
//! ones whose count stays zero.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::errors::{Error, Result};

/// Draw `n_draw` keys uniformly from `[0, n_total)` with replacement.
pub fn draw_replace<R: Rng>(
    n_draw: usize,
    n_total: usize,
    rng: &mut R,
    sample_keys: &mut Vec<usize>,
    inbag_counts: &mut [usize],
) {
    sample_keys.reserve(n_draw);
    for _ in 0..n_draw {
        let key = rng.gen_range(0..n_total);
        sample_keys.push(key);
        inbag_counts[key] += 1;
    }
}

/// Draw `n_draw` keys from `[0, weights.len())` with replacement, where the
/// probability of each key is proportional to its weight.
pub fn draw_replace_weighted<R: Rng>(
    n_draw: usize,
    weights: &[f64],
    rng: &mut R,
    sample_keys: &mut Vec<usize>,
    inbag_counts: &mut [usize],
) -> Result<()> {
    let dist = WeightedIndex::new(weights)
        .map_err(|e| Error::domain(format!("invalid case weights: {e}")))?;
    sample_keys.reserve(n_draw);
    for _ in 0..n_draw {
        let key = dist.sample(rng);
        sample_keys.push(key);
        inbag_counts[key] += 1;
    }
    Ok(())
}

/// Draw `n_draw` distinct keys uniformly from `[0, n_total)`, never drawing a
/// key listed in `excluded` (sorted). Draws fewer keys when the non-excluded
/// pool is smaller than `n_draw`.
pub fn draw_no_replace<R: Rng>(
    n_draw: usize,
    n_total: usize,
    excluded: &[usize],
    rng: &mut R,
    sample_keys: &mut Vec<usize>,
    inbag_counts: &mut [usize],
) {
    let mut pool: Vec<usize> = (0..n_total)
        .filter(|key| excluded.binary_search(key).is_err())
        .collect();
    let n_draw = n_draw.min(pool.len());
    // Partial Fisher-Yates: only the first n_draw slots need to be settled.
    for j in 0..n_draw {
        let swap = rng.gen_range(j..pool.len());
        pool.swap(j, swap);
        sample_keys.push(pool[j]);
        inbag_counts[pool[j]] += 1;
    }
}

/// Draw `n_draw` distinct keys from `[0, weights.len())` with probability
/// proportional to weight. Already-drawn keys have their weight zeroed out.
pub fn draw_no_replace_weighted<R: Rng>(
    n_draw: usize,
    weights: &[f64],
    rng: &mut R,
    sample_keys: &mut Vec<usize>,
    inbag_counts: &mut [usize],
) -> Result<()> {
    let mut dist = WeightedIndex::new(weights)
        .map_err(|e| Error::domain(format!("invalid draw weights: {e}")))?;
    sample_keys.reserve(n_draw);
    for j in 0..n_draw {
        let key = dist.sample(rng);
        sample_keys.push(key);
        inbag_counts[key] += 1;
        if j + 1 == n_draw {
            break;
        }
        dist.update_weights(&[(key, &0.0)])
            .map_err(|_| Error::domain("fewer non-zero weight keys than requested draws"))?;
    }
    Ok(())
}

/// Shuffle the keys `[0, n_total)` and return them.
pub fn shuffled_keys<R: Rng>(n_total: usize, rng: &mut R) -> Vec<usize> {
    let mut keys: Vec<usize> = (0..n_total).collect();
    keys.shuffle(rng);
    keys
}

/// Key with the greatest count, breaking ties by a uniform draw among the
/// tied keys. Keys with non-positive count never win; returns `None` when
/// every count is non-positive.
pub fn most_frequent_key<R: Rng>(counts: &[f64], rng: &mut R) -> Option<usize> {
    let mut best = 0.0f64;
    for &count in counts {
        if count > best {
            best = count;
        }
    }
    if best <= 0.0 {
        return None;
    }
    let tied: Vec<usize> = counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count == best)
        .map(|(key, _)| key)
        .collect();
    if tied.len() == 1 {
        Some(tied[0])
    } else {
        Some(tied[rng.gen_range(0..tied.len())])
    }
}
