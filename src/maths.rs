//! Numeric helpers for the split rules: rank transforms, the beta
//! log-likelihood, and the maximally-selected-statistic p-value
//! approximations.

use statrs::distribution::{Continuous, Normal};
use statrs::function::gamma::ln_gamma;

/// Mid-ranks of `values` (1-based; tied values share the average of the ranks
/// they occupy).
pub fn rank(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0; n];
    let mut j = 0;
    while j < n {
        let mut k = j;
        while k + 1 < n && values[order[k + 1]] == values[order[j]] {
            k += 1;
        }
        // Positions j..=k hold ties; each gets the average 1-based rank.
        let tied_rank = (j + k) as f64 / 2.0 + 1.0;
        for &key in &order[j..=k] {
            ranks[key] = tied_rank;
        }
        j = k + 1;
    }
    ranks
}

/// Unbiased sample variance; zero when fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}

/// Log-density of a beta distribution in the mean/precision parametrisation
/// `alpha = mu * nu`, `beta = (1 - mu) * nu`, evaluated at `y`.
pub fn beta_log_likelihood(y: f64, mu: f64, nu: f64) -> f64 {
    let alpha = mu * nu;
    let beta = (1.0 - mu) * nu;
    ln_gamma(nu) - ln_gamma(alpha) - ln_gamma(beta)
        + (alpha - 1.0) * y.ln()
        + (beta - 1.0) * (1.0 - y).ln()
}

fn standard_normal_density(b: f64) -> f64 {
    // Infallible for unit parameters.
    let standard = Normal::new(0.0, 1.0).unwrap();
    standard.pdf(b)
}

/// Lausen & Schumacher (1992) upper bound on the p-value of a maximally
/// selected standardised statistic `b`, with candidate split proportions
/// restricted to `[min_prop, 1 - min_prop]`.
pub fn maxstat_p_value_lausen92(b: f64, min_prop: f64) -> f64 {
    if b < 1.0 {
        return 1.0;
    }
    let log_prop = 2.0 * ((1.0 - min_prop) / min_prop).ln();
    let density = standard_normal_density(b);
    4.0 * density / b + density * (b - 1.0 / b) * log_prop
}

/// Lausen, Sauerbrei & Schumacher (1994) refinement: the 1992 bound minus a
/// correction summed over the observed candidate-bucket boundaries.
///
/// `bucket_counts[..n_bucket]` are the per-candidate sample counts in the
/// node; their partial sums give the split-point margins `m_i`.
pub fn maxstat_p_value_lausen94(
    b: f64,
    n_sample: usize,
    bucket_counts: &[usize],
    n_bucket: usize,
    min_prop: f64,
) -> f64 {
    let n = n_sample as f64;
    let mut correction = 0.0;
    let mut m1 = 0.0;
    let mut m2 = 0.0;
    for &count in bucket_counts.iter().take(n_bucket) {
        m2 += count as f64;
        if m1 > 0.0 && count > 0 {
            let t = (1.0 - m1 * (n - m2) / ((n - m1) * m2)).max(0.0).sqrt();
            correction += (1.0 / std::f64::consts::PI)
                * (-b * b / 2.0).exp()
                * (t - (b * b / 4.0 - 1.0) * t.powi(3) / 6.0);
        }
        if count > 0 {
            m1 = m2;
        }
    }
    maxstat_p_value_lausen92(b, min_prop) - correction
}
