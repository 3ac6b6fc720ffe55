//! Small numerically-stable math utilities used by the likelihood and EM code.

/// `ln(2π)`.
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Stable `log(Σ exp(x_i))`.
///
/// Returns `-inf` for an empty slice or when every term is `-inf`.
/// `+inf` or `NaN` inputs propagate.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || !max.is_finite() {
        return max;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Normalize log-weights in place into probabilities, returning their log-sum-exp.
///
/// If every entry is `-inf` the slice is left untouched and `-inf` is returned.
pub fn softmax_in_place(log_weights: &mut [f64]) -> f64 {
    let lse = log_sum_exp(log_weights);
    if lse.is_finite() {
        for x in log_weights.iter_mut() {
            *x = (*x - lse).exp();
        }
    }
    lse
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ln_2pi() {
        assert_relative_eq!(LN_2PI, (2.0 * std::f64::consts::PI).ln(), epsilon = 1e-15);
    }

    #[test]
    fn test_log_sum_exp_matches_naive_moderate_values() {
        let xs = [-1.0, 0.5, 2.0];
        let naive = xs.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        assert_relative_eq!(log_sum_exp(&xs), naive, epsilon = 1e-14);
    }

    #[test]
    fn test_log_sum_exp_extremes() {
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_relative_eq!(log_sum_exp(&[-1e5, -1e5]), -1e5 + 2.0f64.ln(), epsilon = 1e-9);
        assert_relative_eq!(log_sum_exp(&[1e5, f64::NEG_INFINITY]), 1e5, epsilon = 1e-9);
    }

    #[test]
    fn test_softmax_in_place() {
        let mut w = [(0.2f64).ln(), (0.3f64).ln(), f64::NEG_INFINITY, (0.5f64).ln()];
        let lse = softmax_in_place(&mut w);
        assert_relative_eq!(lse, 0.0, epsilon = 1e-14);
        assert_relative_eq!(w[0], 0.2, epsilon = 1e-14);
        assert_eq!(w[2], 0.0);
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
    }
}
