//! Summed log-likelihood of a homogeneous trajectory collection.

use crate::likelihood::{log_likelihood, log_likelihood_with_gradient};
use spt_core::{Error, NegLogLikelihood, PopulationParameters, Result, Trajectory, validate_blur};

/// Lower bound on `σ²` used by [`PopulationLikelihood::parameter_bounds`].
pub const MIN_SIGMA2: f64 = 1e-12;

/// Negative (optionally weighted) log-likelihood of one diffusive population.
///
/// Parameters are ordered `[a², σ²]`. Trajectories with zero weight are
/// excluded up front.
#[derive(Debug, Clone)]
pub struct PopulationLikelihood<'a> {
    trajectories: &'a [Trajectory],
    blur: &'a [f64],
    /// `(index, weight)` of every trajectory that contributes.
    included: Vec<(usize, f64)>,
    total_weight: f64,
}

impl<'a> PopulationLikelihood<'a> {
    /// Unweighted likelihood over all trajectories.
    pub fn new(trajectories: &'a [Trajectory], blur: &'a [f64]) -> Result<Self> {
        Self::build(trajectories, blur, None)
    }

    /// Likelihood with per-trajectory weights in `[0, 1]`.
    pub fn weighted(
        trajectories: &'a [Trajectory],
        blur: &'a [f64],
        weights: &[f64],
    ) -> Result<Self> {
        Self::build(trajectories, blur, Some(weights))
    }

    fn build(
        trajectories: &'a [Trajectory],
        blur: &'a [f64],
        weights: Option<&[f64]>,
    ) -> Result<Self> {
        if trajectories.len() != blur.len() {
            return Err(Error::Validation(format!(
                "{} trajectories but {} blur coefficients",
                trajectories.len(),
                blur.len()
            )));
        }
        if let Some(w) = weights {
            if w.len() != trajectories.len() {
                return Err(Error::Validation(format!(
                    "{} trajectories but {} weights",
                    trajectories.len(),
                    w.len()
                )));
            }
        }
        if trajectories.is_empty() {
            return Err(Error::DegenerateInput("no trajectories".to_string()));
        }

        let mut included = Vec::with_capacity(trajectories.len());
        for (i, (t, &b)) in trajectories.iter().zip(blur).enumerate() {
            validate_blur(b)?;
            let w = weights.map_or(1.0, |w| w[i]);
            if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                return Err(Error::Validation(format!("weight {i} must be in [0, 1], got {w}")));
            }
            if w == 0.0 {
                continue;
            }
            if t.len() < 2 {
                return Err(Error::DegenerateInput(format!(
                    "trajectory {} has {} positions, need at least 2",
                    i,
                    t.len()
                )));
            }
            included.push((i, w));
        }

        let total_weight: f64 = included.iter().map(|&(_, w)| w).sum();
        if included.is_empty() || total_weight <= 0.0 {
            return Err(Error::DegenerateInput("all weights are zero".to_string()));
        }

        Ok(Self { trajectories, blur, included, total_weight })
    }

    /// Sum of weights of contributing trajectories.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Number of contributing trajectories.
    pub fn n_included(&self) -> usize {
        self.included.len()
    }

    /// Contributing `(trajectory, blur, weight)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&'a Trajectory, f64, f64)> + '_ {
        let (ts, bs) = (self.trajectories, self.blur);
        self.included.iter().map(move |&(i, w)| (&ts[i], bs[i], w))
    }

    /// Weighted log-likelihood at `params`.
    pub fn log_likelihood(&self, params: &PopulationParameters) -> Result<f64> {
        let mut total = 0.0;
        for (t, b, w) in self.iter() {
            total += w * log_likelihood(t, b, params)?;
        }
        Ok(total)
    }

    /// Weighted log-likelihood and gradient at `params`.
    pub fn log_likelihood_with_gradient(
        &self,
        params: &PopulationParameters,
    ) -> Result<(f64, [f64; 2])> {
        let mut total = 0.0;
        let mut grad = [0.0; 2];
        for (t, b, w) in self.iter() {
            let (ll, g) = log_likelihood_with_gradient(t, b, params)?;
            total += w * ll;
            grad[0] += w * g[0];
            grad[1] += w * g[1];
        }
        Ok((total, grad))
    }
}

fn unpack(params: &[f64]) -> Result<PopulationParameters> {
    match params {
        [a2, sigma2] => Ok(PopulationParameters { a2: *a2, sigma2: *sigma2 }),
        _ => Err(Error::Validation(format!("expected 2 parameters, got {}", params.len()))),
    }
}

impl NegLogLikelihood for PopulationLikelihood<'_> {
    fn n_parameters(&self) -> usize {
        2
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![(0.0, f64::INFINITY), (MIN_SIGMA2, f64::INFINITY)]
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        Ok(-self.log_likelihood(&unpack(params)?)?)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        let (_, g) = self.log_likelihood_with_gradient(&unpack(params)?)?;
        Ok(vec![-g[0], -g[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn collection() -> (Vec<Trajectory>, Vec<f64>) {
        let ts: Vec<Trajectory> = (0..4)
            .map(|k| {
                let xs = (0..10 + k).map(|i| ((i * (k + 2)) as f64 * 0.37).sin()).collect();
                Trajectory::from_1d(xs).unwrap()
            })
            .collect();
        (ts, vec![0.1, 0.0, 1.0 / 6.0, 0.25])
    }

    #[test]
    fn test_unit_weights_match_unweighted() {
        let (ts, bs) = collection();
        let p = PopulationParameters::new(0.02, 0.3).unwrap();
        let plain = PopulationLikelihood::new(&ts, &bs).unwrap();
        let ones = PopulationLikelihood::weighted(&ts, &bs, &[1.0; 4]).unwrap();
        assert_relative_eq!(
            plain.log_likelihood(&p).unwrap(),
            ones.log_likelihood(&p).unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(plain.total_weight(), 4.0);
    }

    #[test]
    fn test_zero_weight_drops_trajectory() {
        let (mut ts, bs) = collection();
        // A too-short trajectory is fine as long as it carries no weight.
        ts[1] = Trajectory::from_1d(vec![0.0]).unwrap();
        let lik = PopulationLikelihood::weighted(&ts, &bs, &[0.5, 0.0, 1.0, 0.25]).unwrap();
        assert_eq!(lik.n_included(), 3);
        assert_relative_eq!(lik.total_weight(), 1.75, epsilon = 1e-12);

        assert!(matches!(
            PopulationLikelihood::new(&ts, &bs),
            Err(Error::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_rejects_degenerate_weights_and_mismatches() {
        let (ts, bs) = collection();
        assert!(matches!(
            PopulationLikelihood::weighted(&ts, &bs, &[0.0; 4]),
            Err(Error::DegenerateInput(_))
        ));
        assert!(matches!(
            PopulationLikelihood::weighted(&ts, &bs, &[0.5, 1.5, 0.1, 0.1]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(PopulationLikelihood::new(&ts, &bs[..3]), Err(Error::Validation(_))));
        assert!(matches!(PopulationLikelihood::new(&[], &[]), Err(Error::DegenerateInput(_))));
    }

    #[test]
    fn test_trait_gradient_is_negated() {
        let (ts, bs) = collection();
        let lik = PopulationLikelihood::new(&ts, &bs).unwrap();
        let p = PopulationParameters::new(0.05, 0.5).unwrap();
        let (ll, g) = lik.log_likelihood_with_gradient(&p).unwrap();
        assert_relative_eq!(lik.nll(&[0.05, 0.5]).unwrap(), -ll, epsilon = 1e-12);
        let gn = lik.grad_nll(&[0.05, 0.5]).unwrap();
        assert_eq!(gn, vec![-g[0], -g[1]]);
        assert!(lik.nll(&[0.1]).is_err());
    }
}
