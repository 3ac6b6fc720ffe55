//! Goodness of fit: per-trajectory quality factors and the Kuiper statistic.
//!
//! The quality factor of a trajectory under a population is the chi-square
//! CDF of its whitened quadratic form, `u = F_{χ²(d(N-1))}(Q)`. Under the
//! model `u` is uniform on `[0, 1]`, so the (weighted) Kuiper distance of the
//! collected factors from the uniform CDF measures misspecification.

use crate::em::MixtureComponent;
use crate::responsibilities::ResponsibilityMatrix;
use serde::{Deserialize, Serialize};
use spt_core::{Error, PopulationParameters, Result, Trajectory};
use spt_prob::{DisplacementCovariance, whiten};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// How mixture quality factors are attributed to populations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityWeighting {
    /// One factor per (trajectory, population) pair, weighted by `T[i, k]`.
    #[default]
    Responsibility,
    /// One factor per trajectory under its most probable population.
    HardAssignment,
}

/// Quality factor of one trajectory under one population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityFactor {
    /// Trajectory index.
    pub trajectory: usize,
    /// Population index.
    pub population: usize,
    /// Value in `[0, 1]`.
    pub value: f64,
    /// Weight in the empirical distribution.
    pub weight: f64,
}

/// Quality factor of `trajectory` under `params`.
pub fn quality_factor(
    trajectory: &Trajectory,
    blur: f64,
    params: &PopulationParameters,
) -> Result<f64> {
    let cov = DisplacementCovariance::new(trajectory.len(), params, blur)?;
    let w = whiten(&cov, trajectory)?;
    let chi2 = ChiSquared::new(w.degrees_of_freedom() as f64)
        .map_err(|e| Error::Computation(format!("chi-square distribution: {e}")))?;
    Ok(chi2.cdf(w.quadratic_form).clamp(0.0, 1.0))
}

fn check_lengths(trajectories: &[Trajectory], blur: &[f64]) -> Result<()> {
    if trajectories.len() != blur.len() {
        return Err(Error::Validation(format!(
            "{} trajectories but {} blur coefficients",
            trajectories.len(),
            blur.len()
        )));
    }
    Ok(())
}

/// Unit-weight quality factors of a homogeneous collection.
pub fn quality_factors_single(
    trajectories: &[Trajectory],
    blur: &[f64],
    params: &PopulationParameters,
) -> Result<Vec<QualityFactor>> {
    check_lengths(trajectories, blur)?;
    trajectories
        .iter()
        .zip(blur)
        .enumerate()
        .map(|(i, (t, &b))| {
            let value = quality_factor(t, b, params)?;
            Ok(QualityFactor { trajectory: i, population: 0, value, weight: 1.0 })
        })
        .collect()
}

/// Quality factors of a fitted mixture.
pub fn quality_factors(
    responsibilities: &ResponsibilityMatrix,
    components: &[MixtureComponent],
    trajectories: &[Trajectory],
    blur: &[f64],
    weighting: QualityWeighting,
) -> Result<Vec<QualityFactor>> {
    check_lengths(trajectories, blur)?;
    if responsibilities.n_trajectories() != trajectories.len()
        || responsibilities.n_populations() != components.len()
    {
        return Err(Error::Validation(format!(
            "responsibilities are {}x{}, expected {}x{}",
            responsibilities.n_trajectories(),
            responsibilities.n_populations(),
            trajectories.len(),
            components.len()
        )));
    }

    let mut out = Vec::with_capacity(trajectories.len());
    for (i, (t, &b)) in trajectories.iter().zip(blur).enumerate() {
        match weighting {
            QualityWeighting::Responsibility => {
                for (k, c) in components.iter().enumerate() {
                    let weight = responsibilities.get(i, k);
                    if weight > 0.0 {
                        let value = quality_factor(t, b, &c.params)?;
                        out.push(QualityFactor { trajectory: i, population: k, value, weight });
                    }
                }
            }
            QualityWeighting::HardAssignment => {
                let k = responsibilities.argmax(i);
                let value = quality_factor(t, b, &components[k].params)?;
                out.push(QualityFactor { trajectory: i, population: k, value, weight: 1.0 });
            }
        }
    }
    Ok(out)
}

/// Kuiper test of quality factors against the uniform distribution.
#[derive(Debug, Clone)]
pub struct KuiperResult {
    /// `√n_eff · V`; of order 1 under the model.
    pub statistic: f64,
    /// Kuiper distance `V = D⁺ + D⁻`.
    pub distance: f64,
    /// Effective sample size `(Σw)² / Σw²`.
    pub n_effective: f64,
    /// Asymptotic p-value.
    pub p_value: f64,
    /// The input factors sorted by value.
    pub sorted: Vec<QualityFactor>,
}

/// Weighted Kuiper statistic of `factors`.
///
/// Takes ownership of the factors and hands them back sorted. Empty input
/// (or zero total weight) gives a statistic of 0.
pub fn kuiper_statistic(mut factors: Vec<QualityFactor>) -> KuiperResult {
    factors.sort_by(|a, b| a.value.total_cmp(&b.value));

    let total: f64 = factors.iter().map(|f| f.weight).sum();
    let sum_sq: f64 = factors.iter().map(|f| f.weight * f.weight).sum();
    if factors.is_empty() || total <= 0.0 {
        return KuiperResult {
            statistic: 0.0,
            distance: 0.0,
            n_effective: 0.0,
            p_value: 1.0,
            sorted: factors,
        };
    }

    let (mut d_plus, mut d_minus, mut cum) = (0.0f64, 0.0f64, 0.0);
    for f in &factors {
        d_minus = d_minus.max(f.value - cum / total);
        cum += f.weight;
        d_plus = d_plus.max(cum / total - f.value);
    }
    let distance = d_plus + d_minus;
    let n_effective = total * total / sum_sq;

    KuiperResult {
        statistic: n_effective.sqrt() * distance,
        distance,
        n_effective,
        p_value: kuiper_p_value(distance, n_effective),
        sorted: factors,
    }
}

/// Asymptotic p-value of a Kuiper distance `v` with Stephens' finite-size correction.
pub fn kuiper_p_value(v: f64, n: f64) -> f64 {
    if !(n > 0.0) || !v.is_finite() {
        return 1.0;
    }
    let sn = n.sqrt();
    let lambda = (sn + 0.155 + 0.24 / sn) * v;
    if lambda < 0.4 {
        return 1.0;
    }
    let l2 = lambda * lambda;
    let mut sum = 0.0;
    for j in 1..=100 {
        let j2 = (j * j) as f64;
        let term = (4.0 * j2 * l2 - 1.0) * (-2.0 * j2 * l2).exp();
        sum += term;
        if term.abs() < 1e-16 * sum.abs().max(1e-300) {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}
