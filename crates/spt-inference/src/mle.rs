//! Maximum Likelihood Estimation of `(a², σ²)` and its uncertainty.

use crate::optimizer::{BoundedOptimizer, OptimizerConfig};
use nalgebra::Matrix2;
use spt_core::{
    Error, FitResult, NegLogLikelihood, ParameterErrors, PopulationParameters, Result, Trajectory,
};
use spt_prob::PopulationLikelihood;

/// Lower bound of `σ²` in units of the data scale.
const MIN_SCALED_SIGMA2: f64 = 1e-9;

/// Normalized correlation above which the information matrix counts as singular.
///
/// Expressed as the condition number of the unit-diagonal information matrix,
/// `(1 + |ρ|) / (1 - |ρ|)`, so it does not depend on the units of the data.
const MAX_CONDITION: f64 = 1e8;

/// Condition number above which a poorly identified fit is logged.
const WARN_CONDITION: f64 = 1e5;

/// Method-of-moments summary of a (weighted) trajectory collection.
#[derive(Debug, Clone, Copy)]
struct Moments {
    /// Mean squared displacement per axis.
    c0: f64,
    /// Mean product of adjacent displacements, if any trajectory has 3+ positions.
    c1: Option<f64>,
    /// Mean blur coefficient, weighted by displacement count.
    blur: f64,
}

fn moments(lik: &PopulationLikelihood<'_>) -> Result<Moments> {
    let (mut s0, mut n0, mut s1, mut n1, mut sb) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (t, b, w) in lik.iter() {
        let n = t.n_displacements() as f64;
        for axis in 0..t.dim() {
            let mut prev: Option<f64> = None;
            for dx in t.displacements(axis) {
                s0 += w * dx * dx;
                if let Some(p) = prev {
                    s1 += w * p * dx;
                    n1 += w;
                }
                prev = Some(dx);
            }
            n0 += w * n;
            sb += w * n * b;
        }
    }
    let c0 = s0 / n0;
    if !(c0.is_finite() && c0 > 0.0) {
        return Err(Error::DegenerateInput("all displacements are zero".to_string()));
    }
    Ok(Moments { c0, c1: (n1 > 0.0).then(|| s1 / n1), blur: sb / n0 })
}

impl Moments {
    /// Covariance-based estimate clamped into the feasible region.
    fn estimate(&self) -> PopulationParameters {
        let (sigma2, a2) = match self.c1 {
            Some(c1) => {
                let sigma2 = (self.c0 + 2.0 * c1).max(0.05 * self.c0);
                (sigma2, (self.blur * sigma2 - c1).clamp(0.0, 0.5 * self.c0))
            }
            // A single displacement per axis cannot separate noise from motion.
            None => (self.c0 / (1.0 - 2.0 * self.blur), 0.0),
        };
        PopulationParameters { a2, sigma2 }
    }
}

/// Closed-form covariance-based estimator of `(a², σ²)`.
///
/// `σ² = c₀ + 2c₁` and `a² = B̄σ² − c₁`, where `c₀` is the mean squared
/// displacement and `c₁` the mean product of adjacent displacements. Cheap and
/// unbiased but less efficient than the likelihood fit; used as its start
/// point.
pub fn covariance_estimate(
    trajectories: &[Trajectory],
    blur: &[f64],
) -> Result<PopulationParameters> {
    let lik = PopulationLikelihood::new(trajectories, blur)?;
    Ok(moments(&lik)?.estimate())
}

/// Population likelihood in units of the data scale, normalized by total weight.
struct ScaledObjective<'a, 'b> {
    lik: &'a PopulationLikelihood<'b>,
    scale: f64,
    norm: f64,
}

impl ScaledObjective<'_, '_> {
    fn params(&self, p: &[f64]) -> PopulationParameters {
        PopulationParameters { a2: p[0] * self.scale, sigma2: p[1] * self.scale }
    }
}

impl NegLogLikelihood for ScaledObjective<'_, '_> {
    fn n_parameters(&self) -> usize {
        2
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![(0.0, f64::INFINITY), (MIN_SCALED_SIGMA2, f64::INFINITY)]
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        Ok(-self.lik.log_likelihood(&self.params(params))? / self.norm)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        let (_, g) = self.lik.log_likelihood_with_gradient(&self.params(params))?;
        let k = -self.scale / self.norm;
        Ok(vec![k * g[0], k * g[1]])
    }
}

/// Maximum-likelihood estimator for one diffusive population.
///
/// Works in units of the data scale (the mean squared displacement), starts
/// from the covariance-based estimate and hands the problem to
/// [`BoundedOptimizer`].
#[derive(Debug, Clone, Default)]
pub struct DiffusionEstimator {
    config: OptimizerConfig,
}

impl DiffusionEstimator {
    /// Create a new estimator with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an estimator with custom optimizer configuration
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Access the optimizer configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Fit `(a², σ²)` to a homogeneous collection.
    pub fn estimate(&self, trajectories: &[Trajectory], blur: &[f64]) -> Result<FitResult> {
        let lik = PopulationLikelihood::new(trajectories, blur)?;
        self.fit(&lik, None)
    }

    /// Fit `(a², σ²)` maximizing the weight-scaled log-likelihood.
    ///
    /// `init` warm-starts the optimizer (used by EM); otherwise the
    /// covariance-based estimate of the weighted data is used.
    pub fn estimate_weighted(
        &self,
        trajectories: &[Trajectory],
        blur: &[f64],
        weights: &[f64],
        init: Option<PopulationParameters>,
    ) -> Result<FitResult> {
        let lik = PopulationLikelihood::weighted(trajectories, blur, weights)?;
        self.fit(&lik, init)
    }

    /// Fit a prepared population likelihood.
    pub fn fit(
        &self,
        lik: &PopulationLikelihood<'_>,
        init: Option<PopulationParameters>,
    ) -> Result<FitResult> {
        let m = moments(lik)?;
        let scale = m.c0;
        let start = init.unwrap_or_else(|| m.estimate());
        let p0 = [start.a2 / scale, start.sigma2 / scale];

        let objective = ScaledObjective { lik, scale, norm: lik.total_weight() };
        let optimizer = BoundedOptimizer::new(self.config.clone());
        let result = optimizer.minimize(&objective, &p0)?;

        let parameters = objective.params(&result.parameters);
        let log_likelihood = lik.log_likelihood(&parameters)?;
        if !result.converged {
            log::debug!("MLE did not report convergence: {}", result.message);
        }

        Ok(FitResult {
            parameters,
            log_likelihood,
            converged: result.converged,
            n_iter: result.n_iter as usize,
            n_fev: result.n_fev,
            n_gev: result.n_gev,
            message: result.message,
        })
    }

    /// Standard errors of `(a², σ²)` at `params` from the observed information.
    pub fn estimate_errors(
        &self,
        trajectories: &[Trajectory],
        blur: &[f64],
        params: &PopulationParameters,
    ) -> Result<ParameterErrors> {
        let lik = PopulationLikelihood::new(trajectories, blur)?;
        parameter_errors(&lik, params)
    }

    /// Standard errors for a weighted population fit.
    pub fn estimate_errors_weighted(
        &self,
        trajectories: &[Trajectory],
        blur: &[f64],
        weights: &[f64],
        params: &PopulationParameters,
    ) -> Result<ParameterErrors> {
        let lik = PopulationLikelihood::weighted(trajectories, blur, weights)?;
        parameter_errors(&lik, params)
    }
}

/// Observed information: Hessian of the negative log-likelihood.
///
/// Central differences of the analytic gradient, switching to a second-order
/// one-sided stencil where the backward step would leave the parameter
/// bounds. Symmetrized.
pub fn observed_information(
    model: &impl NegLogLikelihood,
    best_params: &[f64],
    scale: f64,
) -> Result<Matrix2<f64>> {
    if best_params.len() != 2 || model.n_parameters() != 2 {
        return Err(Error::Validation("observed information expects 2 parameters".to_string()));
    }
    let bounds = model.parameter_bounds();
    let grad_center = model.grad_nll(best_params)?;
    let mut hessian = Matrix2::zeros();

    for j in 0..2 {
        let eps = 1e-5 * best_params[j].abs().max(1e-2 * scale);
        let shifted = |delta: f64| -> Result<Vec<f64>> {
            let mut p = best_params.to_vec();
            p[j] += delta;
            model.grad_nll(&p)
        };

        let column: Vec<f64> = if best_params[j] - eps > bounds[j].0 {
            let (plus, minus) = (shifted(eps)?, shifted(-eps)?);
            (0..2).map(|i| (plus[i] - minus[i]) / (2.0 * eps)).collect()
        } else {
            let (plus, plus2) = (shifted(eps)?, shifted(2.0 * eps)?);
            (0..2)
                .map(|i| (-3.0 * grad_center[i] + 4.0 * plus[i] - plus2[i]) / (2.0 * eps))
                .collect()
        };
        for i in 0..2 {
            hessian[(i, j)] = column[i];
        }
    }

    Ok((hessian + hessian.transpose()) * 0.5)
}

/// Condition number of the information matrix rescaled to unit diagonal.
fn normalized_condition(h: &Matrix2<f64>) -> f64 {
    let rho = (h[(0, 1)] / (h[(0, 0)] * h[(1, 1)]).sqrt()).abs();
    if rho >= 1.0 {
        f64::INFINITY
    } else {
        (1.0 + rho) / (1.0 - rho)
    }
}

fn parameter_errors(
    lik: &PopulationLikelihood<'_>,
    params: &PopulationParameters,
) -> Result<ParameterErrors> {
    PopulationParameters::new(params.a2, params.sigma2)?;
    let scale = moments(lik)?.c0;
    let hessian = observed_information(lik, &params.to_array(), scale)?;

    if hessian.iter().any(|x| !x.is_finite()) {
        return Err(Error::SingularInformation("information matrix is not finite".to_string()));
    }
    if hessian[(0, 0)] <= 0.0 || hessian[(1, 1)] <= 0.0 {
        return Err(Error::SingularInformation(format!(
            "information matrix has non-positive diagonal ({:.3e}, {:.3e})",
            hessian[(0, 0)],
            hessian[(1, 1)]
        )));
    }
    let cond = normalized_condition(&hessian);
    if cond > MAX_CONDITION {
        return Err(Error::SingularInformation(format!(
            "a2 and sigma2 are not separately identifiable (condition number {cond:.1e})"
        )));
    }
    if cond > WARN_CONDITION {
        log::warn!(
            "Information matrix condition number = {cond:.1e}: fit may be poorly identified"
        );
    }

    let chol = hessian.cholesky().ok_or_else(|| {
        Error::SingularInformation("information matrix is not positive definite".to_string())
    })?;
    let cov = chol.inverse();
    ParameterErrors::from_covariance([[cov[(0, 0)], cov[(0, 1)]], [cov[(1, 0)], cov[(1, 1)]]])
        .ok_or_else(|| {
            Error::SingularInformation("inverse information has invalid variances".to_string())
        })
}

/// Fit `(a², σ²)` with the default configuration.
pub fn estimate(trajectories: &[Trajectory], blur: &[f64]) -> Result<FitResult> {
    DiffusionEstimator::new().estimate(trajectories, blur)
}

/// Standard errors of `(a², σ²)` with the default configuration.
pub fn estimate_errors(
    trajectories: &[Trajectory],
    blur: &[f64],
    params: &PopulationParameters,
) -> Result<ParameterErrors> {
    DiffusionEstimator::new().estimate_errors(trajectories, blur, params)
}
