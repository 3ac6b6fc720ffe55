//! Optimization algorithms
//!
//! Box-constrained minimization on top of argmin: L-BFGS with a More-Thuente
//! line search, falling back to a Nelder-Mead simplex when the quasi-Newton
//! run fails. Bounds are enforced by clamping.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use serde::{Deserialize, Serialize};
use spt_core::{Error, NegLogLikelihood, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Configuration for the bounded optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance for gradient norm
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
    /// Retry with Nelder-Mead if L-BFGS fails
    pub nelder_mead_fallback: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10, nelder_mead_fallback: true }
    }
}

/// Which solver produced an [`OptimizationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Solver {
    /// Quasi-Newton L-BFGS.
    Lbfgs,
    /// Derivative-free simplex.
    NelderMead,
}

/// Result of optimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters
    pub parameters: Vec<f64>,
    /// Function value at minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective (cost) evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
    /// Solver that produced the result
    pub solver: Solver,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={}, \
             solver={:?})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged, self.solver
        )
    }
}

/// Wrapper to make a [`NegLogLikelihood`] compatible with argmin
struct ArgminProblem<'a> {
    objective: &'a dyn NegLogLikelihood,
    bounds: &'a [(f64, f64)],
    counts: Arc<FuncCounts>,
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        match self.objective.nll(&clamped) {
            // A parameter point without a valid covariance is a rejected candidate.
            Ok(v) if v.is_nan() => Ok(f64::INFINITY),
            Ok(v) => Ok(v),
            Err(Error::NonPositiveDefinite { .. }) => Ok(f64::INFINITY),
            Err(e) => Err(argmin::core::Error::msg(e.to_string())),
        }
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .grad_nll(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // Projected gradient: at an active bound, drop the component pointing outward.
        const EPS: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds.iter()).enumerate() {
            if x <= lo + EPS && g[i] > 0.0 {
                g[i] = 0.0;
            }
            if x >= hi - EPS && g[i] < 0.0 {
                g[i] = 0.0;
            }
        }

        Ok(g)
    }
}

fn is_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

/// Box-constrained minimizer: L-BFGS first, Nelder-Mead as fallback.
#[derive(Debug, Clone, Default)]
pub struct BoundedOptimizer {
    config: OptimizerConfig,
}

impl BoundedOptimizer {
    /// Create a new optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize `objective` inside its parameter bounds, starting from `init_params`.
    pub fn minimize(
        &self,
        objective: &dyn NegLogLikelihood,
        init_params: &[f64],
    ) -> Result<OptimizationResult> {
        let n = objective.n_parameters();
        let bounds = objective.parameter_bounds();
        if init_params.len() != n || bounds.len() != n {
            return Err(Error::Validation(format!(
                "Parameter length mismatch: {} initial values, {} bounds, {} parameters",
                init_params.len(),
                bounds.len(),
                n
            )));
        }
        if let Some((i, _)) = bounds.iter().enumerate().find(|(_, (lo, hi))| !(lo <= hi)) {
            return Err(Error::Validation(format!("Invalid bounds for parameter {i}")));
        }

        let init = clamp_params(init_params, &bounds);

        let lbfgs = self.minimize_lbfgs(objective, &init, &bounds);
        match lbfgs {
            Ok(res) if res.fval.is_finite() => Ok(res),
            other if self.config.nelder_mead_fallback => {
                match &other {
                    Ok(res) => log::warn!(
                        "L-BFGS ended at non-finite cost ({res}); retrying with Nelder-Mead"
                    ),
                    Err(e) => log::warn!("L-BFGS failed ({e}); retrying with Nelder-Mead"),
                }
                self.minimize_nelder_mead(objective, &init, &bounds)
            }
            other => other,
        }
    }

    fn minimize_lbfgs(
        &self,
        objective: &dyn NegLogLikelihood,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };

        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost =
            if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Validation(format!("Invalid optimizer configuration (tol): {e}")))?
            .with_tolerance_cost(tol_cost)
            .map_err(|e| {
                Error::Validation(format!("Invalid optimizer configuration (tol_cost): {e}"))
            })?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init.to_vec()).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("L-BFGS failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("No best parameters found".to_string()))?;
        let termination = state.get_termination_status();

        Ok(OptimizationResult {
            parameters: clamp_params(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.grad.load(Ordering::Relaxed),
            converged: is_converged(termination),
            message: termination.to_string(),
            solver: Solver::Lbfgs,
        })
    }

    fn minimize_nelder_mead(
        &self,
        objective: &dyn NegLogLikelihood,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };

        // Initial simplex: the start point plus one step along each axis,
        // stepping inward when the outward step would leave the box.
        let mut simplex = vec![init.to_vec()];
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            let step = 0.1 * init[i].abs().max(0.1);
            let mut vertex = init.to_vec();
            vertex[i] =
                if init[i] + step <= hi { init[i] + step } else { (init[i] - step).max(lo) };
            simplex.push(vertex);
        }

        let sd_tol = if self.config.tol > 0.0 { self.config.tol * 1e-3 } else { 1e-12 };
        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(sd_tol)
            .map_err(|e| Error::Validation(format!("Invalid simplex tolerance: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.config.max_iter.saturating_mul(5)))
            .run()
            .map_err(|e| Error::Computation(format!("Nelder-Mead failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("No best parameters found".to_string()))?;
        let termination = state.get_termination_status();

        Ok(OptimizationResult {
            parameters: clamp_params(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: 0,
            converged: is_converged(termination),
            message: termination.to_string(),
            solver: Solver::NelderMead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 1)^2 + 4 (y + 0.5)^2, minimum at (1, -0.5).
    struct Bowl {
        bounds: Vec<(f64, f64)>,
    }

    impl NegLogLikelihood for Bowl {
        fn n_parameters(&self) -> usize {
            2
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            self.bounds.clone()
        }

        fn nll(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 1.0).powi(2) + 4.0 * (params[1] + 0.5).powi(2))
        }

        fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (params[0] - 1.0), 8.0 * (params[1] + 0.5)])
        }
    }

    #[test]
    fn test_unconstrained_bowl() {
        let optimizer = BoundedOptimizer::default();
        let bowl = Bowl { bounds: vec![(-10.0, 10.0), (-10.0, 10.0)] };
        let result = optimizer.minimize(&bowl, &[4.0, 3.0]).unwrap();

        assert!(result.converged, "{}", result);
        assert_eq!(result.solver, Solver::Lbfgs);
        assert!(result.n_gev > 0);
        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_minimum_outside_box_lands_on_bound() {
        // Mirrors a variance parameter pinned at zero.
        let optimizer = BoundedOptimizer::default();
        let bowl = Bowl { bounds: vec![(0.0, f64::INFINITY), (0.0, f64::INFINITY)] };
        let result = optimizer.minimize(&bowl, &[2.0, 2.0]).unwrap();

        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 0.0, epsilon = 1e-8);
        assert_relative_eq!(result.fval, 1.0, epsilon = 1e-6);
    }

    // Only defined for x > 0; elsewhere the point is rejected.
    struct LogBarrier;

    impl NegLogLikelihood for LogBarrier {
        fn n_parameters(&self) -> usize {
            1
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(-5.0, 50.0)]
        }

        fn nll(&self, params: &[f64]) -> Result<f64> {
            let x = params[0];
            if x <= 0.0 {
                return Err(Error::NonPositiveDefinite { pivot: x, index: 0 });
            }
            Ok(x - 2.0 * x.ln())
        }

        fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
            let x = params[0];
            if x <= 0.0 {
                return Err(Error::NonPositiveDefinite { pivot: x, index: 0 });
            }
            Ok(vec![1.0 - 2.0 / x])
        }
    }

    #[test]
    fn test_rejected_region_is_avoided() {
        let optimizer = BoundedOptimizer::default();
        let result = optimizer.minimize(&LogBarrier, &[0.5]).unwrap();
        // Minimum of x - 2 ln x at x = 2.
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-3);
    }

    // Gradient always fails, forcing the simplex fallback.
    struct NoGradient;

    impl NegLogLikelihood for NoGradient {
        fn n_parameters(&self) -> usize {
            2
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(0.0, 1.0), (0.0, 1.0)]
        }

        fn nll(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 0.3).powi(2) + (params[1] - 0.7).powi(2))
        }

        fn grad_nll(&self, _params: &[f64]) -> Result<Vec<f64>> {
            Err(Error::Computation("no gradient".to_string()))
        }
    }

    #[test]
    fn test_nelder_mead_fallback() {
        let optimizer = BoundedOptimizer::default();
        let result = optimizer.minimize(&NoGradient, &[0.9, 0.1]).unwrap();
        assert_eq!(result.solver, Solver::NelderMead);
        assert_eq!(result.n_gev, 0);
        assert_relative_eq!(result.parameters[0], 0.3, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 0.7, epsilon = 1e-3);

        let strict = BoundedOptimizer::new(OptimizerConfig {
            nelder_mead_fallback: false,
            ..OptimizerConfig::default()
        });
        assert!(strict.minimize(&NoGradient, &[0.9, 0.1]).is_err());
    }

    #[test]
    fn test_length_mismatch() {
        let optimizer = BoundedOptimizer::default();
        let bowl = Bowl { bounds: vec![(0.0, 1.0), (0.0, 1.0)] };
        assert!(matches!(optimizer.minimize(&bowl, &[0.0]), Err(Error::Validation(_))));

        let short = Bowl { bounds: vec![(0.0, 1.0)] };
        assert!(matches!(optimizer.minimize(&short, &[0.0, 0.0]), Err(Error::Validation(_))));
    }
}
