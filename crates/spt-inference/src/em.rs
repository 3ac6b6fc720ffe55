//! Expectation-Maximization for mixtures of diffusive populations.
//!
//! Each population `k` has its own `θ_k = (a², σ²)` and mixing weight `P_k`.
//! The E-step computes membership probabilities in log space; the M-step is a
//! responsibility-weighted MLE per population, warm-started from the current
//! parameters. [`fit_mixture_global`] runs many randomly initialized local
//! fits in parallel and keeps the best.

use crate::mle::DiffusionEstimator;
use crate::optimizer::OptimizerConfig;
use crate::responsibilities::ResponsibilityMatrix;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use spt_core::{Error, PopulationParameters, Result, Trajectory};
use spt_prob::math::softmax_in_place;
use spt_prob::{PopulationLikelihood, log_likelihood};

/// Populations whose expected size falls below this fraction of `M` are frozen.
const MIN_POPULATION_FRACTION: f64 = 1e-12;

/// One population of a mixture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    /// Diffusion and noise parameters.
    pub params: PopulationParameters,
    /// Mixing proportion `P_k`.
    pub weight: f64,
}

/// Local EM configuration.
///
/// Defaults to at most 200 cycles with relative tolerance `1e-8` and the
/// default [`OptimizerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmConfig {
    /// Maximum number of M-steps.
    pub max_cycles: usize,
    /// Relative tolerance on log-likelihood improvement.
    pub tol: f64,
    /// Optimizer used by each weighted M-step fit.
    pub optimizer: OptimizerConfig,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self { max_cycles: 200, tol: 1e-8, optimizer: OptimizerConfig::default() }
    }
}

impl EmConfig {
    fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(Error::Validation("max_cycles must be > 0".to_string()));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(Error::Validation("tol must be finite and >= 0".to_string()));
        }
        Ok(())
    }
}

/// Multi-start EM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalEmConfig {
    /// Number of independent local EM runs.
    pub n_restarts: usize,
    /// Range `a²` start values are drawn from.
    pub a2_range: (f64, f64),
    /// Range `σ²` start values are drawn from.
    pub sigma2_range: (f64, f64),
    /// Base seed; restart `r` uses `seed + r`.
    pub seed: u64,
    /// Worker threads (0 = rayon global pool).
    pub n_threads: usize,
    /// Configuration of every local run.
    pub local: EmConfig,
}

impl GlobalEmConfig {
    /// Configuration with the given start-value ranges.
    ///
    /// The remaining fields take these defaults:
    /// - `n_restarts = 20`
    /// - `seed = 42`
    /// - `n_threads = 0` (rayon global pool)
    /// - `local = EmConfig::default()` (200 cycles, `tol = 1e-8`)
    pub fn new(a2_range: (f64, f64), sigma2_range: (f64, f64)) -> Self {
        Self {
            n_restarts: 20,
            a2_range,
            sigma2_range,
            seed: 42,
            n_threads: 0,
            local: EmConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.n_restarts == 0 {
            return Err(Error::Validation("n_restarts must be > 0".to_string()));
        }
        let (a_lo, a_hi) = self.a2_range;
        if !(a_lo.is_finite() && a_hi.is_finite() && 0.0 <= a_lo && a_lo <= a_hi) {
            return Err(Error::Validation(format!("invalid a2 range {:?}", self.a2_range)));
        }
        let (s_lo, s_hi) = self.sigma2_range;
        if !(s_lo.is_finite() && s_hi.is_finite() && 0.0 < s_lo && s_lo <= s_hi) {
            return Err(Error::Validation(format!("invalid sigma2 range {:?}", self.sigma2_range)));
        }
        self.local.validate()
    }
}

/// Fitted mixture.
#[derive(Debug, Clone)]
pub struct MixtureModel {
    /// Fitted populations.
    pub components: Vec<MixtureComponent>,
    /// Total mixture log-likelihood `Σ_i ln Σ_k P_k L_ik`.
    pub log_likelihood: f64,
    /// Membership probabilities at the returned parameters.
    pub responsibilities: ResponsibilityMatrix,
    /// Log-likelihood after every E-step (index 0 = initial components).
    pub loglik_trace: Vec<f64>,
    /// Whether the stopping criterion was met.
    pub converged: bool,
    /// Number of completed EM cycles.
    pub n_iter: usize,
}

/// Result of a multi-start EM.
#[derive(Debug, Clone)]
pub struct GlobalEmResult {
    /// Best mixture, components ordered by ascending `σ²`.
    pub best: MixtureModel,
    /// Restart index that produced `best`.
    pub best_restart: usize,
    /// Final log-likelihood of every restart (`None` if it failed).
    pub restart_log_likelihoods: Vec<Option<f64>>,
    /// Number of restarts that met the stopping criterion.
    pub n_converged: usize,
}

/// E-step: responsibilities and total log-likelihood.
///
/// Populations whose covariance is not positive definite for a trajectory
/// contribute zero probability.
pub fn e_step(
    trajectories: &[Trajectory],
    blur: &[f64],
    components: &[MixtureComponent],
) -> Result<(ResponsibilityMatrix, f64)> {
    let m = trajectories.len();
    let k = components.len();
    let mut t = DMatrix::zeros(m, k);
    let mut total = 0.0;
    let mut row = vec![0.0; k];

    for (i, (traj, &b)) in trajectories.iter().zip(blur).enumerate() {
        for (j, c) in components.iter().enumerate() {
            row[j] = if c.weight > 0.0 {
                match log_likelihood(traj, b, &c.params) {
                    Ok(ll) => c.weight.ln() + ll,
                    Err(Error::NonPositiveDefinite { .. }) => f64::NEG_INFINITY,
                    Err(e) => return Err(e),
                }
            } else {
                f64::NEG_INFINITY
            };
        }
        let lse = softmax_in_place(&mut row);
        if !lse.is_finite() {
            return Err(Error::Computation(format!(
                "trajectory {i} has zero likelihood under every population"
            )));
        }
        total += lse;
        for (j, &r) in row.iter().enumerate() {
            t[(i, j)] = r.clamp(0.0, 1.0);
        }
    }

    Ok((ResponsibilityMatrix::from_matrix(t), total))
}

fn normalized(components: &[MixtureComponent]) -> Result<Vec<MixtureComponent>> {
    if components.is_empty() {
        return Err(Error::Validation("need at least one population".to_string()));
    }
    for (k, c) in components.iter().enumerate() {
        PopulationParameters::new(c.params.a2, c.params.sigma2)?;
        if !c.weight.is_finite() || c.weight < 0.0 {
            return Err(Error::Validation(format!("weight {k} must be finite and >= 0")));
        }
    }
    let total: f64 = components.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return Err(Error::Validation("mixing weights sum to zero".to_string()));
    }
    Ok(components.iter().map(|c| MixtureComponent { weight: c.weight / total, ..*c }).collect())
}

/// Expectation-Maximization with a fixed number of populations.
#[derive(Debug, Clone, Default)]
pub struct MixtureEm {
    config: EmConfig,
}

impl MixtureEm {
    /// Create an EM driver with the given configuration.
    pub fn new(config: EmConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    /// Run EM from `initial` until the relative log-likelihood gain drops
    /// below `tol` or `max_cycles` M-steps have been taken.
    ///
    /// Returns the best iterate seen, with the full trace.
    pub fn fit(
        &self,
        trajectories: &[Trajectory],
        blur: &[f64],
        initial: &[MixtureComponent],
    ) -> Result<MixtureModel> {
        self.config.validate()?;
        // Shape, blur and length checks.
        PopulationLikelihood::new(trajectories, blur)?;
        let mut components = normalized(initial)?;

        let estimator = DiffusionEstimator::with_config(self.config.optimizer.clone());
        let m = trajectories.len() as f64;

        let (mut resp, mut ll) = e_step(trajectories, blur, &components)?;
        let mut trace = Vec::with_capacity(self.config.max_cycles + 1);
        trace.push(ll);
        let mut best = (components.clone(), resp.clone(), ll);
        let mut converged = false;
        let mut n_iter = 0;

        for cycle in 1..=self.config.max_cycles {
            for (k, component) in components.iter_mut().enumerate() {
                let weights = resp.column(k);
                let size: f64 = weights.iter().sum();
                component.weight = size / m;
                if size < MIN_POPULATION_FRACTION * m {
                    log::debug!("EM cycle {cycle}: population {k} is empty, keeping parameters");
                    continue;
                }
                let init = Some(component.params);
                match estimator.estimate_weighted(trajectories, blur, &weights, init) {
                    Ok(fit) => component.params = fit.parameters,
                    Err(e) => log::warn!(
                        "EM cycle {cycle}: refit of population {k} failed ({e}), keeping parameters"
                    ),
                }
            }

            let (next_resp, next_ll) = e_step(trajectories, blur, &components)?;
            trace.push(next_ll);
            n_iter = cycle;
            if next_ll > best.2 {
                best = (components.clone(), next_resp.clone(), next_ll);
            }

            let rel = (next_ll - ll) / (1.0 + ll.abs());
            log::debug!("EM cycle {cycle}: loglik = {next_ll:.6}, relative gain = {rel:.3e}");
            resp = next_resp;
            ll = next_ll;
            if rel < self.config.tol {
                converged = true;
                break;
            }
        }

        let (components, responsibilities, log_likelihood) = best;
        Ok(MixtureModel {
            components,
            log_likelihood,
            responsibilities,
            loglik_trace: trace,
            converged,
            n_iter,
        })
    }
}

/// Local EM from the given initial components.
pub fn fit_mixture_local(
    trajectories: &[Trajectory],
    blur: &[f64],
    initial: &[MixtureComponent],
    config: &EmConfig,
) -> Result<MixtureModel> {
    MixtureEm::new(config.clone()).fit(trajectories, blur, initial)
}

/// Draw `k` random components: uniform `a²` and `σ²` within the ranges and
/// mixing weights uniform on the simplex.
pub fn random_components<R: Rng>(
    k: usize,
    a2_range: (f64, f64),
    sigma2_range: (f64, f64),
    rng: &mut R,
) -> Vec<MixtureComponent> {
    let draws: Vec<(f64, f64, f64)> = (0..k)
        .map(|_| {
            let a2 = rng.random_range(a2_range.0..=a2_range.1);
            let sigma2 = rng.random_range(sigma2_range.0..=sigma2_range.1);
            let e: f64 = Exp1.sample(rng);
            (a2, sigma2, e)
        })
        .collect();
    let total: f64 = draws.iter().map(|d| d.2).sum();
    draws
        .into_iter()
        .map(|(a2, sigma2, e)| MixtureComponent {
            params: PopulationParameters { a2, sigma2 },
            weight: e / total,
        })
        .collect()
}

/// Multi-start EM with `k` populations.
///
/// Restarts are independent and run in parallel; restart `r` is seeded with
/// `seed + r`. The highest finite log-likelihood wins, ties going to the lowest
/// restart index, so the result does not depend on scheduling. Components of
/// the winner are sorted by ascending `σ²`.
///
/// # Thread pool
/// If `config.n_threads > 0`, a dedicated Rayon pool is used; otherwise the
/// global pool.
pub fn fit_mixture_global(
    k: usize,
    trajectories: &[Trajectory],
    blur: &[f64],
    config: &GlobalEmConfig,
) -> Result<GlobalEmResult> {
    if k == 0 {
        return Err(Error::Validation("k must be > 0".to_string()));
    }
    config.validate()?;
    PopulationLikelihood::new(trajectories, blur)?;

    let em = MixtureEm::new(config.local.clone());
    let run_restart = |r: usize| -> Result<MixtureModel> {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(r as u64));
        let initial = random_components(k, config.a2_range, config.sigma2_range, &mut rng);
        em.fit(trajectories, blur, &initial)
    };
    let run_all =
        || (0..config.n_restarts).into_par_iter().map(run_restart).collect::<Vec<_>>();

    let results = if config.n_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_threads)
            .build()
            .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
        pool.install(run_all)
    } else {
        run_all()
    };

    let mut best: Option<(usize, MixtureModel)> = None;
    let mut first_error = None;
    let mut restart_log_likelihoods = Vec::with_capacity(results.len());
    let mut n_converged = 0;
    for (r, result) in results.into_iter().enumerate() {
        match result {
            Ok(model) => {
                restart_log_likelihoods.push(Some(model.log_likelihood));
                n_converged += usize::from(model.converged);
                let better = model.log_likelihood.is_finite()
                    && best.as_ref().map_or(true, |(_, b)| model.log_likelihood > b.log_likelihood);
                if better {
                    best = Some((r, model));
                }
            }
            Err(e) => {
                log::warn!("EM restart {r} failed: {e}");
                restart_log_likelihoods.push(None);
                first_error.get_or_insert(e);
            }
        }
    }

    let (best_restart, mut model) = match (best, first_error) {
        (Some(b), _) => b,
        (None, Some(e)) => return Err(e),
        (None, None) => {
            return Err(Error::Computation("no restart reached a finite log-likelihood".to_string()))
        }
    };
    log::debug!(
        "global EM: best restart {best_restart} (loglik = {:.6}), {n_converged}/{} converged",
        model.log_likelihood,
        config.n_restarts
    );

    let mut order: Vec<usize> = (0..k).collect();
    let sigma2: Vec<f64> = model.components.iter().map(|c| c.params.sigma2).collect();
    order.sort_by(|&a, &b| sigma2[a].total_cmp(&sigma2[b]));
    model.components = order.iter().map(|&j| model.components[j]).collect();
    model.responsibilities = model.responsibilities.permute_columns(&order)?;

    Ok(GlobalEmResult { best: model, best_restart, restart_log_likelihoods, n_converged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mle::estimate;
    use crate::toys::{simulate_mixture, simulate_population};
    use approx::assert_relative_eq;

    fn component(a2: f64, sigma2: f64, weight: f64) -> MixtureComponent {
        MixtureComponent { params: PopulationParameters::new(a2, sigma2).unwrap(), weight }
    }

    #[test]
    fn test_single_population_matches_mle() {
        let p = PopulationParameters::new(0.05, 0.8).unwrap();
        let blur = 1.0 / 6.0;
        let ts = simulate_population(60, 20, 2, &p, blur, 8).unwrap();
        let bs = vec![blur; ts.len()];

        let fit = estimate(&ts, &bs).unwrap();
        let model =
            fit_mixture_local(&ts, &bs, &[component(0.2, 2.0, 1.0)], &EmConfig::default()).unwrap();

        assert!(model.converged);
        assert_relative_eq!(model.components[0].weight, 1.0, epsilon = 1e-12);
        assert_relative_eq!(model.components[0].params.a2, fit.parameters.a2, max_relative = 1e-3);
        assert_relative_eq!(
            model.components[0].params.sigma2,
            fit.parameters.sigma2,
            max_relative = 1e-3
        );
        assert_relative_eq!(model.log_likelihood, fit.log_likelihood, max_relative = 1e-6);
        assert!(model.responsibilities.as_matrix().iter().all(|&t| t == 1.0));
    }

    #[test]
    fn test_trace_and_responsibilities() {
        let pops = [
            PopulationParameters::new(0.01, 0.2).unwrap(),
            PopulationParameters::new(0.01, 3.0).unwrap(),
        ];
        let toys = simulate_mixture(&pops, &[80, 120], 15, 2, 0.1, 3).unwrap();
        let bs = vec![0.1; toys.trajectories.len()];
        let init = [component(0.05, 0.5, 0.5), component(0.05, 1.5, 0.5)];

        let model =
            fit_mixture_local(&toys.trajectories, &bs, &init, &EmConfig::default()).unwrap();

        assert_eq!(model.loglik_trace.len(), model.n_iter + 1);
        assert!(model.loglik_trace.iter().all(|ll| ll.is_finite()));
        assert!(model.loglik_trace.iter().all(|&ll| ll <= model.log_likelihood));
        for i in 0..toys.trajectories.len() {
            let row = model.responsibilities.row(i);
            assert_relative_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
        let w: f64 = model.components.iter().map(|c| c.weight).sum();
        assert_relative_eq!(w, 1.0, epsilon = 1e-9);
        assert_relative_eq!(model.components[1].weight, 0.6, epsilon = 0.08);
    }

    #[test]
    fn test_max_cycles_reached_is_not_an_error() {
        let p = PopulationParameters::new(0.05, 1.0).unwrap();
        let ts = simulate_population(30, 10, 1, &p, 0.0, 4).unwrap();
        let bs = vec![0.0; ts.len()];
        let config = EmConfig { max_cycles: 1, tol: 0.0, ..EmConfig::default() };
        let init = [component(0.1, 0.3, 0.5), component(0.1, 3.0, 0.5)];

        let model = fit_mixture_local(&ts, &bs, &init, &config).unwrap();
        assert!(!model.converged);
        assert_eq!(model.n_iter, 1);
        assert_eq!(model.loglik_trace.len(), 2);
    }

    #[test]
    fn test_invalid_configuration() {
        let p = PopulationParameters::new(0.05, 1.0).unwrap();
        let ts = simulate_population(5, 10, 1, &p, 0.0, 4).unwrap();
        let bs = vec![0.0; ts.len()];
        let init = [component(0.1, 1.0, 1.0)];

        let zero = EmConfig { max_cycles: 0, ..EmConfig::default() };
        assert!(matches!(fit_mixture_local(&ts, &bs, &init, &zero), Err(Error::Validation(_))));
        assert!(fit_mixture_local(&ts, &bs, &[], &EmConfig::default()).is_err());
        assert!(fit_mixture_local(&ts, &bs, &[component(0.1, 1.0, 0.0)], &EmConfig::default())
            .is_err());

        let bad_range = GlobalEmConfig::new((0.0, 0.1), (0.0, 1.0));
        assert!(matches!(fit_mixture_global(2, &ts, &bs, &bad_range), Err(Error::Validation(_))));
        let ok = GlobalEmConfig::new((0.0, 0.1), (0.1, 1.0));
        assert!(matches!(fit_mixture_global(0, &ts, &bs, &ok), Err(Error::Validation(_))));
    }

    #[test]
    fn test_global_config_defaults() {
        let config = GlobalEmConfig::new((0.0, 0.1), (0.5, 2.0));
        assert_eq!(config.n_restarts, 20);
        assert_eq!(config.seed, 42);
        assert_eq!(config.n_threads, 0);
        assert_eq!(config.a2_range, (0.0, 0.1));
        assert_eq!(config.sigma2_range, (0.5, 2.0));
        assert_eq!(config.local.max_cycles, 200);
        assert_eq!(config.local.tol, 1e-8);

        let optimizer = &config.local.optimizer;
        assert_eq!(optimizer.max_iter, 1000);
        assert_eq!(optimizer.tol, 1e-6);
        assert_eq!(optimizer.m, 10);
        assert!(optimizer.nelder_mead_fallback);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = GlobalEmConfig {
            n_restarts: 3,
            seed: 7,
            ..GlobalEmConfig::new((0.0, 0.1), (0.5, 2.0))
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: GlobalEmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_restarts, 3);
        assert_eq!(back.seed, 7);
        assert_eq!(back.sigma2_range, (0.5, 2.0));
        assert_eq!(back.local.max_cycles, EmConfig::default().max_cycles);
    }

    #[test]
    fn test_random_components_on_simplex() {
        let mut rng = StdRng::seed_from_u64(1);
        let cs = random_components(4, (0.0, 0.1), (0.5, 2.0), &mut rng);
        assert_eq!(cs.len(), 4);
        assert_relative_eq!(cs.iter().map(|c| c.weight).sum::<f64>(), 1.0, epsilon = 1e-12);
        for c in &cs {
            assert!((0.0..=0.1).contains(&c.params.a2));
            assert!((0.5..=2.0).contains(&c.params.sigma2));
        }
    }

    #[test]
    fn test_global_em_is_deterministic_and_ordered() {
        let pops = [
            PopulationParameters::new(0.02, 4.0).unwrap(),
            PopulationParameters::new(0.02, 0.2).unwrap(),
        ];
        let toys = simulate_mixture(&pops, &[60, 60], 12, 2, 0.0, 12).unwrap();
        let bs = vec![0.0; toys.trajectories.len()];
        let config =
            GlobalEmConfig { n_restarts: 6, ..GlobalEmConfig::new((0.0, 0.1), (0.1, 5.0)) };
        let pooled = GlobalEmConfig { n_threads: 2, ..config.clone() };

        let a = fit_mixture_global(2, &toys.trajectories, &bs, &config).unwrap();
        let b = fit_mixture_global(2, &toys.trajectories, &bs, &pooled).unwrap();

        assert_eq!(a.best_restart, b.best_restart);
        assert_eq!(a.best.log_likelihood, b.best.log_likelihood);
        assert_eq!(a.restart_log_likelihoods.len(), 6);
        assert!(a.best.components[0].params.sigma2 <= a.best.components[1].params.sigma2);

        // Columns follow the components: slow trajectories sit in column 0.
        let slow = toys.labels.iter().position(|&l| l == 1).unwrap();
        assert!(a.best.responsibilities.get(slow, 0) > 0.5);
    }
}
