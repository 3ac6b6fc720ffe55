//! # spt-inference
//!
//! Statistical inference for single-particle tracking.
//!
//! This crate provides:
//! - Maximum Likelihood Estimation of `(a², σ²)` with observed-information errors
//! - Mixture EM with parallel multi-start
//! - Quality factors and the Kuiper goodness-of-fit statistic
//! - Hard partition of a collection by population
//! - Toy trajectory generation

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Mixture EM: local fits and parallel multi-start.
pub mod em;
/// Quality factors and Kuiper statistic.
pub mod gof;
/// Maximum-likelihood estimation via L-BFGS.
pub mod mle;
/// Bounded numerical optimizer (argmin backend).
pub mod optimizer;
/// Hard partition by most probable population.
pub mod partition;
/// Membership probability matrix.
pub mod responsibilities;
/// Toy trajectory generation.
pub mod toys;

pub use em::{
    EmConfig, GlobalEmConfig, GlobalEmResult, MixtureComponent, MixtureEm, MixtureModel, e_step,
    fit_mixture_global, fit_mixture_local, random_components,
};
pub use gof::{
    KuiperResult, QualityFactor, QualityWeighting, kuiper_p_value, kuiper_statistic, quality_factor,
    quality_factors, quality_factors_single,
};
pub use mle::{
    DiffusionEstimator, covariance_estimate, estimate, estimate_errors, observed_information,
};
pub use optimizer::{BoundedOptimizer, OptimizationResult, OptimizerConfig, Solver};
pub use partition::{PopulationSubset, estimate_population_errors, partition};
pub use responsibilities::ResponsibilityMatrix;
pub use toys::{MixtureToys, simulate_mixture, simulate_population, simulate_trajectory};
