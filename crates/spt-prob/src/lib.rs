//! Probability building blocks for spt.
//!
//! - the blur-corrected displacement covariance of a diffusing particle
//! - O(N) log-likelihood, gradient and whitening of trajectories
//! - the summed (optionally weighted) population likelihood
//! - small numeric helpers (stable log-sum-exp)

pub mod covariance;
pub mod likelihood;
pub mod math;
pub mod population;

pub use covariance::{DisplacementCovariance, LdlStep, Pivots};
pub use likelihood::{Whitened, log_likelihood, log_likelihood_with_gradient, whiten};
pub use population::PopulationLikelihood;
