//! # spt-core
//!
//! Shared data model and error type for single-particle tracking inference:
//! trajectories, population parameters, fit results and the likelihood trait
//! the optimizers are written against.

#![warn(missing_docs)]

/// Error type and `Result` alias.
pub mod error;
/// Likelihood trait used by the optimizers.
pub mod traits;
/// Trajectories, parameters and fit results.
pub mod types;

pub use error::{Error, Result};
pub use traits::NegLogLikelihood;
pub use types::{
    CONTINUOUS_ILLUMINATION_BLUR, FitResult, MAX_BLUR, ParameterErrors, PopulationParameters,
    Trajectory, validate_blur,
};
