//! Error types for spt

use thiserror::Error;

/// spt error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed arguments (length mismatch, out-of-range blur, bad config)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Input that carries no information for the requested fit
    /// (fewer than 2 positions, all-zero weights, zero motion)
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    /// Displacement covariance failed to factorize at the given parameters
    #[error("Covariance is not positive definite (pivot {pivot:e} at displacement {index})")]
    NonPositiveDefinite {
        /// Offending LDLᵀ pivot.
        pivot: f64,
        /// Displacement index at which the pivot appeared.
        index: usize,
    },

    /// Observed information cannot be inverted; the fit is not identifiable
    #[error("Singular information matrix: {0}")]
    SingularInformation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
