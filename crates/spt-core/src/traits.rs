//! Core traits for spt
//!
//! The bounded optimizer and the observed-information computation are written
//! against [`NegLogLikelihood`] rather than a concrete population likelihood,
//! so the scaled MLE objective and the raw likelihood share one fitting path.

use crate::Result;

/// Differentiable negative log-likelihood over a fixed-size parameter vector.
pub trait NegLogLikelihood: Send + Sync {
    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Parameter bounds (min, max)
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Negative log-likelihood at `params`
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of the negative log-likelihood
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>>;
}
