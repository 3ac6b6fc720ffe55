//! Common data types for spt

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest admissible motion-blur coefficient.
pub const MAX_BLUR: f64 = 0.25;

/// Blur coefficient of a shutter that stays open for the whole frame.
pub const CONTINUOUS_ILLUMINATION_BLUR: f64 = 1.0 / 6.0;

/// Check that a blur coefficient lies in `[0, 1/4]`.
pub fn validate_blur(blur: f64) -> Result<f64> {
    if !blur.is_finite() || !(0.0..=MAX_BLUR).contains(&blur) {
        return Err(Error::Validation(format!(
            "blur coefficient must be in [0, {MAX_BLUR}], got {blur}"
        )));
    }
    Ok(blur)
}

/// Positions of one particle sampled at a fixed frame interval.
///
/// Coordinates are stored row-major: position `i` occupies
/// `coords[i * dim..(i + 1) * dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    dim: usize,
    coords: Vec<f64>,
}

impl Trajectory {
    /// Build a trajectory from a flat row-major coordinate buffer.
    pub fn new(dim: usize, coords: Vec<f64>) -> Result<Self> {
        if dim == 0 {
            return Err(Error::Validation("trajectory dimension must be > 0".to_string()));
        }
        if coords.len() % dim != 0 {
            return Err(Error::Validation(format!(
                "coordinate buffer length {} is not a multiple of dimension {}",
                coords.len(),
                dim
            )));
        }
        if let Some(pos) = coords.iter().position(|x| !x.is_finite()) {
            return Err(Error::Validation(format!(
                "non-finite coordinate at position {}",
                pos / dim
            )));
        }
        Ok(Self { dim, coords })
    }

    /// Build a one-dimensional trajectory.
    pub fn from_1d(xs: Vec<f64>) -> Result<Self> {
        Self::new(1, xs)
    }

    /// Build a trajectory from one slice per position.
    pub fn from_positions<P: AsRef<[f64]>>(positions: &[P]) -> Result<Self> {
        let dim = positions.first().map(|p| p.as_ref().len()).unwrap_or(1);
        let mut coords = Vec::with_capacity(positions.len() * dim);
        for (i, p) in positions.iter().enumerate() {
            let p = p.as_ref();
            if p.len() != dim {
                return Err(Error::Validation(format!(
                    "position {} has dimension {}, expected {}",
                    i,
                    p.len(),
                    dim
                )));
            }
            coords.extend_from_slice(p);
        }
        Self::new(dim, coords)
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of recorded positions `N`.
    pub fn len(&self) -> usize {
        self.coords.len() / self.dim
    }

    /// `true` if no positions were recorded.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Number of displacements `N - 1` (zero for an empty trajectory).
    pub fn n_displacements(&self) -> usize {
        self.len().saturating_sub(1)
    }

    /// Coordinates of position `i`.
    pub fn position(&self, i: usize) -> &[f64] {
        &self.coords[i * self.dim..(i + 1) * self.dim]
    }

    /// Raw row-major coordinates.
    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    /// Displacements along one axis, `x_{i+1} - x_i`.
    pub fn displacements(&self, axis: usize) -> impl Iterator<Item = f64> + '_ {
        let dim = self.dim;
        self.coords
            .chunks_exact(dim)
            .zip(self.coords.chunks_exact(dim).skip(1))
            .map(move |(a, b)| b[axis] - a[axis])
    }
}

/// Parameters of one diffusive population.
///
/// `a2` is the localization variance and `sigma2` the diffusive variance per
/// step and axis (`2 D Δt`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopulationParameters {
    /// Squared localization uncertainty `a²`.
    pub a2: f64,
    /// Diffusive step variance `σ²`.
    pub sigma2: f64,
}

impl PopulationParameters {
    /// Create validated parameters (`a² >= 0`, `σ² > 0`, both finite).
    pub fn new(a2: f64, sigma2: f64) -> Result<Self> {
        if !a2.is_finite() || a2 < 0.0 {
            return Err(Error::Validation(format!("a2 must be finite and >= 0, got {a2}")));
        }
        if !sigma2.is_finite() || sigma2 <= 0.0 {
            return Err(Error::Validation(format!(
                "sigma2 must be finite and > 0, got {sigma2}"
            )));
        }
        Ok(Self { a2, sigma2 })
    }

    /// Parameters as a `[a², σ²]` vector.
    pub fn to_array(self) -> [f64; 2] {
        [self.a2, self.sigma2]
    }
}

/// Maximum-likelihood fit of a single population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameters
    pub parameters: PopulationParameters,

    /// (Weighted) total log-likelihood at the optimum
    pub log_likelihood: f64,

    /// Convergence status of the optimizer
    pub converged: bool,

    /// Number of optimizer iterations
    pub n_iter: usize,

    /// Number of objective evaluations
    pub n_fev: usize,

    /// Number of gradient evaluations
    pub n_gev: usize,

    /// Solver termination message
    pub message: String,
}

/// Standard errors of `(a², σ²)` from the observed information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterErrors {
    /// Standard error of `a²`.
    pub a2: f64,
    /// Standard error of `σ²`.
    pub sigma2: f64,
    /// Parameter covariance, ordered `[a², σ²]`.
    pub covariance: [[f64; 2]; 2],
}

impl ParameterErrors {
    /// Build from a 2×2 covariance matrix.
    ///
    /// Returns `None` if a variance is not finite and positive.
    pub fn from_covariance(covariance: [[f64; 2]; 2]) -> Option<Self> {
        let (v0, v1) = (covariance[0][0], covariance[1][1]);
        if !(v0.is_finite() && v0 > 0.0 && v1.is_finite() && v1 > 0.0) {
            return None;
        }
        Some(Self { a2: v0.sqrt(), sigma2: v1.sqrt(), covariance })
    }

    /// Correlation between `a²` and `σ²`.
    pub fn correlation(&self) -> f64 {
        self.covariance[0][1] / (self.a2 * self.sigma2)
    }
}
