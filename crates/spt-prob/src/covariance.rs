//! Displacement covariance of a blurred, noisy diffusive trajectory.
//!
//! For displacements `Δx_i = x_{i+1} - x_i` along one axis the covariance is
//! symmetric tridiagonal Toeplitz:
//!
//! - `Σ_ii     = σ²(1 - 2B) + 2a²`
//! - `Σ_i,i+1  = Bσ² - a²`
//!
//! Only the two distinct values and the size are stored, so construction is
//! O(1) and factorization is O(N) (see [`Pivots`]).

use nalgebra::DMatrix;
use spt_core::{Error, PopulationParameters, Result, validate_blur};

/// Tridiagonal covariance of the `N - 1` displacements of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplacementCovariance {
    n: usize,
    diagonal: f64,
    off_diagonal: f64,
    blur: f64,
}

impl DisplacementCovariance {
    /// Covariance for a trajectory of `n_positions` positions.
    pub fn new(n_positions: usize, params: &PopulationParameters, blur: f64) -> Result<Self> {
        if n_positions < 2 {
            return Err(Error::DegenerateInput(format!(
                "trajectory needs at least 2 positions, got {n_positions}"
            )));
        }
        let blur = validate_blur(blur)?;
        Ok(Self::from_values(n_positions - 1, params.a2, params.sigma2, blur))
    }

    /// Unchecked constructor over the number of displacements.
    pub(crate) fn from_values(n: usize, a2: f64, sigma2: f64, blur: f64) -> Self {
        Self {
            n,
            diagonal: sigma2 * (1.0 - 2.0 * blur) + 2.0 * a2,
            off_diagonal: blur * sigma2 - a2,
            blur,
        }
    }

    /// Matrix size `N - 1`.
    pub fn n_displacements(&self) -> usize {
        self.n
    }

    /// Variance of a single displacement.
    pub fn diagonal(&self) -> f64 {
        self.diagonal
    }

    /// Covariance of adjacent displacements.
    pub fn off_diagonal(&self) -> f64 {
        self.off_diagonal
    }

    /// Blur coefficient the matrix was built with.
    pub fn blur(&self) -> f64 {
        self.blur
    }

    /// Partial derivatives of `(diagonal, off_diagonal)` with respect to `(a², σ²)`.
    ///
    /// Row 0 is the diagonal, row 1 the off-diagonal.
    pub fn jacobian(&self) -> [[f64; 2]; 2] {
        jacobian(self.blur)
    }

    /// Smallest eigenvalue, `diag - 2|off| cos(π / N)`.
    pub fn min_eigenvalue(&self) -> f64 {
        if self.n == 1 {
            return self.diagonal;
        }
        let c = (std::f64::consts::PI / (self.n as f64 + 1.0)).cos();
        self.diagonal - 2.0 * self.off_diagonal.abs() * c
    }

    /// LDLᵀ pivots, computed lazily.
    pub fn pivots(&self) -> Pivots {
        Pivots {
            diagonal: self.diagonal,
            off_diagonal: self.off_diagonal,
            prev: None,
            remaining: self.n,
        }
    }

    /// Dense matrix, for verification and small-N diagnostics.
    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.n, self.n, |i, j| {
            if i == j {
                self.diagonal
            } else if i.abs_diff(j) == 1 {
                self.off_diagonal
            } else {
                0.0
            }
        })
    }
}

pub(crate) fn jacobian(blur: f64) -> [[f64; 2]; 2] {
    [[2.0, 1.0 - 2.0 * blur], [-1.0, blur]]
}

/// One step of the LDLᵀ factorization `Σ = L D Lᵀ` with unit lower-bidiagonal `L`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LdlStep {
    /// Sub-diagonal entry `l_i` of `L` (zero for the first row).
    pub multiplier: f64,
    /// Pivot `D_i`.
    pub pivot: f64,
}

/// Iterator over the LDLᵀ steps of a [`DisplacementCovariance`].
///
/// `D_1 = diag`, `l_i = off / D_{i-1}`, `D_i = diag - l_i off`.
#[derive(Debug, Clone)]
pub struct Pivots {
    diagonal: f64,
    off_diagonal: f64,
    prev: Option<f64>,
    remaining: usize,
}

impl Iterator for Pivots {
    type Item = LdlStep;

    fn next(&mut self) -> Option<LdlStep> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let step = match self.prev {
            None => LdlStep { multiplier: 0.0, pivot: self.diagonal },
            Some(d_prev) => {
                let l = self.off_diagonal / d_prev;
                LdlStep { multiplier: l, pivot: self.diagonal - l * self.off_diagonal }
            }
        };
        self.prev = Some(step.pivot);
        Some(step)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Pivots {}
