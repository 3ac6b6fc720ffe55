//! Gaussian log-likelihood of a trajectory's displacements.
//!
//! Every axis is an independent realization of the same tridiagonal
//! covariance, so the quadratic form is summed over axes and the
//! log-determinant is counted once per axis. All evaluations are O(N·d) via
//! the LDLᵀ recurrence of [`DisplacementCovariance::pivots`].

use crate::covariance::DisplacementCovariance;
use crate::math::LN_2PI;
use spt_core::{Error, PopulationParameters, Result, Trajectory};

/// Whitened displacement statistics of one trajectory under one covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Whitened {
    /// Mahalanobis quadratic form `Σ_axes Δxᵀ Σ⁻¹ Δx`.
    pub quadratic_form: f64,
    /// `ln det Σ` of a single axis.
    pub log_det: f64,
    /// Number of displacements per axis.
    pub n_displacements: usize,
    /// Spatial dimension.
    pub dim: usize,
}

impl Whitened {
    /// Degrees of freedom of the quadratic form, `d (N - 1)`.
    pub fn degrees_of_freedom(&self) -> usize {
        self.dim * self.n_displacements
    }

    /// Log-likelihood `-½ [d(N-1) ln 2π + d ln det Σ + Q]`.
    pub fn log_likelihood(&self) -> f64 {
        let dof = self.degrees_of_freedom() as f64;
        -0.5 * (dof * LN_2PI + self.dim as f64 * self.log_det + self.quadratic_form)
    }
}

fn check_pivot(pivot: f64, index: usize) -> Result<()> {
    if pivot.is_finite() && pivot > 0.0 {
        Ok(())
    } else {
        Err(Error::NonPositiveDefinite { pivot, index })
    }
}

fn check_sizes(cov: &DisplacementCovariance, trajectory: &Trajectory) -> Result<()> {
    if cov.n_displacements() != trajectory.n_displacements() {
        return Err(Error::Validation(format!(
            "covariance has {} displacements, trajectory has {}",
            cov.n_displacements(),
            trajectory.n_displacements()
        )));
    }
    Ok(())
}

/// Whiten the displacements of `trajectory` with `cov`.
pub fn whiten(cov: &DisplacementCovariance, trajectory: &Trajectory) -> Result<Whitened> {
    check_sizes(cov, trajectory)?;

    let mut log_det = 0.0;
    for (i, step) in cov.pivots().enumerate() {
        check_pivot(step.pivot, i)?;
        log_det += step.pivot.ln();
    }

    let mut quadratic_form = 0.0;
    for axis in 0..trajectory.dim() {
        let mut z_prev = 0.0;
        for (step, dx) in cov.pivots().zip(trajectory.displacements(axis)) {
            let z = dx - step.multiplier * z_prev;
            quadratic_form += z * z / step.pivot;
            z_prev = z;
        }
    }

    Ok(Whitened {
        quadratic_form,
        log_det,
        n_displacements: cov.n_displacements(),
        dim: trajectory.dim(),
    })
}

/// Log-likelihood of one trajectory.
pub fn log_likelihood(
    trajectory: &Trajectory,
    blur: f64,
    params: &PopulationParameters,
) -> Result<f64> {
    let cov = DisplacementCovariance::new(trajectory.len(), params, blur)?;
    Ok(whiten(&cov, trajectory)?.log_likelihood())
}

/// Log-likelihood and its gradient with respect to `(a², σ²)`.
///
/// The gradient is exact: the LDLᵀ recurrence is differentiated in forward
/// mode alongside the whitening pass.
pub fn log_likelihood_with_gradient(
    trajectory: &Trajectory,
    blur: f64,
    params: &PopulationParameters,
) -> Result<(f64, [f64; 2])> {
    let cov = DisplacementCovariance::new(trajectory.len(), params, blur)?;
    let jac = cov.jacobian();
    let (diag, off) = (cov.diagonal(), cov.off_diagonal());
    let dim = trajectory.dim();

    // Per-axis whitening state: z_{i-1} and its tangents.
    let mut z_prev = vec![0.0; dim];
    let mut dz_prev = vec![[0.0; 2]; dim];
    let mut axes: Vec<_> = (0..dim).map(|axis| trajectory.displacements(axis)).collect();

    let mut log_det = 0.0;
    let mut d_log_det = [0.0; 2];
    let mut q = 0.0;
    let mut dq = [0.0; 2];

    let mut prev: Option<(f64, [f64; 2])> = None;
    for i in 0..cov.n_displacements() {
        let (l, dl, pivot, d_pivot) = match prev {
            None => (0.0, [0.0; 2], diag, [jac[0][0], jac[0][1]]),
            Some((d_prev, dd_prev)) => {
                let l = off / d_prev;
                let mut dl = [0.0; 2];
                let mut d_pivot = [0.0; 2];
                for j in 0..2 {
                    dl[j] = (jac[1][j] * d_prev - off * dd_prev[j]) / (d_prev * d_prev);
                    d_pivot[j] = jac[0][j] - (dl[j] * off + l * jac[1][j]);
                }
                (l, dl, diag - l * off, d_pivot)
            }
        };
        check_pivot(pivot, i)?;

        log_det += pivot.ln();
        for j in 0..2 {
            d_log_det[j] += d_pivot[j] / pivot;
        }

        for (axis, it) in axes.iter_mut().enumerate() {
            let dx = it.next().ok_or_else(|| {
                Error::Computation("displacement iterator ended early".to_string())
            })?;
            let z = dx - l * z_prev[axis];
            q += z * z / pivot;
            let mut dz = [0.0; 2];
            for j in 0..2 {
                dz[j] = -dl[j] * z_prev[axis] - l * dz_prev[axis][j];
                dq[j] += 2.0 * z * dz[j] / pivot - z * z * d_pivot[j] / (pivot * pivot);
            }
            z_prev[axis] = z;
            dz_prev[axis] = dz;
        }

        prev = Some((pivot, d_pivot));
    }

    let n = cov.n_displacements();
    let ll = Whitened { quadratic_form: q, log_det, n_displacements: n, dim }.log_likelihood();
    let d = dim as f64;
    let grad = [-0.5 * (d * d_log_det[0] + dq[0]), -0.5 * (d * d_log_det[1] + dq[1])];
    Ok((ll, grad))
}
