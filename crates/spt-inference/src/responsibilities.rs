//! Posterior population membership probabilities.

use nalgebra::DMatrix;
use spt_core::{Error, Result};

/// Tolerance on row sums when validating user-supplied responsibilities.
const ROW_SUM_TOL: f64 = 1e-6;

/// `M × K` matrix of membership probabilities; row `i` sums to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsibilityMatrix {
    values: DMatrix<f64>,
}

impl ResponsibilityMatrix {
    /// Wrap a matrix produced by the E-step.
    pub(crate) fn from_matrix(values: DMatrix<f64>) -> Self {
        Self { values }
    }

    /// Build from one row per trajectory, validating shape and normalization.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let k = rows.first().map_or(0, Vec::len);
        if rows.is_empty() || k == 0 {
            return Err(Error::Validation("responsibility matrix must be non-empty".to_string()));
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != k {
                return Err(Error::Validation(format!(
                    "row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    k
                )));
            }
            if row.iter().any(|&t| !t.is_finite() || !(0.0..=1.0).contains(&t)) {
                return Err(Error::Validation(format!("row {i} has entries outside [0, 1]")));
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOL {
                return Err(Error::Validation(format!("row {i} sums to {sum}, expected 1")));
            }
        }
        Ok(Self { values: DMatrix::from_fn(rows.len(), k, |i, j| rows[i][j]) })
    }

    /// Number of trajectories `M`.
    pub fn n_trajectories(&self) -> usize {
        self.values.nrows()
    }

    /// Number of populations `K`.
    pub fn n_populations(&self) -> usize {
        self.values.ncols()
    }

    /// `T[i, k]`.
    pub fn get(&self, i: usize, k: usize) -> f64 {
        self.values[(i, k)]
    }

    /// Membership probabilities of trajectory `i`.
    pub fn row(&self, i: usize) -> Vec<f64> {
        self.values.row(i).iter().copied().collect()
    }

    /// Weights of population `k` over all trajectories.
    pub fn column(&self, k: usize) -> Vec<f64> {
        self.values.column(k).iter().copied().collect()
    }

    /// Expected number of trajectories per population.
    pub fn column_sums(&self) -> Vec<f64> {
        self.values.column_iter().map(|c| c.sum()).collect()
    }

    /// Most probable population of trajectory `i`; ties go to the lowest index.
    pub fn argmax(&self, i: usize) -> usize {
        let mut best = 0;
        for k in 1..self.n_populations() {
            if self.values[(i, k)] > self.values[(i, best)] {
                best = k;
            }
        }
        best
    }

    /// [`argmax`](Self::argmax) of every row.
    pub fn hard_assignments(&self) -> Vec<usize> {
        (0..self.n_trajectories()).map(|i| self.argmax(i)).collect()
    }

    /// Reorder columns so that new column `j` is old column `order[j]`.
    pub fn permute_columns(&self, order: &[usize]) -> Result<Self> {
        let k = self.n_populations();
        let mut seen = vec![false; k];
        let invalid = order.len() != k
            || order.iter().any(|&j| j >= k || std::mem::replace(&mut seen[j], true));
        if invalid {
            return Err(Error::Validation(format!("{order:?} is not a permutation of 0..{k}")));
        }
        Ok(Self { values: self.values.select_columns(order) })
    }

    /// Underlying `M × K` matrix.
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.values
    }
}
