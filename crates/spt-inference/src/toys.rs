//! Toy trajectory generation.
//!
//! Displacements are drawn exactly from the blurred, noisy covariance via its
//! LDLᵀ factors: `y_i ~ N(0, D_i)` and `Δ_i = y_i + l_i y_{i-1}`. Positions
//! are the cumulative sum from a random origin.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use spt_core::{Error, PopulationParameters, Result, Trajectory};
use spt_prob::DisplacementCovariance;

/// Mixture toys together with the generating population of each trajectory.
#[derive(Debug, Clone)]
pub struct MixtureToys {
    /// Simulated trajectories, populations interleaved at random.
    pub trajectories: Vec<Trajectory>,
    /// Index of the population each trajectory was drawn from.
    pub labels: Vec<usize>,
}

fn sample_trajectory<R: Rng>(
    cov: &DisplacementCovariance,
    dim: usize,
    rng: &mut R,
) -> Result<Trajectory> {
    let n = cov.n_displacements() + 1;
    let mut coords: Vec<f64> = Vec::with_capacity(n * dim);
    for _ in 0..dim {
        let origin: f64 = StandardNormal.sample(rng);
        coords.push(10.0 * origin);
    }

    // One independent displacement sequence per axis.
    let mut steps = vec![0.0; cov.n_displacements() * dim];
    for axis in 0..dim {
        let mut y_prev = 0.0;
        for (i, step) in cov.pivots().enumerate() {
            let normal = Normal::new(0.0, step.pivot.sqrt())
                .map_err(|e| Error::Computation(format!("invalid pivot {}: {e}", step.pivot)))?;
            let y = normal.sample(rng);
            steps[i * dim + axis] = y + step.multiplier * y_prev;
            y_prev = y;
        }
    }

    for i in 0..cov.n_displacements() {
        for axis in 0..dim {
            let prev = coords[i * dim + axis];
            coords.push(prev + steps[i * dim + axis]);
        }
    }
    Trajectory::new(dim, coords)
}

/// Simulate one trajectory of `n_positions` positions in `dim` dimensions.
pub fn simulate_trajectory(
    n_positions: usize,
    dim: usize,
    params: &PopulationParameters,
    blur: f64,
    seed: u64,
) -> Result<Trajectory> {
    let cov = DisplacementCovariance::new(n_positions, params, blur)?;
    let mut rng = StdRng::seed_from_u64(seed);
    sample_trajectory(&cov, dim, &mut rng)
}

/// Simulate `n_trajectories` trajectories of a single population.
///
/// Sampling is deterministic for a given `seed`.
pub fn simulate_population(
    n_trajectories: usize,
    n_positions: usize,
    dim: usize,
    params: &PopulationParameters,
    blur: f64,
    seed: u64,
) -> Result<Vec<Trajectory>> {
    if dim == 0 {
        return Err(Error::Validation("dim must be > 0".to_string()));
    }
    let cov = DisplacementCovariance::new(n_positions, params, blur)?;
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_trajectories).map(|_| sample_trajectory(&cov, dim, &mut rng)).collect()
}

/// Simulate a mixture with `counts[k]` trajectories from `populations[k]`.
///
/// Trajectories are shuffled so labels are not contiguous.
pub fn simulate_mixture(
    populations: &[PopulationParameters],
    counts: &[usize],
    n_positions: usize,
    dim: usize,
    blur: f64,
    seed: u64,
) -> Result<MixtureToys> {
    if populations.len() != counts.len() {
        return Err(Error::Validation(format!(
            "{} populations but {} counts",
            populations.len(),
            counts.len()
        )));
    }
    if dim == 0 {
        return Err(Error::Validation("dim must be > 0".to_string()));
    }

    let covs = populations
        .iter()
        .map(|p| DisplacementCovariance::new(n_positions, p, blur))
        .collect::<Result<Vec<_>>>()?;

    let mut labels: Vec<usize> =
        counts.iter().enumerate().flat_map(|(k, &c)| std::iter::repeat(k).take(c)).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    labels.shuffle(&mut rng);

    let trajectories = labels
        .iter()
        .map(|&k| sample_trajectory(&covs[k], dim, &mut rng))
        .collect::<Result<Vec<_>>>()?;
    Ok(MixtureToys { trajectories, labels })
}
