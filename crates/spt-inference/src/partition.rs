//! Hard partition of a collection by most probable population.

use crate::em::MixtureModel;
use crate::mle::DiffusionEstimator;
use crate::responsibilities::ResponsibilityMatrix;
use spt_core::{Error, ParameterErrors, Result, Trajectory};

/// Trajectories assigned to one population.
#[derive(Debug, Clone)]
pub struct PopulationSubset {
    /// Population index.
    pub population: usize,
    /// Indices into the original collection, ascending.
    pub indices: Vec<usize>,
    /// The assigned trajectories.
    pub trajectories: Vec<Trajectory>,
    /// Their blur coefficients.
    pub blur: Vec<f64>,
}

impl PopulationSubset {
    /// Number of assigned trajectories.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether no trajectory was assigned.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Split the collection into `K` disjoint subsets by `argmax_k T[i, k]`
/// (ties to the lowest index). Subset sizes sum to `M`.
pub fn partition(
    responsibilities: &ResponsibilityMatrix,
    trajectories: &[Trajectory],
    blur: &[f64],
) -> Result<Vec<PopulationSubset>> {
    if trajectories.len() != blur.len() || responsibilities.n_trajectories() != trajectories.len() {
        return Err(Error::Validation(format!(
            "{} responsibility rows, {} trajectories, {} blur coefficients",
            responsibilities.n_trajectories(),
            trajectories.len(),
            blur.len()
        )));
    }

    let mut subsets: Vec<PopulationSubset> = (0..responsibilities.n_populations())
        .map(|population| PopulationSubset {
            population,
            indices: Vec::new(),
            trajectories: Vec::new(),
            blur: Vec::new(),
        })
        .collect();

    for (i, k) in responsibilities.hard_assignments().into_iter().enumerate() {
        let s = &mut subsets[k];
        s.indices.push(i);
        s.trajectories.push(trajectories[i].clone());
        s.blur.push(blur[i]);
    }
    Ok(subsets)
}

/// Standard errors of every population of `model`, from its hard partition.
///
/// Entry `k` fails with `DegenerateInput` when no trajectory is assigned to
/// population `k`, or with the estimator's error otherwise.
pub fn estimate_population_errors(
    model: &MixtureModel,
    trajectories: &[Trajectory],
    blur: &[f64],
) -> Result<Vec<Result<ParameterErrors>>> {
    let estimator = DiffusionEstimator::new();
    let subsets = partition(&model.responsibilities, trajectories, blur)?;
    Ok(subsets
        .iter()
        .zip(&model.components)
        .map(|(s, c)| {
            if s.is_empty() {
                return Err(Error::DegenerateInput(format!(
                    "no trajectory assigned to population {}",
                    s.population
                )));
            }
            estimator.estimate_errors(&s.trajectories, &s.blur, &c.params)
        })
        .collect())
}
