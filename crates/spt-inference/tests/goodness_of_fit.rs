//! Kuiper statistic properties and quality-factor calibration.

use proptest::prelude::*;
use spt_core::PopulationParameters;
use spt_inference::{
    QualityFactor, estimate, kuiper_statistic, quality_factors_single, simulate_population,
};

fn factors(values: &[f64], weights: &[f64]) -> Vec<QualityFactor> {
    values
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(i, (&value, &weight))| QualityFactor { trajectory: i, population: 0, value, weight })
        .collect()
}

proptest! {
    #[test]
    fn prop_kuiper_is_order_invariant(
        values in proptest::collection::vec(0.0f64..=1.0, 1..64),
        seed in any::<u64>(),
    ) {
        let weights: Vec<f64> = (0..values.len())
            .map(|i| 0.1 + ((i as u64 ^ seed) % 10) as f64 / 10.0)
            .collect();
        let a = kuiper_statistic(factors(&values, &weights));

        let mut shuffled = factors(&values, &weights);
        shuffled.rotate_left((seed % values.len() as u64) as usize);
        shuffled.reverse();
        let b = kuiper_statistic(shuffled);

        prop_assert!((a.statistic - b.statistic).abs() < 1e-12);
        prop_assert!((a.distance - b.distance).abs() < 1e-12);
    }

    #[test]
    fn prop_kuiper_bounds(values in proptest::collection::vec(0.0f64..=1.0, 1..64)) {
        let weights = vec![1.0; values.len()];
        let r = kuiper_statistic(factors(&values, &weights));
        prop_assert!(r.distance > 0.0 && r.distance <= 2.0);
        prop_assert!((0.0..=1.0).contains(&r.p_value));
        prop_assert!((r.n_effective - values.len() as f64).abs() < 1e-9);
        prop_assert!(r.sorted.windows(2).all(|w| w[0].value <= w[1].value));
    }
}

#[test]
fn test_fitted_model_is_calibrated() {
    let truth = PopulationParameters::new(0.2, 0.6).unwrap();
    let blur = 0.1;
    let ts = simulate_population(400, 16, 2, &truth, blur, 404).unwrap();
    let bs = vec![blur; ts.len()];

    let fit = estimate(&ts, &bs).unwrap();
    let r = kuiper_statistic(quality_factors_single(&ts, &bs, &fit.parameters).unwrap());
    assert!(r.p_value > 1e-3, "kappa = {}", r.statistic);
}

#[test]
fn test_ignoring_blur_is_detected() {
    let truth = PopulationParameters::new(0.01, 1.0).unwrap();
    let ts = simulate_population(400, 30, 2, &truth, 0.25, 505).unwrap();

    // Analysed as if the shutter were instantaneous, with the true motion.
    let no_blur = vec![0.0; ts.len()];
    let r = kuiper_statistic(quality_factors_single(&ts, &no_blur, &truth).unwrap());
    assert!(r.p_value < 1e-6, "kappa = {}", r.statistic);
}
