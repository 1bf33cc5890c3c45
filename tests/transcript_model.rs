//! Transcript model behavior through the public API.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use prober_rs::model::config::FragmentConfig;
use prober_rs::model::transcript::{EPS, TranscriptModel};

#[test]
fn survival_decays_away_from_origin() {
    let config = Arc::new(FragmentConfig::new(0, 2, 4).unwrap());
    let model = TranscriptModel::with_gamma(config, vec![0.1; 10]).unwrap();
    let p: Vec<f64> = (0..10).map(|pos| model.probability_se(pos)).collect();
    assert!(p[0] > p[9]);
    assert!(p.iter().all(|&x| x >= 0.0));
    assert!((p.iter().sum::<f64>() - 1.0).abs() < EPS);
}

#[test]
fn random_models_are_normalized() {
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..50 {
        let primer = rng.random_range(0..5);
        let min = rng.random_range(1..15);
        let max = min + rng.random_range(0..20);
        let config = Arc::new(FragmentConfig::new(primer, min, max).unwrap());
        let len = rng.random_range(min..min + 80);
        let gamma: Vec<f64> = (0..len).map(|_| rng.random::<f64>() * 0.3).collect();
        let mut model = TranscriptModel::with_gamma(Arc::clone(&config), gamma).unwrap();
        if rng.random::<f64>() < 0.5 {
            let beta: Vec<f64> = (0..len).map(|_| rng.random::<f64>() * 0.1).collect();
            model.set_beta(beta).unwrap();
        }

        let se: f64 = (0..=len as i64).map(|p| model.probability_se(p)).sum();
        assert!((se - 1.0).abs() < EPS, "se sum {}", se);

        let mut pe = 0.0;
        for pos in 0..=len as i64 {
            for flen in primer + min..=primer + max {
                pe += model.probability_pe(pos, flen);
            }
        }
        assert!((pe - 1.0).abs() < EPS, "pe sum {}", pe);
        assert_eq!(model.probability_se(len as i64 + 1), 0.0);
        assert_eq!(model.probability_se(-1), 0.0);
    }
}

#[test]
fn single_end_learning_stays_near_truth() {
    let config = Arc::new(FragmentConfig::new(0, 5, 30).unwrap());
    let truth = TranscriptModel::with_gamma(Arc::clone(&config), vec![0.05; 60]).unwrap();
    let mut model = TranscriptModel::new(Arc::clone(&config), 60);
    let mut rng = StdRng::seed_from_u64(8);
    for _ in 0..50_000 {
        let (pos, _) = truth.simulate(&mut rng).unwrap();
        model.update_se(pos as i64, 1.0);
    }
    assert!(model.is_single_end());
    let n = model.observed_count();
    model.em_round(n, 200);
    let interior = &model.gamma()[8..48];
    let mean = interior.iter().sum::<f64>() / interior.len() as f64;
    assert!((mean - 0.05).abs() < 0.015, "mean gamma {}", mean);
}
