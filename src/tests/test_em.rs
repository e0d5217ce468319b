use approx::{assert_abs_diff_eq, assert_relative_eq};
use smartcore::linalg::basic::arrays::Array;

use crate::composition::Storage;
use crate::em::*;
use crate::emd::{emd_matrix, EmdOptions};
use crate::error::EngineError;
use crate::parallel::{build_pool, worker_count};
use crate::tests::test_helpers::{assert_symmetric, assert_zero_diagonal, bar_inputs, square, uniform_cost};

fn small_params() -> EmParams {
    EmParams {
        iters: 3,
        k: 2,
        workers: 2,
        ..EmParams::default()
    }
}

fn assert_finite(m: &smartcore::linalg::basic::matrix::DenseMatrix<f64>) {
    let (r, c) = m.shape();
    for i in 0..r {
        for j in 0..c {
            assert!(m.get((i, j)).is_finite(), "entry ({}, {}) is not finite", i, j);
        }
    }
}

#[test]
fn test_worker_count() {
    assert_eq!(worker_count(0), 1);
    assert_eq!(worker_count(1), 1);
    assert_eq!(worker_count(2), 1);
    assert_eq!(worker_count(8), 7);
    assert_eq!(build_pool(2).unwrap().current_num_threads(), 2);
}

#[test]
fn test_params_validation() {
    assert!(EmParams::default().validate().is_ok());
    assert_eq!(EmParams::default(), EmParams::default());

    let bad = [
        EmParams { k: 0, ..EmParams::default() },
        EmParams { blosum_alpha: 0.0, ..EmParams::default() },
        EmParams { median_target: -1.0, ..EmParams::default() },
        EmParams { beta: f64::NAN, ..EmParams::default() },
        EmParams { plan_minfrac: 1.0, ..EmParams::default() },
        EmParams { workers: 0, ..EmParams::default() },
        EmParams { candidate_k: Some(0), ..EmParams::default() },
    ];
    for params in bad {
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidParameter { .. })
        ));
    }
}

#[test]
fn test_match_matrix_symmetric_non_negative() {
    let (cost, registry, volumes) = bar_inputs(Storage::Sparse);
    let options = EmdOptions {
        retain_plans: true,
        ..EmdOptions::default()
    };
    let batch = emd_matrix(&volumes.matrix, &cost, None, &options).unwrap();
    let t = expected_ingredient_match_matrix(
        &batch.distances,
        &batch.plans,
        registry.len(),
        2,
        1.0,
        Some(8),
        0.0,
    );

    assert_eq!(t.shape(), (registry.len(), registry.len()));
    assert_symmetric(&t, 1e-12);
    let (n, _) = t.shape();
    let mut total = 0.0;
    for i in 0..n {
        for j in 0..n {
            assert!(*t.get((i, j)) >= 0.0);
            total += *t.get((i, j));
        }
    }
    // every recipe has at least one neighbor and contributes unit weight
    assert_abs_diff_eq!(total, volumes.recipes.len() as f64, epsilon = 1e-9);
}

#[test]
fn test_m_step_diagonal_input() {
    let t = square(3, &[5.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 5.0]);
    let cost = m_step_blosum(&t, 1.0, 2.0).unwrap();
    assert_finite(&cost);
    assert_symmetric(&cost, 0.0);
    assert_zero_diagonal(&cost);
    assert_relative_eq!(*cost.get((0, 1)), 2.0);
}

#[test]
fn test_m_step_uniform_input() {
    let t = square(3, &[1.0; 9]);
    let cost = m_step_blosum(&t, 0.5, 1.0).unwrap();
    assert_finite(&cost);
    assert_zero_diagonal(&cost);
    assert_relative_eq!(*cost.get((1, 2)), 1.0);
}

#[test]
fn test_m_step_ranks_and_rescales() {
    // 0 and 1 are matched often, 2 and 3 rarely
    let t = square(
        4,
        &[
            4.0, 3.0, 0.5, 0.2, //
            3.0, 4.0, 0.4, 0.1, //
            0.5, 0.4, 4.0, 0.0, //
            0.2, 0.1, 0.0, 4.0, //
        ],
    );
    let cost = m_step_blosum(&t, 0.1, 1.0).unwrap();
    assert_finite(&cost);
    assert_symmetric(&cost, 1e-12);
    assert_zero_diagonal(&cost);

    let mut off: Vec<f64> = vec![];
    for i in 0..4 {
        for j in (i + 1)..4 {
            assert!(*cost.get((i, j)) > 0.0);
            off.push(*cost.get((i, j)));
        }
    }
    assert!(*cost.get((0, 1)) < *cost.get((2, 3)));
    off.sort_by(|a, b| a.total_cmp(b));
    assert_abs_diff_eq!(0.5 * (off[2] + off[3]), 1.0, epsilon = 1e-9);
}

#[test]
fn test_m_step_rejects_bad_parameters() {
    let t = uniform_cost(3, 1.0);
    assert!(m_step_blosum(&t, 0.0, 1.0).is_err());
    assert!(m_step_blosum(&t, 1.0, 0.0).is_err());
    assert!(m_step_blosum(&square(1, &[0.0]), 1.0, 1.0).is_ok());
}

#[test]
fn test_relative_change() {
    let a = uniform_cost(3, 1.0);
    assert_eq!(relative_change(&a, &a), 0.0);
    let b = uniform_cost(3, 2.0);
    assert_abs_diff_eq!(relative_change(&a, &b), 1.0, epsilon = 1e-12);
}

#[test]
fn test_fit_terminates_within_iters() {
    let (cost, registry, volumes) = bar_inputs(Storage::Sparse);
    let learner = EmLearner::new(small_params()).unwrap();
    let result = learner.fit(&volumes.matrix, &cost).unwrap();

    assert!(!result.convergence.is_empty());
    assert!(result.convergence.len() <= 3);
    assert!(result.convergence.iter().all(|d| d.is_finite() && *d >= 0.0));
    assert_eq!(result.cost.shape(), (registry.len(), registry.len()));
    assert_finite(&result.cost);
    assert_symmetric(&result.cost, 1e-12);
    assert_zero_diagonal(&result.cost);
    assert_symmetric(&result.distances, 1e-12);
    assert!(result.candidates.is_none());
    assert!(!result.plans.is_empty());
}

#[test]
fn test_fit_dense_and_sparse_agree() {
    let (cost, _, sparse) = bar_inputs(Storage::Sparse);
    let (_, _, dense) = bar_inputs(Storage::Dense);
    let learner = EmLearner::new(small_params()).unwrap();
    let a = learner.fit(&sparse.matrix, &cost).unwrap();
    let b = learner.fit(&dense.matrix, &cost).unwrap();
    let (n, _) = a.cost.shape();
    for i in 0..n {
        for j in 0..n {
            assert_abs_diff_eq!(*a.cost.get((i, j)), *b.cost.get((i, j)), epsilon = 1e-9);
        }
    }
}

#[test]
fn test_zero_iterations_single_e_step() {
    let (cost, _, volumes) = bar_inputs(Storage::Dense);
    let learner = EmLearner::new(EmParams {
        iters: 0,
        ..small_params()
    })
    .unwrap();
    let result = learner.fit(&volumes.matrix, &cost).unwrap();
    assert!(result.convergence.is_empty());
    assert!(!result.converged);
    let (n, _) = cost.shape();
    for i in 0..n {
        for j in 0..n {
            assert_eq!(*result.cost.get((i, j)), *cost.get((i, j)));
        }
    }
    assert_zero_diagonal(&result.distances);
}

#[test]
fn test_candidate_path() {
    let (cost, _, volumes) = bar_inputs(Storage::Sparse);
    let learner = EmLearner::new(EmParams {
        candidate_k: Some(2),
        ..small_params()
    })
    .unwrap();
    let result = learner.fit(&volumes.matrix, &cost).unwrap();
    let candidates = result.candidates.unwrap();
    assert!(!candidates.is_empty());
    assert!(candidates.iter().all(|(i, j)| i < j));
    for &(i, j) in &candidates {
        assert!(result.distances.get((i, j)).is_finite());
    }
    assert_finite(&result.cost);
}

#[test]
fn test_fit_rejects_mismatched_cost() {
    let (_, _, volumes) = bar_inputs(Storage::Sparse);
    let learner = EmLearner::new(small_params()).unwrap();
    assert!(matches!(
        learner.fit(&volumes.matrix, &uniform_cost(2, 1.0)),
        Err(EngineError::DimensionMismatch { .. })
    ));
}
