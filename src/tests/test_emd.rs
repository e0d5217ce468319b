use approx::assert_abs_diff_eq;
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::composition::CompositionMatrix;
use crate::emd::*;
use crate::tests::test_helpers::{assert_symmetric, assert_zero_diagonal, square, uniform_cost};

/// |i - j| on a line of `n` ingredients.
fn line_cost(n: usize) -> DenseMatrix<f64> {
    DenseMatrix::from_iterator(
        (0..n * n).map(|idx| (idx / n).abs_diff(idx % n) as f64),
        n,
        n,
        0,
    )
}

fn recipes() -> CompositionMatrix {
    CompositionMatrix::Dense(DenseMatrix::from_iterator(
        vec![
            0.6, 0.3, 0.1, 0.0, 0.0, //
            0.0, 0.3, 0.1, 0.6, 0.0, //
            0.0, 0.0, 0.0, 0.2, 0.8, //
            0.6, 0.3, 0.1, 0.0, 0.0, //
        ]
        .into_iter(),
        4,
        5,
        0,
    ))
}

#[test]
fn test_identity_is_zero() {
    let a = vec![(0, 0.5), (2, 0.25), (3, 0.25)];
    let res = emd(&a, &a, &line_cost(4), true);
    assert_abs_diff_eq!(res.distance, 0.0, epsilon = 1e-12);

    let plan = res.plan.unwrap();
    assert!(plan.iter().all(|e| e.from == e.to));
    assert_abs_diff_eq!(plan.total_mass(), 1.0, epsilon = 1e-12);
}

#[test]
fn test_symmetry() {
    let cost = line_cost(5);
    let a = vec![(0, 0.7), (4, 0.3)];
    let b = vec![(1, 0.2), (2, 0.5), (3, 0.3)];
    let ab = emd(&a, &b, &cost, false).distance;
    let ba = emd(&b, &a, &cost, false).distance;
    assert_abs_diff_eq!(ab, ba, epsilon = 1e-12);
    assert!(ab > 0.0);
}

#[test]
fn test_disjoint_supports_unit_cost() {
    let cost = uniform_cost(4, 1.0);
    let a = vec![(0, 1.0)];
    let b = vec![(1, 0.5), (2, 0.25), (3, 0.25)];
    let res = emd(&a, &b, &cost, true);
    assert_abs_diff_eq!(res.distance, 1.0, epsilon = 1e-12);
    assert_eq!(res.plan.unwrap().len(), 3);
}

#[test]
fn test_line_shift() {
    let res = emd_dense(&[0.5, 0.5, 0.0], &[0.0, 0.5, 0.5], &line_cost(3), true);
    assert_abs_diff_eq!(res.distance, 1.0, epsilon = 1e-12);
    let plan = res.plan.unwrap();
    assert_abs_diff_eq!(plan.total_cost(), res.distance, epsilon = 1e-12);
}

#[test]
fn test_small_known_values() {
    let cost = square(2, &[0.0, 1.0, 1.0, 0.0]);
    let cost3 = square(
        3,
        &[
            0.0, 1.0, 2.0, //
            1.0, 0.0, 10.0, //
            2.0, 10.0, 0.0, //
        ],
    );
    let res = emd_dense(&[0.5, 0.5, 0.0], &[0.0, 0.5, 0.5], &cost3, false);
    assert_abs_diff_eq!(res.distance, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(emd_dense(&[1.0, 0.0], &[0.0, 1.0], &cost, false).distance, 1.0, epsilon = 1e-12);
}

#[test]
fn test_triangle_inequality() {
    let cost = line_cost(5);
    let a = [0.6, 0.3, 0.1, 0.0, 0.0];
    let b = [0.0, 0.3, 0.1, 0.6, 0.0];
    let c = [0.0, 0.0, 0.0, 0.2, 0.8];
    let ab = emd_dense(&a, &b, &cost, false).distance;
    let bc = emd_dense(&b, &c, &cost, false).distance;
    let ac = emd_dense(&a, &c, &cost, false).distance;
    assert!(ac <= ab + bc + 1e-12);
}

#[test]
fn test_empty_support() {
    let res = emd(&[], &[(0, 1.0)], &uniform_cost(2, 1.0), true);
    assert_eq!(res.distance, 0.0);
    assert!(res.plan.unwrap().is_empty());
}

#[test]
fn test_sparsify_order_and_limits() {
    let entry = |from, to, mass| PlanEntry { from, to, mass, cost: 1.0 };
    let plan = TransportPlan {
        entries: vec![
            entry(0, 1, 0.05),
            entry(0, 0, 0.3),
            entry(2, 3, 0.5),
            entry(1, 1, 0.15),
        ],
    };

    let top = plan.sparsify(Some(2), 0.0);
    let masses: Vec<f64> = top.iter().map(|e| e.mass).collect();
    assert_eq!(masses, vec![0.5, 0.3]);

    let frac = plan.sparsify(None, 0.1);
    assert_eq!(frac.len(), 3);
    assert!(frac.iter().all(|e| e.mass >= 0.1));

    let t = plan.transposed();
    assert!(t.iter().any(|e| e.from == 3 && e.to == 2));
}

#[test]
fn test_emd_matrix_full() {
    let volumes = recipes();
    let batch = emd_matrix(&volumes, &line_cost(5), None, &EmdOptions::default()).unwrap();
    assert_eq!(batch.distances.shape(), (4, 4));
    assert_eq!(batch.evaluated, 6);
    assert!(batch.plans.is_empty());
    assert_symmetric(&batch.distances, 0.0);
    assert_zero_diagonal(&batch.distances);
    // recipes 0 and 3 are identical
    assert_abs_diff_eq!(*batch.distances.get((0, 3)), 0.0, epsilon = 1e-12);
    assert!(*batch.distances.get((0, 2)) > *batch.distances.get((0, 1)));
}

#[test]
fn test_emd_matrix_candidates() {
    let volumes = recipes();
    let options = EmdOptions {
        retain_plans: true,
        plan_topk: Some(2),
        plan_minfrac: 0.0,
    };
    let candidates = vec![(1, 0), (0, 1), (2, 3)];
    let batch = emd_matrix(&volumes, &line_cost(5), Some(candidates.as_slice()), &options).unwrap();

    assert_eq!(batch.evaluated, 2);
    assert!(batch.distances.get((0, 2)).is_infinite());
    assert!(batch.distances.get((1, 3)).is_infinite());
    assert!(batch.distances.get((0, 1)).is_finite());
    assert_zero_diagonal(&batch.distances);

    assert_eq!(batch.plans.len(), 2);
    assert!(batch.plans.contains_key(&(0, 1)));
    assert!(batch.plans.values().all(|p| p.len() <= 2));
}

#[test]
fn test_emd_matrix_rejects_bad_input() {
    let volumes = recipes();
    assert!(emd_matrix(&volumes, &line_cost(4), None, &EmdOptions::default()).is_err());
    assert!(emd_matrix(&volumes, &line_cost(5), Some(&[(0, 9)][..]), &EmdOptions::default()).is_err());
}
