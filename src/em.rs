//! # EM refinement of the ingredient cost matrix
//!
//! Starting from a ground cost (usually the tree distance), alternate:
//!
//! - **E-step**: batched EMD between recipes under the current cost, keeping
//!   the sparsified transport plans.
//! - **M-step**: for every recipe take its `k` nearest recipes, weight each by
//!   a softmax of `-beta · distance`, and accumulate their plan masses into
//!   the expected ingredient match matrix `T_sum`. Re-derive the cost from
//!   `T_sum` by a smoothed log-odds transform (substitution-matrix style).
//!
//! Iterations stop after `iters` rounds or once the relative Frobenius change
//! of the cost matrix drops below `tolerance`. The fixed point is local; the
//! result depends on the starting cost.
//!
//! With `candidate_k` set, E-steps only evaluate candidate pairs
//! ([`CandidateSelector`]). That path is a distinct, cheaper algorithm whose
//! trajectory differs from the full O(M²) one.

use log::{debug, info, trace, warn};
use rayon::prelude::*;
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::candidates::{k_smallest, CandidateSelector};
use crate::composition::CompositionMatrix;
use crate::emd::{canonical_pair, emd_matrix, EmdOptions, PlanSet};
use crate::error::{EngineError, Result};
use crate::parallel::{build_pool, default_workers};

/// Off-diagonal costs are floored at this fraction of `median_target`.
pub const COST_FLOOR_FRACTION: f64 = 1e-6;

/// EM configuration. All values are plain parameters; nothing is read from
/// the environment.
#[derive(Clone, Debug)]
pub struct EmParams {
    /// Maximum number of E/M rounds.
    pub iters: usize,
    /// Stop once the relative cost change falls below this.
    pub tolerance: f64,
    /// Neighbors per recipe in the M-step.
    pub k: usize,
    /// Neighbor weighting temperature.
    pub beta: f64,
    /// Plan entries kept per pair.
    pub plan_topk: Option<usize>,
    /// Plan entries below this fraction of the plan mass are dropped.
    pub plan_minfrac: f64,
    /// Laplace smoothing added to every match-matrix cell.
    pub blosum_alpha: f64,
    /// Median off-diagonal cost after rescaling.
    pub median_target: f64,
    /// Candidate neighbors per recipe; `None` evaluates all pairs.
    pub candidate_k: Option<usize>,
    /// E-step worker threads.
    pub workers: usize,
}

impl Default for EmParams {
    fn default() -> Self {
        Self {
            iters: 5,
            tolerance: 1e-3,
            k: 5,
            beta: 1.0,
            plan_topk: Some(8),
            plan_minfrac: 0.01,
            blosum_alpha: 1.0,
            median_target: 1.0,
            candidate_k: None,
            workers: default_workers(),
        }
    }
}

impl PartialEq for EmParams {
    fn eq(&self, other: &Self) -> bool {
        self.iters == other.iters
            && self.k == other.k
            && self.plan_topk == other.plan_topk
            && self.candidate_k == other.candidate_k
            && self.workers == other.workers
            && approx::relative_eq!(self.tolerance, other.tolerance)
            && approx::relative_eq!(self.beta, other.beta)
            && approx::relative_eq!(self.plan_minfrac, other.plan_minfrac)
            && approx::relative_eq!(self.blosum_alpha, other.blosum_alpha)
            && approx::relative_eq!(self.median_target, other.median_target)
    }
}

impl EmParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &'static str, reason: &str| {
            Err(EngineError::InvalidParameter {
                name,
                reason: reason.to_string(),
            })
        };
        if self.k == 0 {
            return invalid("k", "must be at least 1");
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return invalid("tolerance", "must be finite and non-negative");
        }
        if !self.beta.is_finite() {
            return invalid("beta", "must be finite");
        }
        if !(0.0..1.0).contains(&self.plan_minfrac) {
            return invalid("plan_minfrac", "must lie in [0, 1)");
        }
        if self.plan_topk == Some(0) {
            return invalid("plan_topk", "must be at least 1");
        }
        if !(self.blosum_alpha.is_finite() && self.blosum_alpha > 0.0) {
            return invalid("blosum_alpha", "must be finite and positive");
        }
        if !(self.median_target.is_finite() && self.median_target > 0.0) {
            return invalid("median_target", "must be finite and positive");
        }
        if self.candidate_k == Some(0) {
            return invalid("candidate_k", "must be at least 1");
        }
        if self.workers == 0 {
            return invalid("workers", "must be at least 1");
        }
        Ok(())
    }
}

/// Accumulate the expected ingredient match matrix `T_sum`.
///
/// For each recipe its `k` nearest finite-distance neighbors are weighted by
/// `softmax(-beta · d)`; each neighbor pair's plan, sparsified to `plan_topk`
/// entries above `plan_minfrac`, adds `weight · mass` to its cells. The result
/// is symmetrized. Pairs without a plan contribute nothing.
pub fn expected_ingredient_match_matrix(
    distances: &DenseMatrix<f64>,
    plans: &PlanSet,
    n_ingredients: usize,
    k: usize,
    beta: f64,
    plan_topk: Option<usize>,
    plan_minfrac: f64,
) -> DenseMatrix<f64> {
    let (m, _) = distances.shape();
    let n = n_ingredients;
    debug!(
        "Accumulating match matrix: {} recipes, {} plans, k={}, beta={}",
        m,
        plans.len(),
        k,
        beta
    );

    let contributions: Vec<Vec<(usize, usize, f64)>> = (0..m)
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = (0..m).map(|j| *distances.get((i, j))).collect();
            let neighbors: Vec<usize> = k_smallest(&row, i, k)
                .into_iter()
                .filter(|&j| row[j].is_finite())
                .collect();
            if neighbors.is_empty() {
                return Vec::new();
            }

            let d_min = neighbors.iter().map(|&j| row[j]).fold(f64::INFINITY, f64::min);
            let raw: Vec<f64> = neighbors
                .iter()
                .map(|&j| (-beta * (row[j] - d_min)).exp())
                .collect();
            let z: f64 = raw.iter().sum();

            let mut out = Vec::new();
            for (&j, &w) in neighbors.iter().zip(&raw) {
                let weight = if z > 0.0 { w / z } else { 0.0 };
                let Some(plan) = plans.get(&canonical_pair(i, j)) else {
                    trace!("No plan for pair ({}, {})", i, j);
                    continue;
                };
                for e in plan.sparsify(plan_topk, plan_minfrac).iter() {
                    if e.from < n && e.to < n {
                        out.push((e.from, e.to, weight * e.mass));
                    }
                }
            }
            out
        })
        .collect();

    let mut t = vec![0.0; n * n];
    for (from, to, mass) in contributions.into_iter().flatten() {
        t[from * n + to] += mass;
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let s = 0.5 * (t[i * n + j] + t[j * n + i]);
            t[i * n + j] = s;
            t[j * n + i] = s;
        }
    }

    DenseMatrix::from_iterator(t.into_iter(), n, n, 0)
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

/// Log-odds cost update from a match matrix.
///
/// `cost_ij = -ln(observed_ij / expected_ij)` with `observed = T + alpha` and
/// `expected` the product of the smoothed row/column marginals (each inflated
/// by `alpha · N`) over the smoothed total. The scores are symmetrized, the
/// diagonal zeroed, shifted so the smallest off-diagonal entry is zero,
/// rescaled so the median off-diagonal entry is `median_target`, and floored
/// at `COST_FLOOR_FRACTION · median_target`. A degenerate (constant) score
/// matrix maps every off-diagonal entry to `median_target`.
pub fn m_step_blosum(
    match_matrix: &DenseMatrix<f64>,
    blosum_alpha: f64,
    median_target: f64,
) -> Result<DenseMatrix<f64>> {
    if !(blosum_alpha.is_finite() && blosum_alpha > 0.0) {
        return Err(EngineError::InvalidParameter {
            name: "blosum_alpha",
            reason: format!("must be finite and positive, got {}", blosum_alpha),
        });
    }
    if !(median_target.is_finite() && median_target > 0.0) {
        return Err(EngineError::InvalidParameter {
            name: "median_target",
            reason: format!("must be finite and positive, got {}", median_target),
        });
    }
    let (rows, cols) = match_matrix.shape();
    if rows != cols {
        return Err(EngineError::DimensionMismatch {
            rows,
            cols,
            expected: rows,
        });
    }
    let n = rows;
    if n <= 1 {
        return Ok(DenseMatrix::from_iterator(vec![0.0; n * n].into_iter(), n, n, 0));
    }

    let observed: Vec<f64> = (0..n * n)
        .map(|idx| {
            let v = *match_matrix.get((idx / n, idx % n));
            (if v.is_finite() { v.max(0.0) } else { 0.0 }) + blosum_alpha
        })
        .collect();
    let row_marg: Vec<f64> = (0..n).map(|i| observed[i * n..(i + 1) * n].iter().sum()).collect();
    let col_marg: Vec<f64> = (0..n).map(|j| (0..n).map(|i| observed[i * n + j]).sum()).collect();
    let total: f64 = row_marg.iter().sum();

    let score = |i: usize, j: usize| {
        let expected = row_marg[i] * col_marg[j] / total;
        -(observed[i * n + j] / expected).ln()
    };

    let mut cost = vec![0.0; n * n];
    let mut off_diagonal = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            let s = 0.5 * (score(i, j) + score(j, i));
            cost[i * n + j] = s;
            cost[j * n + i] = s;
            off_diagonal.push(s);
        }
    }

    let min_off = off_diagonal.iter().copied().fold(f64::INFINITY, f64::min);
    let mut shifted: Vec<f64> = off_diagonal.iter().map(|s| s - min_off).collect();
    let med = median(&mut shifted);
    let floor = COST_FLOOR_FRACTION * median_target;

    if med <= f64::EPSILON {
        debug!("Degenerate log-odds scores, using constant cost {}", median_target);
    }
    for i in 0..n {
        for j in 0..n {
            let v = if i == j {
                0.0
            } else if med <= f64::EPSILON {
                median_target
            } else {
                ((cost[i * n + j] - min_off) * median_target / med).max(floor)
            };
            cost[i * n + j] = v;
        }
    }

    Ok(DenseMatrix::from_iterator(cost.into_iter(), n, n, 0))
}

/// `‖new − old‖_F / ‖old‖_F` (absolute change when `old` is zero).
pub fn relative_change(old: &DenseMatrix<f64>, new: &DenseMatrix<f64>) -> f64 {
    let (r, c) = old.shape();
    let mut diff = 0.0;
    let mut base = 0.0;
    for i in 0..r {
        for j in 0..c {
            let (a, b) = (*old.get((i, j)), *new.get((i, j)));
            diff += (b - a) * (b - a);
            base += a * a;
        }
    }
    if base > 0.0 {
        (diff / base).sqrt()
    } else {
        diff.sqrt()
    }
}

/// Output of a learner run.
#[derive(Clone, Debug)]
pub struct EmResult {
    /// Recipe distances from the last E-step.
    pub distances: DenseMatrix<f64>,
    /// Final learned ingredient cost.
    pub cost: DenseMatrix<f64>,
    /// Plans from the last E-step.
    pub plans: PlanSet,
    /// Relative cost change per completed M-step.
    pub convergence: Vec<f64>,
    pub converged: bool,
    /// Pairs evaluated in the last E-step when candidate selection is on.
    pub candidates: Option<Vec<(usize, usize)>>,
}

/// Iterative cost learner.
#[derive(Clone, Debug)]
pub struct EmLearner {
    params: EmParams,
}

impl EmLearner {
    pub fn new(params: EmParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &EmParams {
        &self.params
    }

    /// Run EM from `initial_cost` over the recipes in `volumes`.
    ///
    /// `iters == 0` runs a single E-step and returns `initial_cost` unchanged.
    pub fn fit(
        &self,
        volumes: &CompositionMatrix,
        initial_cost: &DenseMatrix<f64>,
    ) -> Result<EmResult> {
        let p = &self.params;
        let n = volumes.ncols();
        let (cr, cc) = initial_cost.shape();
        if cr != n || cc != n {
            return Err(EngineError::DimensionMismatch {
                rows: cr,
                cols: cc,
                expected: n,
            });
        }

        info!(
            "EM start: {} recipes, {} ingredients, iters={}, tol={}, k={}, beta={}, candidates={:?}",
            volumes.nrows(),
            n,
            p.iters,
            p.tolerance,
            p.k,
            p.beta,
            p.candidate_k
        );

        let pool = build_pool(p.workers)?;
        let selector = p.candidate_k.map(CandidateSelector::new);
        let options = EmdOptions {
            retain_plans: true,
            plan_topk: p.plan_topk,
            plan_minfrac: p.plan_minfrac,
        };

        let mut cost = initial_cost.clone();
        let mut convergence = Vec::with_capacity(p.iters);
        let mut converged = false;
        let mut previous: Option<DenseMatrix<f64>> = None;

        let rounds = p.iters.max(1);
        let mut last = None;
        for round in 0..rounds {
            let candidates = selector.map(|s| s.select(volumes, previous.as_ref()));
            let batch = pool.install(|| {
                emd_matrix(volumes, &cost, candidates.as_deref(), &options)
            })?;
            debug!("E-step {}: evaluated {} pairs", round, batch.evaluated);

            if p.iters == 0 {
                last = Some((batch, candidates));
                break;
            }

            let t_sum = pool.install(|| {
                expected_ingredient_match_matrix(
                    &batch.distances,
                    &batch.plans,
                    n,
                    p.k,
                    p.beta,
                    p.plan_topk,
                    p.plan_minfrac,
                )
            });
            let next = m_step_blosum(&t_sum, p.blosum_alpha, p.median_target)?;
            let delta = relative_change(&cost, &next);
            info!("EM iteration {}: relative cost change {:.6}", round + 1, delta);
            convergence.push(delta);
            cost = next;

            previous = Some(batch.distances.clone());
            last = Some((batch, candidates));
            if delta < p.tolerance {
                converged = true;
                info!("EM converged after {} iterations", round + 1);
                break;
            }
        }

        if !converged && p.iters > 0 {
            warn!(
                "EM stopped at the iteration limit ({}) without reaching tolerance {}",
                p.iters, p.tolerance
            );
        }

        let (batch, candidates) = last.ok_or(EngineError::InvalidParameter {
            name: "iters",
            reason: "no E-step was run".to_string(),
        })?;
        Ok(EmResult {
            distances: batch.distances,
            cost,
            plans: batch.plans,
            convergence,
            converged,
            candidates,
        })
    }
}
