//! # Earth Mover's Distance between recipe compositions
//!
//! A recipe is a probability distribution over ingredients. The EMD between
//! two recipes is the minimum total ground cost of moving one distribution's
//! mass onto the other's; the optimal mass assignment is the transport plan.
//!
//! ## Algorithm
//!
//! The transportation problem is solved exactly as a min-cost flow on the
//! bipartite graph `source → supply ingredients → demand ingredients → sink`
//! with successive shortest paths (Bellman-Ford on the residual graph). Only
//! the non-zero support of each vector takes part: moving mass through an
//! ingredient neither recipe contains is never optimal, so the problem size
//! is `|supp(a)| × |supp(b)|` rather than `N × N`.
//!
//! ## Batched computation
//!
//! [`emd_matrix`] evaluates every unordered recipe pair, or a caller-supplied
//! candidate set, in parallel on the current rayon pool. Each pair is solved
//! once and mirrored, so the output is exactly symmetric with a zero
//! diagonal. Pairs outside a candidate set stay at `f64::INFINITY`.
//!
//! ## Complexity
//!
//! Per pair: `O(F · V · E)` with `V = |a| + |b| + 2`, `E = |a|·|b|` and `F`
//! augmentations (at most a few times `V` in practice). Recipes hold a
//! handful of ingredients, so pairs cost microseconds.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::composition::CompositionMatrix;
use crate::error::{EngineError, Result};

/// Masses below this are treated as zero.
pub const MASS_EPS: f64 = 1e-12;
const COST_EPS: f64 = 1e-12;

/// One mass movement from a source ingredient to a destination ingredient.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub from: usize,
    pub to: usize,
    pub mass: f64,
    /// Ground cost per unit of mass.
    pub cost: f64,
}

/// Sparse transport plan between two compositions, as matrix indices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportPlan {
    pub entries: Vec<PlanEntry>,
}

impl TransportPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter()
    }

    pub fn total_mass(&self) -> f64 {
        self.entries.iter().map(|e| e.mass).sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.entries.iter().map(|e| e.mass * e.cost).sum()
    }

    /// Keep entries carrying at least `minfrac` of the total mass, largest
    /// first, at most `topk` of them.
    pub fn sparsify(&self, topk: Option<usize>, minfrac: f64) -> TransportPlan {
        let threshold = self.total_mass() * minfrac.max(0.0);
        let mut entries: Vec<PlanEntry> = self
            .entries
            .iter()
            .copied()
            .filter(|e| e.mass > MASS_EPS && e.mass >= threshold)
            .collect();
        entries.sort_by(|a, b| {
            b.mass
                .partial_cmp(&a.mass)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.from, a.to).cmp(&(b.from, b.to)))
        });
        if let Some(k) = topk {
            entries.truncate(k);
        }
        TransportPlan { entries }
    }

    /// Same plan read in the opposite direction.
    pub fn transposed(&self) -> TransportPlan {
        TransportPlan {
            entries: self
                .entries
                .iter()
                .map(|e| PlanEntry {
                    from: e.to,
                    to: e.from,
                    ..*e
                })
                .collect(),
        }
    }
}

/// Distance and optional plan for one pair.
#[derive(Clone, Debug, PartialEq)]
pub struct EmdResult {
    pub distance: f64,
    pub plan: Option<TransportPlan>,
}

#[derive(Clone, Debug)]
struct Edge {
    to: usize,
    rev: usize,
    cap: f64,
    cost: f64,
}

/// Residual graph for the restricted transportation problem.
struct TransportNetwork {
    adj: Vec<Vec<Edge>>,
    source: usize,
    sink: usize,
}

impl TransportNetwork {
    fn new(nodes: usize) -> Self {
        Self {
            adj: vec![Vec::new(); nodes],
            source: 0,
            sink: nodes - 1,
        }
    }

    fn add_edge(&mut self, u: usize, v: usize, cap: f64, cost: f64) {
        let rev_u = self.adj[v].len();
        let rev_v = self.adj[u].len();
        self.adj[u].push(Edge { to: v, rev: rev_u, cap, cost });
        self.adj[v].push(Edge { to: u, rev: rev_v, cap: 0.0, cost: -cost });
    }

    /// Shortest residual path from source to sink as (node, edge index) hops.
    fn shortest_path(&self) -> Option<Vec<(usize, usize)>> {
        let n = self.adj.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut prev: Vec<Option<(usize, usize)>> = vec![None; n];
        dist[self.source] = 0.0;

        for _ in 0..n {
            let mut changed = false;
            for u in 0..n {
                if !dist[u].is_finite() {
                    continue;
                }
                for (idx, e) in self.adj[u].iter().enumerate() {
                    if e.cap > MASS_EPS && dist[u] + e.cost < dist[e.to] - COST_EPS {
                        dist[e.to] = dist[u] + e.cost;
                        prev[e.to] = Some((u, idx));
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if !dist[self.sink].is_finite() {
            return None;
        }
        let mut path = Vec::new();
        let mut node = self.sink;
        while node != self.source {
            let (u, idx) = prev[node]?;
            path.push((u, idx));
            node = u;
            if path.len() > n {
                return None;
            }
        }
        path.reverse();
        Some(path)
    }

    /// Push flow along shortest paths until no augmenting path remains.
    fn saturate(&mut self) {
        let max_rounds = 4 * self.adj.len() * self.adj.len() + 16;
        for round in 0..max_rounds {
            let Some(path) = self.shortest_path() else {
                trace!("Transport solved after {} augmentations", round);
                return;
            };
            let bottleneck = path
                .iter()
                .map(|&(u, idx)| self.adj[u][idx].cap)
                .fold(f64::INFINITY, f64::min);
            if bottleneck <= MASS_EPS {
                return;
            }
            for &(u, idx) in &path {
                let (to, rev) = (self.adj[u][idx].to, self.adj[u][idx].rev);
                self.adj[u][idx].cap -= bottleneck;
                self.adj[to][rev].cap += bottleneck;
            }
        }
        debug!("Transport solver hit its augmentation cap");
    }
}

/// Exact EMD between two sparse compositions `(index, mass)` over the same
/// ingredient space.
///
/// Both supports are expected to be non-negative and to sum to 1. If either
/// is empty the distance is zero and the plan is empty.
pub fn emd(
    a: &[(usize, f64)],
    b: &[(usize, f64)],
    cost: &DenseMatrix<f64>,
    with_plan: bool,
) -> EmdResult {
    let a: Vec<(usize, f64)> = a.iter().copied().filter(|(_, m)| *m > MASS_EPS).collect();
    let b: Vec<(usize, f64)> = b.iter().copied().filter(|(_, m)| *m > MASS_EPS).collect();
    if a.is_empty() || b.is_empty() {
        return EmdResult {
            distance: 0.0,
            plan: with_plan.then(TransportPlan::default),
        };
    }

    let (p, q) = (a.len(), b.len());
    let mut net = TransportNetwork::new(p + q + 2);
    for (i, &(_, mass)) in a.iter().enumerate() {
        net.add_edge(net.source, 1 + i, mass, 0.0);
    }
    for (j, &(_, mass)) in b.iter().enumerate() {
        net.add_edge(1 + p + j, net.sink, mass, 0.0);
    }
    for (i, &(ai, _)) in a.iter().enumerate() {
        for (j, &(bj, _)) in b.iter().enumerate() {
            net.add_edge(1 + i, 1 + p + j, f64::INFINITY, *cost.get((ai, bj)));
        }
    }

    net.saturate();

    // Supply node i's outgoing edges (after the source reverse edge) lead to
    // demand nodes in insertion order; moved mass sits on their reverse edges.
    let mut distance = 0.0;
    let mut entries = Vec::new();
    for (i, &(ai, _)) in a.iter().enumerate() {
        for e in net.adj[1 + i].iter().filter(|e| e.to > p && e.to <= p + q) {
            let moved = net.adj[e.to][e.rev].cap;
            if moved > MASS_EPS {
                let bj = b[e.to - 1 - p].0;
                distance += moved * e.cost;
                if with_plan {
                    entries.push(PlanEntry {
                        from: ai,
                        to: bj,
                        mass: moved,
                        cost: e.cost,
                    });
                }
            }
        }
    }

    EmdResult {
        distance,
        plan: with_plan.then_some(TransportPlan { entries }),
    }
}

/// EMD between two dense composition vectors.
pub fn emd_dense(a: &[f64], b: &[f64], cost: &DenseMatrix<f64>, with_plan: bool) -> EmdResult {
    let support = |v: &[f64]| -> Vec<(usize, f64)> {
        v.iter()
            .enumerate()
            .filter(|(_, m)| **m > 0.0)
            .map(|(i, m)| (i, *m))
            .collect()
    };
    emd(&support(a), &support(b), cost, with_plan)
}

/// `(min(i, j), max(i, j))`
#[inline]
pub fn canonical_pair(i: usize, j: usize) -> (usize, usize) {
    if i <= j {
        (i, j)
    } else {
        (j, i)
    }
}

/// Transport plans keyed by canonical recipe pair, oriented from the lower
/// recipe index to the higher.
pub type PlanSet = BTreeMap<(usize, usize), TransportPlan>;

/// Options for [`emd_matrix`].
#[derive(Clone, Debug, PartialEq)]
pub struct EmdOptions {
    pub retain_plans: bool,
    /// Keep at most this many entries per retained plan.
    pub plan_topk: Option<usize>,
    /// Drop plan entries below this fraction of the plan's mass.
    pub plan_minfrac: f64,
}

impl Default for EmdOptions {
    fn default() -> Self {
        Self {
            retain_plans: false,
            plan_topk: None,
            plan_minfrac: 0.0,
        }
    }
}

/// Result of a batched EMD computation.
#[derive(Clone, Debug)]
pub struct EmdBatch {
    /// M×M, symmetric, zero diagonal; unevaluated pairs are infinite.
    pub distances: DenseMatrix<f64>,
    pub plans: PlanSet,
    /// Canonical pairs actually evaluated.
    pub evaluated: usize,
}

/// Pairwise EMD over the rows of `volumes`.
///
/// * `candidates` - restrict evaluation to these pairs (any orientation,
///   duplicates allowed); `None` evaluates all `M·(M-1)/2` pairs.
pub fn emd_matrix(
    volumes: &CompositionMatrix,
    cost: &DenseMatrix<f64>,
    candidates: Option<&[(usize, usize)]>,
    options: &EmdOptions,
) -> Result<EmdBatch> {
    let m = volumes.nrows();
    let n = volumes.ncols();
    let (cr, cc) = cost.shape();
    if cr != n || cc != n {
        return Err(EngineError::DimensionMismatch {
            rows: cr,
            cols: cc,
            expected: n,
        });
    }

    let pairs: Vec<(usize, usize)> = match candidates {
        None => (0..m)
            .flat_map(|i| ((i + 1)..m).map(move |j| (i, j)))
            .collect(),
        Some(list) => {
            let mut set = BTreeSet::new();
            for &(i, j) in list {
                if i >= m || j >= m {
                    return Err(EngineError::InvalidParameter {
                        name: "candidates",
                        reason: format!("pair ({}, {}) out of range for {} recipes", i, j, m),
                    });
                }
                if i != j {
                    set.insert(canonical_pair(i, j));
                }
            }
            set.into_iter().collect()
        }
    };

    info!(
        "Computing EMD for {} recipe pairs ({} mode)",
        pairs.len(),
        if candidates.is_some() { "candidate" } else { "full" }
    );

    let supports = volumes.supports();
    let results: Vec<((usize, usize), EmdResult)> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let res = emd(&supports[i], &supports[j], cost, options.retain_plans);
            ((i, j), res)
        })
        .collect();

    let fill = if candidates.is_some() { f64::INFINITY } else { 0.0 };
    let mut flat = vec![fill; m * m];
    for i in 0..m {
        flat[i * m + i] = 0.0;
    }

    let mut plans = PlanSet::new();
    for ((i, j), res) in results {
        flat[i * m + j] = res.distance;
        flat[j * m + i] = res.distance;
        if let Some(plan) = res.plan {
            plans.insert((i, j), plan.sparsify(options.plan_topk, options.plan_minfrac));
        }
    }

    let finite: Vec<f64> = flat.iter().copied().filter(|d| d.is_finite()).collect();
    debug!(
        "EMD batch done: {} pairs, {} plans retained, max distance {:.6}",
        pairs.len(),
        plans.len(),
        finite.iter().copied().fold(0.0, f64::max)
    );

    Ok(EmdBatch {
        distances: DenseMatrix::from_iterator(flat.into_iter(), m, m, 0),
        plans,
        evaluated: pairs.len(),
    })
}
