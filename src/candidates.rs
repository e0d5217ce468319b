//! Candidate recipe pairs for the E-step.
//!
//! Full EMD over every recipe pair is O(M²) transport solves. The selector
//! keeps, for each recipe, its `k` nearest recipes under a cheap proxy and
//! evaluates EMD only on the union of those pairs, O(M·k) solves.
//!
//! - first iteration: L1 (Manhattan) distance between composition rows
//! - later iterations: the previous iteration's EMD distances
//!
//! Pairs are returned canonical `(min, max)`, deduplicated and sorted.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use log::{debug, info};
use rayon::prelude::*;
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::composition::CompositionMatrix;
use crate::emd::canonical_pair;

/// L1 distance between two sparse rows sorted by column.
pub fn l1_distance(a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Less => {
                total += a[i].1.abs();
                i += 1;
            }
            Ordering::Greater => {
                total += b[j].1.abs();
                j += 1;
            }
            Ordering::Equal => {
                total += (a[i].1 - b[j].1).abs();
                i += 1;
                j += 1;
            }
        }
    }
    total += a[i..].iter().map(|(_, v)| v.abs()).sum::<f64>();
    total += b[j..].iter().map(|(_, v)| v.abs()).sum::<f64>();
    total
}

/// Indices of the `k` smallest entries of `row`, skipping `exclude`.
///
/// Ascending by value then index; non-finite values rank last.
pub fn k_smallest(row: &[f64], exclude: usize, k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).filter(|&j| j != exclude).collect();
    let cmp = |a: &usize, b: &usize| row[*a].total_cmp(&row[*b]).then(a.cmp(b));
    if k < idx.len() {
        idx.select_nth_unstable_by(k, cmp);
        idx.truncate(k);
    }
    idx.sort_by(cmp);
    idx
}

/// Per-recipe nearest neighbors under the L1 proxy.
pub fn l1_neighbors(volumes: &CompositionMatrix, k: usize) -> Vec<Vec<usize>> {
    let supports = volumes.supports();
    let m = supports.len();
    (0..m)
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = (0..m)
                .map(|j| l1_distance(&supports[i], &supports[j]))
                .collect();
            k_smallest(&row, i, k)
        })
        .collect()
}

/// Per-recipe nearest neighbors under a precomputed distance matrix.
pub fn matrix_neighbors(distances: &DenseMatrix<f64>, k: usize) -> Vec<Vec<usize>> {
    let (m, _) = distances.shape();
    (0..m)
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = (0..m).map(|j| *distances.get((i, j))).collect();
            k_smallest(&row, i, k)
        })
        .collect()
}

/// Union of neighbor lists as canonical, deduplicated, sorted pairs.
pub fn canonical_pairs(neighbors: &[Vec<usize>]) -> Vec<(usize, usize)> {
    let set: BTreeSet<(usize, usize)> = neighbors
        .iter()
        .enumerate()
        .flat_map(|(i, nbrs)| nbrs.iter().map(move |&j| canonical_pair(i, j)))
        .filter(|(i, j)| i != j)
        .collect();
    set.into_iter().collect()
}

/// Chooses which recipe pairs an E-step evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidateSelector {
    pub k: usize,
}

impl CandidateSelector {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    /// Candidate pairs: L1 proxy without `previous`, else the previous
    /// iteration's distances.
    pub fn select(
        &self,
        volumes: &CompositionMatrix,
        previous: Option<&DenseMatrix<f64>>,
    ) -> Vec<(usize, usize)> {
        let neighbors = match previous {
            None => {
                debug!("Selecting candidates by L1 proxy, k={}", self.k);
                l1_neighbors(volumes, self.k)
            }
            Some(distances) => {
                debug!("Selecting candidates by previous EMD, k={}", self.k);
                matrix_neighbors(distances, self.k)
            }
        };
        let pairs = canonical_pairs(&neighbors);
        let m = volumes.nrows();
        info!(
            "Selected {} candidate pairs for {} recipes ({} full pairs)",
            pairs.len(),
            m,
            m * m.saturating_sub(1) / 2
        );
        pairs
    }
}
