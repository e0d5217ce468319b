//! Nearest-neighbor and similarity reports from finished distance matrices.
//!
//! Reports resolve matrix indices back to ids and names through registries
//! and are plain serde records ready for the serving layer.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::candidates::k_smallest;
use crate::emd::PlanSet;
use crate::error::Result;
use crate::registry::{EntityId, Registry};

/// Finite stand-in for unevaluated distances, as a multiple of the largest
/// finite off-diagonal entry.
pub const SENTINEL_FACTOR: f64 = 2.0;

/// One `(entity, neighbor)` edge of a neighbor report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub id: EntityId,
    pub name: String,
    pub neighbor_id: EntityId,
    pub neighbor_name: String,
    pub distance: f64,
}

/// Ingredient-level mass movement between two recipes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanMove {
    pub from_ingredient_id: EntityId,
    pub to_ingredient_id: EntityId,
    pub mass: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarRecipe {
    pub neighbor_recipe_id: EntityId,
    pub neighbor_name: String,
    pub distance: f64,
    pub transport_plan: Vec<PlanMove>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecipeSimilarity {
    pub recipe_id: EntityId,
    pub recipe_name: String,
    pub neighbors: Vec<SimilarRecipe>,
}

fn row(distances: &DenseMatrix<f64>, i: usize) -> Vec<f64> {
    let (_, m) = distances.shape();
    (0..m).map(|j| *distances.get((i, j))).collect()
}

/// Ranked neighbor indices for `i`: the `k` closest finite entries, either
/// over the full row or only over `restrict`.
fn ranked(row: &[f64], i: usize, k: usize, restrict: Option<&[usize]>) -> Vec<usize> {
    match restrict {
        None => k_smallest(row, i, k)
            .into_iter()
            .filter(|&j| row[j].is_finite())
            .collect(),
        Some(candidates) => {
            let mut c: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&j| j != i && row[j].is_finite())
                .collect();
            c.sort_by(|a, b| row[*a].total_cmp(&row[*b]).then(a.cmp(b)));
            c.dedup();
            c.truncate(k);
            c
        }
    }
}

/// For every entity its `k` nearest others, ascending by distance.
pub fn nearest_neighbors(
    distances: &DenseMatrix<f64>,
    registry: &Registry,
    k: usize,
) -> Result<Vec<NeighborRecord>> {
    registry.validate(distances)?;
    let mut records = Vec::with_capacity(registry.len() * k);
    for (i, id, name) in registry.iter() {
        let r = row(distances, i);
        for j in ranked(&r, i, k, None) {
            let (neighbor_id, neighbor_name) = match registry.entry(j) {
                Some(entry) => entry,
                None => continue,
            };
            records.push(NeighborRecord {
                id,
                name: name.to_string(),
                neighbor_id,
                neighbor_name: neighbor_name.to_string(),
                distance: r[j],
            });
        }
    }
    debug!("Neighbor report with {} records", records.len());
    Ok(records)
}

/// Per-recipe ranked neighbors with a compact transport-plan summary.
///
/// * `plans` - keyed by canonical pair, oriented low → high index; plans are
///   read from the reported recipe towards its neighbor.
/// * `plan_topk` - movements kept per neighbor.
/// * `candidates` - when given, only these pairs are ranked.
pub fn recipe_similarity(
    distances: &DenseMatrix<f64>,
    recipes: &Registry,
    ingredients: &Registry,
    plans: &PlanSet,
    k: usize,
    plan_topk: Option<usize>,
    candidates: Option<&[(usize, usize)]>,
) -> Result<Vec<RecipeSimilarity>> {
    recipes.validate(distances)?;
    let m = recipes.len();

    let restrict: Option<Vec<Vec<usize>>> = candidates.map(|pairs| {
        let mut adj = vec![Vec::new(); m];
        for &(a, b) in pairs {
            if a < m && b < m && a != b {
                adj[a].push(b);
                adj[b].push(a);
            }
        }
        adj
    });

    let mut out = Vec::with_capacity(m);
    for (i, recipe_id, recipe_name) in recipes.iter() {
        let r = row(distances, i);
        let order = ranked(&r, i, k, restrict.as_ref().map(|adj| adj[i].as_slice()));
        let neighbors = order
            .into_iter()
            .filter_map(|j| {
                let (neighbor_recipe_id, neighbor_name) = recipes.entry(j)?;
                let key = if i < j { (i, j) } else { (j, i) };
                let transport_plan = plans
                    .get(&key)
                    .map(|plan| {
                        let oriented = if i < j { plan.clone() } else { plan.transposed() };
                        oriented
                            .sparsify(plan_topk, 0.0)
                            .iter()
                            .filter_map(|e| {
                                Some(PlanMove {
                                    from_ingredient_id: ingredients.id(e.from)?,
                                    to_ingredient_id: ingredients.id(e.to)?,
                                    mass: e.mass,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(SimilarRecipe {
                    neighbor_recipe_id,
                    neighbor_name: neighbor_name.to_string(),
                    distance: r[j],
                    transport_plan,
                })
            })
            .collect();
        out.push(RecipeSimilarity {
            recipe_id,
            recipe_name: recipe_name.to_string(),
            neighbors,
        });
    }
    info!("Recipe similarity report for {} recipes", out.len());
    Ok(out)
}

/// Replace non-finite off-diagonal distances with
/// `SENTINEL_FACTOR × max finite off-diagonal distance` (1.0 if none), and
/// non-finite diagonal entries with zero. Finite entries are left untouched.
pub fn finite_sentinel(distances: &DenseMatrix<f64>) -> DenseMatrix<f64> {
    let (r, c) = distances.shape();
    let values: Vec<f64> = (0..r * c).map(|idx| *distances.get((idx / c, idx % c))).collect();
    let max_finite = values
        .iter()
        .enumerate()
        .filter(|(idx, v)| idx / c != idx % c && v.is_finite())
        .map(|(_, v)| *v)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
    let sentinel = match max_finite {
        Some(m) if m > 0.0 => SENTINEL_FACTOR * m,
        _ => 1.0,
    };

    let mut replaced = 0usize;
    let out: Vec<f64> = values
        .into_iter()
        .enumerate()
        .map(|(idx, v)| {
            if idx / c == idx % c && !v.is_finite() {
                replaced += 1;
                0.0
            } else if v.is_finite() {
                v
            } else {
                replaced += 1;
                sentinel
            }
        })
        .collect();
    if replaced > 0 {
        warn!(
            "Replaced {} non-finite distances with sentinel {:.6}",
            replaced, sentinel
        );
    }
    DenseMatrix::from_iterator(out.into_iter(), r, c, 0)
}
