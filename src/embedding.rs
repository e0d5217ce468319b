//! 2-D recipe-space embedding.
//!
//! The embedding step only needs a finite, symmetric distance matrix; any
//! manifold method can sit behind [`Embedder`]. [`ClassicalMds`] is bundled:
//!
//! 1. square the distances and double-centre them, `B = -½ J D² J`;
//! 2. take the two largest eigenpairs of `B` by shifted power iteration,
//!    deflating `B` and projecting out each eigenvector once it is found;
//!    the second axis restarts from a fresh vector so a repeated top
//!    eigenvalue still yields a second direction;
//! 3. coordinates are `sqrt(max(λ, 0)) · v`.

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::composition::{CompositionMatrix, RowAccess};
use crate::error::{EngineError, Result};
use crate::registry::{EntityId, Registry};

/// Maps an M×M distance matrix to M points in the plane.
pub trait Embedder: Send + Sync {
    fn embed(&self, distances: &DenseMatrix<f64>) -> Result<Vec<[f64; 2]>>;
}

/// Classical (Torgerson) multidimensional scaling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassicalMds {
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for ClassicalMds {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tolerance: 1e-10,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalise(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

// Start vectors whose projected norm falls below this fraction of their
// original norm are skipped.
const MIN_START_RESIDUAL: f64 = 1e-6;

fn project_out(v: &mut [f64], found: &[Vec<f64>]) {
    for u in found {
        let c = dot(v, u);
        v.iter_mut().zip(u).for_each(|(x, y)| *x -= c * y);
    }
}

impl ClassicalMds {
    /// First candidate start with a usable component outside `found`: a
    /// per-axis seeded vector, then the basis vectors.
    fn start_vector(m: usize, axis: usize, found: &[Vec<f64>]) -> Option<Vec<f64>> {
        let seeded: Vec<f64> = (0..m)
            .map(|i| 1.0 + (((i + 1) * (axis + 1)) as f64).sin())
            .collect();
        let basis = (0..m).map(|k| {
            let mut e = vec![0.0; m];
            e[k] = 1.0;
            e
        });
        std::iter::once(seeded).chain(basis).find_map(|mut v| {
            let before = dot(&v, &v).sqrt();
            project_out(&mut v, found);
            let after = normalise(&mut v);
            (after > MIN_START_RESIDUAL * before).then_some(v)
        })
    }

    /// Largest eigenpair of symmetric `b` (m×m, row-major, already deflated
    /// by earlier axes) orthogonal to `found`.
    fn top_eigenpair(
        &self,
        b: &[f64],
        m: usize,
        shift: f64,
        axis: usize,
        found: &[Vec<f64>],
    ) -> (f64, Vec<f64>) {
        let Some(mut v) = Self::start_vector(m, axis, found) else {
            return (0.0, vec![0.0; m]);
        };

        for it in 0..self.max_iter {
            let mut next: Vec<f64> = (0..m)
                .map(|i| dot(&b[i * m..(i + 1) * m], &v) + shift * v[i])
                .collect();
            project_out(&mut next, found);
            if normalise(&mut next) == 0.0 {
                break;
            }
            let delta: f64 = next.iter().zip(&v).map(|(a, c)| (a - c).abs()).sum();
            v = next;
            if delta < self.tolerance {
                trace!("Power iteration converged after {} steps", it + 1);
                break;
            }
        }

        let bv: Vec<f64> = (0..m).map(|i| dot(&b[i * m..(i + 1) * m], &v)).collect();
        (dot(&v, &bv), v)
    }
}

impl Embedder for ClassicalMds {
    fn embed(&self, distances: &DenseMatrix<f64>) -> Result<Vec<[f64; 2]>> {
        let (m, c) = Array::shape(distances);
        if m != c {
            return Err(EngineError::DimensionMismatch {
                rows: m,
                cols: c,
                expected: m,
            });
        }
        if m == 0 {
            return Ok(Vec::new());
        }

        let mut d2 = vec![0.0; m * m];
        for i in 0..m {
            for j in 0..m {
                let d = 0.5 * (*distances.get((i, j)) + *distances.get((j, i)));
                if !d.is_finite() {
                    return Err(EngineError::InvalidParameter {
                        name: "distances",
                        reason: format!("non-finite entry at ({}, {})", i, j),
                    });
                }
                d2[i * m + j] = d * d;
            }
        }

        let row_mean: Vec<f64> = (0..m)
            .map(|i| d2[i * m..(i + 1) * m].iter().sum::<f64>() / m as f64)
            .collect();
        let grand_mean = row_mean.iter().sum::<f64>() / m as f64;
        let mut b: Vec<f64> = (0..m * m)
            .map(|idx| {
                let (i, j) = (idx / m, idx % m);
                -0.5 * (d2[idx] - row_mean[i] - row_mean[j] + grand_mean)
            })
            .collect();

        // Gershgorin bound makes B + shift·I positive semi-definite, so power
        // iteration finds the largest algebraic eigenvalue.
        let shift = (0..m)
            .map(|i| b[i * m..(i + 1) * m].iter().map(|x| x.abs()).sum::<f64>())
            .fold(0.0, f64::max);

        let mut found: Vec<Vec<f64>> = Vec::with_capacity(2);
        let mut coords = vec![[0.0; 2]; m];
        for axis in 0..2.min(m) {
            let (lambda, v) = self.top_eigenpair(&b, m, shift, axis, &found);
            debug!("MDS axis {}: eigenvalue {:.6}", axis, lambda);
            let scale = lambda.max(0.0).sqrt();
            for i in 0..m {
                coords[i][axis] = scale * v[i];
            }
            // Deflate: B <- B - λ v vᵀ
            for (idx, x) in b.iter_mut().enumerate() {
                *x -= lambda * v[idx / m] * v[idx % m];
            }
            found.push(v);
        }
        Ok(coords)
    }
}

/// One recipe placed in the plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecipePoint {
    pub recipe_id: EntityId,
    pub recipe_name: String,
    pub x: f64,
    pub y: f64,
    /// Ingredient names, largest volume first.
    pub ingredients: Vec<String>,
}

/// Embed recipes and attach their ingredient lists.
pub fn embed_recipes(
    embedder: &dyn Embedder,
    distances: &DenseMatrix<f64>,
    recipes: &Registry,
    volumes: &CompositionMatrix,
    ingredients: &Registry,
) -> Result<Vec<RecipePoint>> {
    recipes.validate(distances)?;
    let coords = embedder.embed(distances)?;
    info!("Embedded {} recipes in 2-D", coords.len());

    Ok(recipes
        .iter()
        .zip(coords)
        .map(|((i, recipe_id, recipe_name), [x, y])| {
            let mut support = volumes.row_support(i);
            support.sort_by(|a, b| {
                b.1.total_cmp(&a.1)
                    .then_with(|| ingredients.name(a.0).cmp(&ingredients.name(b.0)))
            });
            RecipePoint {
                recipe_id,
                recipe_name: recipe_name.to_string(),
                x,
                y,
                ingredients: support
                    .into_iter()
                    .filter_map(|(j, _)| ingredients.name(j).map(str::to_string))
                    .collect(),
            }
        })
        .collect())
}
