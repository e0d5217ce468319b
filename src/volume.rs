//! Recipe × ingredient volume matrix.
//!
//! Recipes are probability distributions over ingredients: each matrix row
//! holds volume fractions summing to 1. Rows are placed by the ingredient
//! registry (columns) and a recipe registry assigned in first-appearance
//! order unless the caller supplies one.
//!
//! [`normalize_recipe_volumes`] converts raw amounts and units into the
//! fraction rows this builder consumes.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array2;
use smartcore::linalg::basic::matrix::DenseMatrix;
use sprs::{CsMat, TriMat};

use crate::composition::{CompositionMatrix, Storage};
use crate::error::{EngineError, Result};
use crate::registry::{EntityId, Registry};

/// Fixed volume for "to top" amounts.
pub const TO_TOP_ML: f64 = 90.0;
/// Fixed volume for "to rinse" amounts.
pub const TO_RINSE_ML: f64 = 5.0;
/// Sentinel volume for countable or unconvertible amounts.
pub const SENTINEL_ML: f64 = 1.0;

/// Volume fraction of one ingredient in one recipe.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VolumeRow {
    pub recipe_id: EntityId,
    pub recipe_name: String,
    pub ingredient_id: EntityId,
    pub volume_fraction: f64,
}

/// Recipe ingredient as stored, before unit normalisation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawRecipeRow {
    pub recipe_id: EntityId,
    pub recipe_name: String,
    pub ingredient_id: EntityId,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, rename = "unit_to_ml_conversion", alias = "unit_to_ml")]
    pub unit_to_ml: Option<f64>,
}

impl RawRecipeRow {
    /// Volume in millilitres. Countable and unconvertible amounts map to
    /// [`SENTINEL_ML`] regardless of the amount.
    pub fn volume_ml(&self) -> f64 {
        let amount = self.amount.filter(|a| a.is_finite() && *a >= 0.0).unwrap_or(1.0);
        let unit = self
            .unit
            .as_deref()
            .map(|u| u.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match unit.as_str() {
            "to top" => TO_TOP_ML,
            "to rinse" => TO_RINSE_ML,
            "each" => SENTINEL_ML,
            _ => match self.unit_to_ml {
                Some(factor) if factor.is_finite() && factor > 0.0 => amount * factor,
                _ => SENTINEL_ML,
            },
        }
    }
}

/// Convert raw rows into per-recipe volume fractions.
///
/// Duplicate `(recipe, ingredient)` rows are summed. Recipes whose total
/// volume is zero are dropped.
pub fn normalize_recipe_volumes(rows: &[RawRecipeRow]) -> Vec<VolumeRow> {
    let mut order: Vec<EntityId> = Vec::new();
    let mut per_recipe: HashMap<EntityId, (String, Vec<(EntityId, f64)>)> = HashMap::new();
    for row in rows {
        let entry = per_recipe.entry(row.recipe_id).or_insert_with(|| {
            order.push(row.recipe_id);
            (row.recipe_name.clone(), Vec::new())
        });
        let volume = row.volume_ml();
        match entry.1.iter_mut().find(|(id, _)| *id == row.ingredient_id) {
            Some((_, v)) => *v += volume,
            None => entry.1.push((row.ingredient_id, volume)),
        }
    }

    let mut out = Vec::with_capacity(rows.len());
    for recipe_id in order {
        let Some((name, parts)) = per_recipe.remove(&recipe_id) else {
            continue;
        };
        let total: f64 = parts.iter().map(|(_, v)| v).sum();
        if total <= 0.0 {
            warn!("Recipe {} has zero total volume, skipping", recipe_id);
            continue;
        }
        out.extend(parts.into_iter().map(|(ingredient_id, v)| VolumeRow {
            recipe_id,
            recipe_name: name.clone(),
            ingredient_id,
            volume_fraction: v / total,
        }));
    }
    out
}

/// Built volume matrix with its recipe registry.
#[derive(Clone, Debug)]
pub struct RecipeVolumes {
    pub matrix: CompositionMatrix,
    pub recipes: Registry,
}

/// Build the M×N volume matrix.
///
/// * `recipe_order` - optional explicit recipe id order; recipes absent from it
///   are appended in first-appearance order, ids without rows are skipped.
///
/// Fails if a row references an ingredient missing from `ingredients`.
/// Returns `Ok(None)` when no recipe has positive volume.
pub fn build_volume_matrix(
    rows: &[VolumeRow],
    ingredients: &Registry,
    recipe_order: Option<&[EntityId]>,
    storage: Storage,
) -> Result<Option<RecipeVolumes>> {
    info!(
        "Building volume matrix from {} rows over {} ingredients",
        rows.len(),
        ingredients.len()
    );

    let mut names: HashMap<EntityId, String> = HashMap::new();
    let mut seen: Vec<EntityId> = Vec::new();
    let mut cells: HashMap<EntityId, BTreeMap<usize, f64>> = HashMap::new();
    for row in rows {
        let col = ingredients
            .index(row.ingredient_id)
            .ok_or(EngineError::UnknownIngredient {
                ingredient_id: row.ingredient_id,
                recipe_id: row.recipe_id,
            })?;
        if !names.contains_key(&row.recipe_id) {
            names.insert(row.recipe_id, row.recipe_name.clone());
            seen.push(row.recipe_id);
        }
        *cells.entry(row.recipe_id).or_default().entry(col).or_insert(0.0) += row.volume_fraction;
    }

    let mut ordered: Vec<EntityId> = Vec::with_capacity(seen.len());
    let mut placed: HashSet<EntityId> = HashSet::with_capacity(seen.len());
    for id in recipe_order.unwrap_or_default().iter().copied().chain(seen) {
        if names.contains_key(&id) && placed.insert(id) {
            ordered.push(id);
        }
    }

    let mut kept: Vec<(EntityId, String, BTreeMap<usize, f64>)> = Vec::with_capacity(ordered.len());
    for id in ordered {
        let row = cells.remove(&id).unwrap_or_default();
        let total: f64 = row.values().filter(|v| **v > 0.0).sum();
        if total <= 0.0 {
            warn!("Recipe {} has zero total volume, skipping", id);
            continue;
        }
        let normalised = row
            .into_iter()
            .filter(|(_, v)| *v > 0.0)
            .map(|(j, v)| (j, v / total))
            .collect();
        let name = names.remove(&id).unwrap_or_default();
        kept.push((id, name, normalised));
    }

    if kept.is_empty() {
        info!("No recipes with positive volume, volume matrix is empty");
        return Ok(None);
    }

    let (m, n) = (kept.len(), ingredients.len());
    let matrix = match storage {
        Storage::Dense => {
            let mut flat = vec![0.0; m * n];
            for (i, (_, _, row)) in kept.iter().enumerate() {
                for (&j, &v) in row {
                    flat[i * n + j] = v;
                }
            }
            CompositionMatrix::Dense(DenseMatrix::from_iterator(flat.into_iter(), m, n, 0))
        }
        Storage::Sparse => {
            let mut triplets = TriMat::new((m, n));
            for (i, (_, _, row)) in kept.iter().enumerate() {
                for (&j, &v) in row {
                    triplets.add_triplet(i, j, v);
                }
            }
            let csr: CsMat<f64> = triplets.to_csr();
            debug!("Sparse volume matrix with {} non-zeros", csr.nnz());
            CompositionMatrix::Sparse(csr)
        }
    };

    let recipes = Registry::from_ordered(kept.into_iter().map(|(id, name, _)| (id, name)))?;
    info!("Volume matrix built: {}x{} ({:?})", m, n, storage);
    Ok(Some(RecipeVolumes { matrix, recipes }))
}
