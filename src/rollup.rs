//! Rollup of interchangeable leaf ingredients into their parent.
//!
//! A leaf flagged as substitutable whose parent is a real category (not the
//! synthetic root) is represented by that parent before any matrix is built.
//! Rolling up shrinks the ingredient dimension and merges recipe rows that
//! land on the same representative.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::hierarchy::{IngredientRow, ParentMap};
use crate::registry::EntityId;
use crate::volume::VolumeRow;

/// Child id → representative parent id.
pub type RollupMap = BTreeMap<EntityId, EntityId>;

/// Map every substitutable leaf with a non-root parent to that parent.
///
/// Ids missing from `parent_map` are ignored.
pub fn build_rollup_map(ingredients: &[IngredientRow], parent_map: &ParentMap) -> RollupMap {
    let leaves = parent_map.leaves();
    let rollup: RollupMap = ingredients
        .iter()
        .filter(|row| row.allow_substitution && leaves.contains(&row.id))
        .filter_map(|row| {
            parent_map
                .get(row.id)
                .and_then(|link| link.parent)
                .map(|parent| (row.id, parent))
        })
        .collect();
    info!(
        "Rollup maps {} of {} ingredients onto parents",
        rollup.len(),
        parent_map.len()
    );
    rollup
}

/// Rewrite ingredient ids through `rollup` and merge rows sharing
/// `(recipe_id, ingredient_id)` by summing their volume fraction.
///
/// Output keeps the order of first appearance.
pub fn apply_rollup(rows: &[VolumeRow], rollup: &RollupMap) -> Vec<VolumeRow> {
    let mut merged: Vec<VolumeRow> = Vec::with_capacity(rows.len());
    let mut slots: HashMap<(EntityId, EntityId), usize> = HashMap::with_capacity(rows.len());

    for row in rows {
        let ingredient_id = rollup
            .get(&row.ingredient_id)
            .copied()
            .unwrap_or(row.ingredient_id);
        match slots.get(&(row.recipe_id, ingredient_id)) {
            Some(&slot) => merged[slot].volume_fraction += row.volume_fraction,
            None => {
                slots.insert((row.recipe_id, ingredient_id), merged.len());
                merged.push(VolumeRow {
                    ingredient_id,
                    ..row.clone()
                });
            }
        }
    }

    debug!("Rollup merged {} rows into {}", rows.len(), merged.len());
    merged
}

/// Drop rolled-up leaves so the cost matrix covers representatives only.
pub fn prune_parent_map(parent_map: &ParentMap, rollup: &RollupMap) -> ParentMap {
    let mut pruned = parent_map.clone();
    for child in rollup.keys() {
        pruned.remove(*child);
    }
    debug!(
        "Pruned parent map from {} to {} ingredients",
        parent_map.len(),
        pruned.len()
    );
    pruned
}
