//! Error taxonomy for the substitution engine.
//!
//! Structural defects in the input (hierarchy cycles, dangling parents,
//! malformed registries, shape mismatches) fail fast. Degenerate but valid
//! inputs (no ingredients, no recipes, zero-volume recipes) are not errors:
//! the builders return empty values for those.

use thiserror::Error;

use crate::registry::EntityId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A registry was constructed from an empty entry list.
    #[error("registry input is empty")]
    EmptyRegistry,

    /// Registry indices must be exactly `0..N-1`.
    #[error("registry indices are not contiguous: expected index {expected}, found {found}")]
    NonContiguousIndex { expected: usize, found: usize },

    #[error("duplicate id {0} in registry")]
    DuplicateId(EntityId),

    /// A matrix handed to a registry-aligned component has the wrong shape.
    #[error("matrix shape {rows}x{cols} does not match expected {expected}x{expected}")]
    DimensionMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
    },

    #[error("duplicate ingredient id {0} in hierarchy rows")]
    DuplicateIngredient(EntityId),

    #[error("ingredient rows may not use the synthetic root id {0}")]
    ReservedRootId(EntityId),

    #[error("malformed materialized path {path:?} for ingredient {id}")]
    MalformedPath { id: EntityId, path: String },

    #[error("cycle detected in ingredient hierarchy at id {0}")]
    HierarchyCycle(EntityId),

    #[error("ingredient {child} references unknown parent {parent}")]
    DanglingParent { child: EntityId, parent: EntityId },

    #[error("ingredient {ingredient_id} referenced by recipe {recipe_id} is not in the ingredient registry")]
    UnknownIngredient {
        ingredient_id: EntityId,
        recipe_id: EntityId,
    },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// A serialised artifact could not be decoded.
    #[error("malformed cost matrix artifact: {0}")]
    MalformedArtifact(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to serialise artifact: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
