//! # barspace
//!
//! Ingredient substitutability and recipe similarity for cocktail catalogs.
//!
//! Recipes are volume distributions over ingredients. The distance between
//! two recipes is the Earth Mover's Distance under an ingredient ground cost;
//! the ground cost starts as the weighted distance in the ingredient
//! hierarchy and is refined by expectation-maximization over the transport
//! plans recipes induce on each other.
//!
//! ```ignore
//! use barspace::builder::SubstitutionSpaceBuilder;
//!
//! let artifacts = SubstitutionSpaceBuilder::new()
//!     .with_iterations(5, 1e-3)
//!     .with_candidates(Some(20))
//!     .build(&ingredient_rows, &volume_rows)?;
//! println!("{}", artifacts.to_json()?);
//! ```

pub mod builder;
pub mod candidates;
pub mod composition;
pub mod em;
pub mod embedding;
pub mod emd;
pub mod error;
pub mod hierarchy;
pub mod parallel;
pub mod registry;
pub mod reporter;
pub mod rollup;
pub mod volume;

pub use builder::{AnalyticsArtifacts, CostMatrixArtifact, SubstitutionSpaceBuilder};
pub use error::{EngineError, Result};
pub use registry::{EntityId, Registry};

#[cfg(test)]
mod tests;
