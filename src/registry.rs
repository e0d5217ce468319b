//! Stable index ↔ id ↔ name lookup table.
//!
//! Every matrix in this crate is a plain numeric array; rows and columns are
//! tied back to ingredients and recipes only through a `Registry`. A registry
//! is built once from `(index, id, name)` triples and never mutated.
//!
//! - index → (id, name): direct slice access
//! - id → index: hash map built at construction
//! - name → index: hash map built lazily on the first name-based query
//!
//! Names are expected to be unique but duplicates are tolerated with a
//! warning; name lookups then resolve to the lowest index carrying the name.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::{debug, trace, warn};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{EngineError, Result};

/// Identifier of an ingredient or recipe in the record layer.
pub type EntityId = i64;

#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<(EntityId, String)>,
    by_id: HashMap<EntityId, usize>,
    by_name: OnceLock<HashMap<String, usize>>,
}

impl Registry {
    /// Build from `(index, id, name)` triples in any order.
    ///
    /// Fails on empty input, on indices that are not exactly `0..N-1`, and on
    /// duplicate ids.
    pub fn new(triples: Vec<(usize, EntityId, String)>) -> Result<Self> {
        if triples.is_empty() {
            return Err(EngineError::EmptyRegistry);
        }

        let mut triples = triples;
        triples.sort_by_key(|(idx, _, _)| *idx);

        let mut entries = Vec::with_capacity(triples.len());
        let mut by_id = HashMap::with_capacity(triples.len());
        for (expected, (idx, id, name)) in triples.into_iter().enumerate() {
            if idx != expected {
                return Err(EngineError::NonContiguousIndex { expected, found: idx });
            }
            if by_id.insert(id, idx).is_some() {
                return Err(EngineError::DuplicateId(id));
            }
            entries.push((id, name));
        }

        let registry = Self {
            entries,
            by_id,
            by_name: OnceLock::new(),
        };
        registry.warn_duplicate_names();
        debug!("Registry built with {} entries", registry.len());
        Ok(registry)
    }

    /// Build from `(id, name)` pairs, assigning indices in iteration order.
    pub fn from_ordered<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (EntityId, String)>,
    {
        Self::new(
            pairs
                .into_iter()
                .enumerate()
                .map(|(idx, (id, name))| (idx, id, name))
                .collect(),
        )
    }

    fn warn_duplicate_names(&self) {
        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(self.entries.len());
        for (idx, (_, name)) in self.entries.iter().enumerate() {
            if let Some(first) = seen.insert(name.as_str(), idx) {
                warn!(
                    "Duplicate registry name {:?} at indices {} and {}",
                    name, first, idx
                );
            }
        }
    }

    fn names(&self) -> &HashMap<String, usize> {
        self.by_name.get_or_init(|| {
            trace!("Building name index for {} entries", self.entries.len());
            let mut map = HashMap::with_capacity(self.entries.len());
            for (idx, (_, name)) in self.entries.iter().enumerate() {
                map.entry(name.clone()).or_insert(idx);
            }
            map
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed registry; kept for API symmetry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<(EntityId, &str)> {
        self.entries.get(index).map(|(id, name)| (*id, name.as_str()))
    }

    pub fn id(&self, index: usize) -> Option<EntityId> {
        self.entries.get(index).map(|(id, _)| *id)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(_, name)| name.as_str())
    }

    pub fn index(&self, id: EntityId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn name_by_id(&self, id: EntityId) -> Option<&str> {
        self.index(id).and_then(|idx| self.name(idx))
    }

    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.names().get(name).copied()
    }

    pub fn id_by_name(&self, name: &str) -> Option<EntityId> {
        self.index_by_name(name).and_then(|idx| self.id(idx))
    }

    /// Ids in index order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, EntityId, &str)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, (id, name))| (idx, *id, name.as_str()))
    }

    /// Check that `matrix` is square with one row per registry entry.
    pub fn validate(&self, matrix: &DenseMatrix<f64>) -> Result<()> {
        self.validate_shape(matrix.shape())
    }

    pub fn validate_shape(&self, (rows, cols): (usize, usize)) -> Result<()> {
        if rows != self.len() || cols != self.len() {
            return Err(EngineError::DimensionMismatch {
                rows,
                cols,
                expected: self.len(),
            });
        }
        Ok(())
    }
}
