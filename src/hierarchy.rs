//! # Ingredient hierarchy and tree-distance ground cost
//!
//! Ingredient rows arrive flat, each carrying a materialized path of ancestor
//! ids (`"/3/17/42/"`) and the cost of the edge to its parent. This module:
//!
//! 1. parses the rows into a [`ParentMap`] (child id → parent id + edge weight),
//!    attaching top-level categories to an implicit synthetic root;
//! 2. validates the relation (no dangling parents, no cycles);
//! 3. builds the symmetric N×N ground cost matrix where entry (i, j) is the
//!    weighted tree path length between ingredients i and j;
//! 4. builds the nested [`IngredientTree`] artifact used for browsing.
//!
//! ## Path distance
//!
//! Each node's weighted ancestor chain is materialized once. For a pair the
//! lowest common ancestor is the first entry of one chain found in the other,
//! and the distance is the sum of both partial chain lengths up to it.
//!
//! The synthetic root is never a matrix entry. Two ingredients below
//! different top-level categories `A` and `B` meet at the root and pay half
//! of each top-level edge: `(w_A + w_B) / 2`. Pairs within one top-level tree
//! never see the root edge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array2;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{EngineError, Result};
use crate::registry::{EntityId, Registry};

/// Id reserved for the implicit root; a parent id equal to it is top-level.
pub const SYNTHETIC_ROOT_ID: EntityId = -1;

/// Edge weight used when a row carries none.
pub const DEFAULT_EDGE_WEIGHT: f64 = 1.0;

/// One ingredient as read from the record layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngredientRow {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    /// `/`-separated ancestor ids ending with `id`.
    #[serde(default, rename = "materialized_path", alias = "path")]
    pub path: String,
    #[serde(default)]
    pub substitution_edge_weight: Option<f64>,
    #[serde(default)]
    pub allow_substitution: bool,
}

impl IngredientRow {
    /// Immediate parent from the materialized path, falling back to
    /// `parent_id` when the path is empty. `None` means top-level.
    pub fn resolve_parent(&self) -> Result<Option<EntityId>> {
        let malformed = || EngineError::MalformedPath {
            id: self.id,
            path: self.path.clone(),
        };

        let segments: Vec<&str> = self
            .path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            return Ok(normalise_parent(self.parent_id));
        }

        let ids = segments
            .iter()
            .map(|s| s.parse::<EntityId>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;
        if ids.last() != Some(&self.id) {
            return Err(malformed());
        }
        if ids.len() == 1 {
            return Ok(None);
        }
        Ok(normalise_parent(Some(ids[ids.len() - 2])))
    }
}

#[inline]
fn normalise_parent(parent: Option<EntityId>) -> Option<EntityId> {
    parent.filter(|&p| p != SYNTHETIC_ROOT_ID)
}

/// Link from a node to its parent.
#[derive(Clone, Debug, PartialEq)]
pub struct ParentLink {
    /// `None` for top-level categories (parent is the synthetic root).
    pub parent: Option<EntityId>,
    /// Substitution cost of traversing from the node to its parent.
    pub weight: f64,
    pub name: String,
}

impl ParentLink {
    pub fn new(parent: Option<EntityId>, weight: f64, name: impl Into<String>) -> Self {
        Self {
            parent: normalise_parent(parent),
            weight,
            name: name.into(),
        }
    }
}

/// Validated child → parent relation. Iteration order is ascending id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParentMap {
    links: BTreeMap<EntityId, ParentLink>,
}

/// Weighted chain from a node up to its top-level ancestor.
#[derive(Clone, Debug)]
struct AncestorPath {
    /// (ancestor id, distance from the node), starting with the node at 0.
    chain: Vec<(EntityId, f64)>,
    /// Distance to the synthetic root, top-level edge counted at half weight.
    to_root: f64,
}

impl ParentMap {
    /// Build and validate from `(id, link)` pairs.
    pub fn from_links<I>(links: I) -> Result<Self>
    where
        I: IntoIterator<Item = (EntityId, ParentLink)>,
    {
        let mut map = BTreeMap::new();
        for (id, link) in links {
            if id == SYNTHETIC_ROOT_ID {
                return Err(EngineError::ReservedRootId(id));
            }
            if map.insert(id, link).is_some() {
                return Err(EngineError::DuplicateIngredient(id));
            }
        }
        let parent_map = Self { links: map };
        parent_map.validate()?;
        Ok(parent_map)
    }

    /// Parse flat ingredient rows.
    pub fn from_rows(rows: &[IngredientRow]) -> Result<Self> {
        let links = rows
            .iter()
            .map(|row| {
                let parent = row.resolve_parent()?;
                let weight = row
                    .substitution_edge_weight
                    .unwrap_or(DEFAULT_EDGE_WEIGHT);
                Ok((row.id, ParentLink::new(parent, weight, row.name.clone())))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_links(links)
    }

    /// Check every parent reference resolves and the relation is acyclic.
    pub fn validate(&self) -> Result<()> {
        for (&id, link) in &self.links {
            if let Some(parent) = link.parent {
                if !self.links.contains_key(&parent) {
                    return Err(EngineError::DanglingParent { child: id, parent });
                }
            }
        }
        for &id in self.links.keys() {
            self.ancestor_path(id)?;
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&ParentLink> {
        self.links.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &ParentLink)> + '_ {
        self.links.iter().map(|(id, link)| (*id, link))
    }

    /// Remove a node. Callers must only remove leaves.
    pub(crate) fn remove(&mut self, id: EntityId) -> Option<ParentLink> {
        self.links.remove(&id)
    }

    /// Parent id → child ids (ascending). Top-level nodes are keyed by
    /// [`SYNTHETIC_ROOT_ID`].
    pub fn children(&self) -> BTreeMap<EntityId, Vec<EntityId>> {
        let mut children: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for (&id, link) in &self.links {
            children
                .entry(link.parent.unwrap_or(SYNTHETIC_ROOT_ID))
                .or_default()
                .push(id);
        }
        children
    }

    /// Ids with no children.
    pub fn leaves(&self) -> BTreeSet<EntityId> {
        let parents: BTreeSet<EntityId> = self.links.values().filter_map(|l| l.parent).collect();
        self.links
            .keys()
            .copied()
            .filter(|id| !parents.contains(id))
            .collect()
    }

    fn ancestor_path(&self, id: EntityId) -> Result<AncestorPath> {
        let mut chain = Vec::new();
        let mut current = id;
        let mut dist = 0.0;
        loop {
            if chain.len() > self.links.len() {
                return Err(EngineError::HierarchyCycle(id));
            }
            chain.push((current, dist));
            let link = self
                .links
                .get(&current)
                .ok_or(EngineError::DanglingParent { child: id, parent: current })?;
            match link.parent {
                None => {
                    return Ok(AncestorPath {
                        chain,
                        to_root: dist + 0.5 * link.weight,
                    })
                }
                Some(parent) => {
                    if !self.links.contains_key(&parent) {
                        return Err(EngineError::DanglingParent {
                            child: current,
                            parent,
                        });
                    }
                    dist += link.weight;
                    current = parent;
                }
            }
        }
    }
}

fn path_distance(a: &AncestorPath, b: &AncestorPath) -> f64 {
    for &(ancestor, db) in &b.chain {
        if let Some(&(_, da)) = a.chain.iter().find(|(id, _)| *id == ancestor) {
            return da + db;
        }
    }
    a.to_root + b.to_root
}

/// Build the pairwise tree-distance matrix and its ingredient registry.
///
/// Registry order is ascending ingredient id. Returns `Ok(None)` for an empty
/// parent map.
pub fn build_cost_matrix(parent_map: &ParentMap) -> Result<Option<(DenseMatrix<f64>, Registry)>> {
    if parent_map.is_empty() {
        info!("Empty ingredient hierarchy, no cost matrix to build");
        return Ok(None);
    }
    let n = parent_map.len();
    info!("Building tree-distance cost matrix for {} ingredients", n);

    let registry = Registry::from_ordered(
        parent_map
            .iter()
            .map(|(id, link)| (id, link.name.clone())),
    )?;

    let paths: Vec<AncestorPath> = parent_map
        .iter()
        .map(|(id, _)| parent_map.ancestor_path(id))
        .collect::<Result<_>>()?;
    let max_depth = paths.iter().map(|p| p.chain.len()).max().unwrap_or(0);
    debug!("Materialized ancestor chains, max depth {}", max_depth);

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            trace!("Cost row {}", i);
            (0..n).map(|j| path_distance(&paths[i], &paths[j])).collect()
        })
        .collect();

    let matrix = DenseMatrix::from_iterator(rows.into_iter().flatten(), n, n, 0);
    info!("Cost matrix built: {}x{}", n, n);
    Ok(Some((matrix, registry)))
}

/// One node of the browsing tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngredientNode {
    pub id: EntityId,
    pub name: String,
    pub children: Vec<IngredientNode>,
    /// Distinct recipes using this ingredient directly.
    pub recipe_count: usize,
    /// Distinct recipes using this ingredient or any descendant.
    pub hierarchical_recipe_count: usize,
}

/// Nested ingredient hierarchy for UI rendering.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct IngredientTree {
    pub roots: Vec<IngredientNode>,
}

impl IngredientTree {
    pub fn from_parent_map(parent_map: &ParentMap) -> Self {
        let children = parent_map.children();
        let roots = build_nodes(parent_map, &children, SYNTHETIC_ROOT_ID);
        Self { roots }
    }

    /// Fill recipe counts from `(recipe_id, ingredient_id)` usage pairs.
    /// Usage of ids absent from the tree is ignored.
    pub fn annotate_recipe_counts<I>(&mut self, usage: I)
    where
        I: IntoIterator<Item = (EntityId, EntityId)>,
    {
        let mut direct: HashMap<EntityId, BTreeSet<EntityId>> = HashMap::new();
        for (recipe_id, ingredient_id) in usage {
            direct.entry(ingredient_id).or_default().insert(recipe_id);
        }
        for root in &mut self.roots {
            annotate(root, &direct);
        }
    }

    pub fn find(&self, id: EntityId) -> Option<&IngredientNode> {
        fn walk(nodes: &[IngredientNode], id: EntityId) -> Option<&IngredientNode> {
            nodes
                .iter()
                .find_map(|n| if n.id == id { Some(n) } else { walk(&n.children, id) })
        }
        walk(&self.roots, id)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

fn build_nodes(
    parent_map: &ParentMap,
    children: &BTreeMap<EntityId, Vec<EntityId>>,
    parent: EntityId,
) -> Vec<IngredientNode> {
    let mut nodes: Vec<IngredientNode> = children
        .get(&parent)
        .map(|ids| {
            ids.iter()
                .filter_map(|&id| {
                    parent_map.get(id).map(|link| IngredientNode {
                        id,
                        name: link.name.clone(),
                        children: build_nodes(parent_map, children, id),
                        recipe_count: 0,
                        hierarchical_recipe_count: 0,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    nodes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    nodes
}

fn annotate(
    node: &mut IngredientNode,
    direct: &HashMap<EntityId, BTreeSet<EntityId>>,
) -> BTreeSet<EntityId> {
    let mut subtree = direct.get(&node.id).cloned().unwrap_or_default();
    node.recipe_count = subtree.len();
    for child in &mut node.children {
        subtree.extend(annotate(child, direct));
    }
    node.hierarchical_recipe_count = subtree.len();
    subtree
}

/// Parse rows into the browsing tree and the validated parent map.
pub fn build_ingredient_tree(rows: &[IngredientRow]) -> Result<(IngredientTree, ParentMap)> {
    info!("Building ingredient tree from {} rows", rows.len());
    let parent_map = ParentMap::from_rows(rows)?;
    let tree = IngredientTree::from_parent_map(&parent_map);
    debug!(
        "Ingredient tree has {} top-level categories and {} leaves",
        tree.roots.len(),
        parent_map.leaves().len()
    );
    Ok((tree, parent_map))
}
