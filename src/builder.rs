use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::composition::Storage;
use crate::em::{EmLearner, EmParams};
use crate::embedding::{embed_recipes, ClassicalMds, Embedder, RecipePoint};
use crate::error::{EngineError, Result};
use crate::hierarchy::{build_cost_matrix, build_ingredient_tree, IngredientRow, IngredientTree};
use crate::registry::{EntityId, Registry};
use crate::reporter::{finite_sentinel, nearest_neighbors, recipe_similarity, NeighborRecord, RecipeSimilarity};
use crate::rollup::{apply_rollup, build_rollup_map, prune_parent_map};
use crate::volume::{build_volume_matrix, VolumeRow};

/// Starting point for the EM learner.
#[derive(Clone, Debug, Default)]
pub enum InitialCost {
    /// Tree distance over the (rolled-up) hierarchy.
    #[default]
    TreeDistance,
    /// Caller-supplied matrix aligned with the rolled-up ingredient registry
    /// (ascending ingredient id).
    Matrix(DenseMatrix<f64>),
}

/// Learned ingredient cost matrix with its column ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostMatrixArtifact {
    pub ingredient_ids: Vec<EntityId>,
    pub dim: usize,
    /// Row-major `dim × dim` values.
    pub values: Vec<f64>,
}

impl CostMatrixArtifact {
    pub fn from_matrix(matrix: &DenseMatrix<f64>, registry: &Registry) -> Result<Self> {
        registry.validate(matrix)?;
        let dim = registry.len();
        let values = (0..dim * dim)
            .map(|idx| *matrix.get((idx / dim, idx % dim)))
            .collect();
        Ok(Self {
            ingredient_ids: registry.ids(),
            dim,
            values,
        })
    }

    pub fn to_matrix(&self) -> DenseMatrix<f64> {
        DenseMatrix::from_iterator(self.values.iter().copied(), self.dim, self.dim, 0)
    }

    /// Binary layout: `dim` as u64, `dim` ids as i64, `dim²` f64 row-major,
    /// all little-endian.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 * self.dim + 8 * self.values.len());
        out.extend_from_slice(&(self.dim as u64).to_le_bytes());
        for id in &self.ingredient_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        let word = |k: usize| -> Option<[u8; 8]> {
            bytes.get(8 * k..8 * (k + 1)).and_then(|s| s.try_into().ok())
        };

        let header = word(0)
            .map(u64::from_le_bytes)
            .ok_or_else(|| EngineError::MalformedArtifact("missing header".to_string()))?;
        let dim = usize::try_from(header)
            .map_err(|_| EngineError::MalformedArtifact(format!("dim {} does not fit in usize", header)))?;
        let expected = dim
            .checked_mul(dim)
            .and_then(|sq| sq.checked_add(dim))
            .and_then(|words| words.checked_add(1))
            .and_then(|words| words.checked_mul(8))
            .ok_or_else(|| EngineError::MalformedArtifact(format!("dim {} overflows the byte length", dim)))?;
        if bytes.len() != expected {
            return Err(EngineError::MalformedArtifact(format!(
                "expected {} bytes for dim {}, got {}",
                expected,
                dim,
                bytes.len()
            )));
        }
        let ingredient_ids = (1..=dim)
            .filter_map(|k| word(k).map(i64::from_le_bytes))
            .collect();
        let values = (1 + dim..1 + dim + dim * dim)
            .filter_map(|k| word(k).map(f64::from_le_bytes))
            .collect();
        Ok(Self {
            ingredient_ids,
            dim,
            values,
        })
    }
}

/// Everything one analytics run publishes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsArtifacts {
    pub ingredient_tree: IngredientTree,
    pub ingredient_neighbors: Vec<NeighborRecord>,
    pub recipe_embedding: Vec<RecipePoint>,
    pub recipe_similarity: Vec<RecipeSimilarity>,
    pub learned_cost: Option<CostMatrixArtifact>,
    pub convergence: Vec<f64>,
}

impl AnalyticsArtifacts {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct SubstitutionSpaceBuilder {
    em: EmParams,
    // neighbors per entity in the published reports
    report_k: usize,
    plan_summary_topk: Option<usize>,
    storage: Storage,
    rollup: bool,
    initial_cost: InitialCost,
    embedder: Box<dyn Embedder>,
}

impl Default for SubstitutionSpaceBuilder {
    fn default() -> Self {
        debug!("Creating SubstitutionSpaceBuilder with default parameters");
        Self {
            em: EmParams::default(),
            report_k: 10,
            plan_summary_topk: Some(3),
            storage: Storage::Sparse,
            rollup: true,
            initial_cost: InitialCost::TreeDistance,
            embedder: Box::new(ClassicalMds::default()),
        }
    }
}

impl SubstitutionSpaceBuilder {
    pub fn new() -> Self {
        info!("Initializing new SubstitutionSpaceBuilder");
        Self::default()
    }

    // -------------------- EM configuration --------------------

    /// Replace all EM parameters at once.
    pub fn with_em_params(mut self, params: EmParams) -> Self {
        info!("Configuring EM: {:?}", params);
        self.em = params;
        self
    }

    /// Iteration cap and convergence tolerance.
    pub fn with_iterations(mut self, iters: usize, tolerance: f64) -> Self {
        info!("Configuring EM iterations: iters={}, tolerance={}", iters, tolerance);
        self.em.iters = iters;
        self.em.tolerance = tolerance;
        self
    }

    /// M-step neighbor count and weighting temperature.
    pub fn with_neighbor_weighting(mut self, k: usize, beta: f64) -> Self {
        info!("Configuring M-step neighbors: k={}, beta={}", k, beta);
        self.em.k = k;
        self.em.beta = beta;
        self
    }

    pub fn with_plan_sparsity(mut self, topk: Option<usize>, minfrac: f64) -> Self {
        info!("Configuring plan sparsity: topk={:?}, minfrac={}", topk, minfrac);
        self.em.plan_topk = topk;
        self.em.plan_minfrac = minfrac;
        self
    }

    /// Laplace smoothing and median rescaling target of the log-odds update.
    pub fn with_blosum(mut self, alpha: f64, median_target: f64) -> Self {
        info!("Configuring log-odds update: alpha={}, median_target={}", alpha, median_target);
        self.em.blosum_alpha = alpha;
        self.em.median_target = median_target;
        self
    }

    /// Restrict E-steps to `k` candidate neighbors per recipe.
    pub fn with_candidates(mut self, k: Option<usize>) -> Self {
        info!("Configuring candidate selection: k={:?}", k);
        self.em.candidate_k = k;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        info!("Configuring E-step workers: {}", workers);
        self.em.workers = workers;
        self
    }

    // -------------------- Inputs and outputs --------------------

    pub fn with_initial_cost(mut self, initial: InitialCost) -> Self {
        info!(
            "Configuring initial cost: {}",
            match initial {
                InitialCost::TreeDistance => "tree distance",
                InitialCost::Matrix(_) => "caller matrix",
            }
        );
        self.initial_cost = initial;
        self
    }

    pub fn with_rollup(mut self, rollup: bool) -> Self {
        info!("Setting rollup: {}", rollup);
        self.rollup = rollup;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        info!("Setting volume storage: {:?}", storage);
        self.storage = storage;
        self
    }

    /// Neighbors per entity and plan movements per neighbor in reports.
    pub fn with_report(mut self, k: usize, plan_topk: Option<usize>) -> Self {
        info!("Configuring reports: k={}, plan_topk={:?}", k, plan_topk);
        self.report_k = k;
        self.plan_summary_topk = plan_topk;
        self
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        info!("Setting custom embedder");
        self.embedder = embedder;
        self
    }

    // -------------------- Build --------------------

    /// Run the whole batch: rollup, tree cost, volume matrix, EM, reports.
    ///
    /// Empty ingredient or recipe input (or recipes with no positive volume)
    /// yields the default, empty artifact set.
    pub fn build(self, ingredients: &[IngredientRow], recipes: &[VolumeRow]) -> Result<AnalyticsArtifacts> {
        self.em.validate()?;
        if self.report_k == 0 {
            return Err(EngineError::InvalidParameter {
                name: "report_k",
                reason: "must be at least 1".to_string(),
            });
        }
        if ingredients.is_empty() || recipes.is_empty() {
            info!("Empty ingredient or recipe input, returning empty artifacts");
            return Ok(AnalyticsArtifacts::default());
        }
        info!(
            "Building substitution space from {} ingredients and {} recipe rows",
            ingredients.len(),
            recipes.len()
        );

        // 1) Hierarchy and browsing tree
        let (mut tree, parent_map) = build_ingredient_tree(ingredients)?;
        tree.annotate_recipe_counts(recipes.iter().map(|r| (r.recipe_id, r.ingredient_id)));
        let mut artifacts = AnalyticsArtifacts {
            ingredient_tree: tree,
            ..AnalyticsArtifacts::default()
        };

        // 2) Rollup of substitutable leaves
        let (parent_map, rows) = if self.rollup {
            let rollup = build_rollup_map(ingredients, &parent_map);
            (prune_parent_map(&parent_map, &rollup), apply_rollup(recipes, &rollup))
        } else {
            (parent_map, recipes.to_vec())
        };

        // 3) Ground cost over representatives
        let Some((tree_cost, ingredient_registry)) = build_cost_matrix(&parent_map)? else {
            info!("No ingredients left after rollup, returning empty artifacts");
            return Ok(AnalyticsArtifacts::default());
        };
        let initial = match self.initial_cost {
            InitialCost::TreeDistance => tree_cost,
            InitialCost::Matrix(m) => {
                ingredient_registry.validate(&m)?;
                m
            }
        };
        trace!("Initial cost shape {:?}", initial.shape());

        // 4) Recipe compositions
        let Some(volumes) = build_volume_matrix(&rows, &ingredient_registry, None, self.storage)? else {
            info!("No recipes with positive volume, returning empty artifacts");
            return Ok(AnalyticsArtifacts::default());
        };

        // 5) EM
        let learner = EmLearner::new(self.em.clone())?;
        let result = learner.fit(&volumes.matrix, &initial)?;

        // 6) Reports
        let distances = finite_sentinel(&result.distances);
        artifacts.ingredient_neighbors =
            nearest_neighbors(&result.cost, &ingredient_registry, self.report_k)?;
        artifacts.recipe_similarity = recipe_similarity(
            &distances,
            &volumes.recipes,
            &ingredient_registry,
            &result.plans,
            self.report_k,
            self.plan_summary_topk,
            result.candidates.as_deref(),
        )?;
        artifacts.recipe_embedding = embed_recipes(
            self.embedder.as_ref(),
            &distances,
            &volumes.recipes,
            &volumes.matrix,
            &ingredient_registry,
        )?;
        artifacts.learned_cost = Some(CostMatrixArtifact::from_matrix(
            &result.cost,
            &ingredient_registry,
        )?);
        artifacts.convergence = result.convergence;

        info!(
            "Substitution space built: {} ingredients, {} recipes, {} EM iterations (converged: {})",
            ingredient_registry.len(),
            volumes.recipes.len(),
            artifacts.convergence.len(),
            result.converged
        );
        Ok(artifacts)
    }
}
