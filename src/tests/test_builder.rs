use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::builder::*;
use crate::composition::Storage;
use crate::embedding::Embedder;
use crate::error::{EngineError, Result};
use crate::tests::test_helpers::{bar_hierarchy, bar_recipes, uniform_cost};

fn builder() -> SubstitutionSpaceBuilder {
    SubstitutionSpaceBuilder::new()
        .with_iterations(3, 1e-4)
        .with_neighbor_weighting(2, 1.0)
        .with_workers(2)
        .with_report(3, Some(2))
}

#[test]
fn test_minimal_build() {
    let artifacts = builder().build(&bar_hierarchy(), &bar_recipes()).unwrap();

    assert_eq!(artifacts.ingredient_tree.roots.len(), 4);
    assert_eq!(artifacts.recipe_similarity.len(), 6);
    assert_eq!(artifacts.recipe_embedding.len(), 6);
    assert!(!artifacts.convergence.is_empty());
    assert!(artifacts.convergence.len() <= 3);

    // gin leaves are rolled into "Gin": 15 - 2 ingredients
    let cost = artifacts.learned_cost.as_ref().unwrap();
    assert_eq!(cost.dim, 13);
    assert!(!cost.ingredient_ids.contains(&100));
    assert!(cost.ingredient_ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(artifacts.ingredient_neighbors.len(), 13 * 3);

    // the tree still reports pre-rollup usage
    let london = artifacts.ingredient_tree.find(100).unwrap();
    assert_eq!(london.recipe_count, 2);
}

#[test]
fn test_similarity_is_finite_and_sorted() {
    let artifacts = builder()
        .with_candidates(Some(2))
        .build(&bar_hierarchy(), &bar_recipes())
        .unwrap();
    for recipe in &artifacts.recipe_similarity {
        assert!(recipe.neighbors.len() <= 3);
        assert!(recipe.neighbors.iter().all(|n| n.distance.is_finite()));
        assert!(recipe
            .neighbors
            .windows(2)
            .all(|w| w[0].distance <= w[1].distance));
        assert!(recipe
            .neighbors
            .iter()
            .all(|n| n.neighbor_recipe_id != recipe.recipe_id && n.transport_plan.len() <= 2));
    }
    assert!(artifacts
        .recipe_embedding
        .iter()
        .all(|p| p.x.is_finite() && p.y.is_finite()));
}

#[test]
fn test_empty_inputs_give_empty_artifacts() {
    let none = builder().build(&[], &bar_recipes()).unwrap();
    assert_eq!(none, AnalyticsArtifacts::default());

    let no_recipes = builder().build(&bar_hierarchy(), &[]).unwrap();
    assert_eq!(no_recipes, AnalyticsArtifacts::default());
    assert!(no_recipes.learned_cost.is_none());
}

#[test]
fn test_without_rollup() {
    let artifacts = builder()
        .with_rollup(false)
        .with_storage(Storage::Dense)
        .build(&bar_hierarchy(), &bar_recipes())
        .unwrap();
    assert_eq!(artifacts.learned_cost.unwrap().dim, 15);
}

#[test]
fn test_invalid_configuration() {
    let err = builder()
        .with_blosum(0.0, 1.0)
        .build(&bar_hierarchy(), &bar_recipes())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameter { name: "blosum_alpha", .. }));

    let err = builder()
        .with_initial_cost(InitialCost::Matrix(uniform_cost(3, 1.0)))
        .build(&bar_hierarchy(), &bar_recipes())
        .unwrap_err();
    assert!(matches!(err, EngineError::DimensionMismatch { expected: 13, .. }));
}

struct Origin;

impl Embedder for Origin {
    fn embed(&self, distances: &DenseMatrix<f64>) -> Result<Vec<[f64; 2]>> {
        use smartcore::linalg::basic::arrays::Array;
        Ok(vec![[0.0, 0.0]; distances.shape().0])
    }
}

#[test]
fn test_custom_embedder_and_initial_cost() {
    let artifacts = builder()
        .with_embedder(Box::new(Origin))
        .with_initial_cost(InitialCost::Matrix(uniform_cost(13, 1.0)))
        .build(&bar_hierarchy(), &bar_recipes())
        .unwrap();
    assert!(artifacts.recipe_embedding.iter().all(|p| p.x == 0.0 && p.y == 0.0));
}

#[test]
fn test_artifact_encodings() {
    let artifacts = builder().build(&bar_hierarchy(), &bar_recipes()).unwrap();

    let json = artifacts.to_json().unwrap();
    let back: AnalyticsArtifacts = serde_json::from_str(&json).unwrap();
    assert_eq!(back.recipe_similarity.len(), artifacts.recipe_similarity.len());
    assert_eq!(back.ingredient_tree, artifacts.ingredient_tree);

    let cost = artifacts.learned_cost.unwrap();
    let bytes = cost.to_le_bytes();
    assert_eq!(bytes.len(), 8 * (1 + 13 + 13 * 13));
    assert_eq!(&bytes[..8], &13u64.to_le_bytes());
    assert_eq!(CostMatrixArtifact::from_le_bytes(&bytes).unwrap(), cost);
    assert!(CostMatrixArtifact::from_le_bytes(&bytes[..20]).is_err());

    let matrix = cost.to_matrix();
    use smartcore::linalg::basic::arrays::Array;
    assert_eq!(*matrix.get((0, 1)), cost.values[1]);
}

#[test]
fn test_corrupt_cost_matrix_bytes() {
    let mut huge = u64::MAX.to_le_bytes().to_vec();
    huge.extend_from_slice(&[0u8; 16]);
    assert!(matches!(
        CostMatrixArtifact::from_le_bytes(&huge),
        Err(EngineError::MalformedArtifact(_))
    ));

    let mut square_overflow = (1u64 << 33).to_le_bytes().to_vec();
    square_overflow.extend_from_slice(&[0u8; 8]);
    assert!(matches!(
        CostMatrixArtifact::from_le_bytes(&square_overflow),
        Err(EngineError::MalformedArtifact(_))
    ));

    assert!(matches!(
        CostMatrixArtifact::from_le_bytes(&[1, 0, 0]),
        Err(EngineError::MalformedArtifact(_))
    ));

    let mut truncated = 2u64.to_le_bytes().to_vec();
    truncated.extend_from_slice(&[0u8; 24]);
    assert!(matches!(
        CostMatrixArtifact::from_le_bytes(&truncated),
        Err(EngineError::MalformedArtifact(_))
    ));
}
