//! Node generation and deterministic layout.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use lorepath_shared::{GraphConfig, NarrativeNode, Nugget, Position, Result, new_id};
use lorepath_storage::Storage;

/// Fractional offsets stepped by these irrational ratios never repeat.
const X_STEP: f64 = 0.618_033_988_75;
const Y_STEP: f64 = 0.414_213_562_37;

/// Creates exactly one node per content unit.
#[derive(Clone)]
pub struct NodeGenerator {
    storage: Arc<Storage>,
    config: GraphConfig,
}

impl NodeGenerator {
    pub fn new(storage: Arc<Storage>, config: GraphConfig) -> Self {
        Self { storage, config }
    }

    /// Node for `nugget`, created on first call and returned unchanged after.
    ///
    /// Returns the node and whether this call created it.
    #[instrument(skip_all, fields(nugget_id = %nugget.id, org_id = %nugget.organization_id))]
    pub async fn generate_node(&self, nugget: &Nugget) -> Result<(NarrativeNode, bool)> {
        if let Some(existing) = self.storage.get_node_by_nugget(&nugget.id).await? {
            debug!(node_id = %existing.id, "node already exists, skipping");
            return Ok((existing, false));
        }

        let index = self.storage.count_nodes(&nugget.organization_id).await?;
        let (prerequisites, adapts_to) = match &nugget.metadata {
            Some(meta) => (
                meta.prerequisites.iter().cloned().collect(),
                meta.topics.iter().cloned().collect(),
            ),
            None => (BTreeSet::new(), BTreeSet::new()),
        };

        let now = Utc::now();
        let node = NarrativeNode {
            id: new_id(),
            organization_id: nugget.organization_id.clone(),
            nugget_id: nugget.id.clone(),
            prerequisites,
            adapts_to,
            position: layout_position(index, &self.config),
            choices: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let (stored, created) = self.storage.insert_node_if_absent(&node).await?;
        if created {
            debug!(node_id = %stored.id, index, x = stored.position.x, y = stored.position.y, "node created");
        }
        Ok((stored, created))
    }
}

/// Position of the `index`-th node of an organization.
///
/// Nodes fill a grid of `spacing`-sized cells inside `[0, width) x [0, height)`,
/// one node per cell, centred. Once every cell is taken, later layers reuse the
/// grid with a different offset inside each cell, so no two indices share a
/// position.
pub fn layout_position(index: u64, config: &GraphConfig) -> Position {
    let cols = ((config.width / config.spacing).floor() as u64).max(1);
    let rows = ((config.height / config.spacing).floor() as u64).max(1);
    let cell_w = config.width / cols as f64;
    let cell_h = config.height / rows as f64;

    let capacity = cols * rows;
    let cell = index % capacity;
    let layer = index / capacity;

    let frac_x = (0.5 + layer as f64 * X_STEP).fract().min(0.999);
    let frac_y = (0.5 + layer as f64 * Y_STEP).fract().min(0.999);

    Position {
        x: (cell % cols) as f64 * cell_w + frac_x * cell_w,
        y: (cell / cols) as f64 * cell_h + frac_y * cell_h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorepath_shared::NuggetMetadata;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("lp_nodes_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn meta(prereqs: &[&str], topics: &[&str]) -> NuggetMetadata {
        NuggetMetadata {
            topics: topics.iter().map(|s| s.to_string()).collect(),
            prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
            ..NuggetMetadata::fallback()
        }
    }

    #[tokio::test]
    async fn sets_are_copied_from_metadata() {
        let storage = test_storage().await;
        let generator = NodeGenerator::new(storage.clone(), GraphConfig::default());

        let with_meta = Nugget::new("org", "t", "/a", "a", Some(meta(&["A", "B"], &["C"])));
        storage.insert_nugget_if_absent(&with_meta).await.unwrap();
        let (node, created) = generator.generate_node(&with_meta).await.unwrap();
        assert!(created);
        assert_eq!(
            node.prerequisites,
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );
        assert_eq!(node.adapts_to, BTreeSet::from(["C".to_string()]));

        let bare = Nugget::new("org", "t", "/b", "b", None);
        storage.insert_nugget_if_absent(&bare).await.unwrap();
        let (node, _) = generator.generate_node(&bare).await.unwrap();
        assert!(node.prerequisites.is_empty());
        assert!(node.adapts_to.is_empty());
    }

    #[tokio::test]
    async fn generation_is_idempotent() {
        let storage = test_storage().await;
        let generator = NodeGenerator::new(storage.clone(), GraphConfig::default());
        let nugget = Nugget::new("org", "t", "/a", "a", None);

        let (first, created) = generator.generate_node(&nugget).await.unwrap();
        assert!(created);
        let (second, created) = generator.generate_node(&nugget).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(storage.count_nodes("org").await.unwrap(), 1);
    }

    #[test]
    fn positions_stay_in_bounds_and_distinct() {
        let config = GraphConfig::default();
        let mut seen: Vec<Position> = Vec::new();
        for i in 0..500 {
            let p = layout_position(i, &config);
            assert!(p.x >= 0.0 && p.x < config.width, "x out of bounds at {i}: {p:?}");
            assert!(p.y >= 0.0 && p.y < config.height, "y out of bounds at {i}: {p:?}");
            assert!(!seen.contains(&p), "duplicate position at {i}");
            seen.push(p);
        }
    }

    #[test]
    fn oversized_spacing_still_fits() {
        let config = GraphConfig {
            width: 100.0,
            height: 50.0,
            spacing: 500.0,
            max_choices: 4,
        };
        for i in 0..10 {
            let p = layout_position(i, &config);
            assert!(p.x < 100.0 && p.y < 50.0);
        }
        assert_eq!(layout_position(0, &config), Position { x: 50.0, y: 25.0 });
    }
}
