//! Learner mastery tracking.
//!
//! Levels move only through recorded evidence. The first piece of evidence
//! for a concept sets its level outright; later evidence is blended in with
//! an exponential moving average weighted by `smoothing`.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use lorepath_shared::{
    LorepathError, MAX_MASTERY, MasteryConfig, MasteryState, NarrativeNode, Result,
};
use lorepath_storage::Storage;

/// Reads and updates per-learner mastery.
#[derive(Clone)]
pub struct ProgressTracker {
    storage: Arc<Storage>,
    config: MasteryConfig,
}

impl ProgressTracker {
    pub fn new(storage: Arc<Storage>, config: MasteryConfig) -> Self {
        Self { storage, config }
    }

    pub fn threshold(&self) -> u8 {
        self.config.threshold
    }

    /// Record a score (`0..=100`) for `concept` and return the new level.
    #[instrument(skip_all, fields(learner_id = %learner_id, concept = %concept, score = score))]
    pub async fn record_evidence(&self, learner_id: &str, concept: &str, score: u8) -> Result<u8> {
        if concept.trim().is_empty() {
            return Err(LorepathError::validation("evidence is missing a concept"));
        }
        if score > MAX_MASTERY {
            return Err(LorepathError::validation(format!(
                "score {score} is above {MAX_MASTERY}"
            )));
        }

        let (level, count) = self
            .storage
            .record_mastery_evidence(learner_id, concept, score, self.config.smoothing)
            .await?;
        debug!(level, evidence = count, "mastery updated");
        Ok(level)
    }

    /// Record the same score for every concept `node` covers.
    pub async fn record_node_result(
        &self,
        learner_id: &str,
        node: &NarrativeNode,
        score: u8,
    ) -> Result<()> {
        for concept in node.concepts().collect::<BTreeSet<_>>() {
            self.record_evidence(learner_id, concept, score).await?;
        }
        Ok(())
    }

    /// Mastery map plus the gaps among the concepts of `neighborhood`.
    ///
    /// A gap is a neighborhood concept with no evidence or a level below the
    /// threshold. Between updates, repeated calls return identical results.
    pub async fn mastery_state(
        &self,
        learner_id: &str,
        neighborhood: &[NarrativeNode],
    ) -> Result<MasteryState> {
        let levels = self.storage.get_mastery_levels(learner_id).await?;
        let knowledge_gaps = neighborhood
            .iter()
            .flat_map(|node| node.concepts())
            .filter(|concept| {
                levels
                    .get(*concept)
                    .is_none_or(|level| *level < self.config.threshold)
            })
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(MasteryState {
            learner_id: learner_id.to_string(),
            levels,
            knowledge_gaps,
        })
    }

    /// The nodes around `node_id`: the node itself and its choice targets.
    pub async fn neighborhood(&self, node_id: &str) -> Result<Vec<NarrativeNode>> {
        let node = self
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("narrative node", node_id))?;
        let mut nodes = Vec::with_capacity(node.choices.len() + 1);
        for choice in &node.choices {
            if let Some(target) = self.storage.get_node(&choice.target_node_id).await? {
                nodes.push(target);
            }
        }
        nodes.insert(0, node);
        Ok(nodes)
    }
}
