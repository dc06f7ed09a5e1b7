//! Narrative graph builder.
//!
//! One node per content unit, placed deterministically, plus ranked
//! learner choices that are regenerated as the organization's graph grows.

mod choices;
mod nodes;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use lorepath_embedding::cosine_similarity;
use lorepath_shared::{GraphConfig, LorepathError, NarrativeNode, Result};
use lorepath_storage::Storage;

pub use choices::{ChoiceGenerator, RankingContext};
pub use nodes::{NodeGenerator, layout_position};

/// Outcome of one planning run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub nodes_created: usize,
    pub nodes_total: usize,
}

/// Builds nodes for new content units and refreshes every node's choices.
#[derive(Clone)]
pub struct GraphPlanner {
    storage: Arc<Storage>,
    nodes: NodeGenerator,
    choices: ChoiceGenerator,
}

impl GraphPlanner {
    pub fn new(storage: Arc<Storage>, config: GraphConfig) -> Self {
        Self {
            nodes: NodeGenerator::new(storage.clone(), config.clone()),
            choices: ChoiceGenerator::new(config),
            storage,
        }
    }

    pub fn choice_generator(&self) -> &ChoiceGenerator {
        &self.choices
    }

    /// Ensure a node exists for each of `nugget_ids`, then regenerate the
    /// choices of every node in the organization.
    ///
    /// Safe to re-run: existing nodes are left as they are and choice sets
    /// are replaced whole.
    #[instrument(skip_all, fields(org_id = %organization_id, nuggets = nugget_ids.len()))]
    pub async fn plan(&self, organization_id: &str, nugget_ids: &[String]) -> Result<PlanReport> {
        let mut created = 0;
        for nugget_id in nugget_ids {
            let nugget = self
                .storage
                .get_nugget(nugget_id)
                .await?
                .ok_or_else(|| LorepathError::not_found("nugget", nugget_id.clone()))?;
            if nugget.organization_id != organization_id {
                return Err(LorepathError::validation(format!(
                    "nugget {nugget_id} does not belong to organization {organization_id}"
                )));
            }
            if self.nodes.generate_node(&nugget).await?.1 {
                created += 1;
            }
        }

        let total = self.regenerate_choices(organization_id).await?;
        info!(created, total, "narrative graph planned");
        Ok(PlanReport {
            nodes_created: created,
            nodes_total: total,
        })
    }

    /// Replace the choice set of every node in the organization.
    ///
    /// Returns the number of nodes updated.
    pub async fn regenerate_choices(&self, organization_id: &str) -> Result<usize> {
        let nodes = self.storage.list_nodes(organization_id).await?;
        let vectors: HashMap<String, Vec<f32>> = self
            .storage
            .ready_embeddings(organization_id)
            .await?
            .into_iter()
            .collect();

        for node in &nodes {
            let ctx = RankingContext::for_node(node, &nodes)
                .with_similarity(similarity_to(node, &nodes, &vectors));
            let choices = self.choices.generate(node, &nodes, &ctx);
            debug!(node_id = %node.id, choices = choices.len(), "choices regenerated");
            self.storage.replace_choices(&node.id, &choices).await?;
        }
        Ok(nodes.len())
    }
}

/// Embedding similarity of each candidate to `node`, where both have vectors.
fn similarity_to(
    node: &NarrativeNode,
    candidates: &[NarrativeNode],
    vectors: &HashMap<String, Vec<f32>>,
) -> HashMap<String, f32> {
    let Some(source) = vectors.get(&node.nugget_id) else {
        return HashMap::new();
    };
    candidates
        .iter()
        .filter(|c| c.id != node.id)
        .filter_map(|c| {
            let target = vectors.get(&c.nugget_id)?;
            (target.len() == source.len()).then(|| (c.id.clone(), cosine_similarity(source, target)))
        })
        .collect()
}
