//! Choice generation: ranking the nodes a learner may move to next.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use lorepath_shared::{Choice, GraphConfig, MasteryState, NarrativeNode};

/// Concepts a learner is assumed to hold and the gaps they still have,
/// plus optional embedding similarity of each candidate to the source node.
#[derive(Debug, Clone, Default)]
pub struct RankingContext {
    pub mastered: BTreeSet<String>,
    pub gaps: BTreeSet<String>,
    /// Candidate node id to similarity with the source node.
    pub similarity: HashMap<String, f32>,
}

impl RankingContext {
    /// Context for authoring a node's choices without a specific learner.
    ///
    /// A learner standing on `node` is taken to know its prerequisites and
    /// the concepts it teaches; every other prerequisite found among the
    /// candidates is an open gap.
    pub fn for_node(node: &NarrativeNode, candidates: &[NarrativeNode]) -> Self {
        let mastered: BTreeSet<String> = node.concepts().cloned().collect();
        let gaps = candidates
            .iter()
            .filter(|c| c.id != node.id)
            .flat_map(|c| c.prerequisites.iter())
            .filter(|concept| !mastered.contains(*concept))
            .cloned()
            .collect();
        Self {
            mastered,
            gaps,
            similarity: HashMap::new(),
        }
    }

    /// Context for a learner with the given mastery state.
    pub fn for_learner(state: &MasteryState, threshold: u8) -> Self {
        Self {
            mastered: state.mastered(threshold),
            gaps: state.knowledge_gaps.iter().cloned().collect(),
            similarity: HashMap::new(),
        }
    }

    pub fn with_similarity(mut self, similarity: HashMap<String, f32>) -> Self {
        self.similarity = similarity;
        self
    }
}

/// Orders candidate nodes into a node's choice list.
#[derive(Debug, Clone)]
pub struct ChoiceGenerator {
    config: GraphConfig,
}

struct Ranked<'a> {
    node: &'a NarrativeNode,
    overlap: usize,
    satisfied: f64,
    similarity: f32,
    distance: f64,
}

impl ChoiceGenerator {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    /// Up to `max_choices` choices out of `node`, best first.
    ///
    /// Never includes `node` itself. Candidates whose adapts-to set covers
    /// more open gaps come first; then those with more of their
    /// prerequisites satisfied; then higher embedding similarity, shorter
    /// layout distance and finally node id.
    pub fn generate(
        &self,
        node: &NarrativeNode,
        candidates: &[NarrativeNode],
        ctx: &RankingContext,
    ) -> Vec<Choice> {
        self.rank(node, candidates, ctx)
            .into_iter()
            .take(self.config.max_choices)
            .map(|target| Choice {
                target_node_id: target.id.clone(),
                label: choice_label(target),
            })
            .collect()
    }

    /// Every candidate except `node`, in choice order.
    pub fn rank<'a>(
        &self,
        node: &NarrativeNode,
        candidates: &'a [NarrativeNode],
        ctx: &RankingContext,
    ) -> Vec<&'a NarrativeNode> {
        let mut ranked: Vec<Ranked<'a>> = candidates
            .iter()
            .filter(|c| c.id != node.id)
            .map(|c| Ranked {
                node: c,
                overlap: c.adapts_to.intersection(&ctx.gaps).count(),
                satisfied: satisfaction(c, &ctx.mastered),
                similarity: ctx.similarity.get(&c.id).copied().unwrap_or(0.0),
                distance: node.position.distance_to(&c.position),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.overlap
                .cmp(&a.overlap)
                .then_with(|| b.satisfied.partial_cmp(&a.satisfied).unwrap_or(Ordering::Equal))
                .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal))
                .then_with(|| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        ranked.into_iter().map(|r| r.node).collect()
    }
}

/// Fraction of `node`'s prerequisites in `mastered`; 1.0 when it has none.
fn satisfaction(node: &NarrativeNode, mastered: &BTreeSet<String>) -> f64 {
    if node.prerequisites.is_empty() {
        return 1.0;
    }
    let met = node
        .prerequisites
        .iter()
        .filter(|p| mastered.contains(*p))
        .count();
    met as f64 / node.prerequisites.len() as f64
}

fn choice_label(target: &NarrativeNode) -> String {
    if target.adapts_to.is_empty() {
        return "Continue".to_string();
    }
    let concepts: Vec<&str> = target.adapts_to.iter().take(2).map(String::as_str).collect();
    format!("Explore {}", concepts.join(" & "))
}
