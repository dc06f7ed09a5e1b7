//! Narrative graph, learner session and mastery types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LorepathError, Result};

/// 2-D layout position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A learner-facing edge out of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    pub target_node_id: String,
    pub label: String,
}

/// A graph vertex wrapping exactly one content unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeNode {
    pub id: String,
    pub organization_id: String,
    pub nugget_id: String,
    /// Concepts required before this node.
    pub prerequisites: BTreeSet<String>,
    /// Knowledge gaps this node addresses.
    pub adapts_to: BTreeSet<String>,
    pub position: Position,
    /// Ordered outgoing choices, best first.
    pub choices: Vec<Choice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NarrativeNode {
    /// Whether `node_id` is one of this node's choice targets.
    pub fn offers(&self, node_id: &str) -> bool {
        self.choices.iter().any(|c| c.target_node_id == node_id)
    }

    /// Prerequisites and adapts-to concepts together.
    pub fn concepts(&self) -> impl Iterator<Item = &String> {
        self.prerequisites.iter().chain(self.adapts_to.iter())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Session lifecycle: `created -> active -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Active)
                | (Self::Active, Self::Active)
                | (Self::Active, Self::Completed)
        )
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = LorepathError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(LorepathError::validation(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// One learner traversal of an organization's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub learner_id: String,
    pub organization_id: String,
    pub current_node_id: String,
    /// Node ids visited, oldest first; starts with the entry node.
    pub path: Vec<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whole seconds between start and completion (or `now`), never negative.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.started_at).num_seconds().max(0)
    }
}

// ---------------------------------------------------------------------------
// Mastery
// ---------------------------------------------------------------------------

/// Highest mastery level.
pub const MAX_MASTERY: u8 = 100;

/// A learner's per-concept proficiency and derived gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryState {
    pub learner_id: String,
    /// Concept name to mastery level in `0..=100`.
    pub levels: BTreeMap<String, u8>,
    /// Concepts below threshold or never evidenced, sorted.
    pub knowledge_gaps: Vec<String>,
}

impl MasteryState {
    /// Concepts at or above `threshold`.
    pub fn mastered(&self, threshold: u8) -> BTreeSet<String> {
        self.levels
            .iter()
            .filter(|(_, level)| **level >= threshold)
            .map(|(concept, _)| concept.clone())
            .collect()
    }
}
