//! Job records, queue names and typed payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LorepathError, Result};
use crate::types::new_id;

/// Error message recorded on a job cancelled by an operator.
pub const CANCELLED_REASON: &str = "cancelled";

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// The four fixed work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Ingestion,
    Embedding,
    AiAuthoring,
    NarrativePlanning,
}

impl QueueName {
    /// Every queue, in pipeline order.
    pub const ALL: [QueueName; 4] = [
        Self::Ingestion,
        Self::Embedding,
        Self::AiAuthoring,
        Self::NarrativePlanning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Embedding => "embedding",
            Self::AiAuthoring => "ai-authoring",
            Self::NarrativePlanning => "narrative-planning",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = LorepathError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| LorepathError::validation(format!("unknown queue: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` end a job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward transitions a worker or operator may perform.
    ///
    /// `failed -> pending` is the administrative retry; `pending -> failed`
    /// is the administrative cancel.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = LorepathError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(LorepathError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Where an ingestion job's raw material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Url,
}

/// Optional trigger details attached to an ingestion job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Typed job payload, one variant per job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobPayload {
    Ingestion {
        #[serde(rename = "type")]
        source_type: SourceType,
        source: String,
        organization_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<IngestionMetadata>,
    },
    Embedding {
        nugget_id: String,
        content: String,
        organization_id: String,
    },
    ImageGeneration {
        nugget_id: String,
        organization_id: String,
    },
    AudioGeneration {
        nugget_id: String,
        organization_id: String,
    },
    NarrativePlanning {
        organization_id: String,
        nugget_ids: Vec<String>,
    },
}

impl JobPayload {
    /// Queue that carries this kind of job.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Ingestion { .. } => QueueName::Ingestion,
            Self::Embedding { .. } => QueueName::Embedding,
            Self::ImageGeneration { .. } | Self::AudioGeneration { .. } => QueueName::AiAuthoring,
            Self::NarrativePlanning { .. } => QueueName::NarrativePlanning,
        }
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingestion { .. } => "ingestion",
            Self::Embedding { .. } => "embedding",
            Self::ImageGeneration { .. } => "image_generation",
            Self::AudioGeneration { .. } => "audio_generation",
            Self::NarrativePlanning { .. } => "narrative_planning",
        }
    }

    pub fn organization_id(&self) -> &str {
        match self {
            Self::Ingestion {
                organization_id, ..
            }
            | Self::Embedding {
                organization_id, ..
            }
            | Self::ImageGeneration {
                organization_id, ..
            }
            | Self::AudioGeneration {
                organization_id, ..
            }
            | Self::NarrativePlanning {
                organization_id, ..
            } => organization_id,
        }
    }

    /// Reject payloads with missing required fields.
    pub fn validate(&self) -> Result<()> {
        if self.organization_id().trim().is_empty() {
            return Err(LorepathError::validation(format!(
                "{} job is missing organizationId",
                self.kind()
            )));
        }
        match self {
            Self::Ingestion { source, .. } if source.trim().is_empty() => Err(
                LorepathError::validation("ingestion job is missing source"),
            ),
            Self::Embedding { nugget_id, .. }
            | Self::ImageGeneration { nugget_id, .. }
            | Self::AudioGeneration { nugget_id, .. }
                if nugget_id.trim().is_empty() =>
            {
                Err(LorepathError::validation(format!(
                    "{} job is missing nuggetId",
                    self.kind()
                )))
            }
            Self::NarrativePlanning { nugget_ids, .. } if nugget_ids.is_empty() => Err(
                LorepathError::validation("narrative planning job has no nuggetIds"),
            ),
            _ => Ok(()),
        }
    }

    /// Parse and validate a payload arriving from outside the process.
    pub fn from_json(json: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(json)
            .map_err(|e| LorepathError::validation(format!("malformed job payload: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// One unit of orchestrated work, persisted for its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Recorded but held back from delivery until dispatched.
    #[serde(default)]
    pub deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set only on the transition into `processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set only on the transition into a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a new `pending` job for `payload`.
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        Self {
            id: new_id(),
            queue: payload.queue(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            deferred: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn organization_id(&self) -> &str {
        self.payload.organization_id()
    }

    /// Whether another attempt may start after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestion() -> JobPayload {
        JobPayload::Ingestion {
            source_type: SourceType::File,
            source: "/incoming/lesson1.pdf".into(),
            organization_id: "org-1".into(),
            metadata: Some(IngestionMetadata {
                folder_id: Some("f-1".into()),
                file_name: Some("lesson1.pdf".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn payload_wire_format() {
        let json = serde_json::to_value(ingestion()).expect("serialize");
        assert_eq!(json["kind"], "ingestion");
        assert_eq!(json["type"], "file");
        assert_eq!(json["organizationId"], "org-1");
        assert_eq!(json["metadata"]["folderId"], "f-1");

        let planning = JobPayload::NarrativePlanning {
            organization_id: "org-1".into(),
            nugget_ids: vec!["n1".into()],
        };
        let json = serde_json::to_value(&planning).expect("serialize");
        assert_eq!(json["nuggetIds"][0], "n1");
    }

    #[test]
    fn payload_parses_and_validates_at_boundary() {
        let parsed = JobPayload::from_json(
            r#"{"kind":"embedding","nuggetId":"n1","content":"text","organizationId":"o"}"#,
        )
        .expect("valid payload");
        assert_eq!(parsed.queue(), QueueName::Embedding);

        let missing = JobPayload::from_json(r#"{"kind":"embedding","content":"text"}"#);
        assert!(matches!(missing, Err(LorepathError::Validation { .. })));

        let empty = JobPayload::from_json(
            r#"{"kind":"narrative_planning","organizationId":"o","nuggetIds":[]}"#,
        );
        assert!(empty.is_err());
    }

    #[test]
    fn authoring_kinds_share_a_queue() {
        let image = JobPayload::ImageGeneration {
            nugget_id: "n".into(),
            organization_id: "o".into(),
        };
        let audio = JobPayload::AudioGeneration {
            nugget_id: "n".into(),
            organization_id: "o".into(),
        };
        assert_eq!(image.queue(), QueueName::AiAuthoring);
        assert_eq!(audio.queue(), QueueName::AiAuthoring);
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn queue_names_round_trip() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
        assert_eq!(QueueName::AiAuthoring.to_string(), "ai-authoring");
    }

    #[test]
    fn new_job_is_pending_without_timestamps() {
        let job = Job::new(ingestion(), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.queue, QueueName::Ingestion);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.has_attempts_left());
    }
}
