//! Core domain types: content units and their configured sources.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{LorepathError, Result};

/// Lowest difficulty score a content unit can carry.
pub const MIN_DIFFICULTY: u8 = 1;
/// Highest difficulty score a content unit can carry.
pub const MAX_DIFFICULTY: u8 = 10;

/// Generate a new time-sortable record identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// SHA-256 of `content`, lowercase hex.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Content unit ("nugget")
// ---------------------------------------------------------------------------

/// Lifecycle status of a content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NuggetStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl NuggetStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NuggetStatus {
    type Err = LorepathError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(LorepathError::validation(format!(
                "unknown nugget status: {other}"
            ))),
        }
    }
}

/// Structured metadata extracted from a content unit's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NuggetMetadata {
    /// Key topics, most frequent first.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Difficulty score in `1..=10`.
    pub difficulty: u8,
    /// Concepts the learner should know first, in discovery order.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Estimated study time in whole minutes (at least 1).
    pub estimated_minutes: u32,
    /// Other concepts mentioned alongside the topics.
    #[serde(default)]
    pub related_concepts: Vec<String>,
}

impl NuggetMetadata {
    /// The safe record returned when extraction cannot produce anything better.
    pub fn fallback() -> Self {
        Self {
            topics: Vec::new(),
            difficulty: MIN_DIFFICULTY,
            prerequisites: Vec::new(),
            estimated_minutes: 1,
            related_concepts: Vec::new(),
        }
    }

    /// Check the structural invariants of the record.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty) {
            return Err(LorepathError::validation(format!(
                "difficulty {} outside {MIN_DIFFICULTY}..={MAX_DIFFICULTY}",
                self.difficulty
            )));
        }
        if self.estimated_minutes == 0 {
            return Err(LorepathError::validation(
                "estimated time must be at least one minute",
            ));
        }
        Ok(())
    }
}

impl Default for NuggetMetadata {
    fn default() -> Self {
        Self::fallback()
    }
}

/// One organization-scoped, enriched piece of learning material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nugget {
    pub id: String,
    pub organization_id: String,
    /// File name or page title.
    pub title: String,
    /// Locator of the source the text came from (path or URL).
    pub source: String,
    /// Normalized plain text.
    pub content: String,
    /// SHA-256 of `content`; unique together with organization and source.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NuggetMetadata>,
    pub status: NuggetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Nugget {
    /// Build a fresh `pending` content unit.
    pub fn new(
        organization_id: impl Into<String>,
        title: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
        metadata: Option<NuggetMetadata>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: new_id(),
            organization_id: organization_id.into(),
            title: title.into(),
            source: source.into(),
            content_hash: content_hash(content.as_bytes()),
            content,
            metadata,
            status: NuggetStatus::Pending,
            image_url: None,
            audio_url: None,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A directory watched for new or changed learning material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedFolder {
    pub id: String,
    pub organization_id: String,
    pub path: String,
    pub enabled: bool,
    /// Allowed extensions without the dot (`pdf`, `md`). Empty allows all.
    #[serde(default)]
    pub file_types: Vec<String>,
    pub recursive: bool,
    /// When false, ingestion jobs are recorded but not delivered.
    pub auto_process: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchedFolder {
    /// Whether `path` has one of the folder's allowed extensions.
    pub fn accepts(&self, path: &Path) -> bool {
        if self.file_types.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.file_types
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// A URL polled for content changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredUrl {
    pub id: String,
    pub organization_id: String,
    pub url: String,
    /// Seconds between scheduled checks.
    pub check_interval_secs: u64,
    /// Hash from the last check that enqueued ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(types: &[&str]) -> WatchedFolder {
        WatchedFolder {
            id: new_id(),
            organization_id: "org".into(),
            path: "/incoming".into(),
            enabled: true,
            file_types: types.iter().map(|s| s.to_string()).collect(),
            recursive: true,
            auto_process: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn fallback_metadata_is_valid() {
        let meta = NuggetMetadata::fallback();
        assert!(meta.validate().is_ok());
        assert!(meta.topics.is_empty());
        assert_eq!(meta.difficulty, 1);
        assert_eq!(meta.estimated_minutes, 1);
    }

    #[test]
    fn metadata_rejects_out_of_range_difficulty() {
        let meta = NuggetMetadata {
            difficulty: 11,
            ..NuggetMetadata::fallback()
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn metadata_uses_camel_case_json() {
        let meta = NuggetMetadata {
            topics: vec!["Linear Algebra".into()],
            difficulty: 4,
            prerequisites: vec!["A".into(), "B".into()],
            estimated_minutes: 3,
            related_concepts: vec![],
        };
        let json = serde_json::to_string(&meta).expect("serialize");
        assert!(json.contains("estimatedMinutes"));
        let parsed: NuggetMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.prerequisites, vec!["A", "B"]);
    }

    #[test]
    fn nugget_starts_pending_with_hash() {
        let nugget = Nugget::new("org", "Lesson", "/incoming/a.md", "some text", None);
        assert_eq!(nugget.status, NuggetStatus::Pending);
        assert_eq!(nugget.content_hash, content_hash(b"some text"));
    }

    #[test]
    fn status_parses_storage_form() {
        for status in [
            NuggetStatus::Pending,
            NuggetStatus::Processing,
            NuggetStatus::Ready,
            NuggetStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<NuggetStatus>().unwrap(), status);
        }
        assert!("archived".parse::<NuggetStatus>().is_err());
    }

    #[test]
    fn folder_filters_by_extension() {
        let f = folder(&["pdf", ".md"]);
        assert!(f.accepts(Path::new("/incoming/lesson1.pdf")));
        assert!(f.accepts(Path::new("/incoming/notes.MD")));
        assert!(!f.accepts(Path::new("/incoming/image.png")));
        assert!(!f.accepts(Path::new("/incoming/README")));

        let any = folder(&[]);
        assert!(any.accepts(Path::new("/incoming/whatever.bin")));
    }
}
