//! Shared types, error model, and configuration for Lorepath.
//!
//! This crate is the foundation depended on by all other Lorepath crates.
//! It provides:
//! - [`LorepathError`], the unified error type
//! - Domain types ([`Nugget`], [`Job`], [`NarrativeNode`], [`Session`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod graph;
pub mod jobs;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FolderEntry, GraphConfig, MasteryConfig, MonitorConfig, PipelineConfig,
    ProcessorConfig, ProviderConfig, ProviderKind, QueuesConfig, SearchConfig, StorageConfig,
    UrlEntry, WatcherConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key, validate_config,
};
pub use error::{LorepathError, Result};
pub use graph::{
    Choice, MAX_MASTERY, MasteryState, NarrativeNode, Position, Session, SessionStatus,
};
pub use jobs::{
    CANCELLED_REASON, IngestionMetadata, Job, JobPayload, JobStatus, QueueName, SourceType,
};
pub use types::{
    MAX_DIFFICULTY, MIN_DIFFICULTY, MonitoredUrl, Nugget, NuggetMetadata, NuggetStatus,
    WatchedFolder, content_hash, new_id,
};
