//! Core pipeline and learner-facing logic for Lorepath.
//!
//! This crate wires the job handlers (ingestion, embedding, AI authoring,
//! narrative planning) onto the orchestrator, and provides session delivery
//! and mastery tracking on top of the narrative graph.

pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod session;

pub use pipeline::{Pipeline, PipelineSettings};
pub use progress::ProgressTracker;
pub use runtime::Runtime;
pub use session::{SessionDelivery, SessionProgress};
