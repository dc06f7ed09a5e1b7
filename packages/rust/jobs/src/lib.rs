//! Job orchestration: four named queues, attempt-aware delivery with
//! exponential backoff, crash recovery and administrative operations.
//!
//! Handlers must be idempotent with respect to their primary side effect:
//! delivery is at-least-once, and a job interrupted mid-attempt runs again
//! on the next start.

mod orchestrator;
mod policy;

use async_trait::async_trait;

use lorepath_shared::{Job, Result};

pub use orchestrator::{JobQueue, Orchestrator};
pub use policy::RetryPolicy;

/// Which attempt of a job a handler is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    /// No further attempt follows if this one fails.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Work performed for the jobs of one queue.
///
/// Returning a retryable error (see `LorepathError::is_retryable`) schedules
/// another attempt while attempts remain; any other error fails the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<()>;
}
