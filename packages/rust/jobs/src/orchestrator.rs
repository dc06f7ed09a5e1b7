//! Queue dispatch, job lifecycle and administrative operations.
//!
//! Each queue has an in-process delivery channel. A delivery names a job id
//! and the attempt it should run as; the job row in storage is the source of
//! truth and every delivery starts with a conditional claim, so stale,
//! duplicated or cancelled deliveries become no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use lorepath_shared::{Job, JobPayload, JobStatus, LorepathError, QueueName, QueuesConfig, Result};
use lorepath_storage::{JobFilter, Storage};

use crate::policy::RetryPolicy;
use crate::{JobContext, JobHandler};

/// Message placed on a queue channel.
#[derive(Debug, Clone)]
struct Delivery {
    job_id: String,
    attempt: u32,
}

struct Shared {
    storage: Arc<Storage>,
    policy: RetryPolicy,
    senders: HashMap<QueueName, mpsc::UnboundedSender<Delivery>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

// ---------------------------------------------------------------------------
// JobQueue handle
// ---------------------------------------------------------------------------

/// Cloneable handle for enqueueing and administering jobs.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    /// Record a job and deliver it to its queue.
    #[instrument(skip_all, fields(kind = payload.kind(), org_id = payload.organization_id()))]
    pub async fn enqueue(&self, payload: JobPayload) -> Result<Job> {
        let job = self.record(payload, false).await?;
        self.deliver(job.queue, &job.id, 1);
        debug!(job_id = %job.id, queue = %job.queue, "job enqueued");
        Ok(job)
    }

    /// Record a `pending` job without delivering it; see [`JobQueue::dispatch`].
    #[instrument(skip_all, fields(kind = payload.kind(), org_id = payload.organization_id()))]
    pub async fn enqueue_deferred(&self, payload: JobPayload) -> Result<Job> {
        let job = self.record(payload, true).await?;
        debug!(job_id = %job.id, queue = %job.queue, "job recorded without delivery");
        Ok(job)
    }

    async fn record(&self, payload: JobPayload, deferred: bool) -> Result<Job> {
        payload.validate()?;
        let mut job = Job::new(payload, self.shared.policy.max_attempts);
        job.deferred = deferred;
        self.shared.storage.insert_job(&job).await?;
        Ok(job)
    }

    /// Deliver a deferred `pending` job.
    pub async fn dispatch(&self, job_id: &str) -> Result<Job> {
        let job = self.shared.storage.dispatch_job(job_id).await?;
        self.deliver(job.queue, &job.id, 1);
        info!(job_id, queue = %job.queue, "job dispatched");
        Ok(job)
    }

    /// Administrative retry: a `failed` job returns to `pending` with its
    /// error cleared and runs again from attempt 1.
    pub async fn retry(&self, job_id: &str) -> Result<Job> {
        let job = self.shared.storage.reset_job(job_id).await?;
        self.deliver(job.queue, &job.id, 1);
        info!(job_id, queue = %job.queue, "job retried");
        Ok(job)
    }

    /// Administrative cancel of a `pending` job. Its queued delivery stays in
    /// place and is skipped when picked up.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self.shared.storage.cancel_job(job_id).await?;
        info!(job_id, queue = %job.queue, "job cancelled");
        Ok(job)
    }

    /// Delete a `completed` or `failed` job.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        self.shared.storage.delete_job(job_id).await?;
        info!(job_id, "job deleted");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.shared
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| LorepathError::not_found("job", job_id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.shared.storage.list_jobs(filter).await
    }

    /// Poll until the job reaches a terminal status or `timeout` elapses.
    pub async fn wait_terminal(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LorepathError::conflict(format!(
                    "job {job_id} still {} after {}s",
                    job.status,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn deliver(&self, queue: QueueName, job_id: &str, attempt: u32) {
        let Some(sender) = self.shared.senders.get(&queue) else {
            return;
        };
        let delivery = Delivery {
            job_id: job_id.to_string(),
            attempt,
        };
        if sender.send(delivery).is_err() {
            // Dispatcher gone; the row stays pending and is recovered on next start.
            debug!(job_id, %queue, "queue closed, delivery dropped");
        }
    }

    /// Run one delivery: claim, handle, then complete, fail or schedule a retry.
    #[instrument(skip_all, fields(job_id = %delivery.job_id, attempt = delivery.attempt))]
    async fn process(&self, delivery: Delivery, handler: Arc<dyn JobHandler>) {
        let storage = &self.shared.storage;
        let Delivery { job_id, attempt } = delivery;

        match storage.claim_job(&job_id, attempt).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("job not eligible for this attempt, skipping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to claim job");
                return;
            }
        }

        let job = match storage.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to load claimed job");
                return;
            }
        };

        let ctx = JobContext {
            attempt,
            max_attempts: job.max_attempts,
        };
        debug!(queue = %job.queue, kind = job.payload.kind(), "job started");

        match handler.handle(&job, &ctx).await {
            Ok(()) => match storage.complete_job(&job_id).await {
                Ok(_) => info!(queue = %job.queue, kind = job.payload.kind(), "job completed"),
                Err(e) => warn!(error = %e, "failed to mark job completed"),
            },
            Err(e) if self.shared.policy.should_retry(attempt, job.max_attempts, &e) => {
                let delay = self.shared.policy.backoff(attempt);
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "job attempt failed, retrying"
                );
                if let Err(se) = storage.record_attempt_error(&job_id, &e.to_string()).await {
                    warn!(error = %se, "failed to record attempt error");
                }
                self.schedule_retry(job.queue, job_id, attempt + 1, delay);
            }
            Err(e) => {
                error!(error = %e, queue = %job.queue, "job failed");
                if let Err(se) = storage.fail_job(&job_id, &e.to_string()).await {
                    warn!(error = %se, "failed to mark job failed");
                }
            }
        }
    }

    fn schedule_retry(&self, queue: QueueName, job_id: String, attempt: u32, delay: Duration) {
        let this = self.clone();
        let cancel = self.shared.cancel.clone();
        self.shared.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%job_id, attempt, "shutdown before retry; left for recovery");
                }
                _ = tokio::time::sleep(delay) => this.deliver(queue, &job_id, attempt),
            }
        });
    }

    /// Redeliver work left unfinished by a previous process.
    async fn recover(&self) -> Result<usize> {
        let jobs = self.shared.storage.recoverable_jobs().await?;
        let mut recovered = 0;
        for job in jobs {
            match job.status {
                JobStatus::Pending => {
                    self.deliver(job.queue, &job.id, 1);
                    recovered += 1;
                }
                JobStatus::Processing if job.has_attempts_left() => {
                    self.deliver(job.queue, &job.id, job.attempts + 1);
                    recovered += 1;
                }
                JobStatus::Processing => {
                    let reason = job
                        .error
                        .clone()
                        .unwrap_or_else(|| "interrupted after final attempt".into());
                    self.shared.storage.fail_job(&job.id, &reason).await?;
                    warn!(job_id = %job.id, "interrupted job had no attempts left, failed");
                }
                _ => {}
            }
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the queue dispatchers.
///
/// Lifecycle: [`Orchestrator::new`], [`Orchestrator::register`] a handler per
/// queue, [`Orchestrator::start`], and finally [`Orchestrator::shutdown`],
/// which stops dispatching and waits for in-flight handlers. Jobs enqueued
/// before `start` are buffered and run once dispatching begins.
pub struct Orchestrator {
    queue: JobQueue,
    config: QueuesConfig,
    receivers: HashMap<QueueName, mpsc::UnboundedReceiver<Delivery>>,
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
}

impl Orchestrator {
    pub fn new(storage: Arc<Storage>, config: QueuesConfig) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(queue, tx);
            receivers.insert(queue, rx);
        }

        let shared = Arc::new(Shared {
            storage,
            policy: RetryPolicy::from_config(&config),
            senders,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        Self {
            queue: JobQueue { shared },
            config,
            receivers,
            handlers: HashMap::new(),
        }
    }

    /// Handle for enqueueing and administering jobs.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Set the handler for `queue`, replacing any earlier one.
    pub fn register(&mut self, queue: QueueName, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue, handler);
    }

    /// Recover unfinished jobs and start one dispatcher per registered queue.
    #[instrument(skip_all)]
    pub async fn start(&mut self) -> Result<()> {
        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "redelivering unfinished jobs");
        }

        for queue in QueueName::ALL {
            let Some(handler) = self.handlers.get(&queue).cloned() else {
                warn!(%queue, "no handler registered; jobs will wait");
                continue;
            };
            let Some(rx) = self.receivers.remove(&queue) else {
                continue;
            };
            let concurrency = self.config.concurrency(queue);
            let jobs = self.queue.clone();
            self.queue
                .shared
                .tracker
                .spawn(run_dispatcher(queue, rx, handler, jobs, concurrency));
            debug!(%queue, concurrency, "dispatcher started");
        }
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let shared = &self.queue.shared;
        shared.cancel.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;
        info!("orchestrator stopped");
    }
}

async fn run_dispatcher(
    queue: QueueName,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn JobHandler>,
    jobs: JobQueue,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let cancel = jobs.shared.cancel.clone();

    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker = jobs.clone();
        let handler = Arc::clone(&handler);
        jobs.shared.tracker.spawn(async move {
            let _permit = permit;
            worker.process(delivery, handler).await;
        });
    }
    debug!(%queue, "dispatcher stopped");
}
