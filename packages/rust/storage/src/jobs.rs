//! Job queries.
//!
//! Every status change is a single conditional `UPDATE` whose `WHERE`
//! clause encodes the allowed source status, so two workers racing on the
//! same job cannot both win and a status never moves backwards.

use chrono::Utc;
use libsql::params;
use lorepath_shared::{
    CANCELLED_REASON, Job, JobPayload, JobStatus, LorepathError, QueueName, Result,
};

use crate::{Storage, int, json_err, opt_text, opt_timestamp, storage_err, text, timestamp, ts};

const JOB_COLUMNS: &str = "id, queue, payload_json, status, attempts, max_attempts, deferred, \
     error, created_at, started_at, completed_at";

/// Filters for [`Storage::list_jobs`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<QueueName>,
    pub status: Option<JobStatus>,
    pub organization_id: Option<String>,
    pub limit: Option<usize>,
}

fn row_to_job(row: &libsql::Row) -> Result<Job> {
    let payload: JobPayload = serde_json::from_str(&text(row, 2)?).map_err(json_err)?;
    Ok(Job {
        id: text(row, 0)?,
        queue: text(row, 1)?.parse()?,
        payload,
        status: text(row, 3)?.parse()?,
        attempts: int(row, 4)? as u32,
        max_attempts: int(row, 5)? as u32,
        deferred: int(row, 6)? != 0,
        error: opt_text(row, 7),
        created_at: timestamp(row, 8)?,
        started_at: opt_timestamp(row, 9)?,
        completed_at: opt_timestamp(row, 10)?,
    })
}

impl Storage {
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let payload_json = serde_json::to_string(&job.payload).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, queue, kind, organization_id, payload_json, status, \
                 attempts, max_attempts, deferred, error, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.as_str(),
                    job.queue.as_str(),
                    job.payload.kind(),
                    job.organization_id(),
                    payload_json,
                    job.status.as_str(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.deferred as i64,
                    job.error.clone(),
                    ts(&job.created_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn require_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| LorepathError::not_found("job", id))
    }

    /// List jobs matching `filter`, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1");
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(queue) = filter.queue {
            values.push(queue.as_str().into());
            sql.push_str(&format!(" AND queue = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(status.as_str().into());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(org) = &filter.organization_id {
            values.push(org.clone().into());
            sql.push_str(&format!(" AND organization_id = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(storage_err)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    /// Start attempt number `attempt` of a job.
    ///
    /// The first attempt moves `pending -> processing` and stamps
    /// `started_at`. Later attempts only advance the counter of a job that is
    /// still `processing` with the previous attempt recorded. Returns `false`
    /// when the job is no longer eligible (cancelled, claimed elsewhere, or
    /// already finished).
    pub async fn claim_job(&self, id: &str, attempt: u32) -> Result<bool> {
        self.check_writable()?;
        let changed = if attempt <= 1 {
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'processing', attempts = 1, deferred = 0, \
                     started_at = ?1 WHERE id = ?2 AND status = 'pending'",
                    params![ts(&Utc::now()), id],
                )
                .await
        } else {
            self.conn
                .execute(
                    "UPDATE jobs SET attempts = ?1 \
                     WHERE id = ?2 AND status = 'processing' AND attempts = ?3",
                    params![attempt as i64, id, (attempt - 1) as i64],
                )
                .await
        }
        .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Keep the last error of a failed attempt while the job waits to retry.
    pub async fn record_attempt_error(&self, id: &str, error: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE jobs SET error = ?1 WHERE id = ?2 AND status = 'processing'",
                params![error, id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// `processing -> completed`. Returns `false` if the job was not processing.
    pub async fn complete_job(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'completed', error = NULL, completed_at = ?1 \
                 WHERE id = ?2 AND status = 'processing'",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// `processing -> failed` with the final error.
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2 \
                 WHERE id = ?3 AND status = 'processing'",
                params![error, ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Administrative cancel: only `pending` jobs, which become `failed`.
    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2 \
                 WHERE id = ?3 AND status = 'pending'",
                params![CANCELLED_REASON, ts(&Utc::now()), id],
            )
            .await
            .map_err(storage_err)?;
        let job = self.require_job(id).await?;
        if changed == 0 {
            return Err(LorepathError::conflict(format!(
                "job {id} is {}; only pending jobs can be cancelled",
                job.status
            )));
        }
        Ok(job)
    }

    /// Administrative retry: only `failed` jobs, which return to `pending`
    /// with a fresh attempt budget.
    pub async fn reset_job(&self, id: &str) -> Result<Job> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'pending', attempts = 0, deferred = 0, error = NULL, \
                 started_at = NULL, completed_at = NULL WHERE id = ?1 AND status = 'failed'",
                params![id],
            )
            .await
            .map_err(storage_err)?;
        let job = self.require_job(id).await?;
        if changed == 0 {
            return Err(LorepathError::conflict(format!(
                "job {id} is {}; only failed jobs can be retried",
                job.status
            )));
        }
        Ok(job)
    }

    /// Clear the deferred flag of a `pending` job so it can be delivered.
    pub async fn dispatch_job(&self, id: &str) -> Result<Job> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET deferred = 0 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .await
            .map_err(storage_err)?;
        let job = self.require_job(id).await?;
        if changed == 0 {
            return Err(LorepathError::conflict(format!(
                "job {id} is {}; only pending jobs can be dispatched",
                job.status
            )));
        }
        Ok(job)
    }

    /// Delete a job in a terminal status.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status IN ('completed', 'failed')",
                params![id],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            let job = self.require_job(id).await?;
            return Err(LorepathError::conflict(format!(
                "job {id} is {}; only completed or failed jobs can be deleted",
                job.status
            )));
        }
        Ok(())
    }

    /// Jobs left unfinished by a previous process: non-deferred `pending`
    /// jobs and every `processing` job, oldest first.
    pub async fn recoverable_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (status = 'pending' AND deferred = 0) OR status = 'processing' \
             ORDER BY created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::JobFilter;
    use crate::test_support::test_storage;
    use lorepath_shared::{Job, JobPayload, JobStatus, LorepathError, QueueName};

    fn embedding_job(org: &str) -> Job {
        Job::new(
            JobPayload::Embedding {
                nugget_id: "n1".into(),
                content: "text".into(),
                organization_id: org.into(),
            },
            3,
        )
    }

    #[tokio::test]
    async fn job_roundtrip() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();
        let loaded = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, job.payload);
        assert_eq!(loaded.queue, QueueName::Embedding);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn first_claim_wins_once() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();

        assert!(storage.claim_job(&job.id, 1).await.unwrap());
        assert!(!storage.claim_job(&job.id, 1).await.unwrap());

        let loaded = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn retry_claims_advance_in_order() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();
        storage.claim_job(&job.id, 1).await.unwrap();

        assert!(!storage.claim_job(&job.id, 3).await.unwrap());
        assert!(storage.claim_job(&job.id, 2).await.unwrap());
        let loaded = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_transitions_set_completed_at() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();

        // Not yet processing
        assert!(!storage.complete_job(&job.id).await.unwrap());

        storage.claim_job(&job.id, 1).await.unwrap();
        assert!(storage.fail_job(&job.id, "boom").await.unwrap());
        let loaded = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(loaded.completed_at.is_some());

        // A failed job is not completed by a late worker
        assert!(!storage.complete_job(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_only_pending() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();

        let cancelled = storage.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

        let again = storage.cancel_job(&job.id).await;
        assert!(matches!(again, Err(LorepathError::Conflict { .. })));

        let missing = storage.cancel_job("nope").await;
        assert!(matches!(missing, Err(LorepathError::NotFound { .. })));
    }

    #[tokio::test]
    async fn reset_only_failed_and_clears_state() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();
        assert!(matches!(
            storage.reset_job(&job.id).await,
            Err(LorepathError::Conflict { .. })
        ));

        storage.claim_job(&job.id, 1).await.unwrap();
        storage.fail_job(&job.id, "boom").await.unwrap();
        let reset = storage.reset_job(&job.id).await.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.error.is_none());
        assert!(reset.started_at.is_none());
        assert!(reset.completed_at.is_none());
    }

    #[tokio::test]
    async fn delete_only_terminal() {
        let storage = test_storage().await;
        let job = embedding_job("org");
        storage.insert_job(&job).await.unwrap();
        assert!(matches!(
            storage.delete_job(&job.id).await,
            Err(LorepathError::Conflict { .. })
        ));

        storage.claim_job(&job.id, 1).await.unwrap();
        storage.complete_job(&job.id).await.unwrap();
        storage.delete_job(&job.id).await.unwrap();
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
        assert!(matches!(
            storage.delete_job(&job.id).await,
            Err(LorepathError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_combine() {
        let storage = test_storage().await;
        let a = embedding_job("org-a");
        let b = embedding_job("org-b");
        storage.insert_job(&a).await.unwrap();
        storage.insert_job(&b).await.unwrap();
        storage.claim_job(&b.id, 1).await.unwrap();

        let all = storage.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let pending = storage
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);

        let org_b = storage
            .list_jobs(&JobFilter {
                queue: Some(QueueName::Embedding),
                organization_id: Some("org-b".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(org_b.len(), 1);
        assert_eq!(org_b[0].id, b.id);
    }

    #[tokio::test]
    async fn recovery_skips_deferred_and_terminal() {
        let storage = test_storage().await;
        let pending = embedding_job("org");
        let mut deferred = embedding_job("org");
        deferred.deferred = true;
        let processing = embedding_job("org");
        let done = embedding_job("org");
        for job in [&pending, &deferred, &processing, &done] {
            storage.insert_job(job).await.unwrap();
        }
        storage.claim_job(&processing.id, 1).await.unwrap();
        storage.claim_job(&done.id, 1).await.unwrap();
        storage.complete_job(&done.id).await.unwrap();

        let ids: Vec<String> = storage
            .recoverable_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&pending.id));
        assert!(ids.contains(&processing.id));

        let dispatched = storage.dispatch_job(&deferred.id).await.unwrap();
        assert!(!dispatched.deferred);
    }
}
