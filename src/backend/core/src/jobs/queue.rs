//! Persistent job queue with claim/release/finish semantics.
//!
//! The queue is the synchronization point between dispatchers: claiming is
//! queue-enforced, so when two dispatch cycles race for the same job exactly
//! one wins and the loser gets [`ErrorCode::JobAlreadyClaimed`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Job, JobId, JobParams};
use crate::db::Database;
use crate::error::{DredgeError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Filter
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter for listing jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter<'a> {
    /// Only jobs of this type
    pub jobtype: Option<&'a str>,
    /// Only jobs with this remote ID
    pub remote_id: Option<&'a str>,
    /// Only jobs that are presently claimable
    pub restrict_claimable: bool,
}

impl<'a> JobFilter<'a> {
    /// Filter matching presently claimable jobs (the dispatch default).
    pub fn claimable() -> Self {
        Self {
            restrict_claimable: true,
            ..Self::default()
        }
    }

    /// Filter matching every job, claimed or not.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one jobtype.
    pub fn with_jobtype(mut self, jobtype: &'a str) -> Self {
        self.jobtype = Some(jobtype);
        self
    }

    /// Restrict to one remote ID.
    pub fn with_remote_id(mut self, remote_id: &'a str) -> Self {
        self.remote_id = Some(remote_id);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for queue backends.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job. Returns `None` when `(jobtype, remote_id)` already exists.
    async fn add_job(&self, jobtype: &str, params: JobParams) -> Result<Option<Job>>;

    /// List jobs matching the filter.
    async fn get_all_jobs(&self, filter: JobFilter<'_>) -> Result<Vec<Job>>;

    /// Claim a job. Fails with `JobAlreadyClaimed` if another claimer won.
    async fn claim(&self, job: &Job) -> Result<Job>;

    /// Return a claimed job to the queue, claimable again after `delay`.
    async fn release(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Finish a job: delete it, or reschedule it if it is recurring.
    async fn finish(&self, job: &Job) -> Result<()>;

    /// Delete claimed jobs whose claim is older than `older_than`.
    async fn expire_claimed(&self, older_than: Duration) -> Result<u64>;

    /// Derive a backend bound to a fresh connection identified by `name`.
    async fn dedicated(&self, name: &str) -> Result<Arc<dyn QueueBackend>>;

    /// Identity of the underlying connection.
    fn connection_name(&self) -> &str;

    /// Release the underlying connection.
    async fn close(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory queue backend for testing and development.
///
/// All handles derived via [`QueueBackend::dedicated`] share one job map, so
/// claim semantics across "connections" match the persistent backend.
pub struct InMemoryQueueBackend {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    name: String,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            name: "in-memory".to_string(),
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn add_job(&self, jobtype: &str, params: JobParams) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let duplicate = jobs
            .values()
            .any(|j| j.jobtype == jobtype && j.remote_id == params.remote_id);
        if duplicate {
            return Ok(None);
        }

        let job = Job::new(jobtype, params);
        jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn get_all_jobs(&self, filter: JobFilter<'_>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let now = Utc::now();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| filter.jobtype.map_or(true, |t| j.jobtype == t))
            .filter(|j| filter.remote_id.map_or(true, |r| j.remote_id == r))
            .filter(|j| !filter.restrict_claimable || j.is_claimable(now))
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.created_at);
        Ok(matched)
    }

    async fn claim(&self, job: &Job) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DredgeError::job_not_found(job.id))?;
        if stored.is_claimed() {
            return Err(DredgeError::job_already_claimed(
                &stored.jobtype,
                &stored.remote_id,
            ));
        }
        stored.claimed_at = Some(Utc::now());
        Ok(stored.clone())
    }

    async fn release(&self, job: &Job, delay: Duration) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DredgeError::job_not_found(job.id))?;
        stored.claimed_at = None;
        stored.claim_after = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        stored.attempts += 1;
        Ok(())
    }

    async fn finish(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DredgeError::job_not_found(job.id))?;
        match stored.interval {
            Some(interval) => {
                // recurring jobs come back around instead of disappearing
                stored.claimed_at = None;
                stored.claim_after = Utc::now()
                    + chrono::Duration::from_std(interval)
                        .unwrap_or_else(|_| chrono::Duration::zero());
            }
            None => {
                jobs.remove(&job.id);
            }
        }
        Ok(())
    }

    async fn expire_claimed(&self, older_than: Duration) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| j.claimed_at.map_or(false, |at| at < cutoff))
            .map(|j| j.id)
            .collect();
        for id in &stale {
            jobs.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn dedicated(&self, name: &str) -> Result<Arc<dyn QueueBackend>> {
        Ok(Arc::new(Self {
            jobs: self.jobs.clone(),
            name: name.to_string(),
        }))
    }

    fn connection_name(&self) -> &str {
        &self.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres Backend
// ═══════════════════════════════════════════════════════════════════════════════

const JOB_COLUMNS: &str =
    "id, jobtype, remote_id, data, created_at, claimed_at, claim_after, attempts, interval_secs";

/// Postgres-backed queue for production use.
pub struct PostgresQueueBackend {
    db: Database,
}

impl PostgresQueueBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the jobs table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                jobtype TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                data JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                claimed_at TIMESTAMPTZ,
                claim_after TIMESTAMPTZ NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                interval_secs BIGINT,
                UNIQUE (jobtype, remote_id)
            )",
        )
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let interval_secs: Option<i64> = row.try_get("interval_secs")?;
        Ok(Job {
            id: JobId::from_uuid(row.try_get("id")?),
            jobtype: row.try_get("jobtype")?,
            remote_id: row.try_get("remote_id")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            claim_after: row.try_get("claim_after")?,
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            interval: interval_secs.map(|secs| Duration::from_secs(secs.max(0) as u64)),
        })
    }
}

#[async_trait]
impl QueueBackend for PostgresQueueBackend {
    async fn add_job(&self, jobtype: &str, params: JobParams) -> Result<Option<Job>> {
        let job = Job::new(jobtype, params);
        let row = sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, NULL, $6, 0, $7) \
             ON CONFLICT (jobtype, remote_id) DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id.0)
        .bind(&job.jobtype)
        .bind(&job.remote_id)
        .bind(&job.data)
        .bind(job.created_at)
        .bind(job.claim_after)
        .bind(job.interval.map(|i| i.as_secs() as i64))
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn get_all_jobs(&self, filter: JobFilter<'_>) -> Result<Vec<Job>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(jobtype) = filter.jobtype {
            query.push(" AND jobtype = ");
            query.push_bind(jobtype);
        }
        if let Some(remote_id) = filter.remote_id {
            query.push(" AND remote_id = ");
            query.push_bind(remote_id);
        }
        if filter.restrict_claimable {
            query.push(" AND claimed_at IS NULL AND claim_after <= now()");
        }
        query.push(" ORDER BY created_at ASC");

        let rows = query.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn claim(&self, job: &Job) -> Result<Job> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET claimed_at = now() \
             WHERE id = $1 AND claimed_at IS NULL \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id.0)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => Self::job_from_row(&row),
            None => {
                // either someone else holds the claim or the job is gone
                let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
                    .bind(job.id.0)
                    .fetch_optional(self.db.pool())
                    .await?;
                if exists.is_some() {
                    Err(DredgeError::job_already_claimed(&job.jobtype, &job.remote_id))
                } else {
                    Err(DredgeError::job_not_found(job.id))
                }
            }
        }
    }

    async fn release(&self, job: &Job, delay: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET claimed_at = NULL, \
             claim_after = now() + make_interval(secs => $2), \
             attempts = attempts + 1 \
             WHERE id = $1",
        )
        .bind(job.id.0)
        .bind(delay.as_secs_f64())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn finish(&self, job: &Job) -> Result<()> {
        if job.interval.is_some() {
            sqlx::query(
                "UPDATE jobs SET claimed_at = NULL, \
                 claim_after = now() + make_interval(secs => interval_secs::float8) \
                 WHERE id = $1",
            )
            .bind(job.id.0)
            .execute(self.db.pool())
            .await?;
        } else {
            sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(job.id.0)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    async fn expire_claimed(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE claimed_at IS NOT NULL \
             AND claimed_at < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn dedicated(&self, name: &str) -> Result<Arc<dyn QueueBackend>> {
        let db = self.db.dedicated(name).await?;
        Ok(Arc::new(Self { db }))
    }

    fn connection_name(&self) -> &str {
        self.db.appname()
    }

    async fn close(&self) {
        self.db.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// The job queue handle used by the manager and by workers.
///
/// Cloning shares the backend; [`JobQueue::dedicated`] derives a handle with
/// its own connection for exclusive use by one worker.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    /// Create a queue with the given backend.
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Create an in-memory queue (for testing and development).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()))
    }

    /// Create a Postgres-backed queue and ensure its schema exists.
    pub async fn postgres(db: &Database) -> Result<Self> {
        let backend = PostgresQueueBackend::new(db.clone());
        backend.ensure_schema().await?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Enqueue a job. Returns `None` when `(jobtype, remote_id)` already exists.
    pub async fn add_job(&self, jobtype: &str, params: JobParams) -> Result<Option<Job>> {
        self.backend.add_job(jobtype, params).await
    }

    /// List jobs matching the filter.
    pub async fn get_all_jobs(&self, filter: JobFilter<'_>) -> Result<Vec<Job>> {
        self.backend.get_all_jobs(filter).await
    }

    /// Claim a job. Fails with `JobAlreadyClaimed` if another claimer won.
    pub async fn claim(&self, job: &Job) -> Result<Job> {
        self.backend.claim(job).await
    }

    /// Return a claimed job to the queue, claimable again after `delay`.
    pub async fn release(&self, job: &Job, delay: Duration) -> Result<()> {
        self.backend.release(job, delay).await
    }

    /// Finish a job: delete it, or reschedule it if it is recurring.
    pub async fn finish(&self, job: &Job) -> Result<()> {
        self.backend.finish(job).await
    }

    /// Delete claimed jobs whose claim is older than `older_than`.
    pub async fn expire_claimed(&self, older_than: Duration) -> Result<u64> {
        self.backend.expire_claimed(older_than).await
    }

    /// Derive a queue handle bound to a fresh connection identified by `name`.
    pub async fn dedicated(&self, name: &str) -> Result<JobQueue> {
        Ok(Self::new(self.backend.dedicated(name).await?))
    }

    /// Identity of the underlying connection.
    pub fn connection_name(&self) -> &str {
        self.backend.connection_name()
    }

    /// Release the underlying connection.
    pub async fn close(&self) {
        self.backend.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
