//! The heart of the backend - manages jobs and workers.
//!
//! The [`WorkerManager`] owns the dispatch loop and the worker pool. Each
//! dispatch cycle lists claimable jobs, reaps finished workers so their slots
//! free up immediately, and claims + starts new workers up to each jobtype's
//! concurrency cap.
//!
//! Shutdown is ordered: every worker except the control ("api") type is
//! interrupted and joined first, so the control worker can still answer
//! status queries about the shutdown itself; only then is the control worker
//! taken down.
//!
//! Abort (termination signal) must unblock workers stuck in non-cooperative
//! blocking calls *before* dispatch stops: cancellation jobs are made
//! immediately claimable and drained, because once dispatch stops nothing
//! would ever run them - the blocked worker's own connection is busy
//! executing the very call that needs cancelling.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::queue::{JobFilter, JobQueue};
use super::registry::WorkerRegistry;
use super::worker::{self, InterruptLevel, WorkerHandle};
use super::{Job, JobId, JobParams};
use crate::config::Config;
use crate::db::Database;
use crate::error::ErrorCode;

/// The reserved control jobtype, kept alive last during shutdown.
pub const CONTROL_JOBTYPE: &str = "api";

/// Jobtype of out-of-band blocking-call cancellation jobs. Their `remote_id`
/// names the connection whose queries should be cancelled.
pub const CANCEL_JOBTYPE: &str = "cancel-db-query";

// ═══════════════════════════════════════════════════════════════════════════════
// Interrupt Target
// ═══════════════════════════════════════════════════════════════════════════════

/// Selector for a targeted interrupt.
///
/// A worker can be targeted either with the job it holds or with the
/// `(jobtype, remote_id)` pair, since those uniquely identify a job.
#[derive(Debug, Clone, Copy)]
pub enum InterruptTarget<'a> {
    /// Target the worker holding this exact job
    Job(&'a Job),
    /// Target by jobtype and remote ID
    RemoteId {
        jobtype: &'a str,
        remote_id: &'a str,
    },
}

impl<'a> InterruptTarget<'a> {
    fn jobtype(&self) -> &'a str {
        match self {
            Self::Job(job) => &job.jobtype,
            Self::RemoteId { jobtype, .. } => jobtype,
        }
    }

    fn matches(&self, candidate: &Job) -> bool {
        match self {
            Self::Job(job) => candidate.id == job.id,
            Self::RemoteId { jobtype, remote_id } => {
                candidate.jobtype == *jobtype && candidate.remote_id == *remote_id
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of one live worker, as exposed by the control API.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// The worker's jobtype
    pub jobtype: String,
    /// ID of the job the worker holds
    pub job_id: JobId,
    /// The job's remote ID
    pub remote_id: String,
    /// When the worker was started
    pub started_at: chrono::DateTime<chrono::Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Manages the job queue and worker pool.
pub struct WorkerManager {
    queue: JobQueue,
    database: Option<Database>,
    registry: Arc<WorkerRegistry>,
    config: Arc<Config>,
    /// Per-jobtype sets of live worker handles. The dispatch cycle is the
    /// sole writer; targeted interrupts read concurrently, hence the lock.
    pool: Mutex<HashMap<String, Vec<WorkerHandle>>>,
    running: AtomicBool,
    /// Jobtypes seen in the queue with no registered implementation, so the
    /// error is logged once per distinct type.
    unknown_jobtypes: Mutex<HashSet<String>>,
}

impl WorkerManager {
    /// Create a manager.
    ///
    /// `database` is the backend-wide handle from which workers derive their
    /// dedicated connections; `None` when running against the in-memory
    /// queue.
    pub fn new(
        queue: JobQueue,
        database: Option<Database>,
        registry: Arc<WorkerRegistry>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            database,
            registry,
            config,
            pool: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            unknown_jobtypes: Mutex::new(HashSet::new()),
        })
    }

    /// Whether the dispatch loop is (still) accepting work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatch loop without draining cancellation jobs.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Seed jobs for workers that always need one.
    pub async fn seed_jobs(&self) {
        for descriptor in self.registry.iter() {
            let Some(hook) = descriptor.ensure_job() else {
                continue;
            };
            let Some(params) = hook(&self.config) else {
                continue;
            };
            match self.queue.add_job(descriptor.jobtype(), params).await {
                Ok(Some(job)) => {
                    debug!(job = %job.describe(), "Seeded job for worker");
                }
                Ok(None) => {} // already queued
                Err(e) => {
                    error!(
                        jobtype = descriptor.jobtype(),
                        error = %e,
                        "Error while ensuring job for worker"
                    );
                }
            }
        }
    }

    /// One dispatch cycle.
    ///
    /// Checks for open jobs, and then passes those to dedicated workers, if
    /// slots are available for those workers. Reaping happens before
    /// claiming, so a slot freed this cycle can be reused this cycle.
    pub async fn delegate(self: &Arc<Self>) {
        let jobs = match self.queue.get_all_jobs(JobFilter::claimable()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                e.log();
                return;
            }
        };

        // clean up workers that have finished processing
        let finished: Vec<WorkerHandle> = {
            let mut pool = self.pool.lock();
            let mut finished = Vec::new();
            for handles in pool.values_mut() {
                let mut index = 0;
                while index < handles.len() {
                    if handles[index].is_alive() {
                        index += 1;
                    } else {
                        finished.push(handles.remove(index));
                    }
                }
            }
            finished
        };
        for handle in finished {
            debug!(
                jobtype = handle.jobtype(),
                remote_id = %handle.job().remote_id,
                "Terminating worker"
            );
            handle.join().await;
        }

        let num_active: usize = {
            let pool = self.pool.lock();
            pool.values().map(Vec::len).sum()
        };
        debug!(running = num_active, "Running workers");
        gauge!("dredge_workers_running").set(num_active as f64);

        // check if workers are available for unclaimed jobs
        for job in jobs {
            let Some(descriptor) = self.registry.get(&job.jobtype) else {
                let mut unknown = self.unknown_jobtypes.lock();
                if unknown.insert(job.jobtype.clone()) {
                    error!(jobtype = %job.jobtype, "Unknown job type");
                }
                continue;
            };

            // if a job is of a known type, and that job type has open worker
            // slots, start a new worker to run it
            let slot_free = {
                let pool = self.pool.lock();
                pool.get(&job.jobtype).map_or(0, Vec::len) < descriptor.max_workers()
            };
            if !slot_free {
                continue;
            }

            let claimed = match self.queue.claim(&job).await {
                Ok(claimed) => claimed,
                Err(e) if e.code() == ErrorCode::JobAlreadyClaimed => {
                    // it's fine
                    counter!("dredge_claim_races_total").increment(1);
                    continue;
                }
                Err(e) => {
                    e.log();
                    continue;
                }
            };

            info!(job = %claimed.describe(), "Starting new worker for job");
            let handle = worker::spawn(
                descriptor.build(),
                claimed,
                descriptor.jobtype(),
                self.queue.clone(),
                self.database.clone(),
                Arc::downgrade(self),
                self.config.clone(),
                self.registry.clone(),
            );
            counter!("dredge_jobs_dispatched_total", "jobtype" => descriptor.jobtype())
                .increment(1);
            self.pool
                .lock()
                .entry(job.jobtype.clone())
                .or_default()
                .push(handle);
        }
    }

    /// Main loop.
    ///
    /// Constantly delegates work until no longer running, after which all
    /// workers are asked to stop their work. Once that has happened, the
    /// loop properly ends.
    pub async fn run(self: &Arc<Self>) {
        self.seed_jobs().await;
        info!("Dredge backend started");

        while self.is_running() {
            self.delegate().await;
            tokio::time::sleep(self.config.manager.poll_interval).await;
        }

        self.shutdown().await;
    }

    /// Ordered shutdown of the worker pool.
    async fn shutdown(&self) {
        info!("Telling all workers to stop doing whatever they're doing...");

        // request shutdown from all workers except the control type; this
        // keeps the control API available to observe the shutdown itself
        {
            let pool = self.pool.lock();
            for (jobtype, handles) in pool.iter() {
                if jobtype == CONTROL_JOBTYPE {
                    continue;
                }
                for handle in handles {
                    handle.request_interrupt(InterruptLevel::Retry);
                }
            }
        }

        // wait for all workers that we just asked to quit to finish
        info!("Waiting for all workers to finish...");
        let jobtypes: Vec<String> = {
            let pool = self.pool.lock();
            pool.keys()
                .filter(|jobtype| jobtype.as_str() != CONTROL_JOBTYPE)
                .cloned()
                .collect()
        };
        for jobtype in jobtypes {
            let handles = self.pool.lock().remove(&jobtype).unwrap_or_default();
            for handle in handles {
                info!(jobtype = %jobtype, "Waiting for worker...");
                handle.join().await;
            }
        }

        // shut down the control workers last
        let control = self.pool.lock().remove(CONTROL_JOBTYPE).unwrap_or_default();
        for handle in control {
            handle.request_interrupt(InterruptLevel::Retry);
            handle.join().await;
        }

        tokio::time::sleep(self.config.manager.shutdown_pause).await;
        info!("Bye!");
    }

    /// Stop looping the delegator, clean up, and prepare for shutdown.
    ///
    /// Cancellation jobs are drained before the loop is stopped: after that
    /// no new jobs will be claimed, and a worker blocked in a query has no
    /// other way to be released - its own connection is busy executing the
    /// query that needs cancelling.
    pub async fn abort(&self) {
        info!("Received termination signal");
        self.drain_cancel_jobs(None).await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Interrupt a specific job's worker.
    ///
    /// Any blocking queries owned by the worker's connection are cancelled
    /// first, then the interrupt level is set. Returns `true` once the
    /// interrupt has been delivered (not once the worker has stopped), or
    /// `false` when no live worker matches the target (a no-op, not an
    /// error).
    pub async fn request_interrupt(
        &self,
        level: InterruptLevel,
        target: InterruptTarget<'_>,
    ) -> bool {
        let found = {
            let pool = self.pool.lock();
            let Some(handles) = pool.get(target.jobtype()) else {
                // no workers of this type currently known
                return false;
            };
            handles
                .iter()
                .find(|handle| target.matches(handle.job()))
                .map(|handle| {
                    (
                        handle.connection_name().to_string(),
                        handle.job().describe(),
                        handle.interrupt_flag(),
                    )
                })
        };
        let Some((connection_name, job_label, flag)) = found else {
            return false;
        };

        // first cancel any interruptible queries for this worker's connection
        self.drain_cancel_jobs(Some(&connection_name)).await;

        // now all queries are interrupted, formally request the abort
        info!(job = %job_label, "Requesting interrupt of job");
        flag.set(level);
        true
    }

    /// Claim-and-release every outstanding cancellation job so it runs with
    /// minimal delay, then poll until none remain.
    ///
    /// With `remote_id` set, only cancellation jobs scoped to that connection
    /// are drained.
    async fn drain_cancel_jobs(&self, remote_id: Option<&str>) {
        loop {
            let mut filter = JobFilter::all().with_jobtype(CANCEL_JOBTYPE);
            if let Some(remote_id) = remote_id {
                filter = filter.with_remote_id(remote_id);
            }

            let outstanding = match self.queue.get_all_jobs(filter).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    e.log();
                    return;
                }
            };
            if outstanding.is_empty() {
                // all cancellation jobs have been run
                return;
            }

            for job in outstanding {
                if job.is_claimed() {
                    continue;
                }
                debug!(
                    connection = %job.remote_id,
                    "Making blocking-call cancellation immediately claimable"
                );
                // claim-and-release with zero delay makes the job run asap
                match self.queue.claim(&job).await {
                    Ok(claimed) => {
                        if let Err(e) = self.queue.release(&claimed, Duration::ZERO).await {
                            e.log();
                        }
                    }
                    Err(e) if e.code() == ErrorCode::JobAlreadyClaimed => {}
                    Err(e) => e.log(),
                }
            }

            // give the cancellation jobs a moment to run
            tokio::time::sleep(self.config.manager.cancel_poll_interval).await;
        }
    }

    /// Snapshot of all live workers, for the control API.
    pub fn worker_snapshot(&self) -> Vec<WorkerStatus> {
        let pool = self.pool.lock();
        let mut statuses: Vec<WorkerStatus> = pool
            .values()
            .flatten()
            .map(|handle| WorkerStatus {
                jobtype: handle.jobtype().to_string(),
                job_id: handle.job().id,
                remote_id: handle.job().remote_id.clone(),
                started_at: handle.started_at(),
            })
            .collect();
        statuses.sort_by(|a, b| a.jobtype.cmp(&b.jobtype).then(a.remote_id.cmp(&b.remote_id)));
        statuses
    }

    /// Jobtypes seen in the queue with no registered implementation.
    pub fn unknown_jobtypes(&self) -> Vec<String> {
        let unknown = self.unknown_jobtypes.lock();
        let mut jobtypes: Vec<String> = unknown.iter().cloned().collect();
        jobtypes.sort();
        jobtypes
    }

    /// The queue handle this manager dispatches from.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue a blocking-call cancellation for the given connection.
    ///
    /// Workers use this to request cancellation of their own blocked calls;
    /// the job is picked up by the cancellation worker on its next cycle.
    pub async fn enqueue_cancel(&self, connection_name: &str) {
        if let Err(e) = self
            .queue
            .add_job(CANCEL_JOBTYPE, JobParams::new(connection_name))
            .await
        {
            e.log();
        }
    }
}
