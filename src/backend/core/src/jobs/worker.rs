//! Worker trait and execution harness.
//!
//! A worker is one concurrent unit of execution bound to exactly one claimed
//! job. The harness around [`Worker::work`] takes care of the dedicated
//! connection, interrupt handling and crash containment, so implementations
//! only provide the actual job logic.
//!
//! Interruption is cooperative: [`WorkContext::check_interrupt`] should be
//! called at safe points inside `work()`. Workers blocked in calls that never
//! reach a safe point are unblocked out-of-band via cancellation jobs (see
//! the manager module).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::manager::WorkerManager;
use super::registry::WorkerRegistry;
use super::{Job, JobQueue};
use crate::config::Config;
use crate::db::Database;

// ═══════════════════════════════════════════════════════════════════════════════
// Interrupt Level
// ═══════════════════════════════════════════════════════════════════════════════

/// Cooperative interrupt signal observed voluntarily by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptLevel {
    /// No interrupt requested
    None,
    /// Stop and requeue the job so it can run again after a delay
    Retry,
    /// Stop and finish the job, discarding remaining work
    Cancel,
}

impl InterruptLevel {
    const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Retry => 1,
            Self::Cancel => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Retry,
            2 => Self::Cancel,
            _ => Self::None,
        }
    }
}

/// Shared interrupt state between a worker and whoever may interrupt it.
///
/// Setting the flag does not stop anything by itself; the worker observes it
/// at its own safe points.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    level: AtomicU8,
    notify: Notify,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interrupt level and wake any waiters.
    pub fn set(&self, level: InterruptLevel) {
        self.level.store(level.as_u8(), Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Current interrupt level.
    pub fn get(&self) -> InterruptLevel {
        InterruptLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    /// Whether any interrupt has been requested.
    pub fn is_set(&self) -> bool {
        self.get() != InterruptLevel::None
    }

    /// Wait until an interrupt is requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, or a set() racing between the check
            // and the first poll would be missed forever
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Work Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure modes of a `work()` invocation.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The worker observed its interrupt flag and stopped cooperatively.
    #[error("worker interrupted")]
    Interrupted,

    /// A recognized domain-level processing failure. The job's claim is left
    /// untouched so the job is not immediately retried into the same crash.
    #[error("processor error: {0}")]
    Processor(String),

    /// Anything else. Same non-retry policy as processor errors.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<crate::error::DredgeError> for WorkError {
    fn from(error: crate::error::DredgeError) -> Self {
        Self::Unexpected(anyhow::Error::new(error))
    }
}

/// Result type for `work()`.
pub type WorkResult = std::result::Result<(), WorkError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Work Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a running worker has access to.
pub struct WorkContext {
    /// The claimed job this worker was started for
    pub job: Job,
    /// Queue handle bound to this worker's dedicated connection
    pub queue: JobQueue,
    /// Dedicated database handle, when the backend runs against Postgres
    pub database: Option<Database>,
    /// Application configuration
    pub config: Arc<Config>,
    /// The worker catalog, for workers that enqueue work for other types
    pub registry: Arc<WorkerRegistry>,
    connection_name: String,
    interrupt: Arc<InterruptFlag>,
    manager: Weak<WorkerManager>,
}

impl WorkContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: Job,
        queue: JobQueue,
        database: Option<Database>,
        config: Arc<Config>,
        registry: Arc<WorkerRegistry>,
        connection_name: String,
        interrupt: Arc<InterruptFlag>,
        manager: Weak<WorkerManager>,
    ) -> Self {
        Self {
            job,
            queue,
            database,
            config,
            registry,
            connection_name,
            interrupt,
            manager,
        }
    }

    /// Identity of this worker's dedicated connection.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Current interrupt level.
    pub fn interrupt_level(&self) -> InterruptLevel {
        self.interrupt.get()
    }

    /// Whether an interrupt has been requested.
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    /// Bail out with [`WorkError::Interrupted`] if an interrupt is pending.
    ///
    /// Call this at safe points inside `work()`:
    ///
    /// ```rust,ignore
    /// for item in items {
    ///     ctx.check_interrupt()?;
    ///     process(item).await?;
    /// }
    /// ```
    pub fn check_interrupt(&self) -> Result<(), WorkError> {
        if self.interrupted() {
            Err(WorkError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Wait until an interrupt is requested.
    pub async fn wait_interrupted(&self) {
        self.interrupt.wait().await;
    }

    /// The manager that started this worker, if it is still alive.
    pub fn manager(&self) -> Option<Arc<WorkerManager>> {
        self.manager.upgrade()
    }

    pub(crate) fn manager_weak(&self) -> Weak<WorkerManager> {
        self.manager.clone()
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<InterruptFlag> {
        self.interrupt.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The interface all worker implementations provide.
///
/// `work()` is the only required method. `cleanup()` and `abort()` default to
/// no-ops; implementations override them to release resources or stop
/// internal loops.
#[async_trait]
pub trait Worker: Send {
    /// This is where the actual work happens.
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult;

    /// Runs after `work()` regardless of outcome.
    async fn cleanup(&mut self, _ctx: &mut WorkContext) {}

    /// Runs when the worker was interrupted, after the job has been released
    /// or finished.
    async fn abort(&mut self, _ctx: &mut WorkContext) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to one live worker, owned by the manager's pool.
pub struct WorkerHandle {
    job: Job,
    jobtype: String,
    connection_name: String,
    interrupt: Arc<InterruptFlag>,
    handle: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

impl WorkerHandle {
    /// The job this worker holds for its entire lifetime.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The worker's jobtype.
    pub fn jobtype(&self) -> &str {
        &self.jobtype
    }

    /// Identity of the worker's dedicated connection.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// When the worker was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Set the 'abort requested' flag.
    ///
    /// The worker should quit at its earliest convenience when this is set;
    /// this call itself does not stop anything.
    pub fn request_interrupt(&self, level: InterruptLevel) {
        debug!(
            jobtype = %self.job.jobtype,
            remote_id = %self.job.remote_id,
            ?level,
            "Interrupt requested for worker"
        );
        self.interrupt.set(level);
    }

    /// Wait for the worker to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(jobtype = %self.jobtype, "Worker task panicked");
            }
        }
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<InterruptFlag> {
        self.interrupt.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Harness
// ═══════════════════════════════════════════════════════════════════════════════

/// Start a worker task for a freshly claimed job.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    worker: Box<dyn Worker>,
    job: Job,
    jobtype: &str,
    queue: JobQueue,
    database: Option<Database>,
    manager: Weak<WorkerManager>,
    config: Arc<Config>,
    registry: Arc<WorkerRegistry>,
) -> WorkerHandle {
    let interrupt = Arc::new(InterruptFlag::new());
    let connection_name = format!("{}-{}", jobtype, job.id);

    let task_job = job.clone();
    let task_interrupt = interrupt.clone();
    let task_connection = connection_name.clone();
    let handle = tokio::spawn(async move {
        run(
            worker,
            task_job,
            task_connection,
            queue,
            database,
            manager,
            config,
            registry,
            task_interrupt,
        )
        .await;
    });

    WorkerHandle {
        job,
        jobtype: jobtype.to_string(),
        connection_name,
        interrupt,
        handle,
        started_at: Utc::now(),
    }
}

/// Run one worker to completion.
///
/// Crashes are caught here and logged; the job's claim is deliberately left
/// untouched on failure so the job is not immediately run again into the
/// exact same crash.
#[allow(clippy::too_many_arguments)]
async fn run(
    mut worker: Box<dyn Worker>,
    job: Job,
    connection_name: String,
    base_queue: JobQueue,
    database: Option<Database>,
    manager: Weak<WorkerManager>,
    config: Arc<Config>,
    registry: Arc<WorkerRegistry>,
    interrupt: Arc<InterruptFlag>,
) {
    // dedicated connection scoped to this worker; never shared with others
    let queue = match base_queue.dedicated(&connection_name).await {
        Ok(queue) => queue,
        Err(e) => {
            error!(
                job = %job.describe(),
                error = %e,
                "Could not open dedicated queue connection for worker"
            );
            return;
        }
    };

    let database = match database {
        Some(db) => match db.dedicated(&connection_name).await {
            Ok(db) => Some(db),
            Err(e) => {
                error!(
                    job = %job.describe(),
                    error = %e,
                    "Could not open dedicated database connection for worker"
                );
                queue.close().await;
                return;
            }
        },
        None => None,
    };

    let retry_delay = config.manager.retry_delay;
    let mut ctx = WorkContext::new(
        job,
        queue,
        database,
        config,
        registry,
        connection_name,
        interrupt,
        manager,
    );

    match worker.work(&mut ctx).await {
        Ok(()) => {}
        Err(WorkError::Interrupted) => {
            info!(job = %ctx.job.describe(), "Worker interrupted - cancelling");

            // interrupted - retry later or cancel the job altogether?
            let outcome = match ctx.interrupt_level() {
                InterruptLevel::Retry => ctx.queue.release(&ctx.job, retry_delay).await,
                InterruptLevel::Cancel => ctx.queue.finish(&ctx.job).await,
                InterruptLevel::None => Ok(()),
            };
            if let Err(e) = outcome {
                e.log();
            }

            worker.abort(&mut ctx).await;
        }
        Err(WorkError::Processor(message)) => {
            error!(job = %ctx.job.describe(), %message, "Processor error in worker");
        }
        Err(WorkError::Unexpected(e)) => {
            let chain = e
                .chain()
                .map(|cause| cause.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            error!(
                job = %ctx.job.describe(),
                error = %chain,
                "Worker raised an unexpected error and will abort"
            );
        }
    }

    // clean up after work completed or terminated
    worker.cleanup(&mut ctx).await;

    // close the dedicated connections as soon as possible
    ctx.queue.close().await;
    if let Some(db) = &ctx.database {
        db.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
