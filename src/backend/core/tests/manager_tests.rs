//! Integration tests for the worker manager.
//!
//! Tests cover:
//! - Per-jobtype concurrency caps
//! - Reap-before-claim slot reuse
//! - Cooperative interrupts (retry and cancel)
//! - The out-of-band blocking-call cancellation protocol
//! - Shutdown ordering (control worker joined last)
//! - Abort draining cancellation jobs before stopping dispatch
//! - Crash containment (failed jobs stay claimed)
//!
//! Everything runs against the in-memory queue backend; the semantics under
//! test are the manager's, not the storage's.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use dredge_core::config::Config;
use dredge_core::jobs::{
    InterruptLevel, InterruptTarget, JobFilter, JobParams, JobQueue, WorkContext, WorkError,
    WorkResult, Worker, WorkerDescriptor, WorkerManager, WorkerRegistry, CANCEL_JOBTYPE,
    CONTROL_JOBTYPE,
};

// ============================================================================
// Test Workers
// ============================================================================

/// Blocks until interrupted, optionally recording an event when it wakes.
struct WaitingWorker {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Worker for WaitingWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        ctx.wait_interrupted().await;
        self.events.lock().unwrap().push(self.label.to_string());
        Err(WorkError::Interrupted)
    }
}

/// Finishes its job and exits immediately.
struct QuickWorker {
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for QuickWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        ctx.queue.finish(&ctx.job).await?;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails with a domain-level processing error.
struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn work(&mut self, _ctx: &mut WorkContext) -> WorkResult {
        Err(WorkError::Processor("could not parse record".to_string()))
    }
}

/// Stands in for the real query canceller: consumes cancellation jobs and
/// records that it ran.
struct FakeCancelWorker {
    executed: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Worker for FakeCancelWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        // record before finishing: once the job disappears from the queue,
        // waiters may proceed immediately
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push("cancelled".to_string());
        ctx.queue.finish(&ctx.job).await?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Config with intervals fast enough for tests.
fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.manager.poll_interval = Duration::from_millis(10);
    config.manager.retry_delay = Duration::from_secs(5);
    config.manager.cancel_poll_interval = Duration::from_millis(10);
    config.manager.shutdown_pause = Duration::from_millis(10);
    Arc::new(config)
}

fn manager_with(
    queue: &JobQueue,
    registry: WorkerRegistry,
    config: Arc<Config>,
) -> Arc<WorkerManager> {
    WorkerManager::new(queue.clone(), None, Arc::new(registry), config)
}

fn waiting_descriptor(
    jobtype: &'static str,
    max_workers: usize,
    events: Arc<Mutex<Vec<String>>>,
) -> WorkerDescriptor {
    WorkerDescriptor::new(jobtype, max_workers, move || {
        Box::new(WaitingWorker {
            label: jobtype,
            events: events.clone(),
        })
    })
}

async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_no_jobs(queue: &JobQueue, filter: JobFilter<'_>, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if queue.get_all_jobs(filter).await.unwrap().is_empty() {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Dispatch & Pool Cap Tests
// ============================================================================

#[tokio::test]
async fn test_pool_respects_max_workers() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 2, events.clone()));

    for n in 0..5 {
        queue
            .add_job("harvest", JobParams::new(format!("thread-{}", n)))
            .await
            .unwrap();
    }

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;

    // exactly two workers running, three jobs left unclaimed
    assert_eq!(manager.worker_snapshot().len(), 2);
    let unclaimed = queue.get_all_jobs(JobFilter::claimable()).await.unwrap();
    assert_eq!(unclaimed.len(), 3);

    // further cycles do not exceed the cap
    manager.delegate().await;
    assert_eq!(manager.worker_snapshot().len(), 2);
}

#[tokio::test]
async fn test_reap_frees_slot_for_next_job() {
    let queue = JobQueue::in_memory();
    let completed = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    let counter = completed.clone();
    registry.register(WorkerDescriptor::new("harvest", 1, move || {
        Box::new(QuickWorker {
            completed: counter.clone(),
        })
    }));

    queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap();
    queue
        .add_job("harvest", JobParams::new("thread-2"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;
    assert_eq!(manager.worker_snapshot().len(), 1);

    // each cycle reaps before claiming, so once the first worker has fully
    // terminated its slot is reused within the same cycle
    let deadline = Instant::now() + Duration::from_secs(5);
    while completed.load(Ordering::SeqCst) < 2 {
        if Instant::now() > deadline {
            panic!("timed out waiting for both jobs to complete");
        }
        manager.delegate().await;
        assert!(manager.worker_snapshot().len() <= 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queue.get_all_jobs(JobFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_jobtype_logged_once_and_left_alone() {
    let queue = JobQueue::in_memory();
    let registry = WorkerRegistry::new();

    queue
        .add_job("mystery", JobParams::new("thread-1"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;
    manager.delegate().await;
    manager.delegate().await;

    // tracked exactly once, job never claimed
    assert_eq!(manager.unknown_jobtypes(), vec!["mystery".to_string()]);
    let jobs = queue.get_all_jobs(JobFilter::all()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(!jobs[0].is_claimed());
}

#[tokio::test]
async fn test_seed_jobs_from_registry() {
    fn ensure(_config: &Config) -> Option<JobParams> {
        Some(JobParams::new("localhost"))
    }

    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 1, events).with_ensure_job(ensure));

    let manager = manager_with(&queue, registry, test_config());
    manager.seed_jobs().await;
    // seeding twice must not duplicate the job
    manager.seed_jobs().await;

    let jobs = queue.get_all_jobs(JobFilter::all()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].describe(), "harvest/localhost");
}

// ============================================================================
// Interrupt Tests
// ============================================================================

#[tokio::test]
async fn test_cancel_interrupt_finishes_job() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 1, events));

    queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;
    assert_eq!(manager.worker_snapshot().len(), 1);

    let delivered = manager
        .request_interrupt(
            InterruptLevel::Cancel,
            InterruptTarget::RemoteId {
                jobtype: "harvest",
                remote_id: "thread-1",
            },
        )
        .await;
    assert!(delivered);

    // the worker observes the flag and its job is finished (removed)
    wait_until_no_jobs(&queue, JobFilter::all(), "cancelled job to be finished").await;

    // removed from the pool once a reap sees the terminated task
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        manager.delegate().await;
        if manager.worker_snapshot().is_empty() {
            break;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for cancelled worker to be reaped");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_retry_interrupt_releases_job_with_delay() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 1, events));

    let job = queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap()
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;

    let delivered = manager
        .request_interrupt(InterruptLevel::Retry, InterruptTarget::Job(&job))
        .await;
    assert!(delivered);

    let queue_for_wait = queue.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let jobs = queue_for_wait.get_all_jobs(JobFilter::all()).await.unwrap();
        if jobs.len() == 1 && !jobs[0].is_claimed() {
            // released, with a nonzero delay: not immediately claimable again
            assert_eq!(jobs[0].attempts, 1);
            assert!(queue_for_wait
                .get_all_jobs(JobFilter::claimable())
                .await
                .unwrap()
                .is_empty());
            break;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for job to be released");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_interrupt_without_live_worker_is_noop() {
    let queue = JobQueue::in_memory();
    let manager = manager_with(&queue, WorkerRegistry::new(), test_config());

    let delivered = manager
        .request_interrupt(
            InterruptLevel::Cancel,
            InterruptTarget::RemoteId {
                jobtype: "harvest",
                remote_id: "thread-1",
            },
        )
        .await;
    assert!(!delivered);
}

#[tokio::test]
async fn test_targeted_interrupt_drains_scoped_cancel_jobs_first() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));
    let executed = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 1, events.clone()));
    let cancel_events = events.clone();
    let cancel_counter = executed.clone();
    registry.register(WorkerDescriptor::new(CANCEL_JOBTYPE, 1, move || {
        Box::new(FakeCancelWorker {
            executed: cancel_counter.clone(),
            events: cancel_events.clone(),
        })
    }));

    queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    {
        let manager = manager.clone();
        wait_until("harvest worker to start", move || {
            manager
                .worker_snapshot()
                .iter()
                .any(|w| w.jobtype == "harvest")
        })
        .await;
    }

    // a cancellation job scoped to the blocked worker's connection, queued
    // far in the future so only the drain can make it run
    let snapshot = manager.worker_snapshot();
    let harvest = snapshot.iter().find(|w| w.jobtype == "harvest").unwrap();
    let connection_name = format!("harvest-{}", harvest.job_id);
    queue
        .add_job(
            CANCEL_JOBTYPE,
            JobParams::new(connection_name)
                .claimable_after(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let delivered = manager
        .request_interrupt(
            InterruptLevel::Cancel,
            InterruptTarget::RemoteId {
                jobtype: "harvest",
                remote_id: "thread-1",
            },
        )
        .await;
    assert!(delivered);
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    wait_until_no_jobs(&queue, JobFilter::all(), "all jobs to be consumed").await;

    // the blocked call was cancelled strictly before the interrupt landed
    let order = events.lock().unwrap().clone();
    assert_eq!(order, vec!["cancelled".to_string(), "harvest".to_string()]);

    manager.stop();
    runner.await.unwrap();
}

// ============================================================================
// Shutdown & Abort Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_joins_control_workers_last() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut registry = WorkerRegistry::new();
    registry.register(waiting_descriptor("harvest", 2, events.clone()));
    registry.register(waiting_descriptor(CONTROL_JOBTYPE, 1, events.clone()));

    queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap();
    queue
        .add_job("harvest", JobParams::new("thread-2"))
        .await
        .unwrap();
    queue
        .add_job(CONTROL_JOBTYPE, JobParams::new("localhost"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    {
        let manager = manager.clone();
        wait_until("all three workers to start", move || {
            manager.worker_snapshot().len() == 3
        })
        .await;
    }

    manager.stop();
    runner.await.unwrap();

    let order = events.lock().unwrap().clone();
    assert_eq!(order.len(), 3);
    // the control worker is always the last one out
    assert_eq!(order.last().unwrap(), CONTROL_JOBTYPE);
    assert_eq!(order.iter().filter(|l| *l == "harvest").count(), 2);
}

#[tokio::test]
async fn test_abort_drains_cancel_jobs_before_stopping() {
    let queue = JobQueue::in_memory();
    let events = Arc::new(Mutex::new(Vec::new()));
    let executed = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    let cancel_events = events.clone();
    let cancel_counter = executed.clone();
    registry.register(WorkerDescriptor::new(CANCEL_JOBTYPE, 1, move || {
        Box::new(FakeCancelWorker {
            executed: cancel_counter.clone(),
            events: cancel_events.clone(),
        })
    }));

    // three outstanding cancellation jobs, none claimable on their own
    let far_future = chrono::Utc::now() + chrono::Duration::hours(1);
    for n in 0..3 {
        queue
            .add_job(
                CANCEL_JOBTYPE,
                JobParams::new(format!("conn-{}", n)).claimable_after(far_future),
            )
            .await
            .unwrap();
    }

    let manager = manager_with(&queue, registry, test_config());
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    assert!(manager.is_running());
    manager.abort().await;

    // abort returns only after every cancellation job has been claimed, run
    // and removed; only then is dispatch stopped
    assert_eq!(executed.load(Ordering::SeqCst), 3);
    assert!(queue
        .get_all_jobs(JobFilter::all().with_jobtype(CANCEL_JOBTYPE))
        .await
        .unwrap()
        .is_empty());
    assert!(!manager.is_running());

    runner.await.unwrap();
}

// ============================================================================
// Failure Containment Tests
// ============================================================================

#[tokio::test]
async fn test_failed_worker_leaves_job_claimed() {
    let queue = JobQueue::in_memory();

    let mut registry = WorkerRegistry::new();
    registry.register(WorkerDescriptor::new("harvest", 1, || {
        Box::new(FailingWorker)
    }));

    queue
        .add_job("harvest", JobParams::new("thread-1"))
        .await
        .unwrap();

    let manager = manager_with(&queue, registry, test_config());
    manager.delegate().await;

    // the worker crashes; its claim is deliberately left in place so the job
    // is not immediately retried into the same crash
    let queue_for_wait = queue.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        manager.delegate().await;
        let snapshot = manager.worker_snapshot();
        if snapshot.is_empty() {
            break;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for failed worker to be reaped");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let jobs = queue_for_wait.get_all_jobs(JobFilter::all()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_claimed());

    // and it is never dispatched again
    manager.delegate().await;
    assert!(manager.worker_snapshot().is_empty());
}
