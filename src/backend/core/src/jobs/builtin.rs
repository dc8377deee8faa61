//! Built-in workers.
//!
//! Three workers ship with the backend: the control API (the reserved
//! jobtype kept alive last during shutdown), the blocking-call canceller,
//! and the recurring job expirer.

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Weak;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::manager::{WorkerManager, WorkerStatus, CANCEL_JOBTYPE, CONTROL_JOBTYPE};
use super::registry::{WorkerDescriptor, WorkerRegistry};
use super::worker::{WorkContext, WorkError, WorkResult, Worker};
use super::JobParams;
use crate::config::Config;

/// Jobtype of the recurring queue expirer.
pub const EXPIRE_JOBTYPE: &str = "expire-jobs";

/// Register all built-in workers.
pub fn register_builtin(registry: &mut WorkerRegistry) {
    registry.register(
        WorkerDescriptor::new(CONTROL_JOBTYPE, 1, || Box::new(ApiWorker))
            .with_ensure_job(ensure_api_job),
    );
    registry.register(WorkerDescriptor::new(CANCEL_JOBTYPE, 1, || {
        Box::new(CancelQueryWorker)
    }));
    registry.register(
        WorkerDescriptor::new(EXPIRE_JOBTYPE, 1, || Box::new(JobExpirerWorker))
            .with_ensure_job(ensure_expire_job),
    );
}

fn ensure_api_job(_config: &Config) -> Option<JobParams> {
    Some(JobParams::new("localhost"))
}

fn ensure_expire_job(config: &Config) -> Option<JobParams> {
    Some(JobParams::new("localhost").with_interval(config.expiry.sweep_interval))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control API Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// The control-plane worker.
///
/// Serves a minimal status API on a local port. During shutdown this worker
/// is interrupted and joined only after every other worker has terminated,
/// so the endpoints stay available to observe the shutdown itself (e.g. to
/// see which worker is hanging).
pub struct ApiWorker;

#[derive(Clone)]
struct ApiState {
    manager: Weak<WorkerManager>,
}

#[async_trait]
impl Worker for ApiWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        let address = format!("{}:{}", ctx.config.api.host, ctx.config.api.port);
        let addr: SocketAddr = address.parse().map_err(|_| {
            WorkError::Processor(format!("invalid control API address: {}", address))
        })?;

        let state = ApiState {
            manager: ctx.manager_weak(),
        };
        let app = Router::new()
            .route("/health", get(health))
            .route("/workers", get(workers))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("binding control API listener")?;
        info!(address = %addr, "Control API listening");

        let flag = ctx.interrupt_flag();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { flag.wait().await })
            .await
            .context("control API server failed")?;

        // the server only returns once an interrupt has been requested
        Err(WorkError::Interrupted)
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn workers(State(state): State<ApiState>) -> Json<Vec<WorkerStatus>> {
    let snapshot = state
        .manager
        .upgrade()
        .map(|manager| manager.worker_snapshot())
        .unwrap_or_default();
    Json(snapshot)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Blocking-Call Canceller
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes blocking-call cancellation jobs.
///
/// Each job's `remote_id` names a connection (`application_name`); every
/// query currently running on that connection is cancelled, then the job is
/// finished. This runs on the canceller's own dedicated connection - the
/// target connection is busy executing the query being cancelled and cannot
/// do it itself.
pub struct CancelQueryWorker;

#[async_trait]
impl Worker for CancelQueryWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        let target = ctx.job.remote_id.clone();

        match &ctx.database {
            Some(db) => {
                let cancelled = db.cancel_queries(&target).await?;
                info!(connection = %target, cancelled, "Cancelled interruptible queries");
            }
            None => {
                // no database backing this deployment, so nothing can be
                // blocked on one; the job is simply consumed
                info!(connection = %target, "No database connection to cancel queries on");
            }
        }

        ctx.queue.finish(&ctx.job).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Expirer
// ═══════════════════════════════════════════════════════════════════════════════

/// Deletes abandoned jobs.
///
/// A job that has been claimed for longer than the configured horizon
/// belongs to a worker that crashed without releasing it (crashed workers
/// deliberately leave their claim in place). This recurring worker sweeps
/// those claims so the queue does not accumulate them forever.
pub struct JobExpirerWorker;

#[async_trait]
impl Worker for JobExpirerWorker {
    async fn work(&mut self, ctx: &mut WorkContext) -> WorkResult {
        ctx.check_interrupt()?;

        let horizon = ctx.config.expiry.claimed_job_max_age;
        let expired = ctx.queue.expire_claimed(horizon).await?;
        if expired > 0 {
            info!(expired, "Expired stale claimed jobs");
        }

        // this worker's job is recurring; finishing it schedules the next run
        ctx.queue.finish(&ctx.job).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
