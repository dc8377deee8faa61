//! Job dispatch and worker lifecycle for the Dredge backend.
//!
//! This module is the scheduling core of the platform:
//!
//! - **Job model**: persisted units of claimable work, unique per
//!   `(jobtype, remote_id)`
//! - **Queue**: claim/release/finish semantics over a pluggable backend
//!   (Postgres in production, in-memory for tests)
//! - **Registry**: catalog mapping jobtypes to worker implementations
//! - **Worker**: the `work()` contract plus the interrupt/cancellation
//!   machinery
//! - **Manager**: the dispatch loop, worker pool, and shutdown/abort
//!   protocols
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ┌───────────┐    ┌───────────┐    ┌────────────┐    ┌─────────┐ │
//! │  │  JobQueue │◀──▶│  Manager  │───▶│  Registry  │───▶│ Worker  │ │
//! │  │ (claims)  │    │ (dispatch)│    │ (catalog)  │    │ (work)  │ │
//! │  └───────────┘    └───────────┘    └────────────┘    └─────────┘ │
//! │        ▲                │ reap / interrupt / join        │       │
//! │        └────────────────┴──────── release / finish ──────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use dredge_core::jobs::{
//!     register_builtin, JobQueue, WorkerDescriptor, WorkerManager, WorkerRegistry,
//! };
//!
//! let mut registry = WorkerRegistry::new();
//! register_builtin(&mut registry);
//! registry.register(WorkerDescriptor::new("search-lobsters", 2, || {
//!     Box::new(LobstersSearchWorker::new())
//! }));
//!
//! let manager = WorkerManager::new(queue, Some(database), registry.into(), config);
//! manager.run().await;
//! ```

pub mod builtin;
pub mod job;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod worker;

pub use job::{Job, JobId, JobParams};
pub use manager::{
    InterruptTarget, WorkerManager, WorkerStatus, CANCEL_JOBTYPE, CONTROL_JOBTYPE,
};
pub use queue::{
    InMemoryQueueBackend, JobFilter, JobQueue, PostgresQueueBackend, QueueBackend,
};
pub use registry::{EnsureJobFn, WorkerDescriptor, WorkerRegistry};
pub use worker::{
    InterruptFlag, InterruptLevel, WorkContext, WorkError, WorkResult, Worker, WorkerHandle,
};

// Built-in workers
pub use builtin::{
    register_builtin, ApiWorker, CancelQueryWorker, JobExpirerWorker, EXPIRE_JOBTYPE,
};
