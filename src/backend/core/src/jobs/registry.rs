//! Worker implementation catalog.
//!
//! Maps each jobtype string to the worker implementation that runs it, along
//! with that implementation's static properties: its concurrency cap and an
//! optional hook for seeding a recurring job at startup.

use std::collections::HashMap;
use tracing::warn;

use super::worker::Worker;
use super::JobParams;
use crate::config::Config;

/// Hook invoked once at manager startup to seed a recurring job.
///
/// Returning `None` means no job should be seeded for this worker.
pub type EnsureJobFn = fn(&Config) -> Option<JobParams>;

type BuildFn = dyn Fn() -> Box<dyn Worker> + Send + Sync;

/// A registered worker implementation and its static properties.
pub struct WorkerDescriptor {
    jobtype: &'static str,
    max_workers: usize,
    ensure_job: Option<EnsureJobFn>,
    build: Box<BuildFn>,
}

impl WorkerDescriptor {
    /// Describe a worker implementation.
    ///
    /// `max_workers` caps how many workers of this type run in parallel. Be
    /// careful with values above 1: external rate limits are easily violated
    /// by concurrent workers of the same type.
    pub fn new(
        jobtype: &'static str,
        max_workers: usize,
        build: impl Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    ) -> Self {
        Self {
            jobtype,
            max_workers,
            ensure_job: None,
            build: Box::new(build),
        }
    }

    /// Attach an `ensure_job` startup hook.
    pub fn with_ensure_job(mut self, ensure_job: EnsureJobFn) -> Self {
        self.ensure_job = Some(ensure_job);
        self
    }

    /// The jobtype this implementation handles.
    pub fn jobtype(&self) -> &'static str {
        self.jobtype
    }

    /// Maximum workers of this type running in parallel.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The startup seeding hook, if any.
    pub fn ensure_job(&self) -> Option<EnsureJobFn> {
        self.ensure_job
    }

    /// Construct a fresh worker instance.
    pub fn build(&self) -> Box<dyn Worker> {
        (self.build)()
    }
}

impl std::fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("jobtype", &self.jobtype)
            .field("max_workers", &self.max_workers)
            .field("ensure_job", &self.ensure_job.is_some())
            .finish()
    }
}

/// The catalog of registered worker implementations.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<&'static str, WorkerDescriptor>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker implementation. Re-registering a jobtype replaces
    /// the previous implementation.
    pub fn register(&mut self, descriptor: WorkerDescriptor) -> &mut Self {
        if self.workers.contains_key(descriptor.jobtype()) {
            warn!(jobtype = descriptor.jobtype(), "Replacing registered worker");
        }
        self.workers.insert(descriptor.jobtype(), descriptor);
        self
    }

    /// Look up the implementation for a jobtype.
    pub fn get(&self, jobtype: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(jobtype)
    }

    /// Whether a jobtype has a registered implementation.
    pub fn contains(&self, jobtype: &str) -> bool {
        self.workers.contains_key(jobtype)
    }

    /// Iterate over all registered implementations.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values()
    }

    /// Number of registered implementations.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
