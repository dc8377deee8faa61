//! # Dredge Core
//!
//! Backend of the Dredge research-data collection and analysis platform.
//!
//! ## Architecture
//!
//! - **Jobs**: persistent queue with claim semantics, a worker catalog, and
//!   the dispatch/lifecycle manager with its interrupt and cancellation
//!   protocols
//! - **Database**: Postgres access with per-worker dedicated connections
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: layered file + environment configuration

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{DredgeError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{DredgeError, ErrorCode, ErrorSeverity, Result};
    pub use crate::jobs::{
        register_builtin, InterruptLevel, InterruptTarget, Job, JobFilter, JobId, JobParams,
        JobQueue, WorkContext, WorkError, WorkResult, Worker, WorkerDescriptor, WorkerManager,
        WorkerRegistry,
    };
}
