//! Job data model.
//!
//! A job is a persisted unit of claimable work identified by its type and a
//! caller-assigned remote ID. The queue enforces the claim invariant: a job
//! is held by at most one worker at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted unit of claimable work.
///
/// `(jobtype, remote_id)` is unique within the queue; enqueuing a duplicate
/// is a no-op. A job with an `interval` is recurring: finishing it reschedules
/// it `interval` in the future instead of deleting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Job type key, selects the worker implementation
    pub jobtype: String,
    /// Caller-assigned identifier, unique together with `jobtype`
    pub remote_id: String,
    /// Opaque payload interpreted by the worker
    pub data: serde_json::Value,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// When the job was claimed, if it currently is
    pub claimed_at: Option<DateTime<Utc>>,
    /// The job is not claimable before this moment
    pub claim_after: DateTime<Utc>,
    /// Number of times the job has been released back to the queue
    pub attempts: u32,
    /// Recurrence interval; `None` for one-shot jobs
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
}

impl Job {
    /// Build a new unclaimed job from enqueue parameters.
    pub fn new(jobtype: impl Into<String>, params: JobParams) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            jobtype: jobtype.into(),
            remote_id: params.remote_id,
            data: params.data,
            created_at: now,
            claimed_at: None,
            claim_after: params.claim_after.unwrap_or(now),
            attempts: 0,
            interval: params.interval,
        }
    }

    /// Check if this job is currently claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    /// Check if this job could be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_claimed() && self.claim_after <= now
    }

    /// Short `jobtype/remote_id` label for log lines.
    pub fn describe(&self) -> String {
        format!("{}/{}", self.jobtype, self.remote_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters for enqueuing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    /// Caller-assigned identifier, unique together with the jobtype
    pub remote_id: String,
    /// Opaque payload for the worker
    #[serde(default = "empty_data")]
    pub data: serde_json::Value,
    /// Earliest claimable moment; defaults to immediately
    #[serde(default)]
    pub claim_after: Option<DateTime<Utc>>,
    /// Recurrence interval for recurring jobs
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
}

fn empty_data() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobParams {
    /// Create parameters with the given remote ID and an empty payload.
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            data: empty_data(),
            claim_after: None,
            interval: None,
        }
    }

    /// Set the payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Defer the first claim until `at`.
    pub fn claimable_after(mut self, at: DateTime<Utc>) -> Self {
        self.claim_after = Some(at);
        self
    }

    /// Make the job recurring with the given interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
