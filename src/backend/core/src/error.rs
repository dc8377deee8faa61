//! Error handling for Dredge Core.
//!
//! This module provides:
//! - Structured error types with context and chaining
//! - Error codes for machine-readable handling (e.g. claim races)
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use dredge_core::error::{DredgeError, ErrorCode, Result};
//!
//! fn claim_job() -> Result<()> {
//!     Err(DredgeError::job_already_claimed("search-lobsters", "thread-911"))
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Dredge operations.
pub type Result<T> = std::result::Result<T, DredgeError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable; callers match on them for programmatic handling
/// (most importantly `JobAlreadyClaimed`, which is an expected race outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job errors (1000-1099)
    JobAlreadyClaimed,
    JobNotFound,
    UnknownJobType,
    WorkerStartFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    InvalidJson,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Job errors
            Self::JobAlreadyClaimed => 1000,
            Self::JobNotFound => 1001,
            Self::UnknownJobType => 1002,
            Self::WorkerStartFailed => 1003,

            // Database Errors
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::InvalidJson => 2201,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed | Self::DatabaseQueryFailed | Self::DatabaseError
        )
    }

    /// Check if this error is an expected, benign outcome rather than a fault.
    ///
    /// Losing a claim race is the normal result of two dispatchers seeing the
    /// same job; dispatch continues without logging.
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::JobAlreadyClaimed)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected conditions (claim races, missing jobs)
    Low,
    /// Operational issues (worker start failures)
    Medium,
    /// System errors (database failures, bad configuration)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            // Low severity - expected conditions
            ErrorCode::JobAlreadyClaimed | ErrorCode::JobNotFound => Self::Low,

            // Medium severity - operational
            ErrorCode::UnknownJobType | ErrorCode::WorkerStartFailed => Self::Medium,

            // High severity - system errors
            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            // Critical severity
            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Dredge Core.
///
/// This error type supports:
/// - Structured error codes for programmatic handling
/// - Error chaining with context
/// - User-friendly vs internal messages
/// - Metrics integration
#[derive(Error, Debug)]
pub struct DredgeError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for DredgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DredgeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create the dedicated "already claimed" error for a lost claim race.
    pub fn job_already_claimed(jobtype: impl Into<String>, remote_id: impl Into<String>) -> Self {
        let jobtype = jobtype.into();
        let remote_id = remote_id.into();
        Self::new(
            ErrorCode::JobAlreadyClaimed,
            format!("Job {}/{} is already claimed", jobtype, remote_id),
        )
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "dredge_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for DredgeError {
    fn from(error: sqlx::Error) -> Self {
        let code = match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorCode::DatabaseConnectionFailed
            }
            sqlx::Error::RowNotFound => ErrorCode::JobNotFound,
            _ => ErrorCode::DatabaseQueryFailed,
        };
        Self::with_internal(code, "Database operation failed", error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for DredgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidJson,
            "Failed to serialize or deserialize JSON",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for DredgeError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::JobAlreadyClaimed.numeric_code(), 1000);
        assert_eq!(ErrorCode::DatabaseError.numeric_code(), 2000);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 9000);

        assert_eq!(ErrorCode::JobAlreadyClaimed.category(), "job");
        assert_eq!(ErrorCode::DatabaseQueryFailed.category(), "database");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }

    #[test]
    fn test_benign_claim_race() {
        let error = DredgeError::job_already_claimed("search-lobsters", "thread-1");
        assert_eq!(error.code(), ErrorCode::JobAlreadyClaimed);
        assert!(error.code().is_benign());
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCode::DatabaseConnectionFailed.is_retryable());
        assert!(!ErrorCode::JobAlreadyClaimed.is_retryable());
        assert!(!ErrorCode::ConfigurationError.is_retryable());
    }

    #[test]
    fn test_display_includes_internal() {
        let error = DredgeError::with_internal(
            ErrorCode::DatabaseQueryFailed,
            "Database operation failed",
            "relation \"jobs\" does not exist",
        );
        let rendered = error.to_string();
        assert!(rendered.contains("DatabaseQueryFailed"));
        assert!(rendered.contains("does not exist"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let error: DredgeError = parse_error.into();
        assert_eq!(error.code(), ErrorCode::InvalidJson);
        assert!(error.internal_message().is_some());
    }
}
