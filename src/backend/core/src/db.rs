//! Postgres access for the job queue and workers.
//!
//! Each worker gets its own [`Database`] handle with a distinct
//! `application_name`. That name is the identity the cancellation protocol
//! targets: a `cancel-db-query` job's `remote_id` names the connection whose
//! in-flight queries should be cancelled.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// A named connection pool.
///
/// The backend-wide handle is shared by the manager and the queue; workers
/// receive [`Database::dedicated`] handles that are never shared between
/// workers (connections are not safe for concurrent use by two workers).
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    url: String,
    appname: String,
}

impl Database {
    /// Connect a new pool with the given `application_name`.
    pub async fn connect(url: &str, appname: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?.application_name(appname);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            url: url.to_string(),
            appname: appname.to_string(),
        })
    }

    /// Derive a single-connection handle owned by one worker.
    pub async fn dedicated(&self, appname: &str) -> Result<Self> {
        Self::connect(&self.url, appname, 1).await
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The `application_name` this handle connects with.
    pub fn appname(&self) -> &str {
        &self.appname
    }

    /// Cancel every query currently running on connections named `appname`.
    ///
    /// Returns the number of backends a cancellation request was sent to.
    /// This runs on *this* handle's connection, which is the whole point: the
    /// target connection is busy executing the query being cancelled.
    pub async fn cancel_queries(&self, appname: &str) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT pg_cancel_backend(pid) FROM pg_stat_activity \
             WHERE application_name = $1 AND pid <> pg_backend_pid()",
        )
        .bind(appname)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.len() as u64)
    }

    /// Close the pool, returning its connections to the server.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
