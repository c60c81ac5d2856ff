//! File-backed catalog cache shared by concurrent CLI invocations.
//!
//! One SQLite file holds job state, the instance-shape catalog, spot quotes
//! and the timed locks that rate-limit refreshes. Snakemake hammers the CLI
//! with status checks, so the pool opens with a very long busy timeout and
//! every cross-process decision goes through row-level locking; there are no
//! lock files.

use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::SubsecRound;
use chrono::Utc;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;

use crate::migrations::MIGRATOR;

mod catalog;
mod jobs;

pub use catalog::InstanceShape;
pub use jobs::JobLaunchParams;
pub use jobs::JobRecord;

/// Tolerates a stampede of status checks from the workflow engine.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct Cache {
    pool: SqlitePool,
}

impl Cache {
    /// Open (creating and migrating if necessary) the cache file.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .log_statements(LevelFilter::Off);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Cooperative rate limiter: returns true in at most one caller per
    /// window of length `delta`, across processes sharing the cache file.
    ///
    /// A crashed holder releases the lock implicitly once `delta` elapses.
    pub async fn timed_lock(&self, key: &str, delta: Duration) -> anyhow::Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN EXCLUSIVE").execute(&mut *conn).await?;
        match timed_lock_tx(&mut conn, key, delta).await {
            Ok(acquired) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(acquired)
            }
            Err(err) => {
                // the connection goes back to the pool; never leave the
                // exclusive transaction open on it
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_lock_instant(
        &self,
        key: &str,
        instant: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO timed_locks (key, instant) VALUES (?, ?)")
            .bind(key)
            .bind(instant.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn timed_lock_tx(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
    delta: Duration,
) -> anyhow::Result<bool> {
    let now = Utc::now();
    let stored: Option<(String,)> = sqlx::query_as("SELECT instant FROM timed_locks WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    let expired = match stored {
        None => true,
        Some((instant,)) => match DateTime::parse_from_rfc3339(&instant) {
            Ok(instant) => {
                now.signed_duration_since(instant).num_milliseconds() > delta.as_millis() as i64
            }
            // an unreadable instant would otherwise never expire; take over
            Err(_) => true,
        },
    };
    if expired {
        sqlx::query("INSERT OR REPLACE INTO timed_locks (key, instant) VALUES (?, ?)")
            .bind(key)
            .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&mut *conn)
            .await?;
    }
    Ok(expired)
}

/// Now, truncated to whole seconds: the precision every persisted job
/// timestamp carries.
pub fn now_second_precision() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// ISO-8601, UTC, second precision: `2026-08-01T12:34:56Z`.
pub(crate) fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_instant(text: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .map_err(|err| anyhow::anyhow!("invalid timestamp {text}: {err}"))?
        .with_timezone(&Utc))
}
