//! Cron reconciliation and command-queue drain worker.
//!
//! Mirrors the external cron daemon's job list into the `cron_mirror` table
//! and drains the run/delete request queues against the same daemon.
//! A watchdog force-fails requests nobody picked up.

pub mod backoff;
pub mod drain;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod mirror;
pub mod service;
pub mod settings;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;
pub mod watchdog;

pub use error::{Error, ExecutorOutputError, Result};

/// Run database migrations for the mirror and queue tables.
///
/// Creates `cron_mirror`, `cron_run_requests`, `cron_delete_requests` and
/// `activities`. Called by [`store_sqlite::SqliteStore::connect`]; call it
/// yourself before [`store_sqlite::SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
