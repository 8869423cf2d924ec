//! SQLite realization of the "transactional relational store" contract
//! (spec §1/§6). `sqlx::SqlitePool` is the one connection pool shared by
//! `property_source`, `upload`, `retry_queue` and `coordinator` — each
//! module writes its own tables directly with `sqlx::query`, matching the
//! direct-query style `property_source.rs` already uses rather than
//! introducing a repository abstraction layer.

use crate::error::ValidatorError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    id TEXT PRIMARY KEY,
    displayName TEXT NOT NULL,
    targetUrl TEXT NOT NULL,
    expectedAnalyticsId TEXT,
    expectedTagManagerId TEXT,
    usesConsentMode INTEGER NOT NULL DEFAULT 0,
    slug TEXT NOT NULL,
    isActive INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    startedAt TEXT NOT NULL,
    finishedAt TEXT,
    status TEXT NOT NULL,
    workerCount INTEGER NOT NULL,
    totalProperties INTEGER NOT NULL,
    completedCount INTEGER NOT NULL DEFAULT 0,
    failedCount INTEGER NOT NULL DEFAULT 0,
    uploadCompletedAt TEXT,
    uploadDurationMs INTEGER,
    uploadSuccessCount INTEGER,
    uploadFailedCount INTEGER
);

CREATE TABLE IF NOT EXISTS verdicts (
    id TEXT PRIMARY KEY,
    runId TEXT NOT NULL,
    propertyId TEXT NOT NULL,
    phase INTEGER NOT NULL,
    status TEXT NOT NULL,
    analyticsIdActual TEXT,
    tagManagerIdsActual TEXT NOT NULL DEFAULT '[]',
    pageViewDetected INTEGER NOT NULL DEFAULT 0,
    hasIssues INTEGER NOT NULL DEFAULT 0,
    issueKinds TEXT NOT NULL DEFAULT '[]',
    issueSummary TEXT,
    screenshotUrl TEXT,
    durationMs INTEGER NOT NULL,
    details TEXT NOT NULL,
    UNIQUE(runId, propertyId, phase)
);

CREATE TABLE IF NOT EXISTS retry_queue (
    id TEXT PRIMARY KEY,
    propertyId TEXT NOT NULL,
    runId TEXT NOT NULL,
    reason TEXT NOT NULL,
    attemptCount INTEGER NOT NULL,
    lastAttemptAt TEXT,
    nextRetryAt TEXT NOT NULL,
    status TEXT NOT NULL,
    createdAt TEXT NOT NULL,
    updatedAt TEXT NOT NULL
);
"#;

/// Opens (creating if absent) the SQLite file at `path` and applies the
/// schema. Safe to call on every process start — every statement is
/// `CREATE TABLE IF NOT EXISTS`.
pub async fn init_pool(path: &str) -> Result<SqlitePool, ValidatorError> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(|e| ValidatorError::DatastoreError(e.to_string()))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    sqlx::query(SCHEMA).execute(&pool).await?;

    Ok(pool)
}
