//! Retry Queue Processor (spec §4.8): a stateless worker invoked on its own
//! schedule, structured like the teacher's `HealthMonitor::start_monitoring`
//! interval loop but driving `retry_queue` row transitions instead of
//! health polling.

use crate::browser_pool::BrowserPool;
use crate::cache::TempCache;
use crate::config::Config;
use crate::model::{Property, RetryStatus, Screenshot, Verdict};
use crate::scheduler::run_single_pipeline;
use crate::upload::BatchUploader;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const BATCH_SIZE: i64 = 50;
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MINUTES: i64 = 30;

pub struct RetryQueueProcessor {
    pool: SqlitePool,
    browser_pool: Arc<BrowserPool>,
    config: Config,
    object_store_root: PathBuf,
}

impl RetryQueueProcessor {
    pub fn new(pool: SqlitePool, browser_pool: Arc<BrowserPool>, config: Config, object_store_root: PathBuf) -> Self {
        Self {
            pool,
            browser_pool,
            config,
            object_store_root,
        }
    }

    /// Runs every `retry_interval` on the Coordinator's schedule (spec §6
    /// "Runtime controls" `retryIntervalMs`). Stops when `cancelled` is set.
    pub async fn run_loop(&self, cancelled: Arc<std::sync::atomic::AtomicBool>) {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        loop {
            ticker.tick().await;
            if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.process_once().await {
                warn!("retry queue processing pass failed: {err}");
            }
        }
    }

    /// One pass: fetch due entries, process each to a terminal or
    /// rescheduled state (spec §4.8 steps 1-3).
    pub async fn process_once(&self) -> Result<(), crate::error::ValidatorError> {
        let due = self.fetch_due_entries().await?;
        if due.is_empty() {
            return Ok(());
        }
        info!("retry queue: {} entries due", due.len());

        for entry in due {
            self.process_entry(entry).await;
        }

        Ok(())
    }

    async fn fetch_due_entries(&self) -> Result<Vec<RawRetryEntry>, crate::error::ValidatorError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id, propertyId, runId, attemptCount FROM retry_queue \
             WHERE status = 'pending' AND nextRetryAt <= ? ORDER BY nextRetryAt LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RawRetryEntry {
                id: row.get("id"),
                property_id: row.get("propertyId"),
                run_id: row.get("runId"),
                attempt_count: row.get::<i64, _>("attemptCount") as u32,
            })
            .collect())
    }

    async fn process_entry(&self, entry: RawRetryEntry) {
        let now = Utc::now();

        // Compare-and-set claim: only one processor can move an entry from
        // pending to retrying (spec §4.8 step 3).
        let claimed = sqlx::query(
            "UPDATE retry_queue SET status = 'retrying', lastAttemptAt = ?, updatedAt = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&entry.id)
        .execute(&self.pool)
        .await;

        match claimed {
            Ok(result) if result.rows_affected() == 1 => {}
            Ok(_) => return,
            Err(err) => {
                warn!(entry_id = %entry.id, "failed to claim retry queue entry: {err}");
                return;
            }
        }

        let property = match self.fetch_property(&entry.property_id).await {
            Ok(Some(property)) => property,
            Ok(None) => {
                warn!(property_id = %entry.property_id, "retry queue entry references an unknown property, marking permanent failure");
                self.mark_permanent_failure(&entry.id).await;
                return;
            }
            Err(err) => {
                warn!(property_id = %entry.property_id, "failed to load property for retry: {err}");
                self.reschedule_or_fail(&entry).await;
                return;
            }
        };

        let handle = match self.browser_pool.get_browser().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("retry queue processor could not acquire a browser: {err}");
                self.reschedule_or_fail(&entry).await;
                return;
            }
        };

        let result = run_single_pipeline(&property, &entry.run_id, Arc::clone(&handle.browser), self.config.phase2_timeout).await;

        match result {
            Ok((verdict, screenshot)) => {
                self.persist_resolved_verdict(&entry.run_id, verdict, screenshot).await;
                self.mark_resolved(&entry.id).await;
            }
            Err(err) => {
                warn!(property_id = %entry.property_id, "retry attempt failed: {err}");
                self.reschedule_or_fail(&entry).await;
            }
        }
    }

    async fn fetch_property(&self, property_id: &str) -> Result<Option<Property>, crate::error::ValidatorError> {
        let row = sqlx::query(
            "SELECT id, displayName, targetUrl, expectedAnalyticsId, expectedTagManagerId, \
             usesConsentMode, slug FROM properties WHERE id = ?",
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Property {
            id: row.get("id"),
            display_name: row.get("displayName"),
            target_url: row.get("targetUrl"),
            expected_analytics_id: row.get("expectedAnalyticsId"),
            expected_tag_manager_id: row.get("expectedTagManagerId"),
            uses_consent_mode: row.get::<i64, _>("usesConsentMode") != 0,
            slug: row.get("slug"),
        }))
    }

    /// Records the resolved verdict through the same `BatchUploader` path
    /// normal runs use, via a one-entry `TempCache` — there is no separate
    /// write path for retry-queue successes (spec §6 "verdict rows ...
    /// written only by the Batch Uploader").
    async fn persist_resolved_verdict(&self, run_id: &str, verdict: Verdict, screenshot: Option<Screenshot>) {
        let cache = TempCache::new(None);
        cache.add_verdict(&verdict.property_id, verdict.clone(), false).await;
        if let Some(screenshot) = screenshot {
            cache.add_screenshot(&verdict.property_id, screenshot).await;
        }
        let uploader = BatchUploader::new(self.pool.clone(), self.object_store_root.clone());
        let stats = uploader.upload_run(run_id, &cache).await;
        if stats.upload_failed_count > 0 {
            warn!(property_id = %verdict.property_id, "resolved retry verdict failed to persist");
        }
    }

    async fn mark_resolved(&self, entry_id: &str) {
        let now = Utc::now();
        let _ = sqlx::query("UPDATE retry_queue SET status = 'resolved', updatedAt = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(entry_id)
            .execute(&self.pool)
            .await;
    }

    async fn mark_permanent_failure(&self, entry_id: &str) {
        let now = Utc::now();
        let _ = sqlx::query("UPDATE retry_queue SET status = 'permanent_failure', updatedAt = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(entry_id)
            .execute(&self.pool)
            .await;
    }

    /// On failure: `attemptCount += 1`; below 3, back to `pending` with
    /// `nextRetryAt = now + 30min * 2^(attemptCount-1)` (30m, 60m, 120m);
    /// at 3, `permanent_failure` (spec §4.8 step 2).
    async fn reschedule_or_fail(&self, entry: &RawRetryEntry) {
        let next_attempt = entry.attempt_count + 1;
        let now = Utc::now();

        if next_attempt >= MAX_ATTEMPTS {
            let _ = sqlx::query(
                "UPDATE retry_queue SET status = 'permanent_failure', attemptCount = ?, updatedAt = ? WHERE id = ?",
            )
            .bind(next_attempt as i64)
            .bind(now.to_rfc3339())
            .bind(&entry.id)
            .execute(&self.pool)
            .await;
            return;
        }

        let backoff_minutes = BASE_BACKOFF_MINUTES * 2i64.pow(next_attempt - 1);
        let next_retry_at: DateTime<Utc> = now + ChronoDuration::minutes(backoff_minutes);

        let _ = sqlx::query(
            "UPDATE retry_queue SET status = 'pending', attemptCount = ?, nextRetryAt = ?, updatedAt = ? WHERE id = ?",
        )
        .bind(next_attempt as i64)
        .bind(next_retry_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&entry.id)
        .execute(&self.pool)
        .await;
    }
}

struct RawRetryEntry {
    id: String,
    property_id: String,
    run_id: String,
    attempt_count: u32,
}

/// Conversion helper used by the Run Coordinator/Batch Uploader when a
/// fresh `RetryQueueEntry` needs inserting (the scheduler builds these in
/// memory; this writes them to the datastore).
pub async fn insert_retry_queue_entries(
    pool: &SqlitePool,
    entries: &[crate::model::RetryQueueEntry],
) -> Result<(), crate::error::ValidatorError> {
    for entry in entries {
        sqlx::query(
            "INSERT INTO retry_queue (id, propertyId, runId, reason, attemptCount, lastAttemptAt, \
             nextRetryAt, status, createdAt, updatedAt) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.property_id)
        .bind(&entry.run_id)
        .bind(&entry.reason)
        .bind(entry.attempt_count as i64)
        .bind(entry.last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(entry.next_retry_at.to_rfc3339())
        .bind(retry_status_label(entry.status))
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.updated_at.to_rfc3339())
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn retry_status_label(status: RetryStatus) -> &'static str {
    match status {
        RetryStatus::Pending => "pending",
        RetryStatus::Retrying => "retrying",
        RetryStatus::Resolved => "resolved",
        RetryStatus::PermanentFailure => "permanent_failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_status_labels_are_lowercase_snake() {
        assert_eq!(retry_status_label(RetryStatus::PermanentFailure), "permanent_failure");
        assert_eq!(retry_status_label(RetryStatus::Pending), "pending");
    }
}
