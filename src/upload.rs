//! Batch Uploader (spec §4.7): drains the Temp Cache once Phase 2 (or
//! Phase 1, if nothing queued for Phase 2) completes and persists verdicts
//! and screenshots to the datastore/object store.
//!
//! Grounded on the teacher's `worker.rs` `BatchProcessor`/`WorkerPool`
//! bounded-concurrency pattern: a fixed-size `Semaphore` gates in-flight
//! screenshot uploads the same way the teacher gates in-flight screenshot
//! requests, and chunked retry-with-backoff mirrors the teacher's
//! `CircuitBreaker`-gated transport retries.

use crate::cache::TempCache;
use crate::config::RetryConfig;
use crate::error::{CircuitBreaker, ValidatorError};
use crate::model::{Issue, Screenshot, UploadStats, Verdict, VerdictStatus};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

const VERDICT_CHUNK_SIZE: usize = 50;
const SCREENSHOT_UPLOAD_CONCURRENCY: usize = 5;

pub struct BatchUploader {
    pool: SqlitePool,
    object_store_root: PathBuf,
    circuit_breaker: CircuitBreaker,
}

impl BatchUploader {
    pub fn new(pool: SqlitePool, object_store_root: PathBuf) -> Self {
        Self {
            pool,
            object_store_root,
            circuit_breaker: CircuitBreaker::new(5, std::time::Duration::from_secs(30)),
        }
    }

    /// Drains `cache` and writes every verdict/screenshot pair to the
    /// datastore/object store, then clears the cache unconditionally (spec
    /// §4.7 post-condition — runs even if the uploads themselves failed).
    pub async fn upload_run(&self, run_id: &str, cache: &TempCache) -> UploadStats {
        let started = std::time::Instant::now();
        let entries = cache.export_for_upload().await;

        let (well_formed, malformed): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(verdict, _)| is_well_formed_property_id(&verdict.property_id));

        for (verdict, _) in &malformed {
            warn!(property_id = %verdict.property_id, "dropping verdict with malformed propertyId before upload");
        }

        let success = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        for chunk in well_formed.chunks(VERDICT_CHUNK_SIZE) {
            self.upload_verdict_chunk(chunk, &success, &failed).await;
        }

        let screenshot_jobs: Vec<(Verdict, Screenshot)> = well_formed
            .into_iter()
            .filter_map(|(verdict, screenshot)| screenshot.map(|s| (verdict, s)))
            .collect();
        self.upload_screenshots(run_id, screenshot_jobs).await;

        cache.clear().await;

        UploadStats {
            upload_completed_at: Utc::now(),
            upload_duration_ms: started.elapsed().as_millis() as u64,
            upload_success_count: success.load(Ordering::SeqCst),
            upload_failed_count: failed.load(Ordering::SeqCst),
        }
    }

    async fn upload_verdict_chunk(&self, chunk: &[(Verdict, Option<Screenshot>)], success: &AtomicUsize, failed: &AtomicUsize) {
        let retry = RetryConfig::inline();
        let mut delay = retry.initial_delay;

        for attempt in 1..=retry.max_attempts {
            if !self.circuit_breaker.can_execute() {
                warn!("verdict upload circuit breaker open, skipping chunk of {} verdicts", chunk.len());
                failed.fetch_add(chunk.len(), Ordering::SeqCst);
                return;
            }

            match self.insert_verdicts(chunk).await {
                Ok(()) => {
                    self.circuit_breaker.record_success();
                    success.fetch_add(chunk.len(), Ordering::SeqCst);
                    return;
                }
                Err(err) => {
                    self.circuit_breaker.record_failure();
                    if attempt == retry.max_attempts {
                        warn!("verdict chunk upload failed after {attempt} attempts: {err}");
                        failed.fetch_add(chunk.len(), Ordering::SeqCst);
                        return;
                    }
                    warn!("verdict chunk upload attempt {attempt} failed, retrying in {delay:?}: {err}");
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn insert_verdicts(&self, chunk: &[(Verdict, Option<Screenshot>)]) -> Result<(), ValidatorError> {
        let mut tx = self.pool.begin().await?;

        for (verdict, _) in chunk {
            let analytics_id_actual = verdict.analytics_id_check.chosen_actual.clone();
            let tag_manager_ids_actual = serde_json::to_string(&verdict.tag_manager_id_check.all_found)?;
            let page_view_detected = verdict.page_view_check.count > 0;
            let has_issues = !verdict.issues.is_empty();
            let issue_kinds = serde_json::to_string(&verdict.issues.iter().map(issue_kind_label).collect::<Vec<_>>())?;
            let issue_summary = summarize_issues(&verdict.issues);
            let details = serde_json::to_string(verdict)?;

            sqlx::query(
                "INSERT INTO verdicts (id, runId, propertyId, phase, status, analyticsIdActual, \
                 tagManagerIdsActual, pageViewDetected, hasIssues, issueKinds, issueSummary, \
                 screenshotUrl, durationMs, details) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(runId, propertyId, phase) DO UPDATE SET \
                 status=excluded.status, analyticsIdActual=excluded.analyticsIdActual, \
                 tagManagerIdsActual=excluded.tagManagerIdsActual, pageViewDetected=excluded.pageViewDetected, \
                 hasIssues=excluded.hasIssues, issueKinds=excluded.issueKinds, issueSummary=excluded.issueSummary, \
                 durationMs=excluded.durationMs, details=excluded.details",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&verdict.run_id)
            .bind(&verdict.property_id)
            .bind(verdict.phase as i64)
            .bind(verdict_status_label(verdict.status))
            .bind(analytics_id_actual)
            .bind(tag_manager_ids_actual)
            .bind(page_view_detected)
            .bind(has_issues)
            .bind(issue_kinds)
            .bind(issue_summary)
            .bind(Option::<String>::None)
            .bind(verdict.wall_clock_ms as i64)
            .bind(details)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Parallel upload with bounded concurrency 5 (spec §4.7), same retry
    /// policy as verdict inserts. On success, updates the verdict row's
    /// `screenshotUrl`.
    async fn upload_screenshots(&self, run_id: &str, jobs: Vec<(Verdict, Screenshot)>) {
        let semaphore = Arc::new(Semaphore::new(SCREENSHOT_UPLOAD_CONCURRENCY));
        let mut handles = Vec::with_capacity(jobs.len());

        for (verdict, screenshot) in jobs {
            let semaphore = Arc::clone(&semaphore);
            let root = self.object_store_root.clone();
            let pool = self.pool.clone();
            let run_id = run_id.to_string();
            let circuit_breaker = self.circuit_breaker.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                upload_one_screenshot(&pool, &root, &run_id, &verdict, &screenshot, &circuit_breaker).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn upload_one_screenshot(
    pool: &SqlitePool,
    object_store_root: &PathBuf,
    run_id: &str,
    verdict: &Verdict,
    screenshot: &Screenshot,
    circuit_breaker: &CircuitBreaker,
) {
    let retry = RetryConfig::inline();
    let mut delay = retry.initial_delay;
    let epoch_ms = screenshot.captured_at.timestamp_millis();
    let object_key = format!("{run_id}/{}_{epoch_ms}.jpg", verdict.property_id);

    for attempt in 1..=retry.max_attempts {
        if !circuit_breaker.can_execute() {
            warn!(property_id = %verdict.property_id, "screenshot upload circuit breaker open");
            return;
        }

        match write_and_record(pool, object_store_root, &object_key, verdict, screenshot).await {
            Ok(()) => {
                circuit_breaker.record_success();
                return;
            }
            Err(err) => {
                circuit_breaker.record_failure();
                if attempt == retry.max_attempts {
                    warn!(property_id = %verdict.property_id, "screenshot upload failed after {attempt} attempts: {err}");
                    return;
                }
                sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

async fn write_and_record(
    pool: &SqlitePool,
    object_store_root: &PathBuf,
    object_key: &str,
    verdict: &Verdict,
    screenshot: &Screenshot,
) -> Result<(), ValidatorError> {
    let path = object_store_root.join(object_key);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &screenshot.bytes).await?;

    sqlx::query("UPDATE verdicts SET screenshotUrl = ? WHERE runId = ? AND propertyId = ? AND phase = ?")
        .bind(object_key)
        .bind(&verdict.run_id)
        .bind(&verdict.property_id)
        .bind(verdict.phase as i64)
        .execute(pool)
        .await?;

    info!(property_id = %verdict.property_id, object_key, "uploaded screenshot");
    Ok(())
}

fn is_well_formed_property_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn verdict_status_label(status: VerdictStatus) -> &'static str {
    match status {
        VerdictStatus::Passed => "passed",
        VerdictStatus::Failed => "failed",
        VerdictStatus::Timeout => "timeout",
        VerdictStatus::Error => "error",
    }
}

fn issue_kind_label(issue: &Issue) -> String {
    serde_json::to_value(issue.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn summarize_issues(issues: &[Issue]) -> Option<String> {
    if issues.is_empty() {
        return None;
    }
    Some(issues.iter().map(|issue| issue.message.clone()).collect::<Vec<_>>().join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_ids_accept_alphanumeric_hyphen_underscore() {
        assert!(is_well_formed_property_id("prop-123_ABC"));
        assert!(!is_well_formed_property_id(""));
        assert!(!is_well_formed_property_id("has space"));
        assert!(!is_well_formed_property_id(&"x".repeat(129)));
    }
}
