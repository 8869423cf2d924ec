//! Run Coordinator (spec §4.9): the single entry point that owns a run's
//! lifecycle end to end — acquiring the host-local lock, creating the Run
//! record, driving the Two-Phase Scheduler, handing its output to the Batch
//! Uploader, and guaranteeing the Temp Cache is empty on every exit path.
//!
//! Grounded on the teacher's `main.rs` `setup_shutdown_handler` — the same
//! SIGINT/SIGTERM `tokio::select!` pattern, now racing against the
//! scheduler's run future instead of the screenshot service's.

use crate::browser_pool::BrowserPool;
use crate::cache::TempCache;
use crate::config::Config;
use crate::error::ValidatorError;
use crate::model::{Run, RunStatus};
use crate::property_source::PropertySource;
use crate::scheduler::{ProgressEvent, TwoPhaseScheduler};
use crate::upload::BatchUploader;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

/// A held process lock at `path`. Removed on `Drop` so every exit path —
/// normal completion, cancellation, or an early `?` — releases it.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Refuses to acquire if the lockfile names a pid that is still alive
    /// (spec §4.9 "refuses to start if lock held by a live process"). A
    /// lockfile naming a dead pid is stale and is silently reclaimed.
    pub async fn acquire(path: &str) -> Result<Self, ValidatorError> {
        let path = PathBuf::from(path);

        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if process_is_alive(pid) {
                    return Err(ValidatorError::LockHeld(pid));
                }
                warn!(pid, "reclaiming stale run lock left by a dead process");
            }
        }

        tokio::fs::write(&path, std::process::id().to_string()).await?;
        Ok(Self { path })
    }

    pub async fn release(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove run lock at {:?}: {err}", self.path);
            }
        }
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op delivery, just existence/permission checks
    // (the same probe the teacher's browser pool health check would use
    // for "is the handler still alive").
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

pub struct RunCoordinator {
    pool: SqlitePool,
    browser_pool: Arc<BrowserPool>,
    config: Config,
}

impl RunCoordinator {
    pub fn new(pool: SqlitePool, browser_pool: Arc<BrowserPool>, config: Config) -> Self {
        Self { pool, browser_pool, config }
    }

    /// Drives one full run: lock → Run row → Two-Phase Scheduler → Batch
    /// Uploader → terminal status. Returns the finished `Run` record.
    pub async fn execute(&self, source: &dyn PropertySource) -> Result<Run, ValidatorError> {
        let lock = RunLock::acquire(&self.config.lockfile_path).await?;
        let result = self.execute_locked(source).await;
        lock.release().await;
        result
    }

    async fn execute_locked(&self, source: &dyn PropertySource) -> Result<Run, ValidatorError> {
        let properties = source.active_properties().await?;
        let run_id = Uuid::new_v4().to_string();
        let mut run = Run::new(run_id.clone(), self.config.browser_pool_size, properties.len());
        self.insert_run(&run).await?;

        let mirror_dir = PathBuf::from(&self.config.temp_cache_dir).join(&run_id);
        tokio::fs::create_dir_all(&mirror_dir).await?;
        let cache = Arc::new(TempCache::new(Some(mirror_dir)));

        let scheduler = TwoPhaseScheduler::new(Arc::clone(&self.browser_pool), Arc::clone(&cache), self.config.clone(), run_id.clone());

        let mut progress = scheduler.subscribe();
        let progress_run_id = run_id.clone();
        tokio::spawn(async move {
            while let Ok(event) = progress.recv().await {
                log_progress_event(&progress_run_id, &event);
            }
        });

        let outcome = tokio::select! {
            output = scheduler.run(properties) => RunOutcome::Finished(output),
            _ = wait_for_shutdown_signal() => {
                scheduler.stop().await;
                RunOutcome::Cancelled
            }
        };

        let (status, retry_entries, failed_count) = match outcome {
            RunOutcome::Finished(output) => {
                let failed = output
                    .phase1_verdicts
                    .iter()
                    .chain(output.phase2_verdicts.iter())
                    .filter(|v| !v.is_valid)
                    .count();
                if !output.retry_queue_entries.is_empty() {
                    if let Err(err) = crate::retry_queue::insert_retry_queue_entries(&self.pool, &output.retry_queue_entries).await {
                        warn!("failed to persist retry queue entries: {err}");
                    }
                }
                (RunStatus::Completed, output.retry_queue_entries.len(), failed)
            }
            RunOutcome::Cancelled => (RunStatus::Cancelled, 0, 0),
        };

        let uploader = BatchUploader::new(self.pool.clone(), PathBuf::from(&self.config.object_store_root));
        let upload_stats = uploader.upload_run(&run_id, &cache).await;

        run.status = status;
        run.finished_at = Some(Utc::now());
        run.completed_count = run.total_properties.saturating_sub(failed_count);
        run.failed_count = failed_count;
        run.upload_stats = Some(upload_stats);
        self.finalize_run(&run).await?;

        info!(run_id, retry_entries, "run finished");
        Ok(run)
    }

    async fn insert_run(&self, run: &Run) -> Result<(), ValidatorError> {
        sqlx::query(
            "INSERT INTO runs (id, startedAt, status, workerCount, totalProperties, completedCount, failedCount) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(run.started_at.to_rfc3339())
        .bind(run_status_label(run.status))
        .bind(run.worker_count as i64)
        .bind(run.total_properties as i64)
        .bind(run.completed_count as i64)
        .bind(run.failed_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run(&self, run: &Run) -> Result<(), ValidatorError> {
        let stats = run.upload_stats.as_ref();
        sqlx::query(
            "UPDATE runs SET finishedAt = ?, status = ?, completedCount = ?, failedCount = ?, \
             uploadCompletedAt = ?, uploadDurationMs = ?, uploadSuccessCount = ?, uploadFailedCount = ? \
             WHERE id = ?",
        )
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .bind(run_status_label(run.status))
        .bind(run.completed_count as i64)
        .bind(run.failed_count as i64)
        .bind(stats.map(|s| s.upload_completed_at.to_rfc3339()))
        .bind(stats.map(|s| s.upload_duration_ms as i64))
        .bind(stats.map(|s| s.upload_success_count as i64))
        .bind(stats.map(|s| s.upload_failed_count as i64))
        .bind(&run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

enum RunOutcome {
    Finished(crate::scheduler::SchedulerOutput),
    Cancelled,
}

async fn wait_for_shutdown_signal() {
    let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(_) => {
            // No SIGINT support on this platform — fall back to ctrl_c only.
            let _ = signal::ctrl_c().await;
            return;
        }
    };
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(_) => {
            sigint.recv().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, cancelling run"),
        _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
    }
}

fn log_progress_event(run_id: &str, event: &ProgressEvent) {
    match event {
        ProgressEvent::RunStarted { .. } => info!(run_id, "run started"),
        ProgressEvent::Log { message } => info!(run_id, message),
        ProgressEvent::Progress(payload) => {
            info!(run_id, percent = payload.percent, active_workers = payload.active_workers, "progress")
        }
        ProgressEvent::RunCompleted { .. } => info!(run_id, "run completed"),
        ProgressEvent::RunCancelled { .. } => warn!(run_id, "run cancelled"),
        ProgressEvent::RunFailed { reason, .. } => warn!(run_id, reason, "run failed"),
    }
}

fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_labels_are_lowercase() {
        assert_eq!(run_status_label(RunStatus::Completed), "completed");
        assert_eq!(run_status_label(RunStatus::Cancelled), "cancelled");
    }
}
