//! Health checking system carried from the teacher, generalized so
//! `SystemHealthChecker` considers queue depth and retry-queue backlog as
//! inputs alongside browser pool health, replacing the teacher's dependency
//! on a running `ScreenshotService` (spec has no always-on service; the
//! validator runs as a scheduled batch job, so what's worth alerting on is
//! backlog building up between runs, not an in-flight request rate).

use crate::browser_pool::BrowserPool;
use crate::metrics::{HealthLevel, HealthThresholds};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SystemHealthStatus {
    pub overall: HealthLevel,
    pub browser_pool: HealthLevel,
    pub resources: HealthLevel,
    pub backlog: HealthLevel,
    pub available_browsers: usize,
    pub retry_queue_depth: i64,
    pub memory_usage_bytes: usize,
    pub checked_at: Instant,
}

pub struct SystemHealthChecker {
    browser_pool: Arc<BrowserPool>,
    datastore: SqlitePool,
    thresholds: HealthThresholds,
    last_check: Mutex<Option<SystemHealthStatus>>,
}

impl SystemHealthChecker {
    pub fn new(browser_pool: Arc<BrowserPool>, datastore: SqlitePool, thresholds: HealthThresholds) -> Self {
        Self {
            browser_pool,
            datastore,
            thresholds,
            last_check: Mutex::new(None),
        }
    }

    pub async fn check_system_health(&self) -> SystemHealthStatus {
        let browser_pool = self.check_browser_pool_health().await;
        let resources = self.check_resource_health().await;
        let backlog = self.check_backlog_health().await;

        let pool_stats = self.browser_pool.get_stats().await;
        let retry_depth = self.retry_queue_depth().await.unwrap_or(-1);

        let status = SystemHealthStatus {
            overall: Self::determine_overall_health(&[browser_pool, resources, backlog]),
            browser_pool,
            resources,
            backlog,
            available_browsers: pool_stats.healthy_instances,
            retry_queue_depth: retry_depth,
            memory_usage_bytes: Self::get_memory_usage(),
            checked_at: Instant::now(),
        };

        *self.last_check.lock().await = Some(status.clone());
        status
    }

    async fn check_browser_pool_health(&self) -> HealthLevel {
        let stats = self.browser_pool.get_stats().await;

        if stats.healthy_instances == 0 {
            error!("browser pool health check: no healthy instances available");
            return HealthLevel::Critical;
        }

        if stats.healthy_instances < self.thresholds.min_available_browsers {
            warn!(
                "browser pool health check: only {} healthy instances, below threshold of {}",
                stats.healthy_instances, self.thresholds.min_available_browsers
            );
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    /// Looks at the `retry_queue` pending backlog — a sustained pileup here
    /// means properties are failing validation faster than the retry
    /// processor resolves them.
    async fn check_backlog_health(&self) -> HealthLevel {
        match self.retry_queue_depth().await {
            Ok(depth) if depth as usize > self.thresholds.max_retry_queue_depth => {
                warn!(depth, "retry queue backlog exceeds threshold");
                HealthLevel::Warning
            }
            Ok(_) => HealthLevel::Healthy,
            Err(err) => {
                warn!("failed to read retry queue depth for health check: {err}");
                HealthLevel::Warning
            }
        }
    }

    async fn retry_queue_depth(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retry_queue WHERE status = 'pending'")
            .fetch_one(&self.datastore)
            .await?;
        Ok(row.0)
    }

    async fn check_resource_health(&self) -> HealthLevel {
        let memory_bytes = Self::get_memory_usage();

        if memory_bytes > self.thresholds.max_memory_usage {
            warn!("resource health check: memory usage {memory_bytes} bytes exceeds threshold");
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    fn get_memory_usage() -> usize {
        if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
            for line in content.lines() {
                if line.starts_with("VmRSS:") {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() >= 2 {
                        if let Ok(kb) = parts[1].parse::<usize>() {
                            return kb * 1024;
                        }
                    }
                }
            }
        }
        0
    }

    fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
        if levels.iter().any(|l| *l == HealthLevel::Critical) {
            HealthLevel::Critical
        } else if levels.iter().any(|l| *l == HealthLevel::Warning) {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    pub async fn last_status(&self) -> Option<SystemHealthStatus> {
        self.last_check.lock().await.clone()
    }

    pub async fn start_periodic_health_checks(self: &Arc<Self>, interval: Duration) {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let status = checker.check_system_health().await;
                if status.overall == HealthLevel::Critical {
                    checker.handle_critical_health(&status).await;
                }
            }
        });
    }

    async fn handle_critical_health(&self, status: &SystemHealthStatus) {
        error!(
            available_browsers = status.available_browsers,
            retry_queue_depth = status.retry_queue_depth,
            "system health is critical"
        );
    }
}

#[derive(Debug, Clone)]
pub struct HealthAlert {
    pub alert_type: AlertType,
    pub message: String,
    pub created_at: Instant,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertType {
    Critical,
    ResourceExhaustion,
    BacklogGrowth,
    BrowserPoolFailure,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AlertType::Critical => "critical",
            AlertType::ResourceExhaustion => "resource_exhaustion",
            AlertType::BacklogGrowth => "backlog_growth",
            AlertType::BrowserPoolFailure => "browser_pool_failure",
        };
        write!(f, "{label}")
    }
}

pub struct HealthMonitor {
    checker: Arc<SystemHealthChecker>,
    alerts: Mutex<Vec<HealthAlert>>,
}

impl HealthMonitor {
    pub fn new(checker: Arc<SystemHealthChecker>) -> Self {
        Self {
            checker,
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub async fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.check_alerts().await;
                monitor.cleanup_old_alerts().await;
            }
        });
    }

    async fn check_alerts(&self) {
        let status = self.checker.check_system_health().await;

        if status.browser_pool == HealthLevel::Critical {
            self.create_alert(AlertType::BrowserPoolFailure, "browser pool has no healthy instances".to_string())
                .await;
        }
        if status.resources == HealthLevel::Warning {
            self.create_alert(AlertType::ResourceExhaustion, format!("memory usage at {} bytes", status.memory_usage_bytes))
                .await;
        }
        if status.backlog == HealthLevel::Warning {
            self.create_alert(AlertType::BacklogGrowth, format!("retry queue depth at {}", status.retry_queue_depth))
                .await;
        }
    }

    async fn create_alert(&self, alert_type: AlertType, message: String) {
        info!(%alert_type, message, "health alert raised");
        self.alerts.lock().await.push(HealthAlert {
            alert_type,
            message,
            created_at: Instant::now(),
            acknowledged: false,
        });
    }

    async fn cleanup_old_alerts(&self) {
        let mut alerts = self.alerts.lock().await;
        alerts.retain(|alert| alert.created_at.elapsed() < Duration::from_secs(3600));
    }

    pub async fn get_active_alerts(&self) -> Vec<HealthAlert> {
        self.alerts.lock().await.iter().filter(|a| !a.acknowledged).cloned().collect()
    }

    pub async fn acknowledge_alert(&self, index: usize) {
        if let Some(alert) = self.alerts.lock().await.get_mut(index) {
            alert.acknowledged = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_health_escalates_to_most_severe() {
        assert_eq!(
            SystemHealthChecker::determine_overall_health(&[HealthLevel::Healthy, HealthLevel::Warning]),
            HealthLevel::Warning
        );
        assert_eq!(
            SystemHealthChecker::determine_overall_health(&[HealthLevel::Warning, HealthLevel::Critical]),
            HealthLevel::Critical
        );
        assert_eq!(SystemHealthChecker::determine_overall_health(&[HealthLevel::Healthy]), HealthLevel::Healthy);
    }

    #[test]
    fn alert_type_display_is_snake_case() {
        assert_eq!(AlertType::BrowserPoolFailure.to_string(), "browser_pool_failure");
    }
}
