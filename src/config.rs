//! Configuration management with serde serialization/deserialization
//!
//! Carries the teacher's browser-launch configuration unchanged (stealth
//! sessions still need a viewport, a Chrome path, optimization flags) and
//! adds the scheduler/retry/datastore settings spec.md §6 calls "Runtime
//! controls".

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the analytics validator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Number of Chrome browser instances to maintain in the pool — also
    /// the Two-Phase Scheduler's worker count (spec §4.6 `workerCount`).
    pub browser_pool_size: usize,

    /// Phase-1 per-property hard deadline (default 20s, spec §5).
    pub phase1_timeout: Duration,

    /// Phase-2 per-property hard deadline, including the tag-manager wait
    /// window (default 60s + 30s = 90s total budget, spec §5).
    pub phase2_timeout: Duration,

    /// Days of retention before out-of-scope cleanup removes local
    /// artifacts; read by this crate only to surface in run metadata.
    pub retention_days: u32,

    /// Polling interval for the Retry Queue Processor's own schedule.
    pub retry_interval: Duration,

    /// Browser viewport configuration for stealth sessions.
    pub viewport: Viewport,

    /// Performance optimization settings applied to every stealth session.
    pub optimization: OptimizationSettings,

    /// Path to Chrome/Chromium executable (default: auto-detect).
    pub chrome_path: Option<String>,

    /// Anti-automation user-agent string used for stealth sessions.
    pub user_agent: Option<String>,

    /// Memory limit per Chrome instance in bytes (default: 1GB).
    pub memory_limit: Option<usize>,

    /// SQLite datastore path (file-based `sqlx::SqlitePool`, spec §6).
    pub datastore_path: String,

    /// Root directory of the local-filesystem object store realization of
    /// the "object-storage bucket for binary blobs" contract (spec §6).
    pub object_store_root: String,

    /// Host-local lockfile path guarding against concurrent runs (spec
    /// §4.9).
    pub lockfile_path: String,

    /// Directory for the Temp Cache's optional on-disk mirror.
    pub temp_cache_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser_pool_size: 10,
            phase1_timeout: Duration::from_secs(20),
            phase2_timeout: Duration::from_secs(90),
            retention_days: 30,
            retry_interval: Duration::from_secs(300),
            viewport: Viewport::default(),
            optimization: OptimizationSettings::default(),
            chrome_path: None,
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            memory_limit: Some(1024 * 1024 * 1024),
            datastore_path: "./data/analytics-validator.sqlite".to_string(),
            object_store_root: "./data/object-store".to_string(),
            lockfile_path: "/tmp/analytics-validator.lock".to_string(),
            temp_cache_dir: "./data/temp-cache".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizationSettings {
    pub block_ads: bool,
    pub block_images: bool,
    pub enable_javascript: bool,
    pub disable_css: bool,
    pub disable_plugins: bool,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            block_ads: true,
            block_images: false,
            enable_javascript: true,
            disable_css: false,
            disable_plugins: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
}

impl RetryConfig {
    /// The inline retry policy from spec §4.6: attempts 1→4, backoffs 1/2/4s.
    pub fn inline() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Generate Chrome command-line arguments for a browser-pool instance.
pub fn get_chrome_args_with_instance_id(config: &Config, instance_id: Option<usize>) -> Vec<String> {
    let unique_id = match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    };

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--ignore-ssl-errors".to_string(),
        format!("--window-size={},{}", config.viewport.width, config.viewport.height),
        "--memory-pressure-off".to_string(),
        format!("--user-data-dir=/tmp/chromium-validator-{}", unique_id),
        format!("--remote-debugging-port={}", 9222 + instance_id.unwrap_or(0)),
        format!("--temp-dir=/tmp/chromium-temp-{}", unique_id),
    ];

    if let Some(memory_limit) = config.memory_limit {
        args.push(format!("--max_old_space_size={}", memory_limit / 1024 / 1024));
    }

    if config.optimization.block_images {
        args.push("--disable-images".to_string());
    }

    if !config.optimization.enable_javascript {
        args.push("--disable-javascript".to_string());
    }

    if config.optimization.disable_plugins {
        args.push("--disable-plugins".to_string());
    }

    if config.optimization.disable_css {
        args.push("--disable-css".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> chromiumoxide::browser::BrowserConfig {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .unwrap_or_else(|_| BrowserConfig::with_executable("/usr/sbin/chromium"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_default_timeouts() {
        let config = Config::default();
        assert_eq!(config.phase1_timeout, Duration::from_secs(20));
        assert_eq!(config.phase2_timeout, Duration::from_secs(90));
    }

    #[test]
    fn chrome_args_include_unique_user_data_dir() {
        let config = Config::default();
        let args = get_chrome_args_with_instance_id(&config, Some(2));
        assert!(args.iter().any(|arg| arg.contains("--remote-debugging-port=9224")));
    }
}
