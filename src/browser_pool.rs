//! Browser pool management for concurrent Chrome instances
//!
//! Fixed pool of `N` browser handles created at startup (spec §4.5). Each
//! worker in the Two-Phase Scheduler acquires one handle for its entire
//! lifetime, opening and closing fresh stealth sessions on it per property
//! instead of the teacher's one-handle-per-screenshot-request model.

use crate::config::{create_browser_config_with_instance_id, Config};
use crate::error::ValidatorError;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy)]
pub enum InstanceStatus {
    Healthy,
    Busy,
    Unresponsive,
    Restarting,
    Failed,
}

#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    pub handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    pub last_used: Instant,
    pub properties_processed: usize,
    pub status: InstanceStatus,
    pub created_at: Instant,
    pub failure_count: usize,
}

impl BrowserInstance {
    pub fn new(
        id: usize,
        browser: Browser,
        handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    ) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            last_used: Instant::now(),
            properties_processed: 0,
            status: InstanceStatus::Healthy,
            created_at: Instant::now(),
            failure_count: 0,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.properties_processed += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_available(&mut self) {
        self.status = InstanceStatus::Healthy;
    }

    pub fn mark_failed(&mut self) {
        self.failure_count += 1;
        self.status = InstanceStatus::Failed;
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, InstanceStatus::Healthy)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// RAII handle returned by `acquire`; closes all open sessions/contexts on
/// drop and returns the slot to the pool (spec §4.5 `release`).
pub struct BrowserHandle {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: Arc<BrowserPool>,
}

/// Anti-automation init script shared by every stealth session, whether
/// opened through a `BrowserHandle` directly or through a raw
/// `Arc<Mutex<Browser>>` (the scheduler's Two-Phase workers hold the
/// latter for the lifetime of a worker rather than a handle per page).
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Opens a fresh isolated page on `browser` at `about:blank` with the
/// stealth init script installed, and navigates nowhere else (spec §4.5
/// `newStealthSession`, §4.1 "before any page script runs"). Callers that
/// also need to install the Network Event Capturer's Layer-1 script must
/// do so on the returned page before navigating it to the real target —
/// navigating here would run the target's own scripts before either init
/// script had a chance to register. Free function so callers that only
/// hold the pool-internal `Arc<Mutex<Browser>>` — not a full
/// `BrowserHandle` — still get the same stealth behavior.
pub async fn new_stealth_page(browser: &Arc<Mutex<Browser>>) -> Result<Page, ValidatorError> {
    let browser = browser.lock().await;
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| ValidatorError::PageError(e.to_string()))?;
    let _ = page.evaluate_on_new_document(STEALTH_INIT_SCRIPT).await;
    Ok(page)
}

impl BrowserHandle {
    pub fn new(browser: Arc<Mutex<Browser>>, instance_id: usize, pool: Arc<BrowserPool>) -> Self {
        Self {
            browser,
            instance_id,
            pool,
        }
    }

    /// A stealth session: a fresh isolated context with an anti-automation
    /// user-agent and init scripts installed, navigated to `url` (spec
    /// §4.5 glossary). Callers that need to install their own
    /// pre-navigation scripts (the Network Event Capturer) should use
    /// `new_stealth_page` directly instead, so they can install before
    /// this navigation happens.
    pub async fn new_stealth_session(&self, url: &str) -> Result<Page, ValidatorError> {
        let page = new_stealth_page(&self.browser).await?;
        page.goto(url).await.map_err(|e| ValidatorError::PageError(e.to_string()))?;
        Ok(page)
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;

        tokio::spawn(async move {
            pool.return_browser(instance_id).await;
        });
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Config,
    is_shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

impl BrowserPool {
    pub async fn new(config: Config) -> Result<Self, ValidatorError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(config.browser_pool_size)),
            config: config.clone(),
            is_shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        pool.initialize_instances().await?;
        pool.start_health_check_task().await;

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), ValidatorError> {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        for i in 0..self.config.browser_pool_size {
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.create_browser_instance(i).await {
                Ok(instance) => {
                    instances.push(instance);
                    available.push_back(i);
                    info!("Browser instance {} created successfully", i);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", i, e);
                    return Err(e);
                }
            }
        }

        info!("Browser pool initialized with {} instances", instances.len());
        Ok(())
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, ValidatorError> {
        let temp_dir = format!("/tmp/chromium-temp-{}-{}", std::process::id(), id);
        let user_data_dir = format!("/tmp/chromium-validator-{}-{}", std::process::id(), id);
        let runner_dir = format!("/tmp/chromiumoxide-runner-{}", id);

        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| ValidatorError::BrowserLaunchFailed(format!("Failed to create temp dir: {}", e)))?;
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| ValidatorError::BrowserLaunchFailed(format!("Failed to create user data dir: {}", e)))?;
        std::fs::create_dir_all(&runner_dir)
            .map_err(|e| ValidatorError::BrowserLaunchFailed(format!("Failed to create runner dir: {}", e)))?;

        let instance_config = create_browser_config_with_instance_id(&self.config, Some(id));

        let (browser, mut handler) = {
            std::env::set_var("TMPDIR", &runner_dir);
            let result = Browser::launch(instance_config).await;
            std::env::remove_var("TMPDIR");
            result
        }
        .map_err(|e| ValidatorError::BrowserLaunchFailed(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("Handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        tracing::info!("Handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    pub async fn get_browser(&self) -> Result<BrowserHandle, ValidatorError> {
        if self.is_shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ValidatorError::BrowserUnavailable);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ValidatorError::BrowserUnavailable)?;

        for attempt in 0..3 {
            let instance_id = {
                let mut available = self.available.lock().await;
                available.pop_front().ok_or(ValidatorError::BrowserUnavailable)?
            };

            let browser_result = {
                let mut instances = self.instances.lock().await;
                let instance = instances
                    .get_mut(instance_id)
                    .ok_or(ValidatorError::BrowserUnavailable)?;

                let is_healthy = instance.is_healthy() && !instance.handler.is_finished();

                if !is_healthy {
                    warn!(
                        "Browser instance {} unhealthy (attempt {}), attempting restart",
                        instance_id,
                        attempt + 1
                    );

                    match self.restart_instance_internal(instance_id).await {
                        Ok(()) => {
                            info!("Successfully restarted browser instance {}", instance_id);
                            instance.mark_used();
                            Ok(instance.browser.clone())
                        }
                        Err(e) => {
                            error!("Failed to restart browser instance {}: {}", instance_id, e);
                            self.available.lock().await.push_back(instance_id);
                            Err(e)
                        }
                    }
                } else {
                    instance.mark_used();
                    Ok(instance.browser.clone())
                }
            };

            match browser_result {
                Ok(browser) => {
                    return Ok(BrowserHandle::new(browser, instance_id, Arc::new(self.clone())));
                }
                Err(_) if attempt < 2 => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ValidatorError::BrowserUnavailable)
    }

    pub async fn return_browser(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        if let Some(instance) = instances.get_mut(instance_id) {
            instance.mark_available();
            available.push_back(instance_id);
        }
    }

    pub async fn health_check(&self) -> Vec<InstanceHealth> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .map(|instance| InstanceHealth {
                id: instance.id,
                status: instance.status,
                properties_processed: instance.properties_processed,
                age: instance.age(),
                idle_time: instance.idle_time(),
                failure_count: instance.failure_count,
            })
            .collect()
    }

    pub async fn restart_instance(&self, instance_id: usize) -> Result<(), ValidatorError> {
        self.restart_instance_internal(instance_id).await
    }

    async fn restart_instance_internal(&self, instance_id: usize) -> Result<(), ValidatorError> {
        let mut instances = self.instances.lock().await;

        if let Some(instance) = instances.get_mut(instance_id) {
            instance.status = InstanceStatus::Restarting;

            let _ = instance.browser.lock().await.close().await;
            instance.handler.abort();

            match self.create_browser_instance(instance_id).await {
                Ok(new_instance) => {
                    *instance = new_instance;
                    info!("Browser instance {} restarted successfully", instance_id);
                    Ok(())
                }
                Err(e) => {
                    instance.status = InstanceStatus::Failed;
                    error!("Failed to restart browser instance {}: {}", instance_id, e);
                    Err(e)
                }
            }
        } else {
            Err(ValidatorError::BrowserUnavailable)
        }
    }

    async fn start_health_check_task(&self) {
        let pool = Arc::new(self.clone());
        let is_shutting_down = self.is_shutting_down.clone();

        tokio::spawn(async move {
            let mut quick_interval = tokio::time::interval(Duration::from_secs(15));
            let mut deep_interval = tokio::time::interval(Duration::from_secs(60));

            while !is_shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
                tokio::select! {
                    _ = quick_interval.tick() => {
                        pool.quick_health_check().await;
                    }
                    _ = deep_interval.tick() => {
                        pool.deep_health_check().await;
                    }
                }
            }
        });
    }

    async fn quick_health_check(&self) {
        let instances = self.instances.lock().await;
        for instance in instances.iter() {
            if instance.handler.is_finished() {
                warn!("Browser instance {} handler crashed, marking for restart", instance.id);
            }

            if instance.idle_time() > Duration::from_secs(300) && matches!(instance.status, InstanceStatus::Busy) {
                warn!(
                    "Browser instance {} unresponsive for {}s",
                    instance.id,
                    instance.idle_time().as_secs()
                );
            }
        }
    }

    async fn deep_health_check(&self) {
        let instances_to_restart = {
            let instances = self.instances.lock().await;
            let mut restart_list = Vec::new();

            for instance in instances.iter() {
                let needs_restart = instance.age() > Duration::from_secs(3600)
                    || instance.failure_count > 10
                    || instance.handler.is_finished()
                    || (instance.idle_time() > Duration::from_secs(600) && matches!(instance.status, InstanceStatus::Busy));

                if needs_restart {
                    info!(
                        "Scheduling restart for browser instance {}: age={:?}, failures={}, handler_alive={}",
                        instance.id,
                        instance.age(),
                        instance.failure_count,
                        !instance.handler.is_finished()
                    );
                    restart_list.push(instance.id);
                }
            }
            restart_list
        };

        for instance_id in instances_to_restart {
            if let Err(e) = self.restart_instance(instance_id).await {
                error!("Failed to restart browser instance {} during health check: {}", instance_id, e);
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);

        let mut retries = 0;
        while retries < 10 {
            let available_count = self.available.lock().await.len();
            if available_count == self.config.browser_pool_size {
                break;
            }

            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }

    /// Forces all open contexts closed to unblock in-flight navigations
    /// (spec §4.5 cancellation). Workers observe cancellation at their next
    /// suspension point rather than here.
    pub async fn force_close_all_contexts(&self) {
        let instances = self.instances.lock().await;
        for instance in instances.iter() {
            let browser = instance.browser.lock().await;
            if let Ok(pages) = browser.pages().await {
                for page in pages {
                    let _ = page.close().await;
                }
            }
        }
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await;

        let mut healthy_count = 0;
        let mut busy_count = 0;
        let mut failed_count = 0;
        let mut total_properties_processed = 0;

        for instance in instances.iter() {
            total_properties_processed += instance.properties_processed;
            match instance.status {
                InstanceStatus::Healthy => healthy_count += 1,
                InstanceStatus::Busy => busy_count += 1,
                InstanceStatus::Failed => failed_count += 1,
                _ => {}
            }
        }

        BrowserPoolStats {
            total_instances: instances.len(),
            healthy_instances: healthy_count,
            busy_instances: busy_count,
            failed_instances: failed_count,
            available_instances: available.len(),
            total_properties_processed,
        }
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            config: self.config.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub id: usize,
    pub status: InstanceStatus,
    pub properties_processed: usize,
    pub age: Duration,
    pub idle_time: Duration,
    pub failure_count: usize,
}

#[derive(Debug, Clone)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub available_instances: usize,
    pub total_properties_processed: usize,
}
