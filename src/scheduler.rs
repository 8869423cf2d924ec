//! The Two-Phase Scheduler — the architectural heart of the system.
//!
//! Grounded on the teacher's `worker.rs` `WorkerPool`/`ScreenshotWorker`
//! shared-receiver pattern: N tasks drain one shared queue. Generalized here
//! into two sequential phases with distinct timeouts, a race-condition
//! guard for late Phase-1 results, and a progress-broadcast channel the
//! teacher has no equivalent of.

use crate::browser_pool::BrowserPool;
use crate::cache::TempCache;
use crate::capture::NetworkEventCapturer;
use crate::config::Config;
use crate::error::ValidatorError;
use crate::model::{Phase, Property, RetryQueueEntry, RetryStatus, Screenshot, Verdict, VerdictStatus};
use crate::validator::{validate, PageSnapshot, PageViewTiming};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

const TAG_MANAGER_WAIT_DEADLINE: Duration = Duration::from_secs(30);
const ANALYTICS_WAIT_DEADLINE: Duration = Duration::from_secs(60);
const ANALYTICS_WAIT_MAX_TAIL: Duration = Duration::from_secs(15);
const RETRY_QUEUE_INITIAL_DELAY: Duration = Duration::from_secs(30 * 60);
const PROGRESS_TICK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProgressPayload {
    pub phase: Phase,
    pub processed_in_phase1: usize,
    pub completed_in_phase1: usize,
    pub phase2_queued: usize,
    pub phase2_completed: usize,
    pub phase2_elapsed_ms: u64,
    pub active_workers: usize,
    pub current_property: Option<String>,
    pub percent: f64,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunStarted { run_id: String },
    Log { message: String },
    Progress(ProgressPayload),
    RunCompleted { run_id: String },
    RunCancelled { run_id: String },
    RunFailed { run_id: String, reason: String },
}

struct SchedulerCounters {
    processed_in_phase1: AtomicUsize,
    completed_in_phase1: AtomicUsize,
    phase2_completed: AtomicUsize,
    active_workers: AtomicUsize,
}

impl SchedulerCounters {
    fn new() -> Self {
        Self {
            processed_in_phase1: AtomicUsize::new(0),
            completed_in_phase1: AtomicUsize::new(0),
            phase2_completed: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }
}

pub struct SchedulerOutput {
    pub phase1_verdicts: Vec<Verdict>,
    pub phase2_verdicts: Vec<Verdict>,
    pub retry_queue_entries: Vec<RetryQueueEntry>,
}

pub struct TwoPhaseScheduler {
    browser_pool: Arc<BrowserPool>,
    cache: Arc<TempCache>,
    config: Config,
    run_id: String,
    cancelled: Arc<AtomicBool>,
    timed_out_property_ids: Arc<Mutex<HashSet<String>>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    counters: Arc<SchedulerCounters>,
}

impl TwoPhaseScheduler {
    pub fn new(browser_pool: Arc<BrowserPool>, cache: Arc<TempCache>, config: Config, run_id: String) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            browser_pool,
            cache,
            config,
            run_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            timed_out_property_ids: Arc::new(Mutex::new(HashSet::new())),
            progress_tx,
            counters: Arc::new(SchedulerCounters::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Broadcasts a "stopped" event and force-closes all open browser
    /// contexts to unblock in-flight navigations (spec §5 cancellation
    /// semantics). Workers observe `cancelled` at their next suspension
    /// point and exit without dequeuing new work.
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.progress_tx.send(ProgressEvent::RunCancelled {
            run_id: self.run_id.clone(),
        });
        self.browser_pool.force_close_all_contexts().await;
    }

    pub async fn run(&self, properties: Vec<Property>) -> SchedulerOutput {
        let _ = self.progress_tx.send(ProgressEvent::RunStarted {
            run_id: self.run_id.clone(),
        });

        let total = properties.len();
        let by_id: HashMap<String, Property> =
            properties.iter().map(|p| (p.id.clone(), p.clone())).collect();
        let queue = Arc::new(Mutex::new(VecDeque::from(properties)));
        let phase1_verdicts: Arc<Mutex<Vec<Verdict>>> = Arc::new(Mutex::new(Vec::new()));
        let phase2_queue: Arc<Mutex<VecDeque<Property>>> = Arc::new(Mutex::new(VecDeque::new()));

        self.run_phase1(queue, Arc::clone(&phase1_verdicts), Arc::clone(&phase2_queue)).await;

        let phase1_verdicts = Arc::try_unwrap(phase1_verdicts).unwrap().into_inner();

        if self.cancelled.load(Ordering::SeqCst) {
            return SchedulerOutput {
                phase1_verdicts,
                phase2_verdicts: Vec::new(),
                retry_queue_entries: Vec::new(),
            };
        }

        self.reconcile_phase2_queue(&phase1_verdicts, &by_id, &phase2_queue).await;

        let phase2_verdicts: Arc<Mutex<Vec<Verdict>>> = Arc::new(Mutex::new(Vec::new()));
        let retry_entries: Arc<Mutex<Vec<RetryQueueEntry>>> = Arc::new(Mutex::new(Vec::new()));

        self.run_phase2(phase2_queue, total, Arc::clone(&phase2_verdicts), Arc::clone(&retry_entries))
            .await;

        if self.cancelled.load(Ordering::SeqCst) {
            let _ = self.progress_tx.send(ProgressEvent::RunCancelled {
                run_id: self.run_id.clone(),
            });
        } else {
            let _ = self.progress_tx.send(ProgressEvent::RunCompleted {
                run_id: self.run_id.clone(),
            });
        }

        SchedulerOutput {
            phase1_verdicts,
            phase2_verdicts: Arc::try_unwrap(phase2_verdicts).unwrap().into_inner(),
            retry_queue_entries: Arc::try_unwrap(retry_entries).unwrap().into_inner(),
        }
    }

    async fn run_phase1(
        &self,
        queue: Arc<Mutex<VecDeque<Property>>>,
        phase1_verdicts: Arc<Mutex<Vec<Verdict>>>,
        phase2_queue: Arc<Mutex<VecDeque<Property>>>,
    ) {
        let worker_count = self.config.browser_pool_size;
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let scheduler = self.clone_internal();
            let queue = Arc::clone(&queue);
            let phase1_verdicts = Arc::clone(&phase1_verdicts);
            let phase2_queue = Arc::clone(&phase2_queue);

            workers.push(tokio::spawn(async move {
                scheduler.phase1_worker_loop(worker_id, queue, phase1_verdicts, phase2_queue).await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn phase1_worker_loop(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<Property>>>,
        phase1_verdicts: Arc<Mutex<Vec<Verdict>>>,
        phase2_queue: Arc<Mutex<VecDeque<Property>>>,
    ) {
        let handle = match self.browser_pool.get_browser().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("phase1 worker {worker_id} failed to acquire a browser: {err}");
                return;
            }
        };
        self.counters.active_workers.fetch_add(1, Ordering::SeqCst);

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let property = {
                let mut queue = queue.lock().await;
                queue.pop_front()
            };

            let Some(property) = property else {
                break;
            };

            self.emit_progress(Phase::One, Some(property.id.clone())).await;

            match self
                .run_pipeline_with_timeout_watch(&property, Phase::One, self.config.phase1_timeout, &handle)
                .await
            {
                PipelineOutcome::Verdict(verdict, screenshot) => {
                    self.store_outcome(&property.id, verdict.clone(), screenshot, false).await;
                    phase1_verdicts.lock().await.push(verdict);
                    self.counters.completed_in_phase1.fetch_add(1, Ordering::SeqCst);
                }
                PipelineOutcome::TimedOut => {
                    self.timed_out_property_ids.lock().await.insert(property.id.clone());
                    phase2_queue.lock().await.push_back(property.clone());
                    let placeholder = timeout_placeholder_verdict(&property, &self.run_id, Phase::One);
                    self.cache.add_verdict(&property.id, placeholder.clone(), true).await;
                    phase1_verdicts.lock().await.push(placeholder);
                }
                PipelineOutcome::Error(verdict) => {
                    self.store_outcome(&property.id, verdict.clone(), None, false).await;
                    phase1_verdicts.lock().await.push(verdict);
                }
            }

            self.counters.processed_in_phase1.fetch_add(1, Ordering::SeqCst);
            self.emit_progress(Phase::One, None).await;
        }

        self.counters.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Restart recovery hook (spec §4.6): any property whose Phase-1
    /// verdict in this run is `timeout` but is not already queued gets
    /// appended. This is the step that makes the recovery protocol
    /// real — without it a timeout verdict recorded just before a
    /// crash would never reach Phase 2 on the reconciliation pass that
    /// follows a restart.
    async fn reconcile_phase2_queue(
        &self,
        phase1_verdicts: &[Verdict],
        properties_by_id: &HashMap<String, Property>,
        phase2_queue: &Arc<Mutex<VecDeque<Property>>>,
    ) {
        let mut queue = phase2_queue.lock().await;
        let queued_ids: HashSet<String> = queue.iter().map(|p| p.id.clone()).collect();

        for verdict in phase1_verdicts {
            if verdict.status != VerdictStatus::Timeout || queued_ids.contains(&verdict.property_id) {
                continue;
            }

            let Some(property) = properties_by_id.get(&verdict.property_id) else {
                warn!(
                    property_id = %verdict.property_id,
                    "found a timeout verdict with no matching property — cannot reconcile into the Phase-2 queue"
                );
                continue;
            };

            warn!(
                property_id = %verdict.property_id,
                "reconciling Phase-2 queue: appending a timeout verdict missing from the in-memory queue"
            );
            queue.push_back(property.clone());
        }
    }

    async fn run_phase2(
        &self,
        phase2_queue: Arc<Mutex<VecDeque<Property>>>,
        total_properties: usize,
        phase2_verdicts: Arc<Mutex<Vec<Verdict>>>,
        retry_entries: Arc<Mutex<Vec<RetryQueueEntry>>>,
    ) {
        let phase2_total = phase2_queue.lock().await.len();
        if phase2_total == 0 {
            return;
        }

        let phase2_start = Instant::now();
        let progress_scheduler = self.clone_internal();
        let progress_queue = Arc::clone(&phase2_queue);
        let progress_handle = tokio::spawn(async move {
            progress_scheduler
                .phase2_progress_ticker(progress_queue, phase2_total, phase2_start)
                .await;
        });

        let worker_count = self.config.browser_pool_size.min(phase2_total.max(1));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let scheduler = self.clone_internal();
            let queue = Arc::clone(&phase2_queue);
            let verdicts = Arc::clone(&phase2_verdicts);
            let retries = Arc::clone(&retry_entries);

            workers.push(tokio::spawn(async move {
                scheduler.phase2_worker_loop(worker_id, queue, verdicts, retries).await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        progress_handle.abort();
        let _ = total_properties;
    }

    async fn phase2_worker_loop(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<Property>>>,
        phase2_verdicts: Arc<Mutex<Vec<Verdict>>>,
        retry_entries: Arc<Mutex<Vec<RetryQueueEntry>>>,
    ) {
        let handle = match self.browser_pool.get_browser().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("phase2 worker {worker_id} failed to acquire a browser: {err}");
                return;
            }
        };

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let property = {
                let mut queue = queue.lock().await;
                queue.pop_front()
            };

            let Some(property) = property else {
                break;
            };

            match self
                .run_pipeline_with_timeout_watch(&property, Phase::Two, self.config.phase2_timeout, &handle)
                .await
            {
                PipelineOutcome::Verdict(verdict, screenshot) => {
                    self.store_outcome(&property.id, verdict.clone(), screenshot, false).await;
                    phase2_verdicts.lock().await.push(verdict);
                    self.counters.phase2_completed.fetch_add(1, Ordering::SeqCst);
                }
                PipelineOutcome::TimedOut => {
                    let entry = new_retry_queue_entry(&property, &self.run_id, "phase2_timeout");
                    retry_entries.lock().await.push(entry);
                    self.counters.phase2_completed.fetch_add(1, Ordering::SeqCst);
                }
                PipelineOutcome::Error(verdict) => {
                    // Spec §9 open question (c): preserve the source's
                    // unconditional behavior of retry-queueing every
                    // Phase-2 failure, not only retryable ones.
                    let entry = new_retry_queue_entry(&property, &self.run_id, "phase2_error");
                    retry_entries.lock().await.push(entry);
                    phase2_verdicts.lock().await.push(verdict);
                    self.counters.phase2_completed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Time-based Phase-2 progress with dynamic re-estimation (spec §4.6):
    /// a 2s tick recomputes `dynamicMaxDuration` from the remaining queue
    /// depth and reports the 70-100% window as `elapsed/dynamicMaxDuration`.
    async fn phase2_progress_ticker(&self, queue: Arc<Mutex<VecDeque<Property>>>, phase2_total: usize, start: Instant) {
        let worker_count = self.config.browser_pool_size.max(1);
        let tag_manager_wait_ms = TAG_MANAGER_WAIT_DEADLINE.as_millis() as u64;

        loop {
            sleep(PROGRESS_TICK_INTERVAL).await;
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let remaining = queue.lock().await.len();
            if remaining == 0 {
                break;
            }

            let remaining_batches = remaining.div_ceil(worker_count);
            let dynamic_max_duration_ms =
                remaining_batches as u64 * (self.config.phase2_timeout.as_millis() as u64 + tag_manager_wait_ms);
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let fraction = if dynamic_max_duration_ms == 0 {
                1.0
            } else {
                (elapsed_ms as f64 / dynamic_max_duration_ms as f64).min(1.0)
            };

            let completed = phase2_total - remaining;
            let _ = self.progress_tx.send(ProgressEvent::Progress(ProgressPayload {
                phase: Phase::Two,
                processed_in_phase1: self.counters.processed_in_phase1.load(Ordering::SeqCst),
                completed_in_phase1: self.counters.completed_in_phase1.load(Ordering::SeqCst),
                phase2_queued: remaining,
                phase2_completed: completed,
                phase2_elapsed_ms: elapsed_ms,
                active_workers: self.counters.active_workers.load(Ordering::SeqCst),
                current_property: None,
                percent: 70.0 + fraction * 30.0,
            }));
        }
    }

    async fn emit_progress(&self, phase: Phase, current_property: Option<String>) {
        let processed = self.counters.processed_in_phase1.load(Ordering::SeqCst);
        let completed = self.counters.completed_in_phase1.load(Ordering::SeqCst);
        let _ = self.progress_tx.send(ProgressEvent::Progress(ProgressPayload {
            phase,
            processed_in_phase1: processed,
            completed_in_phase1: completed,
            phase2_queued: 0,
            phase2_completed: 0,
            phase2_elapsed_ms: 0,
            active_workers: self.counters.active_workers.load(Ordering::SeqCst),
            current_property,
            percent: 0.0,
        }));
    }

    async fn store_outcome(&self, property_id: &str, verdict: Verdict, screenshot: Option<Screenshot>, queued_for_phase_two: bool) {
        self.cache.add_verdict(property_id, verdict, queued_for_phase_two).await;
        if let Some(screenshot) = screenshot {
            self.cache.add_screenshot(property_id, screenshot).await;
        }
    }

    /// Runs the pipeline with the late-result race guard from spec §9: a
    /// Phase-1 pipeline that crosses its deadline keeps running in the
    /// background (rather than being cancelled) and, if it later completes,
    /// checks `timedOutPropertyIds` before reporting anything back.
    async fn run_pipeline_with_timeout_watch(
        &self,
        property: &Property,
        phase: Phase,
        phase_timeout: Duration,
        handle: &crate::browser_pool::BrowserHandle,
    ) -> PipelineOutcome {
        let property = property.clone();
        let run_id = self.run_id.clone();
        let browser = Arc::clone(&handle.browser);
        let pipeline_future = run_pipeline_with_retries(property.clone(), run_id, phase, browser);

        let mut task = tokio::spawn(pipeline_future);

        match tokio::time::timeout(phase_timeout, &mut task).await {
            Ok(Ok(Ok((verdict, screenshot)))) => PipelineOutcome::Verdict(verdict, screenshot),
            // The pipeline finished inside the outer deadline but decided
            // internally that analytics detection had timed out (spec §5's
            // internal analytics-wait deadline, not the phase deadline).
            // This must escalate to Phase 2 exactly like a true deadline
            // timeout, not collapse into an Error verdict.
            Ok(Ok(Err(ValidatorError::Timeout(_)))) => PipelineOutcome::TimedOut,
            Ok(Ok(Err(err))) => PipelineOutcome::Error(error_verdict(&property, &self.run_id, phase, &err)),
            Ok(Err(join_err)) => {
                PipelineOutcome::Error(error_verdict(
                    &property,
                    &self.run_id,
                    phase,
                    &ValidatorError::ValidationError(join_err.to_string()),
                ))
            }
            Err(_) => {
                if phase == Phase::One {
                    let property_id = property.id.clone();
                    let timed_out_ids = Arc::clone(&self.timed_out_property_ids);
                    tokio::spawn(async move {
                        if let Ok(Ok((verdict, _))) = task.await {
                            let timed_out_ids = timed_out_ids.lock().await;
                            if timed_out_ids.contains(&property_id) {
                                debug_drop_late_result(&property_id, verdict.phase);
                            }
                        }
                    });
                }
                PipelineOutcome::TimedOut
            }
        }
    }

    fn clone_internal(&self) -> Self {
        Self {
            browser_pool: Arc::clone(&self.browser_pool),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            run_id: self.run_id.clone(),
            cancelled: Arc::clone(&self.cancelled),
            timed_out_property_ids: Arc::clone(&self.timed_out_property_ids),
            progress_tx: self.progress_tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

enum PipelineOutcome {
    Verdict(Verdict, Option<Screenshot>),
    TimedOut,
    Error(Verdict),
}

fn debug_drop_late_result(property_id: &str, phase: Phase) {
    tracing::debug!(property_id, ?phase, "dropping late Phase-1 pipeline result for a property already queued for Phase 2");
}

/// Runs one pipeline pass against a deadline, outside of a `TwoPhaseScheduler`
/// run — the shape the Retry Queue Processor needs (spec §4.8 step 2: "run
/// the full pipeline at Phase-2 timeout"). Does not participate in the
/// late-result race guard: a retry-queue entry has no Phase-2 queue to
/// escalate into, so a deadline expiry here is simply reported as a timeout.
pub async fn run_single_pipeline(
    property: &Property,
    run_id: &str,
    browser: Arc<Mutex<chromiumoxide::browser::Browser>>,
    deadline: Duration,
) -> Result<(Verdict, Option<Screenshot>), ValidatorError> {
    match tokio::time::timeout(
        deadline,
        run_pipeline_with_retries(property.clone(), run_id.to_string(), Phase::Two, browser),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ValidatorError::Timeout(deadline)),
    }
}

/// Inline retry loop around one pipeline pass (spec §4.6 "Retry with
/// exponential backoff"): attempts 1→4 with 1/2/4s backoffs, gated on
/// `ValidatorError::is_retryable()`. A timeout never retries inline — it
/// always escalates to Phase 2 or the retry queue instead, so it is
/// returned to the caller immediately on the first attempt that produces it.
async fn run_pipeline_with_retries(
    property: Property,
    run_id: String,
    phase: Phase,
    browser: Arc<Mutex<chromiumoxide::browser::Browser>>,
) -> Result<(Verdict, Option<Screenshot>), ValidatorError> {
    let retry = crate::config::RetryConfig::inline();
    let mut delay = retry.initial_delay;

    for attempt in 1..=retry.max_attempts {
        match run_pipeline_once(property.clone(), run_id.clone(), phase, Arc::clone(&browser)).await {
            Ok(outcome) => return Ok(outcome),
            Err(ValidatorError::Timeout(d)) => return Err(ValidatorError::Timeout(d)),
            Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                warn!(
                    property_id = %property.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying pipeline after retryable error: {err}"
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("loop always returns by its final iteration")
}

async fn run_pipeline_once(
    property: Property,
    run_id: String,
    phase: Phase,
    browser: Arc<Mutex<chromiumoxide::browser::Browser>>,
) -> Result<(Verdict, Option<Screenshot>), ValidatorError> {
    let started_at = chrono::Utc::now();

    // Open at about:blank and install every pre-navigation script (stealth +
    // capture layer 1) before the first real navigation, per spec §4.1 —
    // otherwise the initial load, where analytics beacons fire, would run
    // unobserved by the fetch/XHR/beacon wrappers.
    let page = crate::browser_pool::new_stealth_page(&browser).await?;

    let capturer = NetworkEventCapturer::new();
    capturer.install(&page).await?;

    page.goto(property.target_url.as_str())
        .await
        .map_err(|e| ValidatorError::PageError(e.to_string()))?;

    let tm_timing = capturer
        .wait_for_tag_manager(&page, property.expected_tag_manager_id.as_deref(), TAG_MANAGER_WAIT_DEADLINE)
        .await;

    let analytics_timing = capturer
        .wait_for_analytics_events(
            &page,
            property.expected_analytics_id.as_deref(),
            ANALYTICS_WAIT_DEADLINE,
            ANALYTICS_WAIT_MAX_TAIL,
        )
        .await;

    let events = capturer.events().await;
    let page_snapshot = extract_page_snapshot(&page, capturer.document_status().await).await?;

    let page_view_timing = PageViewTiming {
        detection_latency_ms: analytics_timing.detection_latency_ms.or(tm_timing.detection_latency_ms),
        timed_out: analytics_timing.timed_out,
    };

    let mut verdict = validate(&property, &events, &page_snapshot, page_view_timing, started_at, &run_id, phase);

    if analytics_timing.timed_out {
        verdict.status = VerdictStatus::Timeout;
    }

    let screenshot_bytes = capture_screenshot(&page).await.ok();
    let _ = page.close().await;

    let screenshot = screenshot_bytes.map(|bytes| Screenshot::new(property.id.clone(), run_id, bytes, phase));

    if verdict.status == VerdictStatus::Timeout {
        return Err(ValidatorError::Timeout(ANALYTICS_WAIT_DEADLINE));
    }

    Ok((verdict, screenshot))
}

async fn extract_page_snapshot(page: &Page, document_status: Option<u16>) -> Result<PageSnapshot, ValidatorError> {
    let title = page.get_title().await.unwrap_or_default().unwrap_or_default();
    let final_url = page
        .url()
        .await
        .unwrap_or_default()
        .unwrap_or_default();

    let body_script = "document.body ? document.body.innerText.slice(0, 2000) : ''";
    let body_text: String = page
        .evaluate(body_script)
        .await
        .and_then(|r| r.into_value().map_err(Into::into))
        .unwrap_or_default();

    let redirect_script = "performance.getEntriesByType('navigation').some(e => e.redirectCount > 0)";
    let redirected: bool = page
        .evaluate(redirect_script)
        .await
        .and_then(|r| r.into_value().map_err(Into::into))
        .unwrap_or(false);

    Ok(PageSnapshot {
        navigation_status: document_status,
        navigation_final_url: final_url,
        redirected,
        body_text,
        title_text: title,
    })
}

async fn capture_screenshot(page: &Page) -> Result<Vec<u8>, ValidatorError> {
    let params = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Jpeg)
        .quality(60)
        .full_page(true)
        .build();

    page.screenshot(params)
        .await
        .map_err(|e| ValidatorError::PageError(e.to_string()))
}

fn timeout_placeholder_verdict(property: &Property, run_id: &str, phase: Phase) -> Verdict {
    let mut verdict = crate::validator::validate(
        property,
        &[],
        &PageSnapshot {
            navigation_status: None,
            navigation_final_url: property.target_url.clone(),
            redirected: false,
            body_text: String::new(),
            title_text: String::new(),
        },
        PageViewTiming {
            detection_latency_ms: None,
            timed_out: true,
        },
        chrono::Utc::now(),
        run_id,
        phase,
    );
    verdict.status = VerdictStatus::Timeout;
    verdict.is_valid = false;
    verdict
}

fn error_verdict(property: &Property, run_id: &str, phase: Phase, err: &ValidatorError) -> Verdict {
    use crate::model::{ExtractionMetrics, IdCheckResult, Issue, IssueKind, IssueSeverity, PageViewResult, PrimarySource};
    use std::collections::HashMap;

    Verdict {
        property_id: property.id.clone(),
        run_id: run_id.to_string(),
        phase,
        started_at: chrono::Utc::now(),
        finished_at: chrono::Utc::now(),
        navigation_status: None,
        navigation_final_url: property.target_url.clone(),
        redirected: false,
        analytics_id_check: IdCheckResult {
            expected: property.expected_analytics_id.clone(),
            chosen_actual: None,
            all_found: Vec::new(),
            issues: Vec::new(),
            is_valid: true,
        },
        tag_manager_id_check: IdCheckResult {
            expected: property.expected_tag_manager_id.clone(),
            chosen_actual: None,
            all_found: Vec::new(),
            issues: Vec::new(),
            is_valid: true,
        },
        page_view_check: PageViewResult {
            count: 0,
            detection_latency_ms: None,
            timed_out: false,
            issues: Vec::new(),
        },
        consent_mode_observed: false,
        is_valid: false,
        issues: vec![Issue::new(IssueKind::ValidationError, IssueSeverity::Critical, err.to_string())],
        wall_clock_ms: 0,
        screenshot_ref: None,
        extraction_source: ExtractionMetrics {
            per_id: HashMap::new(),
            window_count: 0,
            network_count: 0,
            primary_source: PrimarySource::Network,
            consent_mode: None,
        },
        status: VerdictStatus::Error,
    }
}

fn new_retry_queue_entry(property: &Property, run_id: &str, reason: &str) -> RetryQueueEntry {
    let now = chrono::Utc::now();
    RetryQueueEntry {
        id: Uuid::new_v4().to_string(),
        property_id: property.id.clone(),
        run_id: run_id.to_string(),
        reason: reason.to_string(),
        attempt_count: 1,
        last_attempt_at: Some(now),
        next_retry_at: now + chrono::Duration::from_std(RETRY_QUEUE_INITIAL_DELAY).unwrap(),
        status: RetryStatus::Pending,
        created_at: now,
        updated_at: now,
    }
}
