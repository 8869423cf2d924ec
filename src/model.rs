//! Data model shared by the detection engine, validator, scheduler and
//! datastore layers.
//!
//! Every entity here is a plain value type — the tagged variants
//! (`NetworkEvent`, `Issue`) replace the ad-hoc property bags the source
//! system used, so that `detection`/`validator` can stay pure functions over
//! closed types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A validation target read from the Property Source. Immutable within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Property {
    pub id: String,
    pub display_name: String,
    pub target_url: String,
    pub expected_analytics_id: Option<String>,
    pub expected_tag_manager_id: Option<String>,
    pub uses_consent_mode: bool,
    pub slug: String,
}

/// Which capture layer observed an event. Preserved as metadata only — it
/// never affects event identity for deduplication purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureSource {
    Cdp,
    Fetch,
    Xhr,
    Beacon,
    MutationObserver,
    WindowExtraction,
}

/// A single captured network event, tagged by kind.
///
/// `url` is the request URL for real network-origin events and is the
/// dedup key; synthetic window-extraction events carry `url: None` and are
/// deduplicated on `(analytics_id, event_name)` / `tag_manager_id` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NetworkEvent {
    AnalyticsCollect {
        timestamp: DateTime<Utc>,
        analytics_id: Option<String>,
        event_name: Option<String>,
        document_location: Option<String>,
        custom_params: HashMap<String, String>,
        source: CaptureSource,
        url: Option<String>,
    },
    TagManagerLoad {
        timestamp: DateTime<Utc>,
        tag_manager_id: Option<String>,
        source: CaptureSource,
        url: Option<String>,
    },
}

impl NetworkEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NetworkEvent::AnalyticsCollect { timestamp, .. } => *timestamp,
            NetworkEvent::TagManagerLoad { timestamp, .. } => *timestamp,
        }
    }

    pub fn source(&self) -> CaptureSource {
        match self {
            NetworkEvent::AnalyticsCollect { source, .. } => *source,
            NetworkEvent::TagManagerLoad { source, .. } => *source,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            NetworkEvent::AnalyticsCollect { url, .. } => url.as_deref(),
            NetworkEvent::TagManagerLoad { url, .. } => url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionTiming {
    pub detection_latency_ms: Option<u64>,
    pub timed_out: bool,
    pub skipped: Option<String>,
}

/// Closed set of issue kinds (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    AnalyticsIdMismatch,
    TagManagerIdMismatch,
    PageViewNotFound,
    NoAnalyticsEvents,
    AnalyticsNotConfigured,
    ConsentModeBasicDetected,
    TagManagerNotFound,
    ServiceClosed,
    ServerError,
    ValidationError,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub indicators: Option<Vec<String>>,
}

impl Issue {
    pub fn new(kind: IssueKind, severity: IssueSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            expected: None,
            actual: None,
            indicators: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn with_indicators(mut self, indicators: Vec<String>) -> Self {
        self.indicators = Some(indicators);
        self
    }
}

/// Result of reconciling one expected identifier (analytics or tag-manager)
/// against the observed, ordered, deduplicated id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdCheckResult {
    pub expected: Option<String>,
    pub chosen_actual: Option<String>,
    pub all_found: Vec<String>,
    pub issues: Vec<Issue>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageViewResult {
    pub count: usize,
    pub detection_latency_ms: Option<u64>,
    pub timed_out: bool,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimarySource {
    Window,
    Network,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentModeResult {
    pub is_basic: bool,
    pub confidence: ConsentConfidence,
    pub indicators: Vec<String>,
    pub analytics_configured: bool,
    pub message: Option<String>,
}

/// Per-id source attribution plus the derived primary source, mirroring
/// spec §3/§4.2. `consent_mode` is filled in by the validator once it has
/// run `detectConsentModeBasic`; the pure `extractionMetrics` function only
/// populates `per_id`/`window_count`/`network_count`/`primary_source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetrics {
    pub per_id: HashMap<String, HashSet<CaptureSource>>,
    pub window_count: usize,
    pub network_count: usize,
    pub primary_source: PrimarySource,
    pub consent_mode: Option<ConsentModeResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    One = 1,
    Two = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub property_id: String,
    pub run_id: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub navigation_status: Option<u16>,
    pub navigation_final_url: String,
    pub redirected: bool,
    pub analytics_id_check: IdCheckResult,
    pub tag_manager_id_check: IdCheckResult,
    pub page_view_check: PageViewResult,
    pub consent_mode_observed: bool,
    pub is_valid: bool,
    pub issues: Vec<Issue>,
    pub wall_clock_ms: u64,
    pub screenshot_ref: Option<String>,
    pub extraction_source: ExtractionMetrics,
    /// Non-core bookkeeping: set when this verdict is a Phase-1 placeholder
    /// recorded while the property is queued for Phase 2 (spec §4.6 outcome
    /// 2), or an error/timeout verdict. Drives the `verdicts.status` column.
    pub status: VerdictStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Passed,
    Failed,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub property_id: String,
    pub run_id: String,
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub captured_at: DateTime<Utc>,
    pub phase: Phase,
}

impl Screenshot {
    pub fn new(property_id: String, run_id: String, bytes: Vec<u8>, phase: Phase) -> Self {
        Self {
            property_id,
            run_id,
            bytes,
            mime: "image/jpeg",
            captured_at: Utc::now(),
            phase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStats {
    pub upload_completed_at: DateTime<Utc>,
    pub upload_duration_ms: u64,
    pub upload_success_count: usize,
    pub upload_failed_count: usize,
}

/// Mutated only by the Run Coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub worker_count: usize,
    pub total_properties: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub upload_stats: Option<UploadStats>,
}

impl Run {
    pub fn new(id: String, worker_count: usize, total_properties: usize) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            worker_count,
            total_properties,
            completed_count: 0,
            failed_count: 0,
            upload_stats: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Resolved,
    PermanentFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueEntry {
    pub id: String,
    pub property_id: String,
    pub run_id: String,
    pub reason: String,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of pool/worker health, mirroring the teacher's
/// `BrowserPoolStats`/`MetricsSnapshot` shape, adapted to report on the
/// scheduler rather than a screenshot-only browser pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub total_properties_processed: usize,
}
