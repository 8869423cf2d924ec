//! Network Event Capturer: three redundant observation layers installed on
//! a stealth session before navigation, collecting analytics and
//! tag-manager traffic into one append-only, deduplicated list.
//!
//! Grounded on the teacher's `screenshot_service.rs` CDP usage
//! (`page.execute`, `page.evaluate`, `chromiumoxide::cdp::browser_protocol`)
//! and `browser_pool.rs`'s session-per-handle ownership model.

use crate::error::ValidatorError;
use crate::model::{CaptureSource, DetectionTiming, NetworkEvent};
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

pub const ANALYTICS_HOSTS: &[&str] = &["www.google-analytics.com", "analytics.google.com"];
pub const ANALYTICS_COLLECT_PATH_FRAGMENT: &str = "/g/collect";
pub const TAG_MANAGER_HOST: &str = "www.googletagmanager.com";
pub const TAG_MANAGER_PATH: &str = "/gtm.js";

/// Closed false-positive deny list (spec §9 open question (a): treated as
/// data, not code — not asserted to be complete).
pub const ANALYTICS_HOST_DENY_LIST: &[&str] = &[
    "script.hotjar.com",
    "consent.cookiebot.com",
    "securepubads.g.doubleclick.net",
];

pub const RECOGNIZED_ANALYTICS_PARAMS: &[&str] = &["v", "tid", "gtm", "en", "dl", "dt", "sid", "cid"];
pub const CUSTOM_PARAM_PREFIX: &str = "ep.";
pub const TAG_MANAGER_ID_PREFIX: &str = "GTM-";
pub const ANALYTICS_ID_PREFIX: &str = "G-";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TAG_MANAGER_LATE_ATTACH_WAIT: Duration = Duration::from_millis(2000);

pub fn is_analytics_collect_url(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let is_canonical_host = ANALYTICS_HOSTS.contains(&host);
    let is_denied = ANALYTICS_HOST_DENY_LIST.contains(&host);
    is_canonical_host && !is_denied && url.path().contains(ANALYTICS_COLLECT_PATH_FRAGMENT)
}

pub fn is_tag_manager_loader_url(url: &Url) -> bool {
    url.host_str() == Some(TAG_MANAGER_HOST) && url.path() == TAG_MANAGER_PATH
}

fn parse_analytics_event(
    url: &Url,
    post_body: Option<&str>,
    source: CaptureSource,
) -> NetworkEvent {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(body) = post_body {
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            params.insert(key.into_owned(), value.into_owned());
        }
    }

    let analytics_id = params.get("tid").cloned();
    let event_name = params.get("en").cloned();
    let document_location = params.get("dl").cloned();

    let mut custom_params = HashMap::new();
    for (key, value) in &params {
        if RECOGNIZED_ANALYTICS_PARAMS.contains(&key.as_str()) {
            continue;
        }
        if key.starts_with(CUSTOM_PARAM_PREFIX) {
            custom_params.insert(key.clone(), value.clone());
        }
    }

    NetworkEvent::AnalyticsCollect {
        timestamp: chrono::Utc::now(),
        analytics_id,
        event_name,
        document_location,
        custom_params,
        source,
        url: Some(url.to_string()),
    }
}

fn parse_tag_manager_event(url: &Url, source: CaptureSource) -> NetworkEvent {
    let tag_manager_id = url
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned());

    NetworkEvent::TagManagerLoad {
        timestamp: chrono::Utc::now(),
        tag_manager_id,
        source,
        url: Some(url.to_string()),
    }
}

/// Pre-navigation script that wraps `fetch`/`XMLHttpRequest`/`navigator.sendBeacon`
/// and pushes matching URLs into `window.__capturedRequests`, plus a
/// `MutationObserver` that records every inserted `<script src>`.
fn capture_bootstrap_script() -> &'static str {
    r#"
    (function() {
        window.__capturedRequests = window.__capturedRequests || [];
        const push = (url, channel) => {
            window.__capturedRequests.push({ url, channel, timestamp: Date.now() });
        };

        const origFetch = window.fetch;
        window.fetch = function(input, init) {
            try { push(typeof input === 'string' ? input : input.url, 'fetch'); } catch (e) {}
            return origFetch.apply(this, arguments);
        };

        const OrigXHR = window.XMLHttpRequest;
        const origOpen = OrigXHR.prototype.open;
        OrigXHR.prototype.open = function(method, url) {
            try { push(url, 'xhr'); } catch (e) {}
            return origOpen.apply(this, arguments);
        };

        const origSendBeacon = navigator.sendBeacon;
        if (origSendBeacon) {
            navigator.sendBeacon = function(url, data) {
                try { push(url, 'beacon'); } catch (e) {}
                return origSendBeacon.apply(this, arguments);
            };
        }

        window.__capturedScripts = window.__capturedScripts || [];
        const observer = new MutationObserver((mutations) => {
            for (const mutation of mutations) {
                for (const node of mutation.addedNodes) {
                    if (node.tagName === 'SCRIPT' && node.src) {
                        window.__capturedScripts.push(node.src);
                    }
                }
            }
        });
        observer.observe(document.documentElement, { childList: true, subtree: true });
    })();
    "#
}

/// Collects events from all three layers into a single deduplicated,
/// append-only list for the lifetime of one stealth session.
pub struct NetworkEventCapturer {
    events: Arc<Mutex<Vec<NetworkEvent>>>,
    seen_urls: Arc<Mutex<HashSet<String>>>,
    script_injection_failed: Arc<Mutex<bool>>,
    /// Status code of the most recent main-document response observed on
    /// the devtools network channel — the real counterpart of the 200
    /// placeholder the validator used to receive (spec §4.3 server-error
    /// early exit needs an actual status).
    document_status: Arc<Mutex<Option<u16>>>,
}

impl NetworkEventCapturer {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            seen_urls: Arc::new(Mutex::new(HashSet::new())),
            script_injection_failed: Arc::new(Mutex::new(false)),
            document_status: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs the pre-navigation script and subscribes to the devtools
    /// network channel — the second of the three redundant observation
    /// layers (spec §4.1). Script-injection failure degrades to
    /// devtools-only capture, logged but non-fatal (spec §4.1 failure
    /// semantics).
    pub async fn install(&self, page: &Page) -> Result<(), ValidatorError> {
        if let Err(err) = page.evaluate_on_new_document(capture_bootstrap_script()).await {
            warn!("pre-navigation script injection failed, degrading to devtools-only capture: {err}");
            *self.script_injection_failed.lock().await = true;
        }
        self.install_devtools_listener(page).await;
        Ok(())
    }

    /// Subscribes to `Network.responseReceived` and mirrors any analytics
    /// or tag-manager response into the same deduplicated event list the
    /// script layer feeds, plus records the main document's status code.
    /// A subscription failure is logged and non-fatal — the script and
    /// mutation-observer layers still cover the page on their own.
    async fn install_devtools_listener(&self, page: &Page) {
        let mut responses = match page.event_listener::<EventResponseReceived>().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to subscribe to the devtools network channel, relying on script-layer capture only: {err}");
                return;
            }
        };

        let events = Arc::clone(&self.events);
        let seen_urls = Arc::clone(&self.seen_urls);
        let document_status = Arc::clone(&self.document_status);

        tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if matches!(event.r#type, ResourceType::Document) {
                    *document_status.lock().await = Some(event.response.status as u16);
                }

                let Ok(url) = Url::parse(&event.response.url) else {
                    continue;
                };

                let parsed = if is_analytics_collect_url(&url) {
                    Some(parse_analytics_event(&url, None, CaptureSource::Cdp))
                } else if is_tag_manager_loader_url(&url) {
                    Some(parse_tag_manager_event(&url, CaptureSource::Cdp))
                } else {
                    None
                };

                if let Some(parsed) = parsed {
                    let mut seen = seen_urls.lock().await;
                    if seen.insert(url.to_string()) {
                        drop(seen);
                        events.lock().await.push(parsed);
                    }
                }
            }
        });
    }

    /// The most recent main-document status observed on the devtools
    /// channel, if any response has arrived yet.
    pub async fn document_status(&self) -> Option<u16> {
        *self.document_status.lock().await
    }

    /// Adds an event if its URL has not already been seen by any layer.
    /// Window-extracted synthetic events (no URL) are deduplicated by the
    /// caller before reaching here.
    async fn add_event(&self, event: NetworkEvent) {
        if let Some(url) = event.url() {
            let mut seen = self.seen_urls.lock().await;
            if !seen.insert(url.to_string()) {
                return;
            }
        }
        self.events.lock().await.push(event);
    }

    async fn add_analytics_request(&self, raw_url: &str, post_body: Option<&str>, source: CaptureSource) {
        let Ok(url) = Url::parse(raw_url) else {
            return;
        };
        if is_analytics_collect_url(&url) {
            self.add_event(parse_analytics_event(&url, post_body, source)).await;
        } else if is_tag_manager_loader_url(&url) {
            self.add_event(parse_tag_manager_event(&url, source)).await;
        }
    }

    /// Drains the page-script buffer (`window.__capturedRequests`) into the
    /// event list. A read failure on a single tick is ignored per spec.
    async fn drain_page_buffer(&self, page: &Page) {
        let script = "JSON.stringify((window.__capturedRequests || []).splice(0))";
        let drained: Result<serde_json::Value, _> = page
            .evaluate(script)
            .await
            .and_then(|result| result.into_value().map_err(Into::into));

        let Ok(serde_json::Value::Array(entries)) = drained else {
            return;
        };

        for entry in entries {
            let Some(url) = entry.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            let channel = entry.get("channel").and_then(|v| v.as_str()).unwrap_or("fetch");
            let source = match channel {
                "xhr" => CaptureSource::Xhr,
                "beacon" => CaptureSource::Beacon,
                _ => CaptureSource::Fetch,
            };
            self.add_analytics_request(url, None, source).await;
        }
    }

    /// Reads every newly-observed `<script src>` reported by the mutation
    /// observer and, for tag-manager loaders, records a load event.
    async fn drain_script_tags(&self, page: &Page) {
        let script = "JSON.stringify((window.__capturedScripts || []).splice(0))";
        let drained: Result<serde_json::Value, _> = page
            .evaluate(script)
            .await
            .and_then(|result| result.into_value().map_err(Into::into));

        let Ok(serde_json::Value::Array(entries)) = drained else {
            return;
        };

        for entry in entries {
            if let Some(url) = entry.as_str() {
                self.add_analytics_request(url, None, CaptureSource::MutationObserver).await;
            }
        }
    }

    /// Reads `window.google_tag_manager` and appends synthetic events for
    /// every loaded container and every analytics ID visible there. This is
    /// the only path that surfaces IDs once Consent Mode has suppressed
    /// network traffic.
    async fn extract_window_state(&self, page: &Page) {
        let script = r#"
        JSON.stringify(Object.keys(window.google_tag_manager || {}))
        "#;
        let keys: Result<Vec<String>, _> = page
            .evaluate(script)
            .await
            .and_then(|result| result.into_value().map_err(Into::into));

        let Ok(keys) = keys else {
            return;
        };

        for key in keys {
            if key.starts_with(TAG_MANAGER_ID_PREFIX) {
                self.add_event(NetworkEvent::TagManagerLoad {
                    timestamp: chrono::Utc::now(),
                    tag_manager_id: Some(key),
                    source: CaptureSource::WindowExtraction,
                    url: None,
                })
                .await;
            } else if key.starts_with(ANALYTICS_ID_PREFIX) {
                self.add_event(NetworkEvent::AnalyticsCollect {
                    timestamp: chrono::Utc::now(),
                    analytics_id: Some(key),
                    event_name: Some("window_extracted".to_string()),
                    document_location: None,
                    custom_params: HashMap::new(),
                    source: CaptureSource::WindowExtraction,
                    url: None,
                })
                .await;
            }
        }
    }

    async fn tick(&self, page: &Page) {
        self.drain_page_buffer(page).await;
        self.drain_script_tags(page).await;
    }

    pub async fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().await.clone()
    }

    /// Poll every 500ms; succeed when any tag-manager ID is detected and
    /// either `expected` is absent or matches case-insensitively after
    /// trimming. On first success, wait an additional 2000ms and re-read
    /// the window to surface late-attached analytics containers.
    pub async fn wait_for_tag_manager(
        &self,
        page: &Page,
        expected: Option<&str>,
        deadline: Duration,
    ) -> DetectionTiming {
        let start = Instant::now();
        loop {
            self.tick(page).await;
            self.extract_window_state(page).await;

            let events = self.events().await;
            let ids = crate::detection::all_tag_manager_ids(&events);
            let matched = match expected {
                Some(expected) => {
                    let expected = expected.trim().to_lowercase();
                    ids.iter().any(|id| id.trim().to_lowercase() == expected)
                }
                None => !ids.is_empty(),
            };

            if matched {
                sleep(TAG_MANAGER_LATE_ATTACH_WAIT).await;
                self.tick(page).await;
                self.extract_window_state(page).await;
                return DetectionTiming {
                    detection_latency_ms: Some(start.elapsed().as_millis() as u64),
                    timed_out: false,
                    skipped: None,
                };
            }

            if start.elapsed() >= deadline {
                return DetectionTiming {
                    detection_latency_ms: None,
                    timed_out: true,
                    skipped: None,
                };
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll every 500ms, draining layers each tick. Tracks the moment the
    /// first `page_view` event appears; once seen, exits immediately if the
    /// expected analytics ID is already observed, or after `maxTailMs` of
    /// waiting past that point otherwise.
    pub async fn wait_for_analytics_events(
        &self,
        page: &Page,
        expected_analytics_id: Option<&str>,
        deadline: Duration,
        max_tail: Duration,
    ) -> DetectionTiming {
        let start = Instant::now();
        let mut page_view_at: Option<Instant> = None;

        loop {
            self.tick(page).await;

            let events = self.events().await;

            if page_view_at.is_none() && crate::detection::find_page_view(&events).is_some() {
                page_view_at = Some(Instant::now());
            }

            if let Some(page_view_at) = page_view_at {
                let expected_found = expected_analytics_id
                    .map(|expected| crate::detection::all_analytics_ids(&events).iter().any(|id| id == expected))
                    .unwrap_or(true);

                if expected_found {
                    return DetectionTiming {
                        detection_latency_ms: Some(start.elapsed().as_millis() as u64),
                        timed_out: false,
                        skipped: None,
                    };
                }

                if page_view_at.elapsed() >= max_tail {
                    return DetectionTiming {
                        detection_latency_ms: Some(start.elapsed().as_millis() as u64),
                        timed_out: false,
                        skipped: Some("expected_analytics_id_not_found_after_tail".to_string()),
                    };
                }
            }

            if start.elapsed() >= deadline {
                return DetectionTiming {
                    detection_latency_ms: None,
                    timed_out: true,
                    skipped: None,
                };
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}

impl Default for NetworkEventCapturer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analytics_collect_url_matches_canonical_host_and_path() {
        let url = Url::parse("https://www.google-analytics.com/g/collect?tid=G-AAAA").unwrap();
        assert!(is_analytics_collect_url(&url));
    }

    #[test]
    fn analytics_collect_url_rejects_deny_listed_host() {
        let url = Url::parse("https://script.hotjar.com/g/collect?tid=G-AAAA").unwrap();
        assert!(!is_analytics_collect_url(&url));
    }

    #[test]
    fn tag_manager_loader_url_requires_exact_path() {
        let url = Url::parse("https://www.googletagmanager.com/gtm.js?id=GTM-ZZZZ").unwrap();
        assert!(is_tag_manager_loader_url(&url));

        let other = Url::parse("https://www.googletagmanager.com/other.js").unwrap();
        assert!(!is_tag_manager_loader_url(&other));
    }

    #[test]
    fn parse_analytics_event_extracts_recognized_and_custom_params() {
        let url = Url::parse("https://www.google-analytics.com/g/collect?tid=G-AAAA&en=page_view&ep.custom=1").unwrap();
        let event = parse_analytics_event(&url, None, CaptureSource::Cdp);
        match event {
            NetworkEvent::AnalyticsCollect {
                analytics_id,
                event_name,
                custom_params,
                ..
            } => {
                assert_eq!(analytics_id.as_deref(), Some("G-AAAA"));
                assert_eq!(event_name.as_deref(), Some("page_view"));
                assert_eq!(custom_params.get("ep.custom").map(|s| s.as_str()), Some("1"));
            }
            _ => panic!("expected AnalyticsCollect"),
        }
    }

    #[test]
    fn post_body_params_override_query_params() {
        let url = Url::parse("https://www.google-analytics.com/g/collect?tid=G-AAAA").unwrap();
        let event = parse_analytics_event(&url, Some("tid=G-OVERRIDE"), CaptureSource::Cdp);
        match event {
            NetworkEvent::AnalyticsCollect { analytics_id, .. } => {
                assert_eq!(analytics_id.as_deref(), Some("G-OVERRIDE"));
            }
            _ => panic!("expected AnalyticsCollect"),
        }
    }

    #[tokio::test]
    async fn add_event_deduplicates_by_url() {
        let capturer = NetworkEventCapturer::new();
        let url = Url::parse("https://www.google-analytics.com/g/collect?tid=G-AAAA").unwrap();
        capturer.add_event(parse_analytics_event(&url, None, CaptureSource::Cdp)).await;
        capturer.add_event(parse_analytics_event(&url, None, CaptureSource::Fetch)).await;
        assert_eq!(capturer.events().await.len(), 1);
    }
}
