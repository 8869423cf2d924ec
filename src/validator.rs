//! Combines a property's expected configuration with its observed capture
//! state into a single `Verdict`. `validate` is a pure function: the only
//! inputs are values already extracted from the page (`PageSnapshot`) and
//! the captured event list, so the same inputs always produce a
//! byte-identical verdict modulo timestamps (spec §8).

use crate::detection::{
    detect_consent_mode_basic, extraction_metrics, find_analytics_id, find_page_view,
    find_tag_manager_id, ConsentModeContext,
};
use crate::model::{
    CaptureSource, IdCheckResult, Issue, IssueKind, IssueSeverity, NetworkEvent, PageViewResult,
    Phase, Property, Verdict, VerdictStatus,
};
use chrono::{DateTime, Utc};

/// Phrases that mark a page as intentionally shut down rather than broken.
/// Treated as data per the same "don't guess completeness" rule spec §9
/// applies to the analytics deny list.
pub const SERVICE_CLOSED_PHRASES: &[&str] = &[
    "service is no longer available",
    "this service has been discontinued",
    "site has closed",
];

pub const SERVER_ERROR_PHRASES: &[&str] = &[
    "internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
];

/// Already-extracted page state. Kept separate from the live `chromiumoxide`
/// page handle so `validate` itself never performs I/O.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub navigation_status: Option<u16>,
    pub navigation_final_url: String,
    pub redirected: bool,
    pub body_text: String,
    pub title_text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PageViewTiming {
    pub detection_latency_ms: Option<u64>,
    pub timed_out: bool,
}

pub fn validate(
    property: &Property,
    events: &[NetworkEvent],
    page: &PageSnapshot,
    page_view_timing: PageViewTiming,
    started_at: DateTime<Utc>,
    run_id: &str,
    phase: Phase,
) -> Verdict {
    let finished_at = Utc::now();
    let wall_clock_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

    if let Some(verdict) = early_exit(property, page, run_id, phase, started_at, finished_at, wall_clock_ms) {
        return verdict;
    }

    let tag_manager_loaded = events
        .iter()
        .any(|event| matches!(event, NetworkEvent::TagManagerLoad { .. }));

    let expected_id_in_window = property.expected_analytics_id.as_deref().is_some_and(|expected| {
        events.iter().any(|event| {
            matches!(
                event,
                NetworkEvent::AnalyticsCollect {
                    analytics_id: Some(id),
                    source: CaptureSource::WindowExtraction,
                    ..
                } if id == expected
            )
        })
    });

    let observed_events_for_expected_id = property
        .expected_analytics_id
        .as_deref()
        .map(|expected| {
            events
                .iter()
                .filter(|event| {
                    matches!(
                        event,
                        NetworkEvent::AnalyticsCollect {
                            analytics_id: Some(id),
                            source,
                            ..
                        } if id == expected && *source != CaptureSource::WindowExtraction
                    )
                })
                .count()
        })
        .unwrap_or(0);

    let consent_mode = detect_consent_mode_basic(&ConsentModeContext {
        property,
        tag_manager_loaded,
        expected_id_in_window,
        observed_events_for_expected_id,
    });

    let analytics_id_check = check_analytics_id(property, events, tag_manager_loaded, &consent_mode);
    let tag_manager_id_check = check_tag_manager_id(property, events);
    let page_view_check = check_page_view(events, &page_view_timing, consent_mode.is_basic);

    let mut issues = Vec::new();
    issues.extend(analytics_id_check.issues.clone());
    issues.extend(tag_manager_id_check.issues.clone());
    issues.extend(page_view_check.issues.clone());

    let is_valid = analytics_id_check.is_valid && tag_manager_id_check.is_valid && page_view_check.is_valid;

    let mut extraction_source = extraction_metrics(events);
    extraction_source.consent_mode = Some(consent_mode.clone());

    Verdict {
        property_id: property.id.clone(),
        run_id: run_id.to_string(),
        phase,
        started_at,
        finished_at,
        navigation_status: page.navigation_status,
        navigation_final_url: page.navigation_final_url.clone(),
        redirected: page.redirected,
        analytics_id_check,
        tag_manager_id_check,
        page_view_check,
        consent_mode_observed: consent_mode.is_basic,
        is_valid,
        issues,
        wall_clock_ms,
        screenshot_ref: None,
        extraction_source,
        status: if is_valid { VerdictStatus::Passed } else { VerdictStatus::Failed },
    }
}

fn early_exit(
    property: &Property,
    page: &PageSnapshot,
    run_id: &str,
    phase: Phase,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    wall_clock_ms: u64,
) -> Option<Verdict> {
    let haystack = format!("{} {}", page.body_text, page.title_text).to_lowercase();

    let service_closed = SERVICE_CLOSED_PHRASES
        .iter()
        .any(|phrase| haystack.contains(phrase));
    if service_closed {
        return Some(placeholder_verdict(
            property,
            run_id,
            phase,
            started_at,
            finished_at,
            wall_clock_ms,
            page,
            VerdictStatus::Failed,
            Issue::new(IssueKind::ServiceClosed, IssueSeverity::Warning, "service closed page detected"),
        ));
    }

    let server_error = page.navigation_status.map(|status| status >= 500).unwrap_or(false)
        || SERVER_ERROR_PHRASES.iter().any(|phrase| haystack.contains(phrase));
    if server_error {
        return Some(placeholder_verdict(
            property,
            run_id,
            phase,
            started_at,
            finished_at,
            wall_clock_ms,
            page,
            VerdictStatus::Error,
            Issue::new(IssueKind::ServerError, IssueSeverity::Critical, "server error page detected"),
        ));
    }

    None
}

fn placeholder_verdict(
    property: &Property,
    run_id: &str,
    phase: Phase,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    wall_clock_ms: u64,
    page: &PageSnapshot,
    status: VerdictStatus,
    issue: Issue,
) -> Verdict {
    Verdict {
        property_id: property.id.clone(),
        run_id: run_id.to_string(),
        phase,
        started_at,
        finished_at,
        navigation_status: page.navigation_status,
        navigation_final_url: page.navigation_final_url.clone(),
        redirected: page.redirected,
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
        is_valid: status != VerdictStatus::Error,
        issues: vec![issue],
        wall_clock_ms,
        screenshot_ref: None,
        extraction_source: extraction_metrics(&[]),
        status,
    }
}

fn check_analytics_id(
    property: &Property,
    events: &[NetworkEvent],
    tag_manager_loaded: bool,
    consent_mode: &crate::model::ConsentModeResult,
) -> IdCheckResult {
    let expected = property.expected_analytics_id.clone();
    let match_result = find_analytics_id(events, expected.as_deref());

    if match_result.all_ids.is_empty() {
        let (issue, is_valid) = if consent_mode.is_basic {
            (
                Issue::new(IssueKind::ConsentModeBasicDetected, IssueSeverity::Info, "Consent Mode Basic detected"),
                true,
            )
        } else if tag_manager_loaded && !property.uses_consent_mode {
            (
                Issue::new(IssueKind::AnalyticsNotConfigured, IssueSeverity::Critical, "tag manager loaded but analytics not configured"),
                false,
            )
        } else if property.uses_consent_mode {
            (
                Issue::new(IssueKind::NoAnalyticsEvents, IssueSeverity::Info, "no analytics events observed"),
                true,
            )
        } else {
            (
                Issue::new(IssueKind::NoAnalyticsEvents, IssueSeverity::Critical, "no analytics events observed"),
                false,
            )
        };

        return IdCheckResult {
            expected,
            chosen_actual: None,
            all_found: Vec::new(),
            issues: vec![issue],
            is_valid,
        };
    }

    if match_result.found {
        return IdCheckResult {
            expected,
            chosen_actual: match_result.primary,
            all_found: match_result.all_ids,
            issues: Vec::new(),
            is_valid: true,
        };
    }

    let issue = Issue::new(
        IssueKind::AnalyticsIdMismatch,
        IssueSeverity::Critical,
        "observed analytics id does not match expected id",
    )
    .with_expected(expected.clone().unwrap_or_default())
    .with_indicators(match_result.all_ids.clone());

    IdCheckResult {
        expected,
        chosen_actual: match_result.primary,
        all_found: match_result.all_ids,
        issues: vec![issue],
        is_valid: false,
    }
}

fn check_tag_manager_id(property: &Property, events: &[NetworkEvent]) -> IdCheckResult {
    let Some(expected) = property.expected_tag_manager_id.clone() else {
        return IdCheckResult {
            expected: None,
            chosen_actual: None,
            all_found: Vec::new(),
            issues: Vec::new(),
            is_valid: true,
        };
    };

    let match_result = find_tag_manager_id(events, Some(&expected));

    if match_result.all_ids.is_empty() {
        return IdCheckResult {
            expected: Some(expected),
            chosen_actual: None,
            all_found: Vec::new(),
            issues: vec![Issue::new(
                IssueKind::TagManagerNotFound,
                IssueSeverity::Critical,
                "no tag manager container observed",
            )],
            is_valid: false,
        };
    }

    if match_result.found {
        return IdCheckResult {
            expected: Some(expected),
            chosen_actual: match_result.primary,
            all_found: match_result.all_ids,
            issues: Vec::new(),
            is_valid: true,
        };
    }

    let issue = Issue::new(
        IssueKind::TagManagerIdMismatch,
        IssueSeverity::Critical,
        "observed tag manager id does not match expected id",
    )
    .with_expected(expected.clone())
    .with_indicators(match_result.all_ids.clone());

    IdCheckResult {
        expected: Some(expected),
        chosen_actual: match_result.primary,
        all_found: match_result.all_ids,
        issues: vec![issue],
        is_valid: false,
    }
}

fn check_page_view(
    events: &[NetworkEvent],
    timing: &PageViewTiming,
    consent_mode_basic: bool,
) -> PageViewResult {
    if consent_mode_basic {
        return PageViewResult {
            count: 0,
            detection_latency_ms: timing.detection_latency_ms,
            timed_out: timing.timed_out,
            issues: Vec::new(),
        };
    }

    let count = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                NetworkEvent::AnalyticsCollect {
                    event_name: Some(name),
                    ..
                } if name == "page_view"
            )
        })
        .count();

    if count == 0 {
        return PageViewResult {
            count,
            detection_latency_ms: timing.detection_latency_ms,
            timed_out: timing.timed_out,
            issues: vec![Issue::new(
                IssueKind::PageViewNotFound,
                IssueSeverity::Critical,
                "no page_view event observed",
            )],
        };
    }

    let _ = find_page_view(events);

    PageViewResult {
        count,
        detection_latency_ms: timing.detection_latency_ms,
        timed_out: timing.timed_out,
        issues: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaptureSource;
    use std::collections::HashMap;

    fn property(uses_consent_mode: bool) -> Property {
        Property {
            id: "p1".to_string(),
            display_name: "Example".to_string(),
            target_url: "https://example.com".to_string(),
            expected_analytics_id: Some("G-AAAA".to_string()),
            expected_tag_manager_id: Some("GTM-ZZZZ".to_string()),
            uses_consent_mode,
            slug: "example".to_string(),
        }
    }

    fn page() -> PageSnapshot {
        PageSnapshot {
            navigation_status: Some(200),
            navigation_final_url: "https://example.com".to_string(),
            redirected: false,
            body_text: String::new(),
            title_text: String::new(),
        }
    }

    fn analytics_event(id: &str, event_name: &str) -> NetworkEvent {
        NetworkEvent::AnalyticsCollect {
            timestamp: Utc::now(),
            analytics_id: Some(id.to_string()),
            event_name: Some(event_name.to_string()),
            document_location: None,
            custom_params: HashMap::new(),
            source: CaptureSource::Cdp,
            url: Some(format!("https://example.com/g/collect?tid={id}")),
        }
    }

    fn tag_manager_event(id: &str) -> NetworkEvent {
        NetworkEvent::TagManagerLoad {
            timestamp: Utc::now(),
            tag_manager_id: Some(id.to_string()),
            source: CaptureSource::Cdp,
            url: Some(format!("https://www.googletagmanager.com/gtm.js?id={id}")),
        }
    }

    fn timing(timed_out: bool) -> PageViewTiming {
        PageViewTiming {
            detection_latency_ms: Some(100),
            timed_out,
        }
    }

    #[test]
    fn happy_path_is_valid_with_no_issues() {
        let events = vec![analytics_event("G-AAAA", "page_view"), tag_manager_event("GTM-ZZZZ")];
        let verdict = validate(
            &property(false),
            &events,
            &page(),
            timing(false),
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(verdict.is_valid);
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.page_view_check.count, 1);
    }

    #[test]
    fn analytics_mismatch_is_reported() {
        let events = vec![analytics_event("G-BBBB", "page_view")];
        let verdict = validate(
            &property(false),
            &events,
            &page(),
            timing(false),
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(!verdict.is_valid);
        assert!(verdict
            .issues
            .iter()
            .any(|issue| issue.kind == IssueKind::AnalyticsIdMismatch));
        assert_eq!(verdict.analytics_id_check.all_found, vec!["G-BBBB"]);
    }

    #[test]
    fn empty_events_with_consent_mode_and_no_tag_manager_is_valid() {
        let verdict = validate(&property(true), &[], &page(), timing(false), Utc::now(), "run-1", Phase::One);
        assert!(verdict.is_valid);
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.issues[0].kind, IssueKind::NoAnalyticsEvents);
        assert_eq!(verdict.issues[0].severity, IssueSeverity::Info);
    }

    #[test]
    fn empty_events_without_consent_mode_is_invalid() {
        let verdict = validate(&property(false), &[], &page(), timing(false), Utc::now(), "run-1", Phase::One);
        assert!(!verdict.is_valid);
        assert_eq!(verdict.issues[0].kind, IssueKind::NoAnalyticsEvents);
        assert_eq!(verdict.issues[0].severity, IssueSeverity::Critical);
    }

    #[test]
    fn consent_mode_basic_with_window_container_but_not_expected_id_is_valid() {
        let mut window_event = tag_manager_event("GTM-ZZZZ");
        if let NetworkEvent::TagManagerLoad { source, url, .. } = &mut window_event {
            *source = CaptureSource::WindowExtraction;
            *url = None;
        }
        let events = vec![window_event];
        let verdict = validate(&property(true), &events, &page(), timing(false), Utc::now(), "run-1", Phase::One);
        assert!(verdict.is_valid);
        assert!(verdict
            .issues
            .iter()
            .any(|issue| issue.kind == IssueKind::ConsentModeBasicDetected));
    }

    #[test]
    fn non_page_view_events_with_expected_id_still_fail_page_view_check() {
        let events = vec![analytics_event("G-AAAA", "click")];
        let verdict = validate(&property(false), &events, &page(), timing(false), Utc::now(), "run-1", Phase::One);
        assert!(verdict.analytics_id_check.is_valid);
        assert!(!verdict.page_view_check.issues.is_empty());
        assert!(!verdict.is_valid);
    }

    #[test]
    fn service_closed_page_short_circuits_checks() {
        let mut closed_page = page();
        closed_page.body_text = "This service has been discontinued".to_string();
        let verdict = validate(&property(false), &[], &closed_page, timing(false), Utc::now(), "run-1", Phase::One);
        assert_eq!(verdict.status, VerdictStatus::Failed);
        assert_eq!(verdict.issues[0].kind, IssueKind::ServiceClosed);
    }

    #[test]
    fn server_error_status_short_circuits_checks() {
        let mut error_page = page();
        error_page.navigation_status = Some(503);
        let verdict = validate(&property(false), &[], &error_page, timing(false), Utc::now(), "run-1", Phase::One);
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert_eq!(verdict.issues[0].kind, IssueKind::ServerError);
    }
}
