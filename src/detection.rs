//! Pure, side-effect-free functions over a captured `NetworkEvent` list.
//!
//! Nothing in this module touches a browser, a clock (beyond timestamps
//! already attached to events) or I/O of any kind — everything here is
//! unit-tested the same way the teacher's `utils.rs` tests its pure helpers.

use crate::model::{
    CaptureSource, ConsentConfidence, ConsentModeResult, ExtractionMetrics, NetworkEvent,
    PrimarySource, Property,
};
use std::collections::{HashMap, HashSet};

/// Unique analytics IDs in capture order.
pub fn all_analytics_ids(events: &[NetworkEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for event in events {
        if let NetworkEvent::AnalyticsCollect {
            analytics_id: Some(id),
            ..
        } = event
        {
            if seen.insert(id.clone()) {
                ordered.push(id.clone());
            }
        }
    }
    ordered
}

/// Unique tag-manager container IDs in capture order.
pub fn all_tag_manager_ids(events: &[NetworkEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for event in events {
        if let NetworkEvent::TagManagerLoad {
            tag_manager_id: Some(id),
            ..
        } = event
        {
            if seen.insert(id.clone()) {
                ordered.push(id.clone());
            }
        }
    }
    ordered
}

pub struct AnalyticsIdMatch {
    pub found: bool,
    pub all_ids: Vec<String>,
    pub primary: Option<String>,
}

pub fn find_analytics_id(events: &[NetworkEvent], expected: Option<&str>) -> AnalyticsIdMatch {
    let all_ids = all_analytics_ids(events);
    let primary = all_ids.first().cloned();
    let found = match expected {
        Some(expected) => all_ids.iter().any(|id| id == expected),
        None => !all_ids.is_empty(),
    };
    AnalyticsIdMatch {
        found,
        all_ids,
        primary,
    }
}

pub struct TagManagerIdMatch {
    pub found: bool,
    pub all_ids: Vec<String>,
    pub primary: Option<String>,
}

/// Tag-manager comparison is case-insensitive and whitespace-trimmed.
pub fn find_tag_manager_id(events: &[NetworkEvent], expected: Option<&str>) -> TagManagerIdMatch {
    let all_ids = all_tag_manager_ids(events);
    let primary = all_ids.first().cloned();
    let found = match expected {
        Some(expected) => {
            let expected = expected.trim().to_lowercase();
            all_ids.iter().any(|id| id.trim().to_lowercase() == expected)
        }
        None => !all_ids.is_empty(),
    };
    TagManagerIdMatch {
        found,
        all_ids,
        primary,
    }
}

/// First `AnalyticsCollect` event whose `event_name` is `"page_view"`.
pub fn find_page_view(events: &[NetworkEvent]) -> Option<&NetworkEvent> {
    events.iter().find(|event| {
        matches!(
            event,
            NetworkEvent::AnalyticsCollect {
                event_name: Some(name),
                ..
            } if name == "page_view"
        )
    })
}

/// `primarySource = window` if any ID was seen in the window layer (with or
/// without network), else `network`. `Mixed` is part of the closed data
/// model (spec §3) but this function's decision table never produces it —
/// reserved for future per-id primary-source reporting.
pub fn extraction_metrics(events: &[NetworkEvent]) -> ExtractionMetrics {
    let mut per_id: HashMap<String, HashSet<CaptureSource>> = HashMap::new();
    let mut window_count = 0usize;
    let mut network_count = 0usize;
    let mut any_window = false;

    for event in events {
        let (id, source) = match event {
            NetworkEvent::AnalyticsCollect {
                analytics_id: Some(id),
                source,
                ..
            } => (id.clone(), *source),
            NetworkEvent::TagManagerLoad {
                tag_manager_id: Some(id),
                source,
                ..
            } => (id.clone(), *source),
            _ => continue,
        };

        per_id.entry(id).or_default().insert(source);

        if source == CaptureSource::WindowExtraction {
            window_count += 1;
            any_window = true;
        } else {
            network_count += 1;
        }
    }

    let primary_source = if any_window {
        PrimarySource::Window
    } else {
        PrimarySource::Network
    };

    ExtractionMetrics {
        per_id,
        window_count,
        network_count,
        primary_source,
        consent_mode: None,
    }
}

/// Inputs the Consent Mode Basic decision table (spec §4.2) needs beyond the
/// event list itself — whether the container loaded, and whether the
/// expected analytics ID showed up in the window-extraction layer.
pub struct ConsentModeContext<'a> {
    pub property: &'a Property,
    pub tag_manager_loaded: bool,
    pub expected_id_in_window: bool,
    pub observed_events_for_expected_id: usize,
}

pub fn detect_consent_mode_basic(ctx: &ConsentModeContext<'_>) -> ConsentModeResult {
    if !ctx.property.uses_consent_mode {
        return ConsentModeResult {
            is_basic: false,
            confidence: ConsentConfidence::Low,
            indicators: Vec::new(),
            analytics_configured: false,
            message: Some("skipped: property does not use Consent Mode".to_string()),
        };
    }

    if !ctx.tag_manager_loaded {
        return ConsentModeResult {
            is_basic: false,
            confidence: ConsentConfidence::Low,
            indicators: Vec::new(),
            analytics_configured: false,
            message: Some("no tag manager found".to_string()),
        };
    }

    if ctx.expected_id_in_window {
        return ConsentModeResult {
            is_basic: false,
            confidence: ConsentConfidence::Low,
            indicators: Vec::new(),
            analytics_configured: true,
            message: Some("normal implementation".to_string()),
        };
    }

    if ctx.observed_events_for_expected_id == 0 {
        return ConsentModeResult {
            is_basic: true,
            confidence: ConsentConfidence::High,
            indicators: vec!["tag_manager_loaded".to_string(), "no_network_events".to_string()],
            analytics_configured: true,
            message: None,
        };
    }

    ConsentModeResult {
        is_basic: false,
        confidence: ConsentConfidence::Medium,
        indicators: vec!["tag_manager_loaded".to_string(), "network_events_present".to_string()],
        analytics_configured: true,
        message: Some("possible advanced consent mode".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaptureSource;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn analytics_event(id: &str, event_name: Option<&str>) -> NetworkEvent {
        NetworkEvent::AnalyticsCollect {
            timestamp: Utc::now(),
            analytics_id: Some(id.to_string()),
            event_name: event_name.map(|s| s.to_string()),
            document_location: None,
            custom_params: StdHashMap::new(),
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

    #[test]
    fn all_analytics_ids_dedups_and_preserves_order() {
        let events = vec![
            analytics_event("G-AAAA", Some("page_view")),
            analytics_event("G-BBBB", None),
            analytics_event("G-AAAA", Some("click")),
        ];
        assert_eq!(all_analytics_ids(&events), vec!["G-AAAA", "G-BBBB"]);
    }

    #[test]
    fn all_analytics_ids_idempotent_under_concatenation() {
        let events = vec![analytics_event("G-AAAA", Some("page_view"))];
        let mut doubled = events.clone();
        doubled.extend(events.clone());
        assert_eq!(all_analytics_ids(&events), all_analytics_ids(&doubled));
    }

    #[test]
    fn find_analytics_id_reports_mismatch() {
        let events = vec![analytics_event("G-BBBB", Some("page_view"))];
        let result = find_analytics_id(&events, Some("G-AAAA"));
        assert!(!result.found);
        assert_eq!(result.all_ids, vec!["G-BBBB"]);
    }

    #[test]
    fn find_tag_manager_id_is_case_insensitive_and_trims() {
        let events = vec![tag_manager_event(" gtm-zzzz ")];
        let result = find_tag_manager_id(&events, Some("GTM-ZZZZ"));
        assert!(result.found);
    }

    #[test]
    fn find_page_view_locates_distinguished_event() {
        let events = vec![
            analytics_event("G-AAAA", Some("click")),
            analytics_event("G-AAAA", Some("page_view")),
        ];
        let page_view = find_page_view(&events);
        assert!(page_view.is_some());
    }

    #[test]
    fn extraction_metrics_prefers_window_primary_source() {
        let mut window_event = analytics_event("G-AAAA", Some("window_extracted"));
        if let NetworkEvent::AnalyticsCollect { source, url, .. } = &mut window_event {
            *source = CaptureSource::WindowExtraction;
            *url = None;
        }
        let events = vec![window_event];
        let metrics = extraction_metrics(&events);
        assert_eq!(metrics.primary_source, PrimarySource::Window);
        assert_eq!(metrics.window_count, 1);
        assert_eq!(metrics.network_count, 0);
    }

    #[test]
    fn consent_mode_basic_decision_table_matches_spec() {
        let prop_no_consent = property(false);
        let result = detect_consent_mode_basic(&ConsentModeContext {
            property: &prop_no_consent,
            tag_manager_loaded: true,
            expected_id_in_window: false,
            observed_events_for_expected_id: 0,
        });
        assert!(!result.is_basic);

        let prop = property(true);

        let no_tag_manager = detect_consent_mode_basic(&ConsentModeContext {
            property: &prop,
            tag_manager_loaded: false,
            expected_id_in_window: false,
            observed_events_for_expected_id: 0,
        });
        assert!(!no_tag_manager.is_basic);

        let normal = detect_consent_mode_basic(&ConsentModeContext {
            property: &prop,
            tag_manager_loaded: true,
            expected_id_in_window: true,
            observed_events_for_expected_id: 0,
        });
        assert!(!normal.is_basic);

        let basic = detect_consent_mode_basic(&ConsentModeContext {
            property: &prop,
            tag_manager_loaded: true,
            expected_id_in_window: false,
            observed_events_for_expected_id: 0,
        });
        assert!(basic.is_basic);
        assert_eq!(basic.confidence, ConsentConfidence::High);

        let advanced = detect_consent_mode_basic(&ConsentModeContext {
            property: &prop,
            tag_manager_loaded: true,
            expected_id_in_window: false,
            observed_events_for_expected_id: 2,
        });
        assert!(!advanced.is_basic);
        assert_eq!(advanced.confidence, ConsentConfidence::Medium);
    }
}
