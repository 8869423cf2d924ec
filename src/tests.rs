//! Cross-module integration tests. Unlike the per-module `#[cfg(test)]`
//! blocks, these exercise `validate()` end to end against the concrete
//! scenarios the property catalog is expected to produce, and check the
//! ambient stack (config, error, utils) the way the teacher's own
//! `tests.rs` checks it.

#[cfg(test)]
mod integration_tests {
    use crate::detection::{all_analytics_ids, all_tag_manager_ids};
    use crate::error::{CircuitBreaker, ErrorSeverity, ValidatorError};
    use crate::model::{CaptureSource, NetworkEvent, Phase, Property, VerdictStatus};
    use crate::validator::{validate, PageSnapshot, PageViewTiming};
    use crate::{format_bytes, format_duration, sanitize_filename, validate_url, Config};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    fn property() -> Property {
        Property {
            id: "prop-1".to_string(),
            display_name: "Example Property".to_string(),
            target_url: "https://example.com".to_string(),
            expected_analytics_id: Some("G-AAAA".to_string()),
            expected_tag_manager_id: Some("GTM-ZZZZ".to_string()),
            uses_consent_mode: false,
            slug: "example-property".to_string(),
        }
    }

    fn ok_page() -> PageSnapshot {
        PageSnapshot {
            navigation_status: Some(200),
            navigation_final_url: "https://example.com".to_string(),
            redirected: false,
            body_text: "Welcome to Example".to_string(),
            title_text: "Example".to_string(),
        }
    }

    fn collect_event(id: &str, event_name: &str) -> NetworkEvent {
        NetworkEvent::AnalyticsCollect {
            timestamp: Utc::now(),
            analytics_id: Some(id.to_string()),
            event_name: Some(event_name.to_string()),
            document_location: None,
            custom_params: HashMap::new(),
            source: CaptureSource::Cdp,
            url: Some(format!("https://example.com/g/collect?tid={id}&en={event_name}")),
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

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.browser_pool_size, 10);
        assert_eq!(config.phase1_timeout, Duration::from_secs(20));
        assert_eq!(config.phase2_timeout, Duration::from_secs(90));
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn test_error_retryable() {
        assert!(ValidatorError::BrowserUnavailable.is_retryable());
        assert!(ValidatorError::NetworkError("down".to_string()).is_retryable());
        // Timeouts escalate through the Two-Phase Scheduler, not inline retry.
        assert!(!ValidatorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ValidatorError::InvalidUrl("bad".to_string()).is_retryable());
        assert!(!ValidatorError::ConfigurationError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_error_severity() {
        assert!(matches!(ValidatorError::InvalidUrl("x".into()).severity(), ErrorSeverity::Low));
        assert!(matches!(ValidatorError::NetworkError("x".into()).severity(), ErrorSeverity::Medium));
        assert!(matches!(ValidatorError::ConfigurationError("x".into()).severity(), ErrorSeverity::High));
    }

    #[test]
    fn test_circuit_breaker() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        assert!(breaker.can_execute());
        assert_eq!(breaker.get_failure_count(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert!(breaker.can_execute());
        assert_eq!(breaker.get_failure_count(), 0);
    }

    #[test]
    fn test_utils_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
    }

    #[test]
    fn test_utils_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_utils_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_utils_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("invalid-url").is_err());
    }

    // Scenario 1 (spec §8): everything matches, verdict passes clean.
    #[test]
    fn scenario_full_match_passes() {
        let property = property();
        let events = vec![
            tag_manager_event("GTM-ZZZZ"),
            collect_event("G-AAAA", "page_view"),
        ];
        let verdict = validate(
            &property,
            &events,
            &ok_page(),
            PageViewTiming { detection_latency_ms: Some(120), timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(verdict.is_valid);
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.status, VerdictStatus::Passed);
    }

    // Scenario 2: wrong analytics ID observed — a mismatch issue, not a
    // "not configured" issue, and the verdict fails.
    #[test]
    fn scenario_analytics_id_mismatch_fails() {
        let property = property();
        let events = vec![
            tag_manager_event("GTM-ZZZZ"),
            collect_event("G-WRONG", "page_view"),
        ];
        let verdict = validate(
            &property,
            &events,
            &ok_page(),
            PageViewTiming { detection_latency_ms: Some(120), timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(!verdict.is_valid);
        assert!(verdict.analytics_id_check.all_found.contains(&"G-WRONG".to_string()));
    }

    // Scenario 3: no tag manager and no analytics events at all — configured
    // host never fires, the strongest possible failure signal.
    #[test]
    fn scenario_no_events_observed_fails() {
        let property = property();
        let verdict = validate(
            &property,
            &[],
            &ok_page(),
            PageViewTiming { detection_latency_ms: None, timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(!verdict.is_valid);
        assert!(!verdict.issues.is_empty());
    }

    // Scenario 4: service-closed body text short-circuits to a single
    // warning-level issue rather than three independent check failures.
    #[test]
    fn scenario_service_closed_short_circuits() {
        let property = property();
        let page = PageSnapshot {
            navigation_status: Some(200),
            navigation_final_url: "https://example.com".to_string(),
            redirected: false,
            body_text: "This service has been discontinued".to_string(),
            title_text: "Example".to_string(),
        };
        let verdict = validate(
            &property,
            &[],
            &page,
            PageViewTiming { detection_latency_ms: None, timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.status, VerdictStatus::Failed);
    }

    // Scenario 5: Consent Mode Basic — tag manager loads, expected id never
    // shows up in window or network capture, so the validator explains the
    // absence rather than reporting a bare mismatch.
    #[test]
    fn scenario_consent_mode_basic_explains_missing_id() {
        let mut property = property();
        property.uses_consent_mode = true;
        let events = vec![tag_manager_event("GTM-ZZZZ")];
        let verdict = validate(
            &property,
            &events,
            &ok_page(),
            PageViewTiming { detection_latency_ms: None, timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(verdict
            .extraction_source
            .consent_mode
            .as_ref()
            .is_some_and(|c| c.is_basic));
    }

    // Scenario 6: duplicate network-layer observations of the same id
    // collapse to one entry, so retries within a single page load don't
    // inflate the observed id list.
    #[test]
    fn scenario_duplicate_events_dedup_in_final_verdict() {
        let property = property();
        let events = vec![
            tag_manager_event("GTM-ZZZZ"),
            collect_event("G-AAAA", "page_view"),
            collect_event("G-AAAA", "page_view"),
        ];
        assert_eq!(all_analytics_ids(&events), vec!["G-AAAA".to_string()]);
        assert_eq!(all_tag_manager_ids(&events), vec!["GTM-ZZZZ".to_string()]);
        let verdict = validate(
            &property,
            &events,
            &ok_page(),
            PageViewTiming { detection_latency_ms: Some(80), timed_out: false },
            Utc::now(),
            "run-1",
            Phase::One,
        );
        assert!(verdict.is_valid);
    }
}
