use analytics_validator::detection::{
    detect_consent_mode_basic, extraction_metrics, find_analytics_id, ConsentModeContext,
};
use analytics_validator::{
    format_bytes, format_duration, sanitize_filename, validate_url, CaptureSource, CircuitBreaker,
    Config, NetworkEvent, Property,
};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use std::time::Duration;

fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn sample_property() -> Property {
    Property {
        id: "prop-1".to_string(),
        display_name: "Example Property".to_string(),
        target_url: "https://example.com".to_string(),
        expected_analytics_id: Some("G-AAAA".to_string()),
        expected_tag_manager_id: Some("GTM-ZZZZ".to_string()),
        uses_consent_mode: true,
        slug: "example-property".to_string(),
    }
}

fn sample_events(n: usize) -> Vec<NetworkEvent> {
    (0..n)
        .map(|i| NetworkEvent::AnalyticsCollect {
            timestamp: Utc::now(),
            analytics_id: Some(if i % 3 == 0 { "G-AAAA".to_string() } else { "G-BBBB".to_string() }),
            event_name: Some("page_view".to_string()),
            document_location: None,
            custom_params: HashMap::new(),
            source: CaptureSource::Cdp,
            url: Some(format!("https://example.com/g/collect?tid=G-AAAA&i={i}")),
        })
        .collect()
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec!["https://example.com", "http://example.com/path", "invalid-url"];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_filename_sanitization(c: &mut Criterion) {
    let mut group = c.benchmark_group("filename_sanitization");
    configure_fast_group(&mut group);

    let test_filenames = vec!["normal_file.txt", "file with spaces.txt", "file/with/slashes.txt"];

    group.bench_function("sanitize", |b| {
        b.iter(|| {
            for filename in &test_filenames {
                let sanitized = sanitize_filename(filename);
                black_box(sanitized);
            }
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = vec![Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = vec![1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                let formatted = format_duration(*duration);
                black_box(formatted);
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                let formatted = format_bytes(*size);
                black_box(formatted);
            }
        });
    });

    group.finish();
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    configure_fast_group(&mut group);

    group.bench_function("record_and_check", |b| {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(60));
        b.iter(|| {
            let can_execute = breaker.can_execute();
            if can_execute {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            black_box(can_execute);
        });
    });

    group.finish();
}

// The detection/validation pure functions are the hot path of a run — every
// property pays their cost once per phase, so their allocation behavior
// under a realistic event-list size is worth tracking.
fn benchmark_detection_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("detection");
    configure_fast_group(&mut group);

    let property = sample_property();
    let events = sample_events(50);

    group.bench_function("find_analytics_id", |b| {
        b.iter(|| {
            let result = find_analytics_id(&events, property.expected_analytics_id.as_deref());
            black_box(result.found);
        });
    });

    group.bench_function("extraction_metrics", |b| {
        b.iter(|| {
            let metrics = extraction_metrics(&events);
            black_box(metrics.window_count);
        });
    });

    group.bench_function("detect_consent_mode_basic", |b| {
        b.iter(|| {
            let result = detect_consent_mode_basic(&ConsentModeContext {
                property: &property,
                tag_manager_loaded: true,
                expected_id_in_window: false,
                observed_events_for_expected_id: 0,
            });
            black_box(result.is_basic);
        });
    });

    group.finish();
}

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_url_validation,
    benchmark_filename_sanitization,
    benchmark_format_utilities,
    benchmark_circuit_breaker,
    benchmark_detection_pipeline,
);
criterion_main!(unit_benches);
