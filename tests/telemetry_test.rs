//! Telemetry tests: events, sinks and logging setup.

use std::sync::Arc;
use std::time::Duration;

use core_resources::resource::ResourceId;
use core_resources::telemetry::{
    default_sink, init_logging, record_cache_access, record_pool_status, CollectingSink,
    Component, EventSink, LogConfig, LogError, LogFormat, NoopSink, ResourceEvent, ResourceSpan,
    SharedSink, SpanExt, TracingSink,
};
use core_resources::{Cache, CacheConfig};

// =============================================================================
// Event Tests
// =============================================================================

#[test]
fn event_defaults_to_success() {
    let event = ResourceEvent::new(Component::Pool, "acquire");
    assert!(event.success);
    assert_eq!(event.duration, Duration::ZERO);
    assert!(event.resource_id.is_none());
    assert!(event.context.is_none());
}

#[test]
fn event_serializes_component_snake_case() {
    let event = ResourceEvent::new(Component::Mapping, "open")
        .resource(ResourceId::from_raw(3))
        .context("header=8");
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["component"], "mapping");
    assert_eq!(json["operation"], "open");
    assert_eq!(json["context"], "header=8");
}

#[test]
fn component_names_are_stable() {
    let names: Vec<_> = [
        Component::Registry,
        Component::Pool,
        Component::Cache,
        Component::Shared,
        Component::Mapping,
    ]
    .iter()
    .map(Component::as_str)
    .collect();
    assert_eq!(names, ["registry", "pool", "cache", "shared", "mapping"]);
}

// =============================================================================
// Sink Tests
// =============================================================================

#[test]
fn collecting_sink_filters_by_operation() {
    let sink = CollectingSink::new();
    sink.record(ResourceEvent::new(Component::Cache, "evict"));
    sink.record(ResourceEvent::new(Component::Cache, "clear"));
    sink.record(ResourceEvent::new(Component::Pool, "evict"));

    assert_eq!(sink.len(), 3);
    assert_eq!(sink.matching(Component::Cache, "evict").len(), 1);
    sink.clear();
    assert!(sink.is_empty());
}

#[test]
fn sinks_are_shareable_trait_objects() {
    let noop: SharedSink = Arc::new(NoopSink);
    let traced: SharedSink = Arc::new(TracingSink);
    for sink in [noop, traced, default_sink()] {
        sink.record(ResourceEvent::new(Component::Shared, "config_update").success(false));
    }
}

#[test]
fn cache_reports_clear_through_sink() {
    let sink = CollectingSink::new();
    let cache = Cache::with_sink(CacheConfig::default(), sink.clone()).unwrap();
    cache.insert(1u8, 1u8);
    cache.clear();
    let cleared = sink.matching(Component::Cache, "clear");
    assert_eq!(cleared.len(), 1);
    assert!(cleared[0].success);
}

// =============================================================================
// Metrics and Span Tests
// =============================================================================

#[test]
fn metrics_without_recorder_are_noops() {
    record_cache_access(true);
    record_cache_access(false);
    record_pool_status(1, 2, 3);
}

#[test]
fn span_records_result() {
    let span = ResourceSpan::for_resource("registry", "cleanup", ResourceId::from_raw(1));
    let ok: Result<(), String> = Ok(());
    span.record_result(&ok);
    let err: Result<(), String> = Err("boom".into());
    span.record_result(&err);
}

// =============================================================================
// Logging Tests
// =============================================================================

#[test]
fn log_error_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert_eq!(LogError::AlreadyInitialized.to_string(), "Subscriber already initialized");
}

#[test]
fn log_file_in_missing_directory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        format: LogFormat::Pretty,
        level: "info".into(),
        output_path: Some(dir.path().join("missing").join("core.log")),
    };
    assert!(matches!(init_logging(&config), Err(LogError::FileOpen(_))));
}

#[test]
fn json_logging_to_file_captures_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "core_resources=debug".into(),
        output_path: Some(path.clone()),
    };
    init_logging(&config).unwrap();

    TracingSink.record(
        ResourceEvent::new(Component::Cache, "evict").context("capacity"),
    );

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("resource event"));
    assert!(contents.contains(r#""component":"cache""#));

    // A second subscriber cannot be installed.
    assert!(matches!(init_logging(&config), Err(LogError::AlreadyInitialized)));
}
