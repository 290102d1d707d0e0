//! Telemetry for the resource core.
//!
//! Structured events, tracing spans, logging setup and metrics. Nothing here
//! stores or exports data; that is left to the embedding application.

mod events;
mod logging;
mod metrics;
mod spans;

pub use events::{
    default_sink, CollectingSink, Component, EventSink, NoopSink, ResourceEvent, SharedSink,
    TracingSink,
};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_cache_access, record_cache_eviction, record_cleanup, record_event,
    record_pool_acquire, record_pool_status, record_registry_depth,
};
pub use spans::{ResourceSpan, SpanExt};
