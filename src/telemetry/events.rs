//! Structured observability events.
//!
//! Components report every registration, cleanup, acquisition and eviction
//! through an [`EventSink`]. Storage and export belong to the embedding
//! application.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::metrics;
use crate::resource::ResourceId;

/// Component that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Registry,
    Pool,
    Cache,
    Shared,
    Mapping,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Pool => "pool",
            Self::Cache => "cache",
            Self::Shared => "shared",
            Self::Mapping => "mapping",
        }
    }
}

/// One structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub component: Component,
    pub operation: String,
    pub duration: Duration,
    pub success: bool,
    pub resource_id: Option<ResourceId>,
    pub context: Option<String>,
}

impl ResourceEvent {
    pub fn new(component: Component, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            duration: Duration::ZERO,
            success: true,
            resource_id: None,
            context: None,
        }
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Receiver of structured events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ResourceEvent);
}

/// Default sink: emits a tracing event and updates the metrics facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ResourceEvent) {
        let duration_ms = event.duration.as_secs_f64() * 1000.0;
        let resource = event.resource_id.map(|id| id.to_string()).unwrap_or_default();
        let context = event.context.as_deref().unwrap_or("");
        if event.success {
            tracing::debug!(
                component = event.component.as_str(),
                operation = %event.operation,
                resource_id = %resource,
                duration_ms,
                context,
                "resource event"
            );
        } else {
            tracing::warn!(
                component = event.component.as_str(),
                operation = %event.operation,
                resource_id = %resource,
                duration_ms,
                context,
                "resource event failed"
            );
        }
        metrics::record_event(event.component.as_str(), &event.operation, event.success, event.duration);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: ResourceEvent) {}
}

/// In-memory sink for tests and embedders that batch their own export.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ResourceEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of every event recorded so far.
    pub fn events(&self) -> Vec<ResourceEvent> {
        self.events.lock().clone()
    }

    /// Events for one component and operation.
    pub fn matching(&self, component: Component, operation: &str) -> Vec<ResourceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.component == component && e.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: ResourceEvent) {
        self.events.lock().push(event);
    }
}

/// Shared sink handle used by every component.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink used when a component is built without one.
pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fields() {
        let id = ResourceId::from_raw(9);
        let event = ResourceEvent::new(Component::Registry, "cleanup")
            .duration(Duration::from_millis(3))
            .success(false)
            .resource(id)
            .context("timeout");
        assert_eq!(event.component, Component::Registry);
        assert_eq!(event.operation, "cleanup");
        assert_eq!(event.duration, Duration::from_millis(3));
        assert!(!event.success);
        assert_eq!(event.resource_id, Some(id));
        assert_eq!(event.context.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_collecting_sink_filters() {
        let sink = CollectingSink::new();
        sink.record(ResourceEvent::new(Component::Cache, "evict"));
        sink.record(ResourceEvent::new(Component::Pool, "acquire"));
        sink.record(ResourceEvent::new(Component::Cache, "evict"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.matching(Component::Cache, "evict").len(), 2);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = ResourceEvent::new(Component::Mapping, "open").resource(ResourceId::from_raw(5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["component"], "mapping");
        assert_eq!(json["operation"], "open");
        assert_eq!(json["resource_id"], 5);
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.record(ResourceEvent::new(Component::Shared, "update").success(false));
    }
}
