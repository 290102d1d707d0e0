//! Span utilities for resource operations.

use tracing::{info_span, Span};

use crate::resource::ResourceId;

/// Records how a registry or pool operation ended on its `resource_op` span.
pub trait SpanExt {
    /// Fill `outcome` with `ok` or `error`; failures also fill `error` with
    /// the error's display text.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        if let Err(err) = result {
            self.record("outcome", "error");
            self.record("error", tracing::field::display(err));
        } else {
            self.record("outcome", "ok");
        }
    }
}

/// Factory for standardized operation spans.
pub struct ResourceSpan;

impl ResourceSpan {
    /// Span for a component operation.
    ///
    /// `outcome` and `error` are filled in by [`SpanExt::record_result`].
    pub fn new(component: &'static str, operation: &'static str) -> Span {
        info_span!(
            "resource_op",
            component,
            operation,
            resource_id = tracing::field::Empty,
            outcome = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    /// Span bound to a single resource.
    pub fn for_resource(component: &'static str, operation: &'static str, id: ResourceId) -> Span {
        let span = Self::new(component, operation);
        span.record("resource_id", id.as_u64());
        span
    }
}
