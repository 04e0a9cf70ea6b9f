//! Causal spans and process metrics.
//!
//! The contract is an explicit [`TraceContext`] threaded through workflow
//! calls: every child span carries its parent's ids, so the hierarchy
//! (`user_request → workflow → agent_task → llm_call ...`) survives executor
//! hops without thread-local state. Emission goes through
//! `tracing`; counters and gauges are exportable as Prometheus text.

mod metrics;

pub use metrics::MetricsRegistry;

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, error};

/// Identity of one span: the trace it belongs to plus its own id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Starts a fresh trace (one per inbound user request).
    pub fn root() -> Self {
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        let span_id = short_id();
        Self { trace_id, span_id }
    }

    /// A child context within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: short_id(),
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Hashes a user-identifying value for attribute use. Stable across the
/// process; never reversible from logs.
pub fn hash_user_id(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    hex::encode(&digest[..8])
}

/// Truncates an attribute value to the 1 KiB contract.
fn clip(value: &str) -> &str {
    let mut end = value.len().min(1024);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Telemetry service: span construction plus the metrics registry.
///
/// **Interaction**: owned by the composition root; the router, workflow
/// engine, A2A bus, and handoff manager hold an `Arc` and open spans with
/// explicit parent contexts.
pub struct Telemetry {
    metrics: MetricsRegistry,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Opens a span. With no parent a new trace starts; otherwise the child
    /// joins the parent's trace and records its span id.
    pub fn span(self: &Arc<Self>, name: &str, parent: Option<&TraceContext>) -> Span {
        let ctx = match parent {
            Some(p) => p.child(),
            None => TraceContext::root(),
        };
        debug!(
            span = name,
            trace_id = %ctx.trace_id,
            span_id = %ctx.span_id,
            parent_span_id = parent.map(|p| p.span_id.as_str()).unwrap_or("-"),
            "span start"
        );
        self.metrics.counter("atelier_spans_total").inc();
        Span {
            name: name.to_string(),
            ctx,
            start: Instant::now(),
            failed: false,
        }
    }

    /// Emits a point-in-time event under `ctx` with small attributes.
    pub fn event(&self, ctx: &TraceContext, name: &str, attributes: &[(&str, &str)]) {
        let attrs: Vec<String> = attributes
            .iter()
            .map(|(k, v)| format!("{k}={}", clip(v)))
            .collect();
        debug!(
            event = name,
            trace_id = %ctx.trace_id,
            span_id = %ctx.span_id,
            attributes = %attrs.join(" "),
            "span event"
        );
        self.metrics
            .counter(&format!("atelier_events_{name}_total"))
            .inc();
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// An open span; logs duration on close (or drop) and carries the context
/// handed to children.
pub struct Span {
    name: String,
    ctx: TraceContext,
    start: Instant,
    failed: bool,
}

impl Span {
    pub fn context(&self) -> &TraceContext {
        &self.ctx
    }

    /// Attaches an error to this span.
    pub fn record_error(&mut self, err: &dyn std::fmt::Display) {
        self.failed = true;
        error!(
            span = %self.name,
            trace_id = %self.ctx.trace_id,
            span_id = %self.ctx.span_id,
            error = %clip(&err.to_string()),
            "span error"
        );
    }

    /// Explicit close; equivalent to dropping, kept for readability at call
    /// sites that care about where the span ends.
    pub fn end(self) {}
}

impl Drop for Span {
    fn drop(&mut self) {
        debug!(
            span = %self.name,
            trace_id = %self.ctx.trace_id,
            span_id = %self.ctx.span_id,
            duration_ms = self.start.elapsed().as_millis() as u64,
            failed = self.failed,
            "span end"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keeps_trace_id_and_changes_span_id() {
        let root = TraceContext::root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn hash_user_id_is_stable_and_not_identity() {
        let a = hash_user_id("U12345");
        let b = hash_user_id("U12345");
        assert_eq!(a, b);
        assert_ne!(a, "U12345");
        assert_eq!(a.len(), 16);
        assert_ne!(hash_user_id("U12346"), a);
    }

    #[test]
    fn clip_bounds_attribute_size() {
        let long = "x".repeat(5000);
        assert_eq!(clip(&long).len(), 1024);
        assert_eq!(clip("short"), "short");
    }

    #[test]
    fn span_hierarchy_shares_trace() {
        let telemetry = Arc::new(Telemetry::new());
        let parent = telemetry.span("user_request", None);
        let child = telemetry.span("workflow:full_build", Some(parent.context()));
        assert_eq!(
            child.context().trace_id,
            parent.context().trace_id
        );
        child.end();
        parent.end();
        assert!(telemetry.metrics().render().contains("atelier_spans_total 2"));
    }
}
