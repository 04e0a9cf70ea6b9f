//! In-process A2A bus: typed request/response between orchestrator and agents.
//!
//! Delivery is at-most-once within the process; retries belong to callers.
//! Task round-trips are bounded by the configured timeout and surface expiry
//! as a `failed` response with error `"timeout"`, so the workflow engine
//! sees one uniform response shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use a2a_event::{Envelope, Review, Task, TaskResponse};

use crate::telemetry::{Telemetry, TraceContext};

/// Sender id used by the orchestrator on the bus.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

#[derive(Debug, Error)]
pub enum A2aError {
    #[error("agent not registered: {0}")]
    NotRegistered(String),
    #[error("agent handler failed: {0}")]
    Handler(String),
    /// The reply envelope did not carry the expected payload type.
    #[error("malformed agent reply: {0}")]
    MalformedReply(String),
}

/// An agent's message handler. One registration per live agent instance.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, A2aError>;
}

/// The bus. Shared by the workflow engine, agent registry, and handoff
/// manager; handlers are looked up by agent id in O(1).
pub struct A2aBus {
    handlers: DashMap<String, Arc<dyn AgentHandler>>,
    task_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl A2aBus {
    pub fn new(task_timeout: Duration, telemetry: Arc<Telemetry>) -> Self {
        Self {
            handlers: DashMap::new(),
            task_timeout,
            telemetry,
        }
    }

    pub fn register(&self, agent_id: &str, handler: Arc<dyn AgentHandler>) {
        debug!(agent_id, "a2a register");
        self.handlers.insert(agent_id.to_string(), handler);
    }

    pub fn unregister(&self, agent_id: &str) {
        debug!(agent_id, "a2a unregister");
        self.handlers.remove(agent_id);
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.handlers.contains_key(agent_id)
    }

    /// Agent ids whose role prefix matches (ids are `{role}_v{n}_{suffix}`).
    pub fn lookup_by_role(&self, role: &str) -> Vec<String> {
        let prefix = format!("{role}_v");
        self.handlers
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect()
    }

    fn handler(&self, agent_id: &str) -> Result<Arc<dyn AgentHandler>, A2aError> {
        self.handlers
            .get(agent_id)
            .map(|h| h.clone())
            .ok_or_else(|| A2aError::NotRegistered(agent_id.to_string()))
    }

    /// One bounded round-trip; the recipient's execution runs under a child
    /// span of this send.
    async fn round_trip(
        &self,
        envelope: Envelope,
        ctx: &TraceContext,
        span_name: &str,
    ) -> Result<Envelope, A2aError> {
        let handler = self.handler(&envelope.to_agent)?;
        let span = self.telemetry.span(span_name, Some(ctx));
        let reply = tokio::time::timeout(self.task_timeout, handler.handle(envelope)).await;
        match reply {
            Ok(result) => {
                span.end();
                result
            }
            Err(_) => {
                span.end();
                Err(A2aError::Handler("timeout".into()))
            }
        }
    }

    /// Sends a task and awaits the bounded response. Timeout yields a
    /// `failed` response with error `"timeout"` rather than an `Err`, so the
    /// caller's retry policy decides what happens next.
    pub async fn send_task(
        &self,
        task: &Task,
        ctx: &TraceContext,
    ) -> Result<TaskResponse, A2aError> {
        let envelope = Envelope::task_request(task);
        match self.round_trip(envelope, ctx, "a2a_task").await {
            Ok(reply) => reply
                .as_task_response()
                .ok_or_else(|| A2aError::MalformedReply("expected task_response".into())),
            Err(A2aError::Handler(msg)) if msg == "timeout" => {
                self.telemetry
                    .metrics()
                    .counter("atelier_a2a_timeouts_total")
                    .inc();
                Ok(TaskResponse::failed(&task.id, "timeout"))
            }
            Err(other) => Err(other),
        }
    }

    /// Sends an artifact for review and parses the typed review reply.
    pub async fn request_review(
        &self,
        from: &str,
        to: &str,
        artifact: serde_json::Value,
        ctx: &TraceContext,
    ) -> Result<Review, A2aError> {
        let envelope = Envelope::review_request(from, to, artifact);
        let reply = self.round_trip(envelope, ctx, "a2a_review").await?;
        reply
            .as_review()
            .ok_or_else(|| A2aError::MalformedReply("expected review_response".into()))
    }

    /// Asks a free-form question (handoff interrogation) and returns the raw
    /// answer envelope.
    pub async fn ask(
        &self,
        from: &str,
        to: &str,
        content: serde_json::Value,
        ctx: &TraceContext,
    ) -> Result<Envelope, A2aError> {
        let envelope = Envelope::question(from, to, content);
        self.round_trip(envelope, ctx, "a2a_question").await
    }

    /// Generic send with no reply expected; the ack is the `Ok`.
    pub async fn send(&self, envelope: Envelope, ctx: &TraceContext) -> Result<(), A2aError> {
        let _ = self.round_trip(envelope, ctx, "a2a_send").await?;
        Ok(())
    }
}
