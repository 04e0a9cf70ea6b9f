//! The user-facing entry point.
//!
//! One inbound message, one outbound reply: the router loads the session,
//! decides what the message means for any in-flight workflow, and
//! dispatches. Workflow execution always runs off-edge on the engine's
//! tasks; the router's own work is classification and bookkeeping, so the
//! transport gets its answer promptly.

mod classify;

pub use classify::{Classifier, MessageClass};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::llm::{LlmClient, LlmError};
use crate::message::{MessageIn, MessageOut};
use crate::session::{HistoryEntry, HistoryRole, SessionStore};
use crate::state::StateStore;
use crate::telemetry::{hash_user_id, Telemetry};
use crate::workflow::{WorkflowEngine, WorkflowError};

/// Single-turn conversational replies; out of the core's scope beyond this
/// seam.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, history: &[HistoryEntry], text: &str) -> Result<String, LlmError>;
}

/// Default responder: recent history plus the message, one completion.
pub struct LlmResponder {
    llm: Arc<dyn LlmClient>,
}

impl LlmResponder {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Responder for LlmResponder {
    async fn respond(&self, history: &[HistoryEntry], text: &str) -> Result<String, LlmError> {
        let mut prompt = String::from("Reply helpfully and briefly to the user.\n");
        for entry in history {
            let role = match entry.role {
                HistoryRole::User => "user",
                HistoryRole::Assistant => "assistant",
            };
            prompt.push_str(&format!("{role}: {}\n", entry.text));
        }
        prompt.push_str(&format!("user: {text}\nassistant:"));
        Ok(self.llm.complete(&prompt).await?.text)
    }
}

/// Routes each inbound message to conversation, refinement, status, cancel,
/// or a new workflow.
pub struct MessageRouter {
    sessions: Arc<dyn SessionStore>,
    state_store: Arc<dyn StateStore>,
    engine: Arc<WorkflowEngine>,
    classifier: Classifier,
    responder: Arc<dyn Responder>,
    telemetry: Arc<Telemetry>,
}

impl MessageRouter {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        state_store: Arc<dyn StateStore>,
        engine: Arc<WorkflowEngine>,
        classifier: Classifier,
        responder: Arc<dyn Responder>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            sessions,
            state_store,
            engine,
            classifier,
            responder,
            telemetry,
        }
    }

    /// Handles one message end to end and returns the reply for the edge.
    /// Internal failures never surface as errors; the user always gets a
    /// safe reply.
    pub async fn handle_message(&self, msg: &MessageIn) -> MessageOut {
        let span = self.telemetry.span("user_request", None);
        self.telemetry
            .metrics()
            .counter("atelier_messages_total")
            .inc();

        // Sessions are best effort: a broken session store degrades to a
        // historyless conversation, never to a dropped message.
        let history = match self.sessions.get_or_create(&msg.user_id, msg.platform).await {
            Ok(session) => session.history,
            Err(err) => {
                warn!(user = %hash_user_id(&msg.user_id), %err, "session read failed");
                Vec::new()
            }
        };
        if let Err(err) = self
            .sessions
            .append(&msg.user_id, HistoryRole::User, &msg.text)
            .await
        {
            warn!(user = %hash_user_id(&msg.user_id), %err, "session append failed");
        }

        let reply = match self.state_store.load(&msg.user_id).await {
            Ok(Some(state)) if state.is_active => {
                self.handle_in_workflow(msg, &state.original_prompt, state.current_phase)
                    .await
            }
            Ok(_) => self.handle_new(msg, &history, true).await,
            Err(err) => {
                warn!(user = %hash_user_id(&msg.user_id), %err, "state load failed");
                self.handle_new(msg, &history, false).await
            }
        };

        if let Err(err) = self
            .sessions
            .append(&msg.user_id, HistoryRole::Assistant, &reply.text)
            .await
        {
            warn!(user = %hash_user_id(&msg.user_id), %err, "session append failed");
        }
        span.end();
        reply
    }

    async fn handle_in_workflow(
        &self,
        msg: &MessageIn,
        workflow_summary: &str,
        phase: crate::state::Phase,
    ) -> MessageOut {
        let class = self
            .classifier
            .classify_in_workflow(&msg.text, workflow_summary, phase)
            .await;
        match class {
            MessageClass::Refinement => {
                if self.engine.refine(&msg.user_id, &msg.text) {
                    MessageOut::status(
                        &msg.user_id,
                        "Got it, I'm folding that into the current build.",
                    )
                } else {
                    // Active record without a running task: the workflow is
                    // mid-recovery; ask the user to retry rather than lose
                    // the refinement silently.
                    MessageOut::error(
                        &msg.user_id,
                        "I couldn't apply that just now. Please send it again in a moment.",
                    )
                }
            }
            MessageClass::StatusQuery => {
                let text = self
                    .engine
                    .status_text(&msg.user_id)
                    .await
                    .unwrap_or_else(|| "I'm working on your task.".to_string());
                MessageOut::status(&msg.user_id, text)
            }
            MessageClass::Cancellation => {
                self.engine.cancel(&msg.user_id).await;
                MessageOut::status(
                    &msg.user_id,
                    "Okay, cancelling the current task. I'll confirm once it's stopped.",
                )
            }
            MessageClass::NewTask => MessageOut::status(
                &msg.user_id,
                format!(
                    "I'm still working on \"{workflow_summary}\". \
                     Cancel it first if you'd like to start something new."
                ),
            ),
            MessageClass::Conversation => self.single_turn(msg).await,
        }
    }

    async fn handle_new(
        &self,
        msg: &MessageIn,
        history: &[HistoryEntry],
        store_healthy: bool,
    ) -> MessageOut {
        if !self.classifier.webapp_intent(&msg.text).await {
            return self.single_turn_with(history, msg).await;
        }

        // Workflow start fails closed: without a durable state record there
        // is no workflow.
        if !store_healthy {
            return MessageOut::error(
                &msg.user_id,
                "I can't start a new build right now. Please try again later.",
            );
        }
        match self.engine.start(&msg.user_id, msg.platform, &msg.text).await {
            Ok(()) => MessageOut::status(
                &msg.user_id,
                "On it! I'll design, build, review, and deploy your app; \
                 you'll get progress updates here.",
            ),
            Err(WorkflowError::AlreadyActive(_)) => MessageOut::status(
                &msg.user_id,
                "I'm already working on a task for you. Cancel it first to start a new one.",
            ),
            Err(WorkflowError::State(err)) => {
                warn!(user = %hash_user_id(&msg.user_id), %err, "workflow start failed on state store");
                MessageOut::error(
                    &msg.user_id,
                    "I can't start a new build right now. Please try again later.",
                )
            }
            Err(err) => {
                warn!(user = %hash_user_id(&msg.user_id), %err, "workflow start failed");
                MessageOut::error(
                    &msg.user_id,
                    "Something went wrong starting the task. Please try again.",
                )
            }
        }
    }

    async fn single_turn(&self, msg: &MessageIn) -> MessageOut {
        let history = self
            .sessions
            .get_or_create(&msg.user_id, msg.platform)
            .await
            .map(|s| s.history)
            .unwrap_or_default();
        self.single_turn_with(&history, msg).await
    }

    async fn single_turn_with(&self, history: &[HistoryEntry], msg: &MessageIn) -> MessageOut {
        match self.responder.respond(history, &msg.text).await {
            Ok(text) => MessageOut::result(&msg.user_id, text),
            Err(err) => {
                warn!(user = %hash_user_id(&msg.user_id), %err, "single-turn reply failed");
                MessageOut::error(
                    &msg.user_id,
                    "Sorry, I had trouble answering that. Please try again.",
                )
            }
        }
    }

    /// Clears the conversation history; orchestrator state is untouched.
    pub async fn reset_session(&self, user_id: &str) {
        if let Err(err) = self.sessions.clear(user_id).await {
            warn!(user = %hash_user_id(user_id), %err, "session clear failed");
        }
    }

    /// Cancels any active workflow for the user.
    pub async fn cancel_active(&self, user_id: &str) -> bool {
        self.engine.cancel(user_id).await
    }

    /// Startup recovery: resumes interrupted workflows. Returns resumed
    /// user ids.
    pub async fn recover(&self) -> Vec<String> {
        match self.engine.resume_all().await {
            Ok(resumed) => resumed,
            Err(err) => {
                warn!(%err, "startup recovery failed");
                Vec::new()
            }
        }
    }
}
