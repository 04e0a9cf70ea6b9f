//! # Atelier
//!
//! Multi-agent orchestration core for conversational webapp builds. A user
//! message arrives from any transport (chat, VCS comment, direct API); the
//! router classifies it, the workflow engine drives a team of specialized
//! agents through design → implementation ⇌ review → deployment, and
//! progress streams back over the notification channel.
//!
//! ## Design principles
//!
//! - **Durable before observable**: every phase transition checkpoints
//!   orchestrator state before any side effect, and completed steps carry
//!   sequence ids, so a crash resumes instead of repeating.
//! - **Budgeted agents**: each agent instance tracks its context-window
//!   spend; crossing the critical fraction hands the role off to a fresh
//!   instance primed with a structured continuation document.
//! - **Everything external behind a seam**: the LLM ([`LlmClient`]),
//!   transports ([`Transport`]), tools ([`ToolProvider`]), and per-role
//!   agent capabilities ([`AgentFactory`]) are traits; the core composes
//!   them and owns only orchestration.
//! - **No hidden globals**: the composition root builds the services once
//!   and passes them by `Arc`; telemetry context travels explicitly.
//!
//! ## Main modules
//!
//! - [`router`]: [`MessageRouter`], [`Classifier`] — the user-facing edge.
//! - [`workflow`]: [`WorkflowEngine`], [`Planner`] — phase machine, quality
//!   loop, deployment retry, recovery.
//! - [`agent`]: [`AgentRegistry`], [`TokenTracker`] — lifecycle and budget.
//! - [`handoff`]: [`HandoffManager`], [`HandoffDocument`] — continuation
//!   across instances.
//! - [`a2a`]: [`A2aBus`] — typed orchestrator ↔ agent messaging (wire types
//!   in the `a2a-event` crate).
//! - [`session`] / [`state`]: per-user history and durable workflow state,
//!   each with SQLite and in-memory stores.
//! - [`retry`] / [`cache`] / [`notify`] / [`telemetry`] / [`tools`]:
//!   the ambient machinery.

pub mod a2a;
pub mod agent;
pub mod cache;
pub mod config;
pub mod handoff;
pub mod llm;
pub mod message;
pub mod notify;
pub mod retry;
pub mod router;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tools;
pub mod workflow;

pub use a2a::{A2aBus, A2aError, AgentHandler, ORCHESTRATOR_ID};
pub use agent::{
    AgentFactory, AgentInstance, AgentRegistry, AgentRole, AgentState, LifecycleEvent,
    LlmAgent, LlmAgentFactory, TokenSnapshot, TokenTracker, UsageStatus,
};
pub use cache::{Cache, CacheError, LruTtlCache};
pub use config::CoreConfig;
pub use handoff::{
    HandoffDocument, HandoffManager, HandoffPayload, HandoffStore, InMemoryHandoffStore,
    SqliteHandoffStore, TerminationReason,
};
pub use llm::{LlmClient, LlmError, LlmReply, MockLlm, ScriptedLlm};
pub use message::{MessageIn, MessageKind, MessageOut, Platform};
pub use notify::{split_message, Notifier, NotifyError, RecordingTransport, Transport};
pub use retry::{
    retry_with_policy, BreakerError, BreakerState, CircuitBreaker, CircuitBreakerSet, RetryPolicy,
};
pub use router::{Classifier, LlmResponder, MessageClass, MessageRouter, Responder};
pub use session::{
    HistoryEntry, HistoryRole, InMemorySessionStore, Session, SessionStore, SqliteSessionStore,
};
pub use state::{
    AuditEvent, AuditEventType, InMemoryStateStore, OrchestratorState, Phase, SqliteStateStore,
    StateStore, StepRecord, WorkflowType,
};
pub use telemetry::{hash_user_id, MetricsRegistry, Telemetry, TraceContext};
pub use tools::{
    BuildErrorDetail, DatabaseProject, DeployOutcome, MockToolProvider, ScenarioOutcome,
    ToolError, ToolOutcome, ToolProvider,
};
pub use workflow::{Planner, WorkflowEngine, WorkflowError, WorkflowPlan};

/// When running `cargo test -p atelier`, initializes tracing from `RUST_LOG`
/// so unit tests in `src/**` can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
