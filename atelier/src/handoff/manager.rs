//! The handoff protocol: interrogate, persist, respawn, terminate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::a2a::{A2aBus, ORCHESTRATOR_ID};
use crate::agent::{AgentFactory, AgentInstance, AgentState};
use crate::config::CoreConfig;
use crate::handoff::store::{HandoffStore, HandoffStoreError};
use crate::handoff::{
    HandoffDocument, HandoffPayload, SourceAgent, TargetAgent, TaskProgress, TerminationReason,
};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::telemetry::{Telemetry, TraceContext};

#[derive(Debug, Error)]
pub enum HandoffError {
    /// Persisting the document failed after retries; the predecessor is
    /// still live and the caller may retry the whole handoff.
    #[error("handoff persist failed: {0}")]
    Store(#[from] HandoffStoreError),
}

/// Workflow context the registry passes along so the document can explain
/// itself to the successor.
#[derive(Clone, Debug)]
pub struct HandoffContext {
    pub user_id: String,
    pub project_id: Option<String>,
    pub original_request: String,
    pub task_description: String,
    pub reason: TerminationReason,
}

/// Builds, persists, and applies handoff documents.
///
/// **Interaction**: invoked synchronously by the agent registry when a
/// tracker reports CRITICAL; returns the successor instance the registry
/// swaps into its role slot.
pub struct HandoffManager {
    config: Arc<CoreConfig>,
    store: Arc<dyn HandoffStore>,
    bus: Arc<A2aBus>,
    telemetry: Arc<Telemetry>,
}

impl HandoffManager {
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<dyn HandoffStore>,
        bus: Arc<A2aBus>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            telemetry,
        }
    }

    /// Asks the source instance for its handoff content. Malformed or
    /// failing output degrades to the minimal skeleton; the handoff never
    /// aborts because an exhausted agent answered poorly.
    async fn interrogate(&self, source: &AgentInstance, ctx: &TraceContext) -> HandoffPayload {
        let question = serde_json::json!({
            "produce": "handoff_content",
            "fields": [
                "task_progress", "decisions_made", "rejected_alternatives",
                "work_completed", "current_wip", "todo_list", "tool_state",
                "assumptions", "dependencies"
            ],
        });
        match self
            .bus
            .ask(ORCHESTRATOR_ID, &source.agent_id, question, ctx)
            .await
        {
            Ok(answer) => HandoffPayload::from_value(&answer.content).unwrap_or_else(|| {
                warn!(agent_id = %source.agent_id, "malformed handoff content; using skeleton");
                HandoffDocument::skeleton_payload()
            }),
            Err(err) => {
                warn!(agent_id = %source.agent_id, %err, "handoff interrogation failed; using skeleton");
                HandoffDocument::skeleton_payload()
            }
        }
    }

    /// Runs the full protocol for `source`, returning the successor.
    ///
    /// Atomicity: if the document cannot be persisted, the source instance is
    /// restored to its previous state, nothing is terminated, and the error
    /// surfaces for the caller to retry.
    pub async fn execute(
        &self,
        context: &HandoffContext,
        source: &mut AgentInstance,
        factory: &dyn AgentFactory,
        parent: &TraceContext,
    ) -> Result<(AgentInstance, String), HandoffError> {
        let span = self.telemetry.span("agent_handoff", Some(parent));
        let ctx = span.context().clone();
        let previous_state = source.state;
        source.state = AgentState::HandoffPending;

        let payload = self.interrogate(source, &ctx).await;

        let previous = self
            .store
            .latest_active(&context.user_id, source.role)
            .await
            .unwrap_or_default();
        let trace_id = previous
            .as_ref()
            .map(|d| d.trace_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let doc = HandoffDocument {
            handoff_id: uuid::Uuid::new_v4().to_string(),
            trace_id,
            predecessor_handoff_id: previous.map(|d| d.handoff_id),
            user_id: context.user_id.clone(),
            project_id: context.project_id.clone(),
            source_agent: SourceAgent {
                id: source.agent_id.clone(),
                role: source.role,
                version: source.version,
                termination_reason: context.reason,
            },
            target_agent: TargetAgent {
                role: source.role,
                expected_version: source.version + 1,
            },
            token_usage_snapshot: source.tracker.snapshot(),
            task_progress: payload.task_progress.unwrap_or_else(|| TaskProgress {
                completion_percent: 0,
                phase: "unknown".into(),
                status: "handoff".into(),
            }),
            original_request: context.original_request.clone(),
            task_description: context.task_description.clone(),
            decisions_made: payload.decisions_made,
            rejected_alternatives: payload.rejected_alternatives,
            work_completed: payload.work_completed,
            current_wip: payload.current_wip,
            todo_list: payload.todo_list,
            tool_state: payload.tool_state,
            assumptions: payload.assumptions,
            dependencies: payload.dependencies,
            created_at: chrono::Utc::now(),
            is_active: true,
        };

        let persist = retry_with_policy(
            &RetryPolicy::fixed(3, Duration::from_millis(50)),
            |_: &HandoffStoreError| true,
            || self.store.save_active(&doc),
        )
        .await;
        if let Err(err) = persist {
            source.state = previous_state;
            return Err(HandoffError::Store(err));
        }
        self.telemetry.event(
            &ctx,
            "handoff_document_created",
            &[("handoff_id", &doc.handoff_id), ("trace_id", &doc.trace_id)],
        );

        // Spawn the successor with the continuation prepended to its system
        // context, then retire the predecessor.
        let mut successor = AgentInstance::new(
            source.role,
            source.version + 1,
            self.config.context_limit,
            self.config.warn_fraction,
            self.config.crit_fraction,
        );
        successor.predecessor_handoff_id = Some(doc.handoff_id.clone());
        successor.state = AgentState::Active;
        let handler = factory.spawn_handler(source.role, Some(&doc.continuation_prompt()));
        self.bus.register(&successor.agent_id, handler);

        self.bus.unregister(&source.agent_id);
        source.state = AgentState::Terminated;

        self.telemetry
            .metrics()
            .counter("atelier_handoffs_total")
            .inc();
        info!(
            role = %source.role,
            from = %source.agent_id,
            to = %successor.agent_id,
            handoff_id = %doc.handoff_id,
            "agent handoff complete"
        );
        span.end();
        Ok((successor, doc.handoff_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use a2a_event::{Envelope, MessageType};

    use crate::a2a::{A2aError, AgentHandler};
    use crate::agent::AgentRole;
    use crate::handoff::InMemoryHandoffStore;

    struct ReportingAgent {
        content: serde_json::Value,
    }

    #[async_trait]
    impl AgentHandler for ReportingAgent {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope, A2aError> {
            assert_eq!(envelope.message_type, MessageType::Question);
            Ok(Envelope::new(
                &envelope.to_agent,
                &envelope.from_agent,
                MessageType::Answer,
                self.content.clone(),
            ))
        }
    }

    struct NullFactory;

    impl AgentFactory for NullFactory {
        fn spawn_handler(
            &self,
            _role: AgentRole,
            _system_preamble: Option<&str>,
        ) -> Arc<dyn AgentHandler> {
            Arc::new(ReportingAgent {
                content: serde_json::json!({}),
            })
        }
    }

    fn setup() -> (
        Arc<HandoffManager>,
        Arc<A2aBus>,
        Arc<InMemoryHandoffStore>,
        HandoffContext,
    ) {
        let config = Arc::new(CoreConfig::default());
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(A2aBus::new(Duration::from_secs(1), telemetry.clone()));
        let store = Arc::new(InMemoryHandoffStore::new());
        let manager = Arc::new(HandoffManager::new(
            config,
            store.clone(),
            bus.clone(),
            telemetry,
        ));
        let context = HandoffContext {
            user_id: "U1".into(),
            project_id: None,
            original_request: "Build a todo app".into(),
            task_description: "implementation task".into(),
            reason: TerminationReason::ContextExhausted,
        };
        (manager, bus, store, context)
    }

    fn instance(bus: &A2aBus, content: serde_json::Value) -> AgentInstance {
        let mut instance = AgentInstance::new(AgentRole::Frontend, 1, 1000, 0.75, 0.9);
        instance.state = AgentState::Critical;
        bus.register(&instance.agent_id, Arc::new(ReportingAgent { content }));
        instance
    }

    #[tokio::test]
    async fn handoff_spawns_successor_and_terminates_source() {
        let (manager, bus, store, context) = setup();
        let mut source = instance(
            &bus,
            serde_json::json!({"current_wip": "styling", "work_completed": {"summary": "scaffold"}}),
        );
        let source_id = source.agent_id.clone();

        let (successor, handoff_id) = manager
            .execute(&context, &mut source, &NullFactory, &TraceContext::root())
            .await
            .unwrap();

        assert_eq!(successor.version, 2);
        assert_eq!(successor.state, AgentState::Active);
        assert_eq!(
            successor.predecessor_handoff_id.as_deref(),
            Some(handoff_id.as_str())
        );
        assert_eq!(source.state, AgentState::Terminated);
        assert!(!bus.is_registered(&source_id));
        assert!(bus.is_registered(&successor.agent_id));

        let doc = store.load(&handoff_id).await.unwrap().unwrap();
        assert!(doc.is_active);
        assert_eq!(doc.current_wip, "styling");
        assert_eq!(doc.work_completed.summary, "scaffold");
        assert_eq!(doc.target_agent.expected_version, 2);
    }

    #[tokio::test]
    async fn malformed_report_uses_skeleton() {
        let (manager, bus, store, context) = setup();
        let mut source = instance(&bus, serde_json::json!("I am very tired"));

        let (_, handoff_id) = manager
            .execute(&context, &mut source, &NullFactory, &TraceContext::root())
            .await
            .unwrap();
        let doc = store.load(&handoff_id).await.unwrap().unwrap();
        assert_eq!(doc.current_wip, "unreported");
        assert_eq!(doc.original_request, "Build a todo app");
    }

    #[tokio::test]
    async fn second_handoff_extends_the_chain() {
        let (manager, bus, store, context) = setup();
        let mut first = instance(&bus, serde_json::json!({}));
        let (mut second, first_id) = manager
            .execute(&context, &mut first, &NullFactory, &TraceContext::root())
            .await
            .unwrap();

        // Drive the successor critical and hand off again.
        second.state = AgentState::Critical;
        let (third, second_id) = manager
            .execute(&context, &mut second, &NullFactory, &TraceContext::root())
            .await
            .unwrap();
        assert_eq!(third.version, 3);

        let first_doc = store.load(&first_id).await.unwrap().unwrap();
        let second_doc = store.load(&second_id).await.unwrap().unwrap();
        assert_eq!(first_doc.trace_id, second_doc.trace_id);
        assert_eq!(
            second_doc.predecessor_handoff_id.as_deref(),
            Some(first_id.as_str())
        );
        assert!(!first_doc.is_active);
        assert!(second_doc.is_active);

        let chain = store.chain(&first_doc.trace_id).await.unwrap();
        assert_eq!(chain.len(), 2);
    }

    struct FailingStore;

    #[async_trait]
    impl HandoffStore for FailingStore {
        async fn save_active(&self, _doc: &HandoffDocument) -> Result<(), HandoffStoreError> {
            Err(HandoffStoreError::Storage("disk full".into()))
        }

        async fn load(
            &self,
            _handoff_id: &str,
        ) -> Result<Option<HandoffDocument>, HandoffStoreError> {
            Ok(None)
        }

        async fn latest_active(
            &self,
            _user_id: &str,
            _role: AgentRole,
        ) -> Result<Option<HandoffDocument>, HandoffStoreError> {
            Ok(None)
        }

        async fn chain(&self, _trace_id: &str) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
            Ok(vec![])
        }

        async fn list_for_project(
            &self,
            _project_id: &str,
        ) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn persist_failure_keeps_predecessor_alive() {
        let config = Arc::new(CoreConfig::default());
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(A2aBus::new(Duration::from_secs(1), telemetry.clone()));
        let manager = HandoffManager::new(config, Arc::new(FailingStore), bus.clone(), telemetry);

        let mut source = instance(&bus, serde_json::json!({}));
        let source_id = source.agent_id.clone();
        let context = HandoffContext {
            user_id: "U1".into(),
            project_id: None,
            original_request: "r".into(),
            task_description: "t".into(),
            reason: TerminationReason::ContextExhausted,
        };

        let result = manager
            .execute(&context, &mut source, &NullFactory, &TraceContext::root())
            .await;
        assert!(matches!(result, Err(HandoffError::Store(_))));
        assert_eq!(source.state, AgentState::Critical);
        assert!(bus.is_registered(&source_id));
    }
}
