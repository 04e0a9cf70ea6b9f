//! Ownership of live agent instances for one user's workflow.
//!
//! Role slots are mutated only by the owning workflow task (or the handoff
//! manager acting on its behalf), so a single async mutex over the slot map
//! is all the coordination the registry needs. Creation is lazy: no agents
//! exist until a phase first asks for one.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use a2a_event::TokenUsage;

use crate::a2a::A2aBus;
use crate::agent::{
    AgentFactory, AgentInstance, AgentRole, AgentState, TokenSnapshot, UsageStatus,
};
use crate::config::CoreConfig;
use crate::handoff::{HandoffContext, HandoffError, HandoffManager, TerminationReason};
use crate::telemetry::{Telemetry, TraceContext};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no active instance for role {0}")]
    NoActiveInstance(AgentRole),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Lifecycle notifications; hooks are fire-and-forget.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    Warning {
        agent_id: String,
        usage_fraction: f64,
    },
    Critical {
        agent_id: String,
        usage_fraction: f64,
    },
    Handoff {
        predecessor_id: String,
        successor_id: String,
        handoff_id: String,
    },
    Terminated {
        agent_id: String,
    },
}

pub type LifecycleHook = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct WorkContext {
    original_request: String,
    project_id: Option<String>,
    current_task: String,
}

/// Live agent set for one `user_id`.
pub struct AgentRegistry {
    user_id: String,
    config: Arc<CoreConfig>,
    factory: Arc<dyn AgentFactory>,
    bus: Arc<A2aBus>,
    handoff: Arc<HandoffManager>,
    telemetry: Arc<Telemetry>,
    active: Mutex<HashMap<AgentRole, AgentInstance>>,
    cached: Mutex<HashMap<AgentRole, AgentInstance>>,
    hook: std::sync::Mutex<Option<LifecycleHook>>,
    work: Mutex<WorkContext>,
}

impl AgentRegistry {
    pub fn new(
        user_id: impl Into<String>,
        config: Arc<CoreConfig>,
        factory: Arc<dyn AgentFactory>,
        bus: Arc<A2aBus>,
        handoff: Arc<HandoffManager>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            config,
            factory,
            bus,
            handoff,
            telemetry,
            active: Mutex::new(HashMap::new()),
            cached: Mutex::new(HashMap::new()),
            hook: std::sync::Mutex::new(None),
            work: Mutex::new(WorkContext {
                original_request: String::new(),
                project_id: None,
                current_task: String::new(),
            }),
        }
    }

    pub fn register_callbacks(&self, hook: LifecycleHook) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn fire(&self, event: LifecycleEvent) {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(&event);
        }
    }

    /// Updates the workflow context baked into handoff documents.
    pub async fn set_work_context(
        &self,
        original_request: &str,
        project_id: Option<&str>,
        current_task: &str,
    ) {
        let mut work = self.work.lock().await;
        work.original_request = original_request.to_string();
        work.project_id = project_id.map(str::to_string);
        work.current_task = current_task.to_string();
    }

    pub async fn note_task(&self, description: &str) {
        self.work.lock().await.current_task = description.to_string();
    }

    /// Returns the active instance's id for `role`, spawning lazily.
    ///
    /// With caching on, a released instance is reused only while its budget
    /// sits below the warning fraction; otherwise it is terminated and a
    /// fresh instance spawned.
    pub async fn acquire(&self, role: AgentRole) -> String {
        let mut active = self.active.lock().await;
        if let Some(instance) = active.get(&role) {
            if instance.is_live() {
                return instance.agent_id.clone();
            }
        }

        if self.config.agent_caching {
            if let Some(cached) = self.cached.lock().await.remove(&role) {
                if cached.usage_fraction() < self.config.warn_fraction {
                    debug!(role = %role, agent_id = %cached.agent_id, "reusing cached agent");
                    let id = cached.agent_id.clone();
                    active.insert(role, cached);
                    return id;
                }
                // Cached past the budget bound: terminate and respawn.
                self.bus.unregister(&cached.agent_id);
                self.fire(LifecycleEvent::Terminated {
                    agent_id: cached.agent_id.clone(),
                });
            }
        }

        let mut instance = AgentInstance::new(
            role,
            1,
            self.config.context_limit,
            self.config.warn_fraction,
            self.config.crit_fraction,
        );
        instance.state = AgentState::Active;
        let handler = self.factory.spawn_handler(role, None);
        self.bus.register(&instance.agent_id, handler);
        self.telemetry
            .metrics()
            .counter("atelier_agent_spawns_total")
            .inc();
        info!(role = %role, agent_id = %instance.agent_id, "agent spawned");
        let id = instance.agent_id.clone();
        active.insert(role, instance);
        id
    }

    pub async fn current_id(&self, role: AgentRole) -> Option<String> {
        self.active
            .lock()
            .await
            .get(&role)
            .filter(|i| i.is_live())
            .map(|i| i.agent_id.clone())
    }

    pub async fn usage_snapshot(&self, role: AgentRole) -> Option<TokenSnapshot> {
        self.active
            .lock()
            .await
            .get(&role)
            .map(|i| i.tracker.snapshot())
    }

    /// Records one operation's usage against the role's active instance.
    ///
    /// WARNING fires its callback and keeps the instance in service.
    /// CRITICAL initiates handoff synchronously before returning: on return
    /// the role slot already holds the successor, and the caller must send
    /// the next (or re-issued) task to it.
    pub async fn record_usage(
        &self,
        role: AgentRole,
        op_name: &str,
        usage: &TokenUsage,
        ctx: &TraceContext,
    ) -> Result<UsageStatus, RegistryError> {
        let mut active = self.active.lock().await;
        let instance = active
            .get_mut(&role)
            .filter(|i| i.is_live())
            .ok_or(RegistryError::NoActiveInstance(role))?;

        let status = instance.tracker.record(op_name, usage);
        let fraction = instance.tracker.usage_fraction();
        self.telemetry.event(
            ctx,
            "token_usage_recorded",
            &[
                ("agent_id", instance.agent_id.as_str()),
                ("op", op_name),
                ("fraction", &format!("{fraction:.3}")),
            ],
        );

        match status {
            UsageStatus::Ok => {}
            UsageStatus::Warning => {
                instance.state = AgentState::Warning;
                self.fire(LifecycleEvent::Warning {
                    agent_id: instance.agent_id.clone(),
                    usage_fraction: fraction,
                });
            }
            UsageStatus::Critical => {
                instance.state = AgentState::Critical;
                self.fire(LifecycleEvent::Critical {
                    agent_id: instance.agent_id.clone(),
                    usage_fraction: fraction,
                });
                let work = self.work.lock().await;
                let context = HandoffContext {
                    user_id: self.user_id.clone(),
                    project_id: work.project_id.clone(),
                    original_request: work.original_request.clone(),
                    task_description: if work.current_task.is_empty() {
                        op_name.to_string()
                    } else {
                        work.current_task.clone()
                    },
                    reason: TerminationReason::ContextExhausted,
                };
                drop(work);

                let predecessor_id = instance.agent_id.clone();
                let (successor, handoff_id) = self
                    .handoff
                    .execute(&context, instance, self.factory.as_ref(), ctx)
                    .await?;
                self.fire(LifecycleEvent::Handoff {
                    predecessor_id,
                    successor_id: successor.agent_id.clone(),
                    handoff_id,
                });
                active.insert(role, successor);
            }
        }
        Ok(status)
    }

    /// Releases a role slot. With caching off the instance is terminated;
    /// with caching on it is parked for reuse (budget re-checked on
    /// reacquire).
    pub async fn release(&self, role: AgentRole) {
        let Some(instance) = self.active.lock().await.remove(&role) else {
            return;
        };
        if self.config.agent_caching && instance.is_live() {
            debug!(role = %role, agent_id = %instance.agent_id, "caching released agent");
            self.cached.lock().await.insert(role, instance);
            return;
        }
        self.bus.unregister(&instance.agent_id);
        self.fire(LifecycleEvent::Terminated {
            agent_id: instance.agent_id,
        });
    }

    /// Terminates every active and cached instance.
    pub async fn release_all(&self) {
        let drained: Vec<AgentInstance> = {
            let mut active = self.active.lock().await;
            let mut cached = self.cached.lock().await;
            active.drain().map(|(_, i)| i).chain(cached.drain().map(|(_, i)| i)).collect()
        };
        for instance in drained {
            self.bus.unregister(&instance.agent_id);
            self.fire(LifecycleEvent::Terminated {
                agent_id: instance.agent_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use a2a_event::{Envelope, MessageType};

    use crate::a2a::{A2aError, AgentHandler};
    use crate::handoff::InMemoryHandoffStore;

    struct QuietAgent;

    #[async_trait]
    impl AgentHandler for QuietAgent {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope, A2aError> {
            Ok(Envelope::new(
                &envelope.to_agent,
                &envelope.from_agent,
                MessageType::Answer,
                serde_json::json!({}),
            ))
        }
    }

    struct QuietFactory;

    impl AgentFactory for QuietFactory {
        fn spawn_handler(
            &self,
            _role: AgentRole,
            _system_preamble: Option<&str>,
        ) -> Arc<dyn AgentHandler> {
            Arc::new(QuietAgent)
        }
    }

    fn registry(config: CoreConfig) -> (Arc<AgentRegistry>, Arc<A2aBus>) {
        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(A2aBus::new(Duration::from_secs(1), telemetry.clone()));
        let handoff = Arc::new(HandoffManager::new(
            config.clone(),
            Arc::new(InMemoryHandoffStore::new()),
            bus.clone(),
            telemetry.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(
            "U1",
            config,
            Arc::new(QuietFactory),
            bus.clone(),
            handoff,
            telemetry,
        ));
        (registry, bus)
    }

    fn small_budget() -> CoreConfig {
        CoreConfig {
            context_limit: 1000,
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn acquire_is_lazy_and_idempotent() {
        let (registry, bus) = registry(small_budget());
        assert!(registry.current_id(AgentRole::Designer).await.is_none());

        let first = registry.acquire(AgentRole::Designer).await;
        let second = registry.acquire(AgentRole::Designer).await;
        assert_eq!(first, second);
        assert!(bus.is_registered(&first));
        assert!(first.starts_with("designer_v1_"));
    }

    #[tokio::test]
    async fn warning_fires_once_and_keeps_instance() {
        let (registry, _) = registry(small_budget());
        let id = registry.acquire(AgentRole::Frontend).await;

        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        registry.register_callbacks(Arc::new(move |event| {
            if let LifecycleEvent::Warning { agent_id, .. } = event {
                sink.lock().unwrap().push(agent_id.clone());
            }
        }));

        let ctx = TraceContext::root();
        let status = registry
            .record_usage(AgentRole::Frontend, "t1", &TokenUsage::new(760, 0), &ctx)
            .await
            .unwrap();
        assert_eq!(status, UsageStatus::Warning);
        let status = registry
            .record_usage(AgentRole::Frontend, "t2", &TokenUsage::new(10, 0), &ctx)
            .await
            .unwrap();
        assert_eq!(status, UsageStatus::Ok);

        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(registry.current_id(AgentRole::Frontend).await, Some(id));
    }

    #[tokio::test]
    async fn critical_swaps_in_successor_synchronously() {
        let (registry, bus) = registry(small_budget());
        let predecessor = registry.acquire(AgentRole::Frontend).await;
        registry
            .set_work_context("Build a todo app", None, "implement UI")
            .await;

        let ctx = TraceContext::root();
        let status = registry
            .record_usage(AgentRole::Frontend, "big", &TokenUsage::new(930, 0), &ctx)
            .await
            .unwrap();
        assert_eq!(status, UsageStatus::Critical);

        let successor = registry.current_id(AgentRole::Frontend).await.unwrap();
        assert_ne!(successor, predecessor);
        assert!(successor.starts_with("frontend_v2_"));
        assert!(!bus.is_registered(&predecessor));
        assert!(bus.is_registered(&successor));
        // Successor starts with a fresh budget.
        let snap = registry.usage_snapshot(AgentRole::Frontend).await.unwrap();
        assert_eq!(snap.total, 0);
    }

    #[tokio::test]
    async fn release_without_caching_terminates() {
        let (registry, bus) = registry(small_budget());
        let id = registry.acquire(AgentRole::Qa).await;
        registry.release(AgentRole::Qa).await;
        assert!(!bus.is_registered(&id));
        assert!(registry.current_id(AgentRole::Qa).await.is_none());
    }

    #[tokio::test]
    async fn caching_reuses_fresh_instance() {
        let config = CoreConfig {
            agent_caching: true,
            ..small_budget()
        };
        let (registry, bus) = registry(config);
        let id = registry.acquire(AgentRole::Backend).await;
        registry.release(AgentRole::Backend).await;
        assert!(bus.is_registered(&id));

        let again = registry.acquire(AgentRole::Backend).await;
        assert_eq!(id, again);
    }

    #[tokio::test]
    async fn cached_instance_past_warn_budget_is_respawned() {
        let config = CoreConfig {
            agent_caching: true,
            ..small_budget()
        };
        let (registry, bus) = registry(config);
        let id = registry.acquire(AgentRole::Backend).await;
        let ctx = TraceContext::root();
        registry
            .record_usage(AgentRole::Backend, "heavy", &TokenUsage::new(800, 0), &ctx)
            .await
            .unwrap();
        registry.release(AgentRole::Backend).await;

        let fresh = registry.acquire(AgentRole::Backend).await;
        assert_ne!(fresh, id);
        assert!(!bus.is_registered(&id));
        assert!(bus.is_registered(&fresh));
    }

    #[tokio::test]
    async fn release_all_unregisters_everything() {
        let (registry, bus) = registry(small_budget());
        let a = registry.acquire(AgentRole::Designer).await;
        let b = registry.acquire(AgentRole::Devops).await;
        registry.release_all().await;
        assert!(!bus.is_registered(&a));
        assert!(!bus.is_registered(&b));
    }

    #[tokio::test]
    async fn record_usage_without_instance_errors() {
        let (registry, _) = registry(small_budget());
        let result = registry
            .record_usage(
                AgentRole::Designer,
                "x",
                &TokenUsage::new(1, 1),
                &TraceContext::root(),
            )
            .await;
        assert!(matches!(result, Err(RegistryError::NoActiveInstance(_))));
    }
}
