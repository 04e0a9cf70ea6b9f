//! The workflow engine: plans, drives, checkpoints, recovers.
//!
//! One spawned task per active workflow owns that user's state record,
//! agent slots, and refinement inbox, so all per-user effects stay
//! serialized. Every phase transition persists durable state before any
//! observable side effect, and completed steps are deduplicated by id, so a
//! restart replays nothing.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use a2a_event::{Review, Task, TaskResponse, TaskStatus};

use crate::a2a::{A2aBus, A2aError, ORCHESTRATOR_ID};
use crate::agent::{AgentFactory, AgentRegistry, AgentRole, RegistryError, UsageStatus};
use crate::config::CoreConfig;
use crate::handoff::HandoffManager;
use crate::message::MessageKind;
use crate::notify::Notifier;
use crate::retry::{retry_with_policy, BreakerError, CircuitBreakerSet, RetryPolicy};
use crate::state::{
    AuditEventType, OrchestratorState, Phase, StateStore, StateStoreError, WorkflowType,
};
use crate::telemetry::{hash_user_id, Telemetry, TraceContext};
use crate::tools::{DeployOutcome, ToolError, ToolProvider};
use crate::workflow::plan::Planner;
use crate::workflow::progress;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("a workflow is already active for user {0}")]
    AlreadyActive(String),
    #[error(transparent)]
    State(#[from] StateStoreError),
    #[error(transparent)]
    A2a(#[from] A2aError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },
    #[error("workflow cancelled")]
    Cancelled,
}

struct WorkflowHandle {
    refinements: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Drives multi-agent workflows for all users of this process.
pub struct WorkflowEngine {
    config: Arc<CoreConfig>,
    state_store: Arc<dyn StateStore>,
    bus: Arc<A2aBus>,
    factory: Arc<dyn AgentFactory>,
    handoff: Arc<HandoffManager>,
    tools: Arc<dyn ToolProvider>,
    notifier: Arc<Notifier>,
    telemetry: Arc<Telemetry>,
    breakers: Arc<CircuitBreakerSet>,
    planner: Planner,
    active: DashMap<String, WorkflowHandle>,
    tasks: TaskTracker,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CoreConfig>,
        state_store: Arc<dyn StateStore>,
        bus: Arc<A2aBus>,
        factory: Arc<dyn AgentFactory>,
        handoff: Arc<HandoffManager>,
        tools: Arc<dyn ToolProvider>,
        notifier: Arc<Notifier>,
        telemetry: Arc<Telemetry>,
        breakers: Arc<CircuitBreakerSet>,
        planner: Planner,
    ) -> Self {
        Self {
            config,
            state_store,
            bus,
            factory,
            handoff,
            tools,
            notifier,
            telemetry,
            breakers,
            planner,
            active: DashMap::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.active.contains_key(user_id)
    }

    /// Plans and launches a workflow. The state record is durable before
    /// this returns; execution continues on a background task.
    pub async fn start(
        self: &Arc<Self>,
        user_id: &str,
        platform: crate::message::Platform,
        original_prompt: &str,
    ) -> Result<(), WorkflowError> {
        if self.active.contains_key(user_id) {
            return Err(WorkflowError::AlreadyActive(user_id.to_string()));
        }
        if let Some(existing) = self.state_store.load(user_id).await? {
            if existing.is_active {
                return Err(WorkflowError::AlreadyActive(user_id.to_string()));
            }
        }

        let plan = self.planner.plan(original_prompt, "").await;
        let mut state = OrchestratorState::new(
            user_id,
            platform,
            original_prompt,
            plan.workflow_type,
            plan.estimated_steps,
        );
        state.agents_needed = plan.agents_needed.clone();
        self.state_store.save(&state).await?;
        let _ = self
            .state_store
            .append_audit(
                user_id,
                AuditEventType::WorkflowStarted,
                serde_json::json!({
                    "workflow_type": plan.workflow_type.as_str(),
                    "estimated_steps": plan.estimated_steps,
                    "notes": plan.notes,
                }),
            )
            .await;

        self.spawn_run(state, false);
        Ok(())
    }

    /// Startup recovery: resumes every active record. Returns resumed users.
    pub async fn resume_all(self: &Arc<Self>) -> Result<Vec<String>, WorkflowError> {
        let user_ids = self.state_store.list_active().await?;
        let loads =
            futures::future::join_all(user_ids.iter().map(|u| self.state_store.load(u))).await;
        let mut resumed = Vec::new();
        for (user_id, loaded) in user_ids.into_iter().zip(loads) {
            let Some(state) = loaded? else {
                continue;
            };
            if state.current_phase.is_terminal() {
                // A crash between terminal transition and deletion; finish
                // the cleanup instead of resuming.
                let _ = self.state_store.delete(&user_id).await;
                continue;
            }
            if self.active.contains_key(&user_id) {
                continue;
            }
            let _ = self
                .state_store
                .append_audit(
                    &user_id,
                    AuditEventType::WorkflowResumed,
                    serde_json::json!({"phase": state.current_phase.as_str()}),
                )
                .await;
            self.notifier
                .notify(
                    &user_id,
                    &format!(
                        "Resumed your previous task ({}% done, phase {}).",
                        state.percent(),
                        state.current_phase.as_str()
                    ),
                    MessageKind::Status,
                )
                .await;
            self.spawn_run(state, true);
            resumed.push(user_id);
        }
        Ok(resumed)
    }

    fn spawn_run(self: &Arc<Self>, state: OrchestratorState, resumed: bool) {
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        self.active.insert(
            state.user_id.clone(),
            WorkflowHandle {
                refinements: tx,
                cancel: cancel.clone(),
            },
        );
        let engine = self.clone();
        self.tasks.spawn(async move {
            engine.run(state, rx, cancel, resumed).await;
        });
    }

    /// Hands a refinement to the owning workflow task. Returns `false` when
    /// no workflow is active for the user.
    pub fn refine(&self, user_id: &str, text: &str) -> bool {
        match self.active.get(user_id) {
            Some(handle) => handle.refinements.try_send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Requests cancellation. Returns `true` when a workflow was signalled
    /// or a leftover record was cleaned up.
    pub async fn cancel(self: &Arc<Self>, user_id: &str) -> bool {
        if let Some(handle) = self.active.get(user_id) {
            handle.cancel.cancel();
            return true;
        }
        // No running task, but a record may linger after a crash.
        match self.state_store.load(user_id).await {
            Ok(Some(state)) if state.is_active => {
                let _ = self
                    .state_store
                    .append_audit(
                        user_id,
                        AuditEventType::WorkflowCancelled,
                        serde_json::json!({"phase": state.current_phase.as_str()}),
                    )
                    .await;
                let _ = self.state_store.delete(user_id).await;
                true
            }
            _ => false,
        }
    }

    /// Formatted status snapshot for `status_query` replies.
    pub async fn status_text(&self, user_id: &str) -> Option<String> {
        let state = self.state_store.load(user_id).await.ok()??;
        let mut out = format!(
            "Working on: {}\nPhase: {} at {}% ({} of {} steps)",
            state.original_prompt,
            state.current_phase.as_str(),
            state.percent(),
            state.steps_completed.len(),
            state.steps_total
        );
        if let Some(agent) = &state.current_agent_working {
            out.push_str(&format!("\nCurrent agent: {agent}"));
        }
        if !state.accumulated_refinements.is_empty() {
            out.push_str(&format!(
                "\nRefinements applied: {}",
                state.accumulated_refinements.len()
            ));
        }
        Some(out)
    }

    /// One-line summary for the in-workflow classifier.
    pub async fn workflow_summary(&self, user_id: &str) -> Option<(String, Phase)> {
        let state = self.state_store.load(user_id).await.ok()??;
        if !state.is_active {
            return None;
        }
        Some((state.original_prompt.clone(), state.current_phase))
    }

    async fn run(
        self: Arc<Self>,
        state: OrchestratorState,
        inbox: mpsc::Receiver<String>,
        cancel: CancellationToken,
        resumed: bool,
    ) {
        let user_id = state.user_id.clone();
        let mut span = self.telemetry.span(
            &format!("workflow:{}", state.workflow_type.as_str()),
            None,
        );
        let registry = Arc::new(AgentRegistry::new(
            &user_id,
            self.config.clone(),
            self.factory.clone(),
            self.bus.clone(),
            self.handoff.clone(),
            self.telemetry.clone(),
        ));
        registry
            .set_work_context(&state.original_prompt, state.project_id.as_deref(), "")
            .await;
        let hook_metrics = self.telemetry.clone();
        registry.register_callbacks(Arc::new(move |event| {
            use crate::agent::LifecycleEvent::*;
            match event {
                Warning { agent_id, usage_fraction } => warn!(
                    agent_id = %agent_id,
                    fraction = usage_fraction,
                    "agent crossed warning budget"
                ),
                Critical { agent_id, usage_fraction } => warn!(
                    agent_id = %agent_id,
                    fraction = usage_fraction,
                    "agent crossed critical budget; handing off"
                ),
                Handoff { successor_id, .. } => {
                    hook_metrics
                        .metrics()
                        .counter("atelier_workflow_handoffs_total")
                        .inc();
                    info!(successor_id = %successor_id, "workflow continuing on successor agent");
                }
                Terminated { agent_id } => {
                    info!(agent_id = %agent_id, "agent terminated");
                }
            }
        }));

        let mut run = WorkflowRun {
            engine: self.clone(),
            registry,
            state,
            inbox,
            cancel,
            ctx: span.context().clone(),
        };
        if resumed {
            info!(
                user = %hash_user_id(&user_id),
                phase = run.state.current_phase.as_str(),
                "resuming workflow"
            );
        }

        let outcome = run.drive().await;
        match outcome {
            Ok(result_message) => run.finish_completed(&result_message).await,
            Err(WorkflowError::Cancelled) => run.finish_cancelled().await,
            Err(err) => {
                span.record_error(&err);
                run.finish_failed(&err).await;
            }
        }
        span.end();
        self.active.remove(&user_id);
    }
}

/// Per-run mutable context; owned by the workflow task.
struct WorkflowRun {
    engine: Arc<WorkflowEngine>,
    registry: Arc<AgentRegistry>,
    state: OrchestratorState,
    inbox: mpsc::Receiver<String>,
    cancel: CancellationToken,
    ctx: TraceContext,
}

/// Merges a new implementation artifact with an existing backend artifact.
fn merge_implementation(
    existing: Option<serde_json::Value>,
    new: serde_json::Value,
) -> serde_json::Value {
    match existing {
        Some(serde_json::Value::Object(map)) if map.contains_key("backend") => {
            let mut merged = map;
            merged.insert("frontend".to_string(), new);
            serde_json::Value::Object(merged)
        }
        _ => new,
    }
}

impl WorkflowRun {
    fn user_id(&self) -> &str {
        &self.state.user_id
    }

    fn project_key(&self) -> String {
        self.state
            .project_id
            .clone()
            .unwrap_or_else(|| format!("proj-{}", self.user_id()))
    }

    fn check_cancel(&self) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Persists the current state; the workflow never advances past a failed
    /// save.
    async fn persist(&mut self) -> Result<(), WorkflowError> {
        self.state.updated_at = chrono::Utc::now();
        self.engine.state_store.save(&self.state).await?;
        Ok(())
    }

    async fn audit(&self, event_type: AuditEventType, payload: serde_json::Value) {
        if let Err(err) = self
            .engine
            .state_store
            .append_audit(self.user_id(), event_type, payload)
            .await
        {
            warn!(%err, "audit append failed");
        }
    }

    async fn notify(&self, text: &str, kind: MessageKind) {
        self.engine.notifier.notify(self.user_id(), text, kind).await;
    }

    /// Pulls queued refinements into durable state. Returns the new batch.
    async fn drain_refinements(&mut self) -> Result<Vec<String>, WorkflowError> {
        let mut fresh = Vec::new();
        while let Ok(text) = self.inbox.try_recv() {
            fresh.push(text);
        }
        if !fresh.is_empty() {
            for text in &fresh {
                self.state.accumulated_refinements.push(text.clone());
                self.audit(
                    AuditEventType::RefinementAdded,
                    serde_json::json!({"text": text}),
                )
                .await;
            }
            self.persist().await?;
        }
        Ok(fresh)
    }

    /// Persist-first phase transition; notification follows the checkpoint.
    async fn transition(&mut self, to: Phase) -> Result<(), WorkflowError> {
        self.check_cancel()?;
        if self.state.current_phase == to {
            return Ok(());
        }
        let from = self.state.current_phase;
        self.state.current_phase = to;
        self.persist().await?;
        self.audit(
            AuditEventType::PhaseChanged,
            serde_json::json!({"from": from.as_str(), "to": to.as_str()}),
        )
        .await;
        self.engine.telemetry.event(
            &self.ctx,
            "phase_transition",
            &[
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("completion", &self.state.percent().to_string()),
            ],
        );
        if !to.is_terminal() {
            self.notify(
                &format!("Phase: {} ({}% done)", to.as_str(), self.state.percent()),
                MessageKind::Status,
            )
            .await;
        }
        Ok(())
    }

    /// Records a step once, growing `steps_total` as completed steps catch
    /// up. Replays on resume are no-ops.
    async fn complete_step(&mut self, id: &str) -> Result<(), WorkflowError> {
        if !self.state.record_step(id) {
            return Ok(());
        }
        self.state.steps_total = progress::grown_total(
            self.state.steps_completed.len(),
            self.state.steps_total,
            self.engine.config.growth_delta,
        );
        self.persist().await?;
        self.audit(
            AuditEventType::StepCompleted,
            serde_json::json!({"step": id, "percent": self.state.percent()}),
        )
        .await;
        Ok(())
    }

    /// Sends one task to a role's active instance, with retry on transient
    /// failures and transparent re-issue to the successor after a
    /// CRITICAL-triggered handoff.
    async fn send_role_task(
        &mut self,
        role: AgentRole,
        description: &str,
        metadata: serde_json::Value,
        op_name: &str,
    ) -> Result<TaskResponse, WorkflowError> {
        self.check_cancel()?;
        let agent_id = self.registry.acquire(role).await;
        self.registry.note_task(description).await;
        self.state.current_agent_working = Some(role.as_str().to_string());
        self.state.current_task_description = Some(description.to_string());
        self.persist().await?;

        let policy = RetryPolicy::external(&self.engine.config);
        let mut attempt = 0usize;
        let response = loop {
            let task = Task::new(description, ORCHESTRATOR_ID, &agent_id)
                .with_metadata(metadata.clone());
            let result = self.engine.bus.send_task(&task, &self.ctx).await;
            match result {
                Ok(response) if response.status == TaskStatus::Completed => break response,
                Ok(response) => {
                    let message = response.error.clone().unwrap_or_else(|| "failed".into());
                    if policy.should_retry(attempt) {
                        warn!(role = %role, attempt, message = %message, "agent task failed; retrying");
                        tokio::time::sleep(policy.delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    // Record whatever budget the failed operation burned.
                    if let Some(usage) = response.token_usage {
                        let _ = self
                            .registry
                            .record_usage(role, op_name, &usage, &self.ctx)
                            .await;
                    }
                    return Err(WorkflowError::StepFailed {
                        step: op_name.to_string(),
                        message,
                    });
                }
                Err(err) => {
                    let transient = matches!(err, A2aError::Handler(_));
                    if transient && policy.should_retry(attempt) {
                        warn!(role = %role, attempt, %err, "agent call errored; retrying");
                        tokio::time::sleep(policy.delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(WorkflowError::A2a(err));
                }
            }
        };

        if let Some(usage) = response.token_usage {
            let status = self
                .registry
                .record_usage(role, op_name, &usage, &self.ctx)
                .await?;
            if status == UsageStatus::Critical {
                // The role slot already holds the successor; the response we
                // got may be truncated by the exhausted context, so re-issue
                // once and prefer the successor's answer.
                let successor = self
                    .registry
                    .current_id(role)
                    .await
                    .ok_or(RegistryError::NoActiveInstance(role))?;
                let task = Task::new(description, ORCHESTRATOR_ID, &successor)
                    .with_metadata(metadata.clone());
                let retried = self.engine.bus.send_task(&task, &self.ctx).await?;
                if retried.status == TaskStatus::Completed {
                    if let Some(usage) = retried.token_usage {
                        let _ = self
                            .registry
                            .record_usage(role, op_name, &usage, &self.ctx)
                            .await?;
                    }
                    return Ok(retried);
                }
                return Err(WorkflowError::StepFailed {
                    step: op_name.to_string(),
                    message: retried
                        .error
                        .unwrap_or_else(|| "successor task failed".into()),
                });
            }
        }
        Ok(response)
    }

    /// A tool call behind the per-service breaker plus the retry policy.
    async fn guarded_tool<T, F, Fut>(
        &self,
        service: &str,
        mut call: F,
    ) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ToolError>>,
    {
        let breaker = self.engine.breakers.breaker(service);
        let policy = RetryPolicy::external(&self.engine.config);
        let is_retryable = |err: &BreakerError<ToolError>| match err {
            BreakerError::Open { .. } => false,
            BreakerError::Inner(inner) => inner.is_transient(),
        };
        let mut attempt = 0usize;
        let result = loop {
            match breaker.call(&mut call).await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    if !is_retryable(&err) || !policy.should_retry(attempt) {
                        break Err(err);
                    }
                    let delay = policy.delay(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        };
        result.map_err(|err| match err {
            BreakerError::Open { service } => {
                WorkflowError::Tool(ToolError::Unavailable(format!("circuit open: {service}")))
            }
            BreakerError::Inner(inner) => WorkflowError::Tool(inner),
        })
    }

    fn refinement_text(&self) -> String {
        if self.state.accumulated_refinements.is_empty() {
            String::new()
        } else {
            format!(
                "\nRefinements: {}",
                self.state.accumulated_refinements.join("; ")
            )
        }
    }

    // --- phases -----------------------------------------------------------

    async fn phase_plan(&mut self) -> Result<(), WorkflowError> {
        self.complete_step("plan").await
    }

    async fn phase_design(&mut self) -> Result<(), WorkflowError> {
        if self.state.has_step("design") {
            return Ok(());
        }
        self.transition(Phase::Design).await?;
        self.drain_refinements().await?;
        let description = format!(
            "Produce a design specification for: {}{}",
            self.state.original_prompt,
            self.refinement_text()
        );
        let response = self
            .send_role_task(
                AgentRole::Designer,
                &description,
                serde_json::json!({"refinements": self.state.accumulated_refinements}),
                "design",
            )
            .await?;
        // Orchestrator approval heuristic: any structured artifact counts.
        let spec = response.result.filter(|v| !v.is_null());
        match spec {
            Some(spec) => {
                self.state.current_design_spec = Some(spec);
                self.complete_step("design").await
            }
            None => Err(WorkflowError::StepFailed {
                step: "design".into(),
                message: "designer produced no artifact".into(),
            }),
        }
    }

    async fn phase_backend(&mut self) -> Result<(), WorkflowError> {
        if !self.state.agents_needed.contains(&AgentRole::Backend)
            || self.state.has_step("backend")
        {
            return Ok(());
        }
        self.transition(Phase::Backend).await?;
        self.drain_refinements().await?;

        // Provision the database and write the linkage durably before any
        // consumer can observe it; a restart must not lose the project.
        if self.state.project_metadata.is_null() {
            let key = self.project_key();
            let outcome = self
                .guarded_tool("database", || {
                    self.engine.tools.create_database_project(&key)
                })
                .await?;
            let db = outcome.value;
            self.state.project_id = Some(db.project_id.clone());
            self.state.project_metadata = serde_json::json!({
                "connection_url": db.connection_url,
                "pooled_url": db.pooled_url,
                "region": db.region,
                "branch_id": db.branch_id,
                "db_name": db.db_name,
            });
            self.persist().await?;
            self.registry
                .set_work_context(
                    &self.state.original_prompt,
                    self.state.project_id.as_deref(),
                    "backend implementation",
                )
                .await;
        }

        let response = self
            .send_role_task(
                AgentRole::Backend,
                "Implement the backend services for the designed application",
                serde_json::json!({
                    "design_spec": self.state.current_design_spec,
                    "database": self.state.project_metadata,
                }),
                "backend",
            )
            .await?;
        if let Some(result) = response.result {
            self.state.current_implementation = Some(serde_json::json!({"backend": result}));
        }
        self.complete_step("backend").await
    }

    async fn phase_implementation(&mut self) -> Result<(), WorkflowError> {
        if self.state.has_step("implementation") {
            return Ok(());
        }
        self.transition(Phase::Implementation).await?;
        let mut fresh = self.drain_refinements().await?;
        let mut passes = 0u8;
        loop {
            let description = format!(
                "Implement the application per the design specification: {}{}",
                self.state.original_prompt,
                self.refinement_text()
            );
            let response = self
                .send_role_task(
                    AgentRole::Frontend,
                    &description,
                    serde_json::json!({
                        "design_spec": self.state.current_design_spec,
                        "refinements": fresh,
                    }),
                    "implementation",
                )
                .await?;
            if let Some(result) = response.result {
                self.state.current_implementation = Some(merge_implementation(
                    self.state.current_implementation.take(),
                    result,
                ));
                self.persist().await?;
            }
            // A refinement that arrived while implementing re-invokes the
            // implementer with the new scope, bounded to avoid livelock.
            fresh = self.drain_refinements().await?;
            passes += 1;
            if fresh.is_empty() || passes >= 3 {
                break;
            }
        }
        self.complete_step("implementation").await
    }

    async fn phase_review(&mut self) -> Result<(), WorkflowError> {
        if self.state.has_step("review") {
            return Ok(());
        }
        self.transition(Phase::Review).await?;
        let reviewer = AgentRole::CodeReviewer;
        let min_quality = self.engine.config.min_quality;
        let mut iteration: u32 = 1;
        let mut boundary_streak = 0u32;

        loop {
            self.check_cancel()?;
            let queued = self.drain_refinements().await?;
            let reviewer_id = self.registry.acquire(reviewer).await;
            let artifact = serde_json::json!({
                "implementation": self.state.current_implementation,
                "iteration": iteration,
            });

            let review = self.request_review_with_retry(&reviewer_id, artifact).await?;
            self.engine.telemetry.event(
                &self.ctx,
                "review_scored",
                &[
                    ("score", &review.score.to_string()),
                    ("iteration", &iteration.to_string()),
                ],
            );

            if review.approved && review.score >= min_quality {
                self.audit(
                    AuditEventType::QualityLoopExited,
                    serde_json::json!({"reason": "approved", "score": review.score, "iteration": iteration}),
                )
                .await;
                break;
            }
            // Boundary tie-break: a score stuck one below the bar for two
            // consecutive rounds will not converge; move on.
            if u32::from(review.score) + 1 == u32::from(min_quality) {
                boundary_streak += 1;
            } else {
                boundary_streak = 0;
            }
            if boundary_streak >= 2 {
                self.audit(
                    AuditEventType::QualityLoopExited,
                    serde_json::json!({"reason": "boundary", "score": review.score, "iteration": iteration}),
                )
                .await;
                break;
            }
            if iteration >= self.engine.config.max_review_iter {
                self.audit(
                    AuditEventType::QualityLoopExited,
                    serde_json::json!({"reason": "iteration_cap", "score": review.score, "iteration": iteration}),
                )
                .await;
                break;
            }

            let response = self
                .send_role_task(
                    AgentRole::Frontend,
                    "Improve the implementation per review feedback",
                    serde_json::json!({
                        "feedback": review.feedback,
                        "critical_issues": review.critical_issues,
                        "suggestions": review.suggestions,
                        "refinements": queued,
                        "iteration": iteration,
                    }),
                    "improve",
                )
                .await?;
            if let Some(result) = response.result {
                self.state.current_implementation = Some(merge_implementation(
                    self.state.current_implementation.take(),
                    result,
                ));
            }
            self.complete_step(&format!("improve-{iteration}")).await?;
            iteration += 1;
        }
        self.complete_step("review").await
    }

    /// One review round; unparseable reviewer output counts as a failed
    /// round and is retried before surfacing.
    async fn request_review_with_retry(
        &self,
        reviewer_id: &str,
        artifact: serde_json::Value,
    ) -> Result<Review, WorkflowError> {
        let policy = RetryPolicy::external(&self.engine.config);
        retry_with_policy(
            &policy,
            |err: &A2aError| matches!(err, A2aError::Handler(_) | A2aError::MalformedReply(_)),
            || {
                self.engine.bus.request_review(
                    ORCHESTRATOR_ID,
                    reviewer_id,
                    artifact.clone(),
                    &self.ctx,
                )
            },
        )
        .await
        .map_err(WorkflowError::A2a)
    }

    async fn phase_deployment(&mut self) -> Result<String, WorkflowError> {
        self.transition(Phase::Deployment).await?;
        let max_attempts = self.engine.config.max_build_retries.max(1);
        let mut last_error = String::from("deployment failed");

        for attempt in 1..=max_attempts {
            self.check_cancel()?;
            self.drain_refinements().await?;

            let outcome = self.attempt_deploy().await;
            let deploy = match outcome {
                Ok(deploy) => deploy,
                Err(WorkflowError::Tool(err)) => {
                    last_error = err.to_string();
                    self.audit(
                        AuditEventType::DeployAttempted,
                        serde_json::json!({"attempt": attempt, "succeeded": false, "error": last_error}),
                    )
                    .await;
                    continue;
                }
                Err(other) => return Err(other),
            };

            self.audit(
                AuditEventType::DeployAttempted,
                serde_json::json!({
                    "attempt": attempt,
                    "succeeded": deploy.succeeded,
                    "errors": deploy.errors,
                }),
            )
            .await;
            self.engine.telemetry.event(
                &self.ctx,
                "deploy_attempt",
                &[
                    ("attempt", &attempt.to_string()),
                    ("succeeded", &deploy.succeeded.to_string()),
                ],
            );

            if deploy.succeeded {
                if let Some(url) = deploy.url.clone() {
                    if self.verify_deployment(&url).await? {
                        self.complete_step("deploy").await?;
                        return Ok(url);
                    }
                    last_error = format!("post-deploy verification failed for {url}");
                } else {
                    last_error = "deploy reported success without a URL".into();
                }
            } else {
                last_error = if deploy.build_log.is_empty() {
                    "build failed".into()
                } else {
                    deploy.build_log.clone()
                };
            }

            if attempt < max_attempts {
                // Hand the structured build errors to the implementer, then
                // try again with the fixed artifact.
                let response = self
                    .send_role_task(
                        AgentRole::Frontend,
                        "Fix the build errors from the failed deployment",
                        serde_json::json!({
                            "build_errors": deploy.errors,
                            "build_log": deploy.build_log,
                            "attempt": attempt,
                        }),
                        "fix_build",
                    )
                    .await?;
                if let Some(result) = response.result {
                    self.state.current_implementation = Some(merge_implementation(
                        self.state.current_implementation.take(),
                        result,
                    ));
                    self.persist().await?;
                }
            }
        }

        Err(WorkflowError::StepFailed {
            step: "deployment".into(),
            message: last_error,
        })
    }

    async fn attempt_deploy(&self) -> Result<DeployOutcome, WorkflowError> {
        let key = self.project_key();
        let artifact = self
            .state
            .current_implementation
            .clone()
            .unwrap_or(serde_json::Value::Null);
        let outcome = if self.state.workflow_type == WorkflowType::Redeploy {
            self.guarded_tool("deploy", || self.engine.tools.redeploy(&key))
                .await?
        } else {
            self.guarded_tool("deploy", || self.engine.tools.deploy(&key, &artifact))
                .await?
        };
        Ok(outcome.value)
    }

    async fn verify_deployment(&self, url: &str) -> Result<bool, WorkflowError> {
        let steps = serde_json::json!([{"action": "open", "target": url}]);
        match self
            .guarded_tool("browser", || self.engine.tools.run_scenario(url, &steps))
            .await
        {
            Ok(outcome) => Ok(outcome.value.pass),
            Err(WorkflowError::Tool(err)) => {
                warn!(%err, "verification scenario unavailable; counting attempt as failed");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Applies refinements that arrived after a successful deploy as one
    /// post-deployment update task.
    async fn post_deploy_updates(&mut self) -> Result<(), WorkflowError> {
        let queued = self.drain_refinements().await?;
        if queued.is_empty() {
            return Ok(());
        }
        let response = self
            .send_role_task(
                AgentRole::Frontend,
                "Apply post-deployment updates",
                serde_json::json!({"refinements": queued}),
                "post_deploy_update",
            )
            .await?;
        if let Some(result) = response.result {
            self.state.current_implementation = Some(merge_implementation(
                self.state.current_implementation.take(),
                result,
            ));
            self.persist().await?;
        }
        Ok(())
    }

    /// Runs the phase sequence for the workflow type. Phases completed
    /// before a crash are skipped by their step ids.
    async fn drive(&mut self) -> Result<String, WorkflowError> {
        match self.state.workflow_type {
            WorkflowType::DesignOnly => {
                self.phase_plan().await?;
                self.phase_design().await?;
                Ok("Design specification is ready.".to_string())
            }
            WorkflowType::Redeploy => {
                self.phase_plan().await?;
                let url = self.phase_deployment().await?;
                Ok(format!("Redeployed: your app is live at {url}"))
            }
            WorkflowType::BugFix => {
                self.phase_plan().await?;
                self.phase_implementation().await?;
                self.phase_review().await?;
                let url = self.phase_deployment().await?;
                self.post_deploy_updates().await?;
                Ok(format!("Fix deployed: your app is live at {url}"))
            }
            WorkflowType::FullBuild | WorkflowType::Custom => {
                self.phase_plan().await?;
                self.phase_design().await?;
                self.phase_backend().await?;
                self.phase_implementation().await?;
                self.phase_review().await?;
                let url = self.phase_deployment().await?;
                self.post_deploy_updates().await?;
                Ok(format!("All done! Your app is live at {url}"))
            }
        }
    }

    // --- terminal paths ---------------------------------------------------

    async fn finish_completed(&mut self, result_message: &str) {
        if let Err(err) = self.transition(Phase::Completed).await {
            error!(%err, "failed to persist completion");
        }
        self.audit(
            AuditEventType::WorkflowCompleted,
            serde_json::json!({"steps": self.state.steps_completed.len()}),
        )
        .await;
        self.notify(result_message, MessageKind::Result).await;
        let _ = self.engine.state_store.delete(self.user_id()).await;
        self.registry.release_all().await;
        self.engine
            .telemetry
            .metrics()
            .counter("atelier_workflows_completed_total")
            .inc();
    }

    async fn finish_cancelled(&mut self) {
        self.state.current_phase = Phase::Cancelled;
        self.state.is_active = false;
        self.state.updated_at = chrono::Utc::now();
        let _ = self.engine.state_store.save(&self.state).await;
        self.audit(
            AuditEventType::WorkflowCancelled,
            serde_json::json!({"steps": self.state.steps_completed.len()}),
        )
        .await;
        self.notify("Cancelled. The task has been stopped and cleaned up.", MessageKind::Status)
            .await;
        let _ = self.engine.state_store.delete(self.user_id()).await;
        self.registry.release_all().await;
        self.engine
            .telemetry
            .metrics()
            .counter("atelier_workflows_cancelled_total")
            .inc();
    }

    async fn finish_failed(&mut self, err: &WorkflowError) {
        error!(user = %hash_user_id(self.user_id()), %err, "workflow failed");
        self.state.current_phase = Phase::Failed;
        self.state.updated_at = chrono::Utc::now();
        let _ = self.engine.state_store.save(&self.state).await;
        self.audit(
            AuditEventType::WorkflowFailed,
            serde_json::json!({"error": err.to_string()}),
        )
        .await;
        // Surface the failure before deleting the record; the audit trail
        // outlives both.
        self.notify(
            &format!("I could not finish the task: {err}"),
            MessageKind::Error,
        )
        .await;
        let _ = self.engine.state_store.delete(self.user_id()).await;
        self.registry.release_all().await;
        self.engine
            .telemetry
            .metrics()
            .counter("atelier_workflows_failed_total")
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_backend_artifact() {
        let backend = serde_json::json!({"backend": {"routes": 3}});
        let merged = merge_implementation(Some(backend), serde_json::json!({"pages": 2}));
        assert_eq!(merged["backend"]["routes"], 3);
        assert_eq!(merged["frontend"]["pages"], 2);
    }

    #[test]
    fn merge_without_backend_replaces() {
        let merged = merge_implementation(
            Some(serde_json::json!({"pages": 1})),
            serde_json::json!({"pages": 2}),
        );
        assert_eq!(merged, serde_json::json!({"pages": 2}));
        let fresh = merge_implementation(None, serde_json::json!({"pages": 9}));
        assert_eq!(fresh, serde_json::json!({"pages": 9}));
    }
}
