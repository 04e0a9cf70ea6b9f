//! Durable orchestrator state and audit trail.
//!
//! One record per user holds everything needed to resume a workflow after a
//! crash: phase, artifacts, refinements, completed steps. Writes are
//! serialized by the owning workflow task; the store enforces monotonic
//! `updated_at` so a stale writer can never roll state back.

mod memory;
mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Platform;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state storage: {0}")]
    Storage(String),
    #[error("state serialization: {0}")]
    Serialization(String),
    /// A save carried an `updated_at` older than the stored record.
    #[error("stale write for user {user_id}")]
    StaleWrite { user_id: String },
}

/// Workflow stage. Terminal phases never transition further.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Design,
    Backend,
    Implementation,
    Review,
    Deployment,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Design => "design",
            Phase::Backend => "backend",
            Phase::Implementation => "implementation",
            Phase::Review => "review",
            Phase::Deployment => "deployment",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Phase::Planning),
            "design" => Ok(Phase::Design),
            "backend" => Ok(Phase::Backend),
            "implementation" => Ok(Phase::Implementation),
            "review" => Ok(Phase::Review),
            "deployment" => Ok(Phase::Deployment),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            "cancelled" => Ok(Phase::Cancelled),
            _ => Err(format!("unknown phase: {s}")),
        }
    }
}

/// Kind of workflow the planner selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    FullBuild,
    BugFix,
    Redeploy,
    DesignOnly,
    Custom,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::FullBuild => "full_build",
            WorkflowType::BugFix => "bug_fix",
            WorkflowType::Redeploy => "redeploy",
            WorkflowType::DesignOnly => "design_only",
            WorkflowType::Custom => "custom",
        }
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_build" => Ok(WorkflowType::FullBuild),
            "bug_fix" => Ok(WorkflowType::BugFix),
            "redeploy" => Ok(WorkflowType::Redeploy),
            "design_only" => Ok(WorkflowType::DesignOnly),
            "custom" => Ok(WorkflowType::Custom),
            _ => Err(format!("unknown workflow type: {s}")),
        }
    }
}

/// One completed step: a monotonically increasing sequence number plus a
/// stable step id used for deduplication on resume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub seq: u64,
    pub id: String,
}

/// Durable per-user workflow state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub user_id: String,
    pub platform: Platform,
    pub is_active: bool,
    pub current_phase: Phase,
    pub workflow_type: WorkflowType,
    pub original_prompt: String,
    /// Roles the plan called for; decides optional phases across restarts.
    pub agents_needed: Vec<crate::agent::AgentRole>,
    pub accumulated_refinements: Vec<String>,
    pub current_design_spec: Option<serde_json::Value>,
    pub current_implementation: Option<serde_json::Value>,
    pub steps_completed: Vec<StepRecord>,
    pub steps_total: u32,
    pub current_agent_working: Option<String>,
    pub current_task_description: Option<String>,
    /// Links provisioned external resources (repo, deployment).
    pub project_id: Option<String>,
    /// Durable linkage written before any consumer sees it (DB provisioning).
    pub project_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(
        user_id: impl Into<String>,
        platform: Platform,
        original_prompt: impl Into<String>,
        workflow_type: WorkflowType,
        estimated_steps: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            platform,
            is_active: true,
            current_phase: Phase::Planning,
            workflow_type,
            original_prompt: original_prompt.into(),
            agents_needed: Vec::new(),
            accumulated_refinements: Vec::new(),
            current_design_spec: None,
            current_implementation: None,
            steps_completed: Vec::new(),
            steps_total: estimated_steps.max(1),
            current_agent_working: None,
            current_task_description: None,
            project_id: None,
            project_metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.steps_completed.iter().any(|s| s.id == id)
    }

    /// Records a step once. Returns `false` when the id was already present
    /// (resume replaying a completed step).
    pub fn record_step(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.has_step(&id) {
            return false;
        }
        let seq = self.steps_completed.last().map(|s| s.seq + 1).unwrap_or(1);
        self.steps_completed.push(StepRecord { seq, id });
        true
    }

    /// User-visible progress percent, always within 0..=100.
    pub fn percent(&self) -> u8 {
        crate::workflow::progress::percent(self.steps_completed.len(), self.steps_total)
    }
}

/// Kinds of audit events appended over a workflow's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WorkflowStarted,
    PhaseChanged,
    StepCompleted,
    RefinementAdded,
    HandoffCompleted,
    QualityLoopExited,
    DeployAttempted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowResumed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::WorkflowStarted => "workflow_started",
            AuditEventType::PhaseChanged => "phase_changed",
            AuditEventType::StepCompleted => "step_completed",
            AuditEventType::RefinementAdded => "refinement_added",
            AuditEventType::HandoffCompleted => "handoff_completed",
            AuditEventType::QualityLoopExited => "quality_loop_exited",
            AuditEventType::DeployAttempted => "deploy_attempted",
            AuditEventType::WorkflowCompleted => "workflow_completed",
            AuditEventType::WorkflowFailed => "workflow_failed",
            AuditEventType::WorkflowCancelled => "workflow_cancelled",
            AuditEventType::WorkflowResumed => "workflow_resumed",
        }
    }
}

/// Append-only diagnostic record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: String,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Durable checkpointing and crash recovery for workflows.
///
/// All writes for one `user_id` are serialized by the owning workflow task;
/// the store only has to provide per-record atomicity and the monotonic
/// `updated_at` check.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upserts the record. Fails with [`StateStoreError::StaleWrite`] when
    /// the stored `updated_at` is newer than the incoming one.
    async fn save(&self, state: &OrchestratorState) -> Result<(), StateStoreError>;

    async fn load(&self, user_id: &str) -> Result<Option<OrchestratorState>, StateStoreError>;

    async fn delete(&self, user_id: &str) -> Result<(), StateStoreError>;

    /// User ids of all records with `is_active = true` (startup recovery).
    async fn list_active(&self) -> Result<Vec<String>, StateStoreError>;

    async fn append_audit(
        &self,
        user_id: &str,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<(), StateStoreError>;

    /// Audit events for a user, oldest first.
    async fn list_audit(&self, user_id: &str) -> Result<Vec<AuditEvent>, StateStoreError>;

    /// Purges records not updated within `max_age`. Returns how many were
    /// removed. Audit events are retained.
    async fn cleanup_stale(&self, max_age: std::time::Duration)
        -> Result<usize, StateStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_step_dedupes_by_id_and_grows_seq() {
        let mut state =
            OrchestratorState::new("u", Platform::Chat, "build", WorkflowType::FullBuild, 5);
        assert!(state.record_step("plan"));
        assert!(state.record_step("design"));
        assert!(!state.record_step("plan"));
        assert_eq!(state.steps_completed.len(), 2);
        assert_eq!(state.steps_completed[0].seq, 1);
        assert_eq!(state.steps_completed[1].seq, 2);
    }

    #[test]
    fn percent_stays_in_bounds() {
        let mut state =
            OrchestratorState::new("u", Platform::Chat, "build", WorkflowType::FullBuild, 2);
        assert_eq!(state.percent(), 0);
        state.record_step("a");
        assert_eq!(state.percent(), 50);
        state.record_step("b");
        state.record_step("c");
        assert!(state.percent() <= 100);
    }

    #[test]
    fn phase_parse_roundtrip() {
        for phase in [
            Phase::Planning,
            Phase::Design,
            Phase::Backend,
            Phase::Implementation,
            Phase::Review,
            Phase::Deployment,
            Phase::Completed,
            Phase::Failed,
            Phase::Cancelled,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!(Phase::Completed.is_terminal());
        assert!(!Phase::Review.is_terminal());
    }

    #[test]
    fn workflow_type_parse_roundtrip() {
        for wt in [
            WorkflowType::FullBuild,
            WorkflowType::BugFix,
            WorkflowType::Redeploy,
            WorkflowType::DesignOnly,
            WorkflowType::Custom,
        ] {
            assert_eq!(wt.as_str().parse::<WorkflowType>().unwrap(), wt);
        }
    }

    #[test]
    fn state_serde_roundtrip_preserves_fields() {
        let mut state =
            OrchestratorState::new("u9", Platform::VcsComment, "fix bug", WorkflowType::BugFix, 3);
        state.accumulated_refinements.push("dark theme".into());
        state.current_design_spec = Some(serde_json::json!({"pages": 2}));
        state.record_step("plan");
        let json = serde_json::to_string(&state).unwrap();
        let back: OrchestratorState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, "u9");
        assert_eq!(back.workflow_type, WorkflowType::BugFix);
        assert_eq!(back.accumulated_refinements, vec!["dark theme".to_string()]);
        assert_eq!(back.steps_completed.len(), 1);
    }
}
