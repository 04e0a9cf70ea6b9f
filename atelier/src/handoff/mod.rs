//! Handoff documents: the knowledge transferred between successive
//! instances of one agent role.
//!
//! The document is the contract: whatever a dying instance manages to
//! report is normalized into this schema (or a minimal skeleton when the
//! report is malformed), persisted, and rendered into a continuation prompt
//! for the successor. A role's documents form a linear chain through
//! `predecessor_handoff_id`, identified by a shared `trace_id`.

mod manager;
mod store;

pub use manager::{HandoffContext, HandoffError, HandoffManager};
pub use store::{HandoffStore, HandoffStoreError, InMemoryHandoffStore, SqliteHandoffStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use a2a_event::TaskPriority;

use crate::agent::{AgentRole, TokenSnapshot};

/// Why the source instance stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ContextExhausted,
    PhaseComplete,
    Manual,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceAgent {
    pub id: String,
    pub role: AgentRole,
    pub version: u32,
    pub termination_reason: TerminationReason,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetAgent {
    pub role: AgentRole,
    pub expected_version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Clamped to 0..=100 on construction and parse.
    pub completion_percent: u8,
    pub phase: String,
    pub status: String,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            completion_percent: 0,
            phase: "unknown".into(),
            status: "unknown".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub impact: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectedAlternative {
    pub alternative: String,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkCompleted {
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TodoItem {
    pub task: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub est_time: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TodoStatus,
}

/// The payload an agent reports when interrogated; everything defaults so a
/// partial answer still parses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HandoffPayload {
    #[serde(default)]
    pub task_progress: Option<TaskProgress>,
    #[serde(default)]
    pub decisions_made: Vec<Decision>,
    #[serde(default)]
    pub rejected_alternatives: Vec<RejectedAlternative>,
    #[serde(default)]
    pub work_completed: WorkCompleted,
    #[serde(default)]
    pub current_wip: String,
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
    #[serde(default)]
    pub tool_state: serde_json::Value,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl HandoffPayload {
    /// Parses an agent's answer; `None` when it is not an object at all.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let mut payload: HandoffPayload = serde_json::from_value(value.clone()).ok()?;
        if let Some(progress) = payload.task_progress.as_mut() {
            progress.completion_percent = progress.completion_percent.min(100);
        }
        Some(payload)
    }
}

/// The durable handoff record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandoffDocument {
    pub handoff_id: String,
    /// Shared by all documents of one role chain.
    pub trace_id: String,
    /// Previous document in the chain, if any.
    pub predecessor_handoff_id: Option<String>,
    pub user_id: String,
    pub project_id: Option<String>,
    pub source_agent: SourceAgent,
    pub target_agent: TargetAgent,
    pub token_usage_snapshot: TokenSnapshot,
    pub task_progress: TaskProgress,
    pub original_request: String,
    pub task_description: String,
    pub decisions_made: Vec<Decision>,
    pub rejected_alternatives: Vec<RejectedAlternative>,
    pub work_completed: WorkCompleted,
    pub current_wip: String,
    pub todo_list: Vec<TodoItem>,
    /// Free-form; passed through unmodified.
    pub tool_state: serde_json::Value,
    pub assumptions: Vec<String>,
    /// Collaborator role → reference.
    pub dependencies: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// False once superseded by a newer document for the same role.
    pub is_active: bool,
}

impl HandoffDocument {
    /// Minimal skeleton used when the source instance cannot produce a
    /// usable report; the successor at least learns the request and how far
    /// the phase got.
    pub fn skeleton_payload() -> HandoffPayload {
        HandoffPayload {
            task_progress: Some(TaskProgress::default()),
            current_wip: "unreported".into(),
            ..HandoffPayload::default()
        }
    }

    /// The text prepended to the successor's system context. Pure function
    /// of the document.
    pub fn continuation_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "You are taking over from a previous {} instance (v{}) that reached {}% of its task.\n",
            self.source_agent.role,
            self.source_agent.version,
            self.task_progress.completion_percent
        ));
        out.push_str(&format!("Original request: {}\n", self.original_request));
        out.push_str(&format!("Current task: {}\n", self.task_description));

        if !self.work_completed.summary.is_empty() || !self.work_completed.artifacts.is_empty() {
            out.push_str("\nCompleted so far:\n");
            if !self.work_completed.summary.is_empty() {
                out.push_str(&format!("- {}\n", self.work_completed.summary));
            }
            for artifact in &self.work_completed.artifacts {
                out.push_str(&format!("- artifact: {artifact}\n"));
            }
        }
        if !self.decisions_made.is_empty() {
            out.push_str("\nDecisions already made (do not revisit):\n");
            for d in &self.decisions_made {
                out.push_str(&format!("- {} ({})\n", d.decision, d.reasoning));
            }
        }
        if !self.rejected_alternatives.is_empty() {
            out.push_str("\nRejected alternatives (do not retry):\n");
            for r in &self.rejected_alternatives {
                out.push_str(&format!("- {}: {}\n", r.alternative, r.reason));
            }
        }
        if !self.todo_list.is_empty() {
            out.push_str("\nRemaining TODOs:\n");
            for t in &self.todo_list {
                out.push_str(&format!("- [{:?}] {}\n", t.priority, t.task));
            }
        }
        if !self.current_wip.is_empty() {
            out.push_str(&format!("\nWork in progress: {}\n", self.current_wip));
        }
        if !self.assumptions.is_empty() {
            out.push_str("\nAssumptions in force:\n");
            for a in &self.assumptions {
                out.push_str(&format!("- {a}\n"));
            }
        }
        out
    }

    /// Human-readable rendering for inspection; never persisted by default.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Handoff {} ({} v{} → v{})\n\n",
            self.handoff_id,
            self.source_agent.role,
            self.source_agent.version,
            self.target_agent.expected_version
        ));
        out.push_str(&format!("- trace: `{}`\n", self.trace_id));
        out.push_str(&format!("- user: `{}`\n", self.user_id));
        out.push_str(&format!(
            "- tokens: {} / {} ({:.0}%)\n",
            self.token_usage_snapshot.total,
            self.token_usage_snapshot.context_limit,
            self.token_usage_snapshot.usage_fraction * 100.0
        ));
        out.push_str(&format!(
            "- progress: {}% in phase {}\n\n",
            self.task_progress.completion_percent, self.task_progress.phase
        ));
        out.push_str("## Continuation\n\n");
        out.push_str(&self.continuation_prompt());
        out
    }
}
