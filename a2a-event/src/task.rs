//! Task request/response payloads and token accounting.

use serde::{Deserialize, Serialize};

/// Token usage for one agent operation (one or more LLM round-trips).
///
/// All counters are cumulative within the operation; the core's token
/// tracker sums these across operations and never decrements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed as model input (prompt).
    pub input_tokens: u64,
    /// Tokens produced as model output (completion).
    pub output_tokens: u64,
    /// Input tokens served from a provider-side cache.
    pub cached_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record with no cached tokens.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_tokens: 0,
        }
    }

    /// Input + output. Cached tokens are informational and not counted here.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Component-wise sum.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cached_tokens: self.cached_tokens + other.cached_tokens,
        }
    }
}

/// Priority of a task request. Informational for the receiving agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// A unit of work sent from one agent (or the orchestrator) to another.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id; echoed back in [`TaskResponse::task_id`].
    pub id: String,
    /// What the receiving agent should do.
    pub description: String,
    /// Sender agent id (or `"orchestrator"`).
    pub from: String,
    /// Receiver agent id.
    pub to: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Free-form task metadata (e.g. refinement text, build errors).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Task {
    /// Creates a task with a fresh id and default priority.
    pub fn new(
        description: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            from: from.into(),
            to: to.into(),
            priority: TaskPriority::default(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Terminal status of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Result of executing a [`Task`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Id of the task this responds to.
    pub task_id: String,
    pub status: TaskStatus,
    /// Opaque structured result produced by the agent (artifact, text, ...).
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Usage for this operation, when the agent reports it.
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    /// Error message when `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn completed(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            token_usage: None,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            token_usage: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            result: None,
            token_usage: None,
            error: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_total_and_add() {
        let a = TokenUsage::new(100, 20);
        let b = TokenUsage {
            input_tokens: 5,
            output_tokens: 5,
            cached_tokens: 3,
        };
        assert_eq!(a.total(), 120);
        let sum = a.add(&b);
        assert_eq!(sum.input_tokens, 105);
        assert_eq!(sum.output_tokens, 25);
        assert_eq!(sum.cached_tokens, 3);
    }

    #[test]
    fn task_roundtrip_preserves_priority_tag() {
        let task = Task::new("build it", "orchestrator", "frontend_v1_abc")
            .with_priority(TaskPriority::High);
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"high\""));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, TaskPriority::High);
        assert_eq!(back.id, task.id);
    }

    #[test]
    fn response_constructors_set_status() {
        let ok = TaskResponse::completed("t1", serde_json::json!({"files": []}));
        assert_eq!(ok.status, TaskStatus::Completed);
        assert!(ok.error.is_none());

        let err = TaskResponse::failed("t1", "timeout");
        assert_eq!(err.status, TaskStatus::Failed);
        assert_eq!(err.error.as_deref(), Some("timeout"));

        let cancelled = TaskResponse::cancelled("t1");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
    }

    #[test]
    fn task_missing_optional_fields_deserializes() {
        let json = r#"{"id":"t","description":"d","from":"a","to":"b"}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.metadata.is_null());
    }
}
