//! A2A envelope: message id + addressing + tagged payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::review::Review;
use crate::task::{Task, TaskResponse};

/// Tag determining the schema of [`Envelope::content`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    ReviewRequest,
    ReviewResponse,
    Question,
    Answer,
    Status,
    Error,
}

/// One message on the A2A bus.
///
/// `content` is the JSON form of the payload named by `message_type`:
/// a [`Task`] for `task_request`, a [`TaskResponse`] for `task_response`,
/// the artifact under review for `review_request`, a [`Review`] for
/// `review_response`, and free-form JSON for the rest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Envelope {
    /// Creates an envelope with a fresh message id and the current time.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message_type,
            content,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn task_request(task: &Task) -> Self {
        let content = serde_json::to_value(task).unwrap_or(serde_json::Value::Null);
        Self::new(&task.from, &task.to, MessageType::TaskRequest, content)
    }

    pub fn task_response(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        response: &TaskResponse,
    ) -> Self {
        let content = serde_json::to_value(response).unwrap_or(serde_json::Value::Null);
        Self::new(from_agent, to_agent, MessageType::TaskResponse, content)
    }

    pub fn review_request(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        artifact: serde_json::Value,
    ) -> Self {
        Self::new(from_agent, to_agent, MessageType::ReviewRequest, artifact)
    }

    pub fn review_response(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        review: &Review,
    ) -> Self {
        let content = serde_json::to_value(review).unwrap_or(serde_json::Value::Null);
        Self::new(from_agent, to_agent, MessageType::ReviewResponse, content)
    }

    pub fn question(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self::new(from_agent, to_agent, MessageType::Question, content)
    }

    /// Parses the content as the payload type named by the tag.
    /// Returns `None` when the tag does not match or the content is malformed.
    pub fn as_task(&self) -> Option<Task> {
        match self.message_type {
            MessageType::TaskRequest => serde_json::from_value(self.content.clone()).ok(),
            _ => None,
        }
    }

    pub fn as_task_response(&self) -> Option<TaskResponse> {
        match self.message_type {
            MessageType::TaskResponse => serde_json::from_value(self.content.clone()).ok(),
            _ => None,
        }
    }

    pub fn as_review(&self) -> Option<Review> {
        match self.message_type {
            MessageType::ReviewResponse => Review::from_value(&self.content),
            _ => None,
        }
    }

    /// Serializes the envelope to a JSON string for transports/logs.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn message_type_uses_snake_case_tags() {
        let json = serde_json::to_string(&MessageType::ReviewRequest).unwrap();
        assert_eq!(json, "\"review_request\"");
        let back: MessageType = serde_json::from_str("\"task_response\"").unwrap();
        assert_eq!(back, MessageType::TaskResponse);
    }

    #[test]
    fn task_request_roundtrip() {
        let task = Task::new("design a landing page", "orchestrator", "designer_v1_0ab1");
        let envelope = Envelope::task_request(&task);
        assert_eq!(envelope.message_type, MessageType::TaskRequest);
        assert_eq!(envelope.from_agent, "orchestrator");
        assert_eq!(envelope.to_agent, "designer_v1_0ab1");

        let parsed = envelope.as_task().unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.description, task.description);
    }

    #[test]
    fn as_task_on_wrong_tag_is_none() {
        let envelope = Envelope::new(
            "a",
            "b",
            MessageType::Status,
            serde_json::json!({"phase": "design"}),
        );
        assert!(envelope.as_task().is_none());
        assert!(envelope.as_review().is_none());
    }

    #[test]
    fn task_response_roundtrip() {
        let response = TaskResponse::completed("t9", serde_json::json!({"ok": true}));
        let envelope = Envelope::task_response("backend_v1_ff00", "orchestrator", &response);
        let parsed = envelope.as_task_response().unwrap();
        assert_eq!(parsed.task_id, "t9");
        assert_eq!(parsed.status, TaskStatus::Completed);
    }

    #[test]
    fn review_response_roundtrip() {
        let review = Review::new(true, 9);
        let envelope = Envelope::review_response("code-reviewer_v1_1234", "orchestrator", &review);
        let parsed = envelope.as_review().unwrap();
        assert!(parsed.approved);
        assert_eq!(parsed.score, 9);
    }

    #[test]
    fn envelope_json_contains_ids() {
        let envelope = Envelope::new("a", "b", MessageType::Status, serde_json::json!(null));
        let json = envelope.to_json().unwrap();
        assert!(json.contains(&envelope.message_id));
        assert!(json.contains("\"status\""));
    }
}
