//! Minimal LLM-backed agent capability.
//!
//! Forwards tasks, reviews, and handoff interrogations to an [`LlmClient`]
//! and wraps the reply in the protocol's typed envelopes. Role personas and
//! prompt engineering live outside the core; this handler only frames the
//! request and reports token usage faithfully.

use std::sync::Arc;

use async_trait::async_trait;

use a2a_event::{Envelope, MessageType, Review, TaskResponse};

use crate::a2a::{A2aError, AgentHandler};
use crate::agent::{AgentFactory, AgentRole};
use crate::llm::LlmClient;

pub struct LlmAgent {
    role: AgentRole,
    preamble: Option<String>,
    llm: Arc<dyn LlmClient>,
}

impl LlmAgent {
    pub fn new(role: AgentRole, preamble: Option<String>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            role,
            preamble,
            llm,
        }
    }

    fn frame(&self, body: &str) -> String {
        match &self.preamble {
            Some(preamble) => format!("{preamble}\n\nRole: {}\n{body}", self.role),
            None => format!("Role: {}\n{body}", self.role),
        }
    }

    /// Extracts the first JSON object from a reply, tolerating prose around it.
    fn json_in(text: &str) -> Option<serde_json::Value> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        serde_json::from_str(&text[start..=end]).ok()
    }
}

#[async_trait]
impl AgentHandler for LlmAgent {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, A2aError> {
        match envelope.message_type {
            MessageType::TaskRequest => {
                let task = envelope
                    .as_task()
                    .ok_or_else(|| A2aError::MalformedReply("task_request without task".into()))?;
                let prompt = self.frame(&format!(
                    "Task: {}\nMetadata: {}",
                    task.description, task.metadata
                ));
                let reply = self
                    .llm
                    .complete(&prompt)
                    .await
                    .map_err(|e| A2aError::Handler(e.to_string()))?;
                let result = Self::json_in(&reply.text)
                    .unwrap_or_else(|| serde_json::json!({ "text": reply.text }));
                let response = TaskResponse::completed(&task.id, result).with_usage(reply.usage);
                Ok(Envelope::task_response(
                    &envelope.to_agent,
                    &envelope.from_agent,
                    &response,
                ))
            }
            MessageType::ReviewRequest => {
                let prompt = self.frame(&format!(
                    "Review this artifact and answer with JSON \
                     {{approved, score, feedback, critical_issues, suggestions}}:\n{}",
                    envelope.content
                ));
                let reply = self
                    .llm
                    .complete(&prompt)
                    .await
                    .map_err(|e| A2aError::Handler(e.to_string()))?;
                match Self::json_in(&reply.text).and_then(|v| Review::from_value(&v)) {
                    Some(review) => Ok(Envelope::review_response(
                        &envelope.to_agent,
                        &envelope.from_agent,
                        &review,
                    )),
                    // The orchestrator treats an unparseable review as a
                    // failed round; hand the raw text back under the review
                    // tag so it can decide.
                    None => Ok(Envelope::new(
                        &envelope.to_agent,
                        &envelope.from_agent,
                        MessageType::ReviewResponse,
                        serde_json::json!({ "raw": reply.text }),
                    )),
                }
            }
            MessageType::Question => {
                let prompt = self.frame(&format!("Question: {}", envelope.content));
                let reply = self
                    .llm
                    .complete(&prompt)
                    .await
                    .map_err(|e| A2aError::Handler(e.to_string()))?;
                let content = Self::json_in(&reply.text)
                    .unwrap_or_else(|| serde_json::json!({ "text": reply.text }));
                Ok(Envelope::new(
                    &envelope.to_agent,
                    &envelope.from_agent,
                    MessageType::Answer,
                    content,
                ))
            }
            _ => Ok(Envelope::new(
                &envelope.to_agent,
                &envelope.from_agent,
                MessageType::Status,
                serde_json::json!({ "role": self.role.as_str() }),
            )),
        }
    }
}

/// Factory wiring every role to the same LLM seam.
pub struct LlmAgentFactory {
    llm: Arc<dyn LlmClient>,
}

impl LlmAgentFactory {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

impl AgentFactory for LlmAgentFactory {
    fn spawn_handler(
        &self,
        role: AgentRole,
        system_preamble: Option<&str>,
    ) -> Arc<dyn AgentHandler> {
        Arc::new(LlmAgent::new(
            role,
            system_preamble.map(str::to_string),
            self.llm.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a2a_event::{Task, TaskStatus, TokenUsage};

    use crate::llm::{LlmReply, ScriptedLlm};

    fn agent_with(replies: &[&str]) -> LlmAgent {
        let llm = ScriptedLlm::new();
        for reply in replies {
            llm.push(Ok(LlmReply::new(*reply, TokenUsage::new(100, 40))));
        }
        LlmAgent::new(AgentRole::Frontend, None, Arc::new(llm))
    }

    #[tokio::test]
    async fn task_reply_carries_result_and_usage() {
        let agent = agent_with(&[r#"{"files": ["app.tsx"]}"#]);
        let task = Task::new("build", "orchestrator", "frontend_v1_x");
        let reply = agent.handle(Envelope::task_request(&task)).await.unwrap();
        let response = reply.as_task_response().unwrap();
        assert_eq!(response.status, TaskStatus::Completed);
        assert_eq!(response.result.unwrap()["files"][0], "app.tsx");
        assert_eq!(response.token_usage.unwrap().total(), 140);
    }

    #[tokio::test]
    async fn prose_reply_is_wrapped_as_text() {
        let agent = agent_with(&["done, no JSON here"]);
        let task = Task::new("build", "orchestrator", "frontend_v1_x");
        let reply = agent.handle(Envelope::task_request(&task)).await.unwrap();
        let response = reply.as_task_response().unwrap();
        assert_eq!(
            response.result.unwrap()["text"],
            serde_json::json!("done, no JSON here")
        );
    }

    #[tokio::test]
    async fn review_reply_parses_into_review() {
        let agent = agent_with(&[r#"{"approved": true, "score": 9, "feedback": []}"#]);
        let envelope = Envelope::review_request("orchestrator", "frontend_v1_x", serde_json::json!({}));
        let reply = agent.handle(envelope).await.unwrap();
        let review = reply.as_review().unwrap();
        assert!(review.approved);
        assert_eq!(review.score, 9);
    }

    #[tokio::test]
    async fn garbage_review_reply_is_unparseable_downstream() {
        let agent = agent_with(&["LGTM I guess"]);
        let envelope = Envelope::review_request("orchestrator", "frontend_v1_x", serde_json::json!({}));
        let reply = agent.handle(envelope).await.unwrap();
        assert_eq!(reply.message_type, MessageType::ReviewResponse);
        assert!(reply.as_review().is_none());
    }

    #[tokio::test]
    async fn preamble_is_prepended_to_prompts() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_reply("{}");
        let agent = LlmAgent::new(
            AgentRole::Backend,
            Some("Continue from handoff: TODO list ...".into()),
            llm.clone(),
        );
        let task = Task::new("resume work", "orchestrator", "backend_v2_x");
        let _ = agent.handle(Envelope::task_request(&task)).await.unwrap();
        assert_eq!(llm.calls(), 1);
    }
}
