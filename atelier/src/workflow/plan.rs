//! Advisory workflow planning.
//!
//! The planner asks the LLM to shape the workflow; its answer is advisory
//! and any failure (transport, unparseable output) falls back to a
//! conservative full build so a planner outage never blocks users.

use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::agent::AgentRole;
use crate::llm::LlmClient;
use crate::state::WorkflowType;

/// What the planner decided. `estimated_steps` seeds `steps_total`.
#[derive(Clone, Debug)]
pub struct WorkflowPlan {
    pub workflow_type: WorkflowType,
    pub agents_needed: Vec<AgentRole>,
    pub estimated_steps: u32,
    pub notes: String,
}

impl WorkflowPlan {
    /// Conservative default when planning is unavailable.
    pub fn fallback() -> Self {
        Self {
            workflow_type: WorkflowType::FullBuild,
            agents_needed: vec![
                AgentRole::Designer,
                AgentRole::Frontend,
                AgentRole::CodeReviewer,
                AgentRole::Devops,
            ],
            estimated_steps: 5,
            notes: "planner unavailable; defaulted to full build".into(),
        }
    }

    pub fn needs(&self, role: AgentRole) -> bool {
        self.agents_needed.contains(&role)
    }
}

#[derive(serde::Deserialize)]
struct PlanPayload {
    workflow_type: String,
    #[serde(default)]
    agents_needed: Vec<String>,
    #[serde(default)]
    estimated_steps: Option<u32>,
    #[serde(default)]
    notes: String,
}

fn parse_plan(text: &str) -> Option<WorkflowPlan> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let payload: PlanPayload = serde_json::from_str(&text[start..=end]).ok()?;
    let workflow_type = WorkflowType::from_str(&payload.workflow_type).ok()?;
    let agents_needed: Vec<AgentRole> = payload
        .agents_needed
        .iter()
        .filter_map(|s| AgentRole::from_str(s).ok())
        .collect();
    Some(WorkflowPlan {
        workflow_type,
        agents_needed: if agents_needed.is_empty() {
            WorkflowPlan::fallback().agents_needed
        } else {
            agents_needed
        },
        estimated_steps: payload.estimated_steps.unwrap_or(5).max(1),
        notes: payload.notes,
    })
}

/// LLM-advised planner with a safe fallback.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Never fails: planning problems degrade to [`WorkflowPlan::fallback`].
    pub async fn plan(&self, original_request: &str, context: &str) -> WorkflowPlan {
        let prompt = format!(
            "Plan a webapp build workflow for the request below. Answer with JSON \
             {{workflow_type, agents_needed, estimated_steps, notes}} where workflow_type is one \
             of full_build|bug_fix|redeploy|design_only|custom and agents_needed lists roles from \
             designer|backend|frontend|code-reviewer|qa|devops.\n\
             Request: {original_request}\nContext: {context}"
        );
        match self.llm.complete(&prompt).await {
            Ok(reply) => parse_plan(&reply.text).unwrap_or_else(|| {
                warn!("unparseable plan; using fallback");
                WorkflowPlan::fallback()
            }),
            Err(err) => {
                warn!(%err, "planner call failed; using fallback");
                WorkflowPlan::fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, LlmReply, MockLlm, ScriptedLlm};
    use a2a_event::TokenUsage;

    #[tokio::test]
    async fn parses_plan_from_json_reply() {
        let llm = MockLlm::new(
            r#"Here is the plan: {"workflow_type": "full_build",
               "agents_needed": ["designer", "backend", "frontend", "code-reviewer"],
               "estimated_steps": 7, "notes": "needs a database"}"#,
        );
        let planner = Planner::new(Arc::new(llm));
        let plan = planner.plan("Build a shop", "").await;
        assert_eq!(plan.workflow_type, WorkflowType::FullBuild);
        assert!(plan.needs(AgentRole::Backend));
        assert_eq!(plan.estimated_steps, 7);
        assert_eq!(plan.notes, "needs a database");
    }

    #[tokio::test]
    async fn llm_failure_falls_back() {
        let llm = ScriptedLlm::new();
        llm.push(Err(LlmError::Timeout));
        let planner = Planner::new(Arc::new(llm));
        let plan = planner.plan("Build", "").await;
        assert_eq!(plan.workflow_type, WorkflowType::FullBuild);
        assert_eq!(plan.estimated_steps, 5);
        assert!(!plan.needs(AgentRole::Backend));
    }

    #[tokio::test]
    async fn prose_reply_falls_back() {
        let llm = ScriptedLlm::new();
        llm.push(Ok(LlmReply::new(
            "I think you should build it carefully",
            TokenUsage::new(5, 5),
        )));
        let planner = Planner::new(Arc::new(llm));
        let plan = planner.plan("Build", "").await;
        assert_eq!(plan.notes, "planner unavailable; defaulted to full build");
    }

    #[test]
    fn unknown_roles_are_skipped_and_zero_steps_clamped() {
        let plan = parse_plan(
            r#"{"workflow_type": "bug_fix", "agents_needed": ["frontend", "wizard"],
                "estimated_steps": 0}"#,
        )
        .unwrap();
        assert_eq!(plan.workflow_type, WorkflowType::BugFix);
        assert_eq!(plan.agents_needed, vec![AgentRole::Frontend]);
        assert_eq!(plan.estimated_steps, 1);
    }

    #[test]
    fn unknown_workflow_type_is_unparseable() {
        assert!(parse_plan(r#"{"workflow_type": "rewrite_everything"}"#).is_none());
    }
}
