//! Agent identities, lifecycle states, and the capability seam.
//!
//! The core owns agent *lifecycles* (spawn, budget, handoff, termination);
//! what an agent actually says to its model is outside the core. An
//! [`AgentFactory`] bridges the two: the registry asks it for a bus handler
//! whenever a role needs a live instance.

mod llm_agent;
mod registry;
mod token_tracker;

pub use llm_agent::{LlmAgent, LlmAgentFactory};
pub use registry::{AgentRegistry, LifecycleEvent, LifecycleHook, RegistryError};
pub use token_tracker::{OperationRecord, TokenSnapshot, TokenTracker, UsageStatus};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::a2a::AgentHandler;

/// Specialized agent roles.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    Designer,
    Backend,
    Frontend,
    CodeReviewer,
    Qa,
    Devops,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Designer => "designer",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::CodeReviewer => "code-reviewer",
            AgentRole::Qa => "qa",
            AgentRole::Devops => "devops",
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "designer" => Ok(AgentRole::Designer),
            "backend" => Ok(AgentRole::Backend),
            "frontend" => Ok(AgentRole::Frontend),
            "code-reviewer" => Ok(AgentRole::CodeReviewer),
            "qa" => Ok(AgentRole::Qa),
            "devops" => Ok(AgentRole::Devops),
            _ => Err(format!("unknown agent role: {s}")),
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Active,
    Warning,
    Critical,
    HandoffPending,
    HandoffComplete,
    Terminated,
}

/// One live (or terminated) agent instance owned by the registry.
#[derive(Clone, Debug)]
pub struct AgentInstance {
    /// `{role}_v{version}_{8-hex}`; doubles as the bus address.
    pub agent_id: String,
    pub role: AgentRole,
    /// Increments on each handoff within a role.
    pub version: u32,
    pub state: AgentState,
    pub tracker: TokenTracker,
    pub spawn_time: DateTime<Utc>,
    pub predecessor_handoff_id: Option<String>,
}

impl AgentInstance {
    pub fn new(
        role: AgentRole,
        version: u32,
        context_limit: u64,
        warn_fraction: f64,
        crit_fraction: f64,
    ) -> Self {
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        Self {
            agent_id: format!("{}_v{}_{}", role.as_str(), version, suffix),
            role,
            version,
            state: AgentState::Initializing,
            tracker: TokenTracker::new(context_limit, warn_fraction, crit_fraction),
            spawn_time: Utc::now(),
            predecessor_handoff_id: None,
        }
    }

    pub fn usage_fraction(&self) -> f64 {
        self.tracker.usage_fraction()
    }

    /// Whether the instance may take work.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            AgentState::Active | AgentState::Warning | AgentState::Critical
        )
    }
}

/// Produces bus handlers for fresh agent instances.
///
/// The `system_preamble` carries a handoff continuation prompt for
/// successors; `None` for first instances of a role.
pub trait AgentFactory: Send + Sync {
    fn spawn_handler(&self, role: AgentRole, system_preamble: Option<&str>)
        -> Arc<dyn AgentHandler>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_roundtrip() {
        for role in [
            AgentRole::Designer,
            AgentRole::Backend,
            AgentRole::Frontend,
            AgentRole::CodeReviewer,
            AgentRole::Qa,
            AgentRole::Devops,
        ] {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
    }

    #[test]
    fn agent_id_shape() {
        let instance = AgentInstance::new(AgentRole::CodeReviewer, 3, 1000, 0.75, 0.9);
        assert!(instance.agent_id.starts_with("code-reviewer_v3_"));
        let suffix = instance.agent_id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn fresh_instance_is_not_live_until_activated() {
        let mut instance = AgentInstance::new(AgentRole::Qa, 1, 1000, 0.75, 0.9);
        assert_eq!(instance.state, AgentState::Initializing);
        assert!(!instance.is_live());
        instance.state = AgentState::Active;
        assert!(instance.is_live());
        instance.state = AgentState::Terminated;
        assert!(!instance.is_live());
    }
}
