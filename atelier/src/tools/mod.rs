//! Uniform façade over external capabilities.
//!
//! Agents and the workflow engine invoke VCS, deploy, database-provisioning,
//! and browser-test services only through [`ToolProvider`]; concrete
//! integrations live outside the core. Every operation returns its payload
//! wrapped in a [`ToolOutcome`] carrying `duration_ms` and a `trace_id`.

mod mock;

pub use mock::MockToolProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// The call reached the service and failed there.
    #[error("tool call failed: {0}")]
    Failed(String),
    /// The service could not be reached; retryable.
    #[error("tool unavailable: {0}")]
    Unavailable(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Unavailable(_))
    }
}

/// Payload plus the bookkeeping every tool call returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome<T> {
    pub value: T,
    pub duration_ms: u64,
    pub trace_id: String,
}

impl<T> ToolOutcome<T> {
    pub fn new(value: T, duration_ms: u64) -> Self {
        Self {
            value,
            duration_ms,
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// A created repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoRef {
    pub repo_id: String,
    pub url: String,
}

/// A recorded commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRef {
    pub commit_id: String,
}

/// File contents read from the repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

/// Structured build error extracted from a failed deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildErrorDetail {
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
}

/// Result of a deploy or redeploy attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub succeeded: bool,
    pub url: Option<String>,
    pub build_log: String,
    #[serde(default)]
    pub errors: Vec<BuildErrorDetail>,
}

impl DeployOutcome {
    pub fn success(url: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            url: Some(url.into()),
            build_log: String::new(),
            errors: Vec::new(),
        }
    }

    pub fn failure(build_log: impl Into<String>, errors: Vec<BuildErrorDetail>) -> Self {
        Self {
            succeeded: false,
            url: None,
            build_log: build_log.into(),
            errors,
        }
    }
}

/// A provisioned database project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseProject {
    pub project_id: String,
    pub connection_url: String,
    pub pooled_url: String,
    pub region: String,
    pub branch_id: String,
    pub db_name: String,
}

/// Result of a browser test scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub pass: bool,
    #[serde(default)]
    pub failures: Vec<String>,
}

/// External capability façade. Operations are idempotent on a
/// project-scoped key where the backing service allows it; payloads are
/// passed to agents unchanged.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn create_repo(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<ToolOutcome<RepoRef>, ToolError>;

    async fn commit(
        &self,
        project_key: &str,
        message: &str,
        files: &serde_json::Value,
    ) -> Result<ToolOutcome<CommitRef>, ToolError>;

    async fn read_file(
        &self,
        project_key: &str,
        path: &str,
    ) -> Result<ToolOutcome<FileContent>, ToolError>;

    async fn deploy(
        &self,
        project_key: &str,
        artifact_bundle: &serde_json::Value,
    ) -> Result<ToolOutcome<DeployOutcome>, ToolError>;

    async fn redeploy(&self, project_id: &str) -> Result<ToolOutcome<DeployOutcome>, ToolError>;

    async fn create_database_project(
        &self,
        project_key: &str,
    ) -> Result<ToolOutcome<DatabaseProject>, ToolError>;

    async fn run_scenario(
        &self,
        url: &str,
        steps: &serde_json::Value,
    ) -> Result<ToolOutcome<ScenarioOutcome>, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_carries_trace_id() {
        let a = ToolOutcome::new(1u32, 12);
        let b = ToolOutcome::new(1u32, 12);
        assert_ne!(a.trace_id, b.trace_id);
        assert_eq!(a.duration_ms, 12);
    }

    #[test]
    fn deploy_outcome_constructors() {
        let ok = DeployOutcome::success("https://app.example.dev");
        assert!(ok.succeeded);
        assert_eq!(ok.url.as_deref(), Some("https://app.example.dev"));

        let failed = DeployOutcome::failure(
            "error in src/main.ts",
            vec![BuildErrorDetail {
                file: "src/main.ts".into(),
                line: Some(14),
                message: "type mismatch".into(),
            }],
        );
        assert!(!failed.succeeded);
        assert_eq!(failed.errors.len(), 1);
    }

    #[test]
    fn deploy_outcome_serde_defaults_errors() {
        let json = r#"{"succeeded": true, "url": "https://x", "build_log": ""}"#;
        let outcome: DeployOutcome = serde_json::from_str(json).unwrap();
        assert!(outcome.errors.is_empty());
    }
}
