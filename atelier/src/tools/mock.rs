//! Scriptable tool provider for tests and examples.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    BuildErrorDetail, CommitRef, DatabaseProject, DeployOutcome, FileContent, RepoRef,
    ScenarioOutcome, ToolError, ToolOutcome, ToolProvider,
};

/// Deterministic provider: deploy results pop from a script (default
/// success), everything else succeeds with canned values. Call counts are
/// exposed so tests can assert retry behavior.
pub struct MockToolProvider {
    deploy_script: Mutex<VecDeque<DeployOutcome>>,
    deploy_calls: AtomicUsize,
    db_calls: AtomicUsize,
}

impl MockToolProvider {
    pub fn new() -> Self {
        Self {
            deploy_script: Mutex::new(VecDeque::new()),
            deploy_calls: AtomicUsize::new(0),
            db_calls: AtomicUsize::new(0),
        }
    }

    /// Queues the outcome of the next deploy/redeploy call.
    pub async fn push_deploy(&self, outcome: DeployOutcome) {
        self.deploy_script.lock().await.push_back(outcome);
    }

    /// Queues one failed attempt with a single build error.
    pub async fn push_deploy_failure(&self, file: &str, line: u32, message: &str) {
        self.push_deploy(DeployOutcome::failure(
            format!("{file}:{line}: {message}"),
            vec![BuildErrorDetail {
                file: file.to_string(),
                line: Some(line),
                message: message.to_string(),
            }],
        ))
        .await;
    }

    pub fn deploy_calls(&self) -> usize {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn db_calls(&self) -> usize {
        self.db_calls.load(Ordering::SeqCst)
    }

    async fn next_deploy(&self) -> DeployOutcome {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        self.deploy_script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| DeployOutcome::success("https://app.example.dev"))
    }
}

impl Default for MockToolProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for MockToolProvider {
    async fn create_repo(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<ToolOutcome<RepoRef>, ToolError> {
        Ok(ToolOutcome::new(
            RepoRef {
                repo_id: format!("repo-{project_key}"),
                url: format!("https://vcs.example.dev/{name}"),
            },
            5,
        ))
    }

    async fn commit(
        &self,
        project_key: &str,
        _message: &str,
        _files: &serde_json::Value,
    ) -> Result<ToolOutcome<CommitRef>, ToolError> {
        Ok(ToolOutcome::new(
            CommitRef {
                commit_id: format!("c-{project_key}"),
            },
            5,
        ))
    }

    async fn read_file(
        &self,
        _project_key: &str,
        path: &str,
    ) -> Result<ToolOutcome<FileContent>, ToolError> {
        Ok(ToolOutcome::new(
            FileContent {
                path: path.to_string(),
                content: String::new(),
            },
            2,
        ))
    }

    async fn deploy(
        &self,
        _project_key: &str,
        _artifact_bundle: &serde_json::Value,
    ) -> Result<ToolOutcome<DeployOutcome>, ToolError> {
        Ok(ToolOutcome::new(self.next_deploy().await, 50))
    }

    async fn redeploy(&self, _project_id: &str) -> Result<ToolOutcome<DeployOutcome>, ToolError> {
        Ok(ToolOutcome::new(self.next_deploy().await, 30))
    }

    async fn create_database_project(
        &self,
        project_key: &str,
    ) -> Result<ToolOutcome<DatabaseProject>, ToolError> {
        self.db_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome::new(
            DatabaseProject {
                project_id: format!("db-{project_key}"),
                connection_url: format!("postgres://db.example.dev/{project_key}"),
                pooled_url: format!("postgres://pool.example.dev/{project_key}"),
                region: "eu-central-1".into(),
                branch_id: "main".into(),
                db_name: "app".into(),
            },
            40,
        ))
    }

    async fn run_scenario(
        &self,
        _url: &str,
        _steps: &serde_json::Value,
    ) -> Result<ToolOutcome<ScenarioOutcome>, ToolError> {
        Ok(ToolOutcome::new(
            ScenarioOutcome {
                pass: true,
                failures: Vec::new(),
            },
            20,
        ))
    }
}
