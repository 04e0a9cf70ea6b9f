//! Handoff document persistence.
//!
//! `save_active` is the only write: it supersedes the previous active
//! document for `(user_id, role)` and inserts the new one in a single
//! transaction, so the at-most-one-active invariant holds even across a
//! crash between the two statements.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::params;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::agent::AgentRole;
use crate::handoff::HandoffDocument;

#[derive(Debug, Error)]
pub enum HandoffStoreError {
    #[error("handoff storage: {0}")]
    Storage(String),
    #[error("handoff serialization: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait HandoffStore: Send + Sync {
    /// Persists `doc` as the active document for its `(user_id, role)`,
    /// atomically marking any previous active document inactive.
    async fn save_active(&self, doc: &HandoffDocument) -> Result<(), HandoffStoreError>;

    async fn load(&self, handoff_id: &str) -> Result<Option<HandoffDocument>, HandoffStoreError>;

    /// Latest active document for a role, if any.
    async fn latest_active(
        &self,
        user_id: &str,
        role: AgentRole,
    ) -> Result<Option<HandoffDocument>, HandoffStoreError>;

    /// Full chain for a trace, oldest first.
    async fn chain(&self, trace_id: &str) -> Result<Vec<HandoffDocument>, HandoffStoreError>;

    /// All documents linked to a project, newest first.
    async fn list_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<HandoffDocument>, HandoffStoreError>;
}

/// In-memory store for tests.
pub struct InMemoryHandoffStore {
    docs: Mutex<Vec<HandoffDocument>>,
}

impl InMemoryHandoffStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryHandoffStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandoffStore for InMemoryHandoffStore {
    async fn save_active(&self, doc: &HandoffDocument) -> Result<(), HandoffStoreError> {
        let mut docs = self.docs.lock().await;
        for existing in docs.iter_mut() {
            if existing.user_id == doc.user_id && existing.source_agent.role == doc.source_agent.role
            {
                existing.is_active = false;
            }
        }
        docs.push(doc.clone());
        Ok(())
    }

    async fn load(&self, handoff_id: &str) -> Result<Option<HandoffDocument>, HandoffStoreError> {
        Ok(self
            .docs
            .lock()
            .await
            .iter()
            .find(|d| d.handoff_id == handoff_id)
            .cloned())
    }

    async fn latest_active(
        &self,
        user_id: &str,
        role: AgentRole,
    ) -> Result<Option<HandoffDocument>, HandoffStoreError> {
        Ok(self
            .docs
            .lock()
            .await
            .iter()
            .filter(|d| d.user_id == user_id && d.source_agent.role == role && d.is_active)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn chain(&self, trace_id: &str) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
        let mut chain: Vec<HandoffDocument> = self
            .docs
            .lock()
            .await
            .iter()
            .filter(|d| d.trace_id == trace_id)
            .cloned()
            .collect();
        chain.sort_by_key(|d| d.created_at);
        Ok(chain)
    }

    async fn list_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
        let mut docs: Vec<HandoffDocument> = self
            .docs
            .lock()
            .await
            .iter()
            .filter(|d| d.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect();
        docs.sort_by_key(|d| std::cmp::Reverse(d.created_at));
        Ok(docs)
    }
}

fn storage_err(e: impl std::fmt::Display) -> HandoffStoreError {
    HandoffStoreError::Storage(e.to_string())
}

/// SQLite-backed store. The document body is one JSON column; query fields
/// (user, role, trace, project, active flag, created_at) are indexed columns.
pub struct SqliteHandoffStore {
    db_path: std::path::PathBuf,
}

impl SqliteHandoffStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, HandoffStoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS handoffs (
                handoff_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                project_id TEXT,
                is_active INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_handoffs_user_role_created
                ON handoffs(user_id, role, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_handoffs_trace_id ON handoffs(trace_id);
            CREATE INDEX IF NOT EXISTS idx_handoffs_project_id ON handoffs(project_id);
            "#,
        )
        .map_err(storage_err)?;
        Ok(Self { db_path })
    }
}

fn doc_from_json(json: &str) -> Result<HandoffDocument, HandoffStoreError> {
    serde_json::from_str(json).map_err(|e| HandoffStoreError::Serialization(e.to_string()))
}

#[async_trait]
impl HandoffStore for SqliteHandoffStore {
    async fn save_active(&self, doc: &HandoffDocument) -> Result<(), HandoffStoreError> {
        let db_path = self.db_path.clone();
        let doc = doc.clone();
        let body = serde_json::to_string(&doc)
            .map_err(|e| HandoffStoreError::Serialization(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let tx = conn.transaction().map_err(storage_err)?;
            tx.execute(
                "UPDATE handoffs SET is_active = 0,
                        doc = json_set(doc, '$.is_active', json('false'))
                 WHERE user_id = ?1 AND role = ?2 AND is_active = 1",
                params![doc.user_id, doc.source_agent.role.as_str()],
            )
            .map_err(storage_err)?;
            tx.execute(
                "INSERT INTO handoffs
                 (handoff_id, user_id, role, trace_id, project_id, is_active, created_at, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc.handoff_id,
                    doc.user_id,
                    doc.source_agent.role.as_str(),
                    doc.trace_id,
                    doc.project_id,
                    doc.is_active as i64,
                    doc.created_at.timestamp_millis(),
                    body,
                ],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    async fn load(&self, handoff_id: &str) -> Result<Option<HandoffDocument>, HandoffStoreError> {
        let db_path = self.db_path.clone();
        let handoff_id = handoff_id.to_string();
        let body: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.query_row(
                "SELECT doc FROM handoffs WHERE handoff_id = ?1",
                params![handoff_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(storage_err(other)),
            })
        })
        .await
        .map_err(storage_err)??;
        body.as_deref().map(doc_from_json).transpose()
    }

    async fn latest_active(
        &self,
        user_id: &str,
        role: AgentRole,
    ) -> Result<Option<HandoffDocument>, HandoffStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let body: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.query_row(
                "SELECT doc FROM handoffs
                 WHERE user_id = ?1 AND role = ?2 AND is_active = 1
                 ORDER BY created_at DESC LIMIT 1",
                params![user_id, role.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(storage_err(other)),
            })
        })
        .await
        .map_err(storage_err)??;
        body.as_deref().map(doc_from_json).transpose()
    }

    async fn chain(&self, trace_id: &str) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
        let db_path = self.db_path.clone();
        let trace_id = trace_id.to_string();
        let bodies: Vec<String> = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT doc FROM handoffs WHERE trace_id = ?1 ORDER BY created_at ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![trace_id], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        bodies.iter().map(|b| doc_from_json(b)).collect()
    }

    async fn list_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<HandoffDocument>, HandoffStoreError> {
        let db_path = self.db_path.clone();
        let project_id = project_id.to_string();
        let bodies: Vec<String> = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT doc FROM handoffs WHERE project_id = ?1 ORDER BY created_at DESC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![project_id], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
        .map_err(storage_err)??;
        bodies.iter().map(|b| doc_from_json(b)).collect()
    }
}
