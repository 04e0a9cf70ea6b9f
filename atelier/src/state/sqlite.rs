//! SQLite-backed orchestrator state store with audit log.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use crate::message::Platform;
use crate::state::{
    AuditEvent, AuditEventType, OrchestratorState, Phase, StateStore, StateStoreError, StepRecord,
    WorkflowType,
};

pub struct SqliteStateStore {
    db_path: std::path::PathBuf,
}

fn storage_err(e: impl std::fmt::Display) -> StateStoreError {
    StateStoreError::Storage(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> StateStoreError {
    StateStoreError::Serialization(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StateStoreError> {
    serde_json::to_string(value).map_err(ser_err)
}

impl SqliteStateStore {
    /// Opens or creates the database, tables, and indexes.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_state (
                user_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                current_phase TEXT NOT NULL,
                workflow_type TEXT NOT NULL,
                original_prompt TEXT NOT NULL,
                agents_needed TEXT NOT NULL,
                accumulated_refinements TEXT NOT NULL,
                current_design_spec TEXT,
                current_implementation TEXT,
                steps_completed TEXT NOT NULL,
                steps_total INTEGER NOT NULL,
                current_agent_working TEXT,
                current_task_description TEXT,
                project_id TEXT,
                project_metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orchestrator_state_is_active
                ON orchestrator_state(is_active);
            CREATE INDEX IF NOT EXISTS idx_orchestrator_state_updated_at
                ON orchestrator_state(updated_at);
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_events_user_id ON audit_events(user_id);
            "#,
        )
        .map_err(storage_err)?;
        Ok(Self { db_path })
    }
}

type StateRow = (
    String,         // platform
    i64,            // is_active
    String,         // current_phase
    String,         // workflow_type
    String,         // original_prompt
    String,         // agents_needed
    String,         // accumulated_refinements
    Option<String>, // current_design_spec
    Option<String>, // current_implementation
    String,         // steps_completed
    i64,            // steps_total
    Option<String>, // current_agent_working
    Option<String>, // current_task_description
    Option<String>, // project_id
    String,         // project_metadata
    i64,            // created_at
    i64,            // updated_at
);

fn row_to_state(user_id: &str, row: StateRow) -> Result<OrchestratorState, StateStoreError> {
    let (
        platform,
        is_active,
        current_phase,
        workflow_type,
        original_prompt,
        agents_needed,
        refinements,
        design_spec,
        implementation,
        steps,
        steps_total,
        current_agent_working,
        current_task_description,
        project_id,
        project_metadata,
        created_at,
        updated_at,
    ) = row;

    let agents_needed: Vec<crate::agent::AgentRole> =
        serde_json::from_str(&agents_needed).map_err(ser_err)?;
    let accumulated_refinements: Vec<String> =
        serde_json::from_str(&refinements).map_err(ser_err)?;
    let steps_completed: Vec<StepRecord> = serde_json::from_str(&steps).map_err(ser_err)?;
    let current_design_spec = design_spec
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(ser_err)?;
    let current_implementation = implementation
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(ser_err)?;
    let project_metadata = serde_json::from_str(&project_metadata).map_err(ser_err)?;

    Ok(OrchestratorState {
        user_id: user_id.to_string(),
        platform: platform.parse::<Platform>().unwrap_or(Platform::Chat),
        is_active: is_active != 0,
        current_phase: current_phase
            .parse::<Phase>()
            .map_err(StateStoreError::Serialization)?,
        workflow_type: workflow_type
            .parse::<WorkflowType>()
            .map_err(StateStoreError::Serialization)?,
        original_prompt,
        agents_needed,
        accumulated_refinements,
        current_design_spec,
        current_implementation,
        steps_completed,
        steps_total: steps_total as u32,
        current_agent_working,
        current_task_description,
        project_id,
        project_metadata,
        created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(&self, state: &OrchestratorState) -> Result<(), StateStoreError> {
        let db_path = self.db_path.clone();
        let state = state.clone();
        let agents_needed = to_json(&state.agents_needed)?;
        let refinements = to_json(&state.accumulated_refinements)?;
        let steps = to_json(&state.steps_completed)?;
        let design_spec = state
            .current_design_spec
            .as_ref()
            .map(to_json)
            .transpose()?;
        let implementation = state
            .current_implementation
            .as_ref()
            .map(to_json)
            .transpose()?;
        let project_metadata = to_json(&state.project_metadata)?;

        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let tx = conn.transaction().map_err(storage_err)?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT updated_at FROM orchestrator_state WHERE user_id = ?1",
                    params![state.user_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(storage_err(other)),
                })?;
            let incoming = state.updated_at.timestamp_millis();
            if matches!(existing, Some(stored) if stored > incoming) {
                return Err(StateStoreError::StaleWrite {
                    user_id: state.user_id.clone(),
                });
            }
            tx.execute(
                r#"
                INSERT OR REPLACE INTO orchestrator_state
                (user_id, platform, is_active, current_phase, workflow_type, original_prompt,
                 agents_needed, accumulated_refinements, current_design_spec,
                 current_implementation, steps_completed, steps_total, current_agent_working,
                 current_task_description, project_id, project_metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                "#,
                params![
                    state.user_id,
                    state.platform.as_str(),
                    state.is_active as i64,
                    state.current_phase.as_str(),
                    state.workflow_type.as_str(),
                    state.original_prompt,
                    agents_needed,
                    refinements,
                    design_spec,
                    implementation,
                    steps,
                    state.steps_total as i64,
                    state.current_agent_working,
                    state.current_task_description,
                    state.project_id,
                    project_metadata,
                    state.created_at.timestamp_millis(),
                    incoming,
                ],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    async fn load(&self, user_id: &str) -> Result<Option<OrchestratorState>, StateStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let row: Option<StateRow> = conn
                .query_row(
                    r#"
                    SELECT platform, is_active, current_phase, workflow_type, original_prompt,
                           agents_needed, accumulated_refinements, current_design_spec,
                           current_implementation, steps_completed, steps_total,
                           current_agent_working, current_task_description, project_id,
                           project_metadata, created_at, updated_at
                    FROM orchestrator_state WHERE user_id = ?1
                    "#,
                    params![user_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                            row.get(12)?,
                            row.get(13)?,
                            row.get(14)?,
                            row.get(15)?,
                            row.get(16)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(storage_err(other)),
                })?;
            row.map(|r| row_to_state(&user_id, r)).transpose()
        })
        .await
        .map_err(storage_err)?
    }

    async fn delete(&self, user_id: &str) -> Result<(), StateStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.execute(
                "DELETE FROM orchestrator_state WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn list_active(&self) -> Result<Vec<String>, StateStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT user_id FROM orchestrator_state WHERE is_active = 1 ORDER BY updated_at ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    async fn append_audit(
        &self,
        user_id: &str,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<(), StateStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let payload = serde_json::to_string(&payload).map_err(ser_err)?;
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.execute(
                "INSERT INTO audit_events (user_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id,
                    event_type.as_str(),
                    payload,
                    Utc::now().timestamp_millis()
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn list_audit(&self, user_id: &str) -> Result<Vec<AuditEvent>, StateStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT event_type, payload, created_at FROM audit_events
                     WHERE user_id = ?1 ORDER BY id ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(storage_err)?;
            let mut events = Vec::new();
            for row in rows {
                let (event_type_str, payload, created_at) = row.map_err(storage_err)?;
                let event_type: AuditEventType =
                    serde_json::from_value(serde_json::Value::String(event_type_str))
                        .map_err(ser_err)?;
                events.push(AuditEvent {
                    user_id: user_id.clone(),
                    event_type,
                    payload: serde_json::from_str(&payload).map_err(ser_err)?,
                    timestamp: chrono::DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                });
            }
            Ok(events)
        })
        .await
        .map_err(storage_err)?
    }

    async fn cleanup_stale(&self, max_age: Duration) -> Result<usize, StateStoreError> {
        let db_path = self.db_path.clone();
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let removed = conn
                .execute(
                    "DELETE FROM orchestrator_state WHERE updated_at < ?1",
                    params![cutoff],
                )
                .map_err(storage_err)?;
            Ok(removed)
        })
        .await
        .map_err(storage_err)?
    }
}
