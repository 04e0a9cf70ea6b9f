//! SQLite-backed session store. Persistent across process restarts.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use crate::message::Platform;
use crate::session::{HistoryEntry, HistoryRole, Session, SessionStore, SessionStoreError};

/// One row per user: history as a JSON column, timestamps in epoch millis.
/// Expiry is enforced on read/write and swept in `active_count`.
pub struct SqliteSessionStore {
    db_path: std::path::PathBuf,
    ttl_ms: i64,
    n_history: usize,
}

fn storage_err(e: impl std::fmt::Display) -> SessionStoreError {
    SessionStoreError::Storage(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn row_to_session(
    user_id: &str,
    platform: &str,
    history_json: &str,
    created_at: i64,
    last_active: i64,
) -> Result<Session, SessionStoreError> {
    let history: Vec<HistoryEntry> = serde_json::from_str(history_json)
        .map_err(|e| SessionStoreError::Serialization(e.to_string()))?;
    let platform = platform
        .parse::<Platform>()
        .unwrap_or(Platform::Chat);
    Ok(Session {
        user_id: user_id.to_string(),
        platform,
        history,
        created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        last_active: chrono::DateTime::from_timestamp_millis(last_active).unwrap_or_else(Utc::now),
    })
}

impl SqliteSessionStore {
    /// Opens or creates the database and table.
    pub fn new(
        path: impl AsRef<Path>,
        ttl: Duration,
        n_history: usize,
    ) -> Result<Self, SessionStoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                history TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active);
            "#,
        )
        .map_err(storage_err)?;
        Ok(Self {
            db_path,
            ttl_ms: ttl.as_millis() as i64,
            n_history,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Session, SessionStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let ttl_ms = self.ttl_ms;
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let now = now_ms();
            let row: Option<(String, String, i64, i64)> = conn
                .query_row(
                    "SELECT platform, history, created_at, last_active FROM sessions WHERE user_id = ?1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(storage_err(other)),
                })?;

            let live = row.filter(|(_, _, _, last_active)| now - last_active <= ttl_ms);
            match live {
                Some((platform_str, history, created_at, _)) => {
                    conn.execute(
                        "UPDATE sessions SET last_active = ?2 WHERE user_id = ?1",
                        params![user_id, now],
                    )
                    .map_err(storage_err)?;
                    row_to_session(&user_id, &platform_str, &history, created_at, now)
                }
                None => {
                    conn.execute(
                        "INSERT OR REPLACE INTO sessions (user_id, platform, history, created_at, last_active)
                         VALUES (?1, ?2, '[]', ?3, ?3)",
                        params![user_id, platform.as_str(), now],
                    )
                    .map_err(storage_err)?;
                    row_to_session(&user_id, platform.as_str(), "[]", now, now)
                }
            }
        })
        .await
        .map_err(storage_err)?
    }

    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        text: &str,
    ) -> Result<(), SessionStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let text = text.to_string();
        let ttl_ms = self.ttl_ms;
        let n_history = self.n_history;
        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let tx = conn.transaction().map_err(storage_err)?;
            let now = now_ms();
            let row: Option<(String, String, i64, i64)> = tx
                .query_row(
                    "SELECT platform, history, created_at, last_active FROM sessions WHERE user_id = ?1",
                    params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(storage_err(other)),
                })?;

            let mut session = match row {
                Some((platform, history, created_at, last_active)) if now - last_active <= ttl_ms => {
                    row_to_session(&user_id, &platform, &history, created_at, last_active)?
                }
                _ => Session::new(&user_id, Platform::Chat),
            };
            session.push_bounded(HistoryEntry::new(role, text), n_history);
            let history_json = serde_json::to_string(&session.history)
                .map_err(|e| SessionStoreError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT OR REPLACE INTO sessions (user_id, platform, history, created_at, last_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    session.platform.as_str(),
                    history_json,
                    session.created_at.timestamp_millis(),
                    now
                ],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    async fn clear(&self, user_id: &str) -> Result<(), SessionStoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn active_count(&self) -> Result<usize, SessionStoreError> {
        let db_path = self.db_path.clone();
        let ttl_ms = self.ttl_ms;
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let cutoff = now_ms() - ttl_ms;
            conn.execute(
                "DELETE FROM sessions WHERE last_active < ?1",
                params![cutoff],
            )
            .map_err(storage_err)?;
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as usize)
        })
        .await
        .map_err(storage_err)?
    }
}
