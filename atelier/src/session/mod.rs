//! Per-user conversation history with TTL expiry.
//!
//! Sessions feed single-turn replies and classifier context; they are not
//! workflow state. The store owns expiry: reads refresh the TTL, and an
//! expired session is replaced by a fresh one transparently.

mod memory;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Platform;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session storage: {0}")]
    Storage(String),
    #[error("session serialization: {0}")]
    Serialization(String),
}

/// Who produced a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

/// One turn of conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded per-user conversation history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub platform: Platform,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, platform: Platform) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            platform,
            history: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }

    /// Appends one entry, dropping the oldest beyond `n_history`.
    pub fn push_bounded(&mut self, entry: HistoryEntry, n_history: usize) {
        self.history.push(entry);
        if self.history.len() > n_history {
            let overflow = self.history.len() - n_history;
            self.history.drain(..overflow);
        }
    }
}

/// Persistent per-user session store, keyed by `user_id` only.
///
/// TTL and history bound are store construction parameters; every read and
/// write refreshes `last_active`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the live session, creating one (or replacing an expired one)
    /// as needed.
    async fn get_or_create(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Session, SessionStoreError>;

    /// Appends one turn. Creates the session when absent.
    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        text: &str,
    ) -> Result<(), SessionStoreError>;

    /// Drops the session's history and record.
    async fn clear(&self, user_id: &str) -> Result<(), SessionStoreError>;

    /// Number of unexpired sessions.
    async fn active_count(&self) -> Result<usize, SessionStoreError>;
}
