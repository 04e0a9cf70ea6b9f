//! In-memory session store for tests and embedders with external durability.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::message::Platform;
use crate::session::{HistoryEntry, HistoryRole, Session, SessionStore, SessionStoreError};

pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
    ttl: chrono::Duration,
    n_history: usize,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration, n_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            n_history,
        }
    }

    fn is_expired(&self, session: &Session) -> bool {
        Utc::now() - session.last_active > self.ttl
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Session, SessionStoreError> {
        let mut entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id, platform));
        if self.is_expired(entry.value()) {
            *entry.value_mut() = Session::new(user_id, platform);
        }
        entry.value_mut().last_active = Utc::now();
        Ok(entry.value().clone())
    }

    async fn append(
        &self,
        user_id: &str,
        role: HistoryRole,
        text: &str,
    ) -> Result<(), SessionStoreError> {
        let mut entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id, Platform::Chat));
        if self.is_expired(entry.value()) {
            *entry.value_mut() = Session::new(user_id, entry.value().platform);
        }
        let session = entry.value_mut();
        session.push_bounded(HistoryEntry::new(role, text), self.n_history);
        session.last_active = Utc::now();
        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<(), SessionStoreError> {
        self.sessions.remove(user_id);
        Ok(())
    }

    async fn active_count(&self) -> Result<usize, SessionStoreError> {
        self.sessions.retain(|_, s| Utc::now() - s.last_active <= self.ttl);
        Ok(self.sessions.len())
    }
}
