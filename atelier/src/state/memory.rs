//! In-memory state store for tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::state::{
    AuditEvent, AuditEventType, OrchestratorState, StateStore, StateStoreError,
};

pub struct InMemoryStateStore {
    states: DashMap<String, OrchestratorState>,
    audit: Mutex<Vec<AuditEvent>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            audit: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &OrchestratorState) -> Result<(), StateStoreError> {
        if let Some(existing) = self.states.get(&state.user_id) {
            if existing.updated_at > state.updated_at {
                return Err(StateStoreError::StaleWrite {
                    user_id: state.user_id.clone(),
                });
            }
        }
        self.states.insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<OrchestratorState>, StateStoreError> {
        Ok(self.states.get(user_id).map(|s| s.clone()))
    }

    async fn delete(&self, user_id: &str) -> Result<(), StateStoreError> {
        self.states.remove(user_id);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<String>, StateStoreError> {
        Ok(self
            .states
            .iter()
            .filter(|e| e.value().is_active)
            .map(|e| e.key().clone())
            .collect())
    }

    async fn append_audit(
        &self,
        user_id: &str,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<(), StateStoreError> {
        self.audit.lock().await.push(AuditEvent {
            user_id: user_id.to_string(),
            event_type,
            payload,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(&self, user_id: &str) -> Result<Vec<AuditEvent>, StateStoreError> {
        Ok(self
            .audit
            .lock()
            .await
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn cleanup_stale(&self, max_age: Duration) -> Result<usize, StateStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let before = self.states.len();
        self.states.retain(|_, s| s.updated_at >= cutoff);
        Ok(before - self.states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Platform;
    use crate::state::WorkflowType;

    fn state(user: &str) -> OrchestratorState {
        OrchestratorState::new(user, Platform::Chat, "build", WorkflowType::FullBuild, 5)
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = InMemoryStateStore::new();
        let s = state("u1");
        store.save(&s).await.unwrap();
        assert!(store.load("u1").await.unwrap().is_some());
        store.delete("u1").await.unwrap();
        assert!(store.load("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_write_is_rejected() {
        let store = InMemoryStateStore::new();
        let mut s = state("u1");
        s.updated_at = Utc::now();
        store.save(&s).await.unwrap();

        let mut old = s.clone();
        old.updated_at = s.updated_at - chrono::Duration::seconds(10);
        assert!(matches!(
            store.save(&old).await,
            Err(StateStoreError::StaleWrite { .. })
        ));
    }

    #[tokio::test]
    async fn list_active_filters_inactive() {
        let store = InMemoryStateStore::new();
        let a = state("a");
        let mut b = state("b");
        b.is_active = false;
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        assert_eq!(store.list_active().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn audit_is_append_only_per_user() {
        let store = InMemoryStateStore::new();
        store
            .append_audit("u1", AuditEventType::WorkflowStarted, serde_json::json!({}))
            .await
            .unwrap();
        store
            .append_audit("u2", AuditEventType::WorkflowFailed, serde_json::json!({}))
            .await
            .unwrap();
        let events = store.list_audit("u1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::WorkflowStarted);
    }

    #[tokio::test]
    async fn cleanup_stale_removes_old_records() {
        let store = InMemoryStateStore::new();
        let mut old = state("old");
        old.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.save(&old).await.unwrap();
        store.save(&state("fresh")).await.unwrap();

        let removed = store.cleanup_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("fresh").await.unwrap().is_some());
    }
}
