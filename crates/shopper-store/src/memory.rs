use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shopper_domain::{Session, SessionId, SessionStatus};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::SessionStore;

/// In-memory implementation of [`SessionStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral runs.
/// The single write lock serializes updates across all sessions, which
/// trivially satisfies the per-session serialization requirement.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&session.id) {
            return Err(StoreError::SessionExists(session.id.to_string()));
        }
        guard.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.contains_key(&session.id) {
            return Err(StoreError::SessionNotFound(session.id.to_string()));
        }
        guard.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.values().filter(|s| s.is_active()).cloned().collect())
    }

    async fn get_active_sessions_by_provider(
        &self,
        provider: &str,
    ) -> Result<Vec<Session>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .filter(|s| s.is_active() && s.provider == provider)
            .cloned()
            .collect())
    }

    async fn get_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let guard = self.inner.read().await;
        let mut all: Vec<Session> = guard.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shopper_domain::{LaunchMode, OfferId, RetryScope, StoragePolicy};

    fn dummy_session(id: &str, status: SessionStatus, provider: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(id),
            consumer_id: "test".to_string(),
            status,
            error: None,
            provider: provider.to_string(),
            provider_instance_id: String::new(),
            offer_id: OfferId::from_parts(provider, "1"),
            gpu_type: "RTX 4090".to_string(),
            gpu_count: 1,
            price_per_hour: 0.4,
            workload_type: None,
            reservation_hours: 2,
            idle_threshold_minutes: None,
            storage_policy: StoragePolicy::Destroy,
            launch_mode: LaunchMode::Ssh,
            ssh_host: String::new(),
            ssh_port: 0,
            ssh_user: String::new(),
            ssh_public_key: String::new(),
            api_endpoint: None,
            auto_retry: false,
            max_retries: 0,
            retry_scope: RetryScope::SameGpu,
            retry_count: 0,
            retry_parent_id: None,
            retry_child_id: None,
            failed_offers: vec![],
            created_at: now,
            expires_at: now + Duration::hours(2),
            stopped_at: None,
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryStore::new();
        store
            .create(&dummy_session("s1", SessionStatus::Pending, "mock"))
            .await
            .unwrap();

        let got = store.get(&SessionId::new("s1")).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().id.as_str(), "s1");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryStore::new();
        let s = dummy_session("dup", SessionStatus::Pending, "mock");
        store.create(&s).await.unwrap();
        assert!(matches!(
            store.create(&s).await,
            Err(StoreError::SessionExists(_))
        ));
    }

    #[tokio::test]
    async fn update_unknown_session_fails() {
        let store = InMemoryStore::new();
        let s = dummy_session("ghost", SessionStatus::Running, "mock");
        assert!(matches!(
            store.update(&s).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn active_queries_filter_by_status_and_provider() {
        let store = InMemoryStore::new();
        store
            .create(&dummy_session("a", SessionStatus::Running, "vastai"))
            .await
            .unwrap();
        store
            .create(&dummy_session("b", SessionStatus::Provisioning, "tensordock"))
            .await
            .unwrap();
        store
            .create(&dummy_session("c", SessionStatus::Stopped, "vastai"))
            .await
            .unwrap();

        assert_eq!(store.get_active_sessions().await.unwrap().len(), 2);
        assert_eq!(
            store
                .get_active_sessions_by_provider("vastai")
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .get_sessions_by_status(&[SessionStatus::Stopped, SessionStatus::Failed])
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
