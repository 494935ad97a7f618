use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use shopper_domain::{Session, SessionStatus};
use shopper_provider::ProviderRegistry;
use shopper_store::SessionStore;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Concurrent destroy cap.
    pub max_parallel: usize,
    /// Wall-clock bound on the whole teardown; sessions still outstanding
    /// when it fires count as failures.
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ShutdownSummary {
    pub total: usize,
    pub destroyed: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to list active sessions: {0}")]
    Store(#[from] shopper_store::StoreError),

    #[error("shutdown incomplete: destroyed {destroyed} of {total} sessions, {failed} failed")]
    Incomplete {
        total: usize,
        destroyed: usize,
        failed: usize,
    },
}

/// Graceful teardown: destroy every active session before the process exits,
/// in parallel, bounded, and under a deadline. The whole point of the control
/// plane is that nothing rented survives it unsupervised.
pub struct ShutdownManager {
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
    config: ShutdownConfig,
}

impl ShutdownManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ProviderRegistry>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn graceful_shutdown(&self) -> Result<ShutdownSummary, ShutdownError> {
        let sessions = self.store.get_active_sessions().await?;
        let total = sessions.len();
        if total == 0 {
            return Ok(ShutdownSummary::default());
        }
        info!(total, "graceful shutdown: destroying active sessions");

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut join_set = JoinSet::new();
        for session in sessions {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                destroy_one(store, registry, session).await
            });
        }

        let mut destroyed = 0usize;
        let drain = async {
            while let Some(joined) = join_set.join_next().await {
                if matches!(joined, Ok(true)) {
                    destroyed += 1;
                }
            }
        };
        if tokio::time::timeout(self.config.timeout, drain).await.is_err() {
            warn!(
                timeout_secs = self.config.timeout.as_secs(),
                "shutdown timeout fired with sessions still outstanding"
            );
            join_set.abort_all();
        }

        let failed = total - destroyed;
        let summary = ShutdownSummary {
            total,
            destroyed,
            failed,
        };
        info!(?summary, "graceful shutdown complete");

        if failed == 0 {
            Ok(summary)
        } else {
            Err(ShutdownError::Incomplete {
                total,
                destroyed,
                failed,
            })
        }
    }
}

/// Destroy one session's instance and mark the record stopped. Returns
/// whether the session counts as destroyed.
async fn destroy_one(
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
    mut session: Session,
) -> bool {
    // No provider instance exists, so nothing can leak; stop locally.
    if session.provider_instance_id.is_empty() {
        mark_stopped(&store, &mut session).await;
        return true;
    }

    let provider = match registry.get(&session.provider) {
        Ok(p) => p,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "no adapter for session provider");
            return false;
        }
    };
    match provider.destroy_instance(&session.provider_instance_id).await {
        Ok(()) => {
            mark_stopped(&store, &mut session).await;
            true
        }
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "destroy failed during shutdown");
            false
        }
    }
}

async fn mark_stopped(store: &Arc<dyn SessionStore>, session: &mut Session) {
    if session.transition(SessionStatus::Stopped, Utc::now()).is_ok() {
        if let Err(e) = store.update(session).await {
            warn!(session_id = %session.id, error = %e, "failed to persist stopped state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use shopper_domain::{InstanceTags, LaunchMode, OfferId, RetryScope, SessionId, StoragePolicy};
    use shopper_provider::MockProvider;
    use shopper_store::InMemoryStore;

    fn session(id: &str, instance_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(id),
            consumer_id: "c".to_string(),
            status: if instance_id.is_empty() {
                SessionStatus::Pending
            } else {
                SessionStatus::Running
            },
            error: None,
            provider: "mock".to_string(),
            provider_instance_id: instance_id.to_string(),
            offer_id: OfferId::new("mock-1"),
            gpu_type: "RTX 4090".to_string(),
            gpu_count: 1,
            price_per_hour: 0.4,
            workload_type: None,
            reservation_hours: 2,
            idle_threshold_minutes: None,
            storage_policy: StoragePolicy::Destroy,
            launch_mode: LaunchMode::Ssh,
            ssh_host: if instance_id.is_empty() { String::new() } else { "h".into() },
            ssh_port: if instance_id.is_empty() { 0 } else { 22 },
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
            expires_at: now + ChronoDuration::hours(2),
            stopped_at: None,
        }
    }

    fn tags(session: &str) -> InstanceTags {
        InstanceTags::new(SessionId::new(session), "dep", "c", Utc::now())
    }

    fn manager(
        provider: Arc<MockProvider>,
        store: Arc<InMemoryStore>,
        config: ShutdownConfig,
    ) -> ShutdownManager {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        ShutdownManager::new(store, Arc::new(registry), config)
    }

    #[tokio::test]
    async fn zero_active_sessions_is_a_clean_success() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        let m = manager(provider, store, ShutdownConfig::default());

        let summary = m.graceful_shutdown().await.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.destroyed, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn mixed_outcomes_aggregate_into_counters() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        for (sid, iid) in [("s1", "inst-1"), ("s2", "inst-2"), ("s3", "inst-3")] {
            provider.seed_instance(iid, tags(sid));
            store.create(&session(sid, iid)).await.unwrap();
        }
        provider.fail_destroy_forever("inst-3");

        let m = manager(provider, store.clone(), ShutdownConfig::default());
        let err = m.graceful_shutdown().await.unwrap_err();
        match err {
            ShutdownError::Incomplete {
                total,
                destroyed,
                failed,
            } => {
                assert_eq!(total, 3);
                assert_eq!(destroyed, 2);
                assert_eq!(failed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        let s1 = store.get(&SessionId::new("s1")).await.unwrap().unwrap();
        assert_eq!(s1.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn sessions_without_instances_are_stopped_locally() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        store.create(&session("s1", "")).await.unwrap();

        let m = manager(provider.clone(), store.clone(), ShutdownConfig::default());
        let summary = m.graceful_shutdown().await.unwrap();
        assert_eq!(summary.destroyed, 1);
        assert_eq!(provider.destroy_calls(), 0, "no provider call for empty instance ids");

        let s = store.get(&SessionId::new("s1")).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_outstanding_sessions_as_failed() {
        let provider = Arc::new(MockProvider::new());
        provider.set_destroy_delay(Duration::from_secs(600));
        let store = Arc::new(InMemoryStore::new());
        for (sid, iid) in [("s1", "inst-1"), ("s2", "inst-2")] {
            provider.seed_instance(iid, tags(sid));
            store.create(&session(sid, iid)).await.unwrap();
        }

        let config = ShutdownConfig {
            max_parallel: 5,
            timeout: Duration::from_secs(5),
        };
        let m = manager(provider, store, config);
        let err = m.graceful_shutdown().await.unwrap_err();
        match err {
            ShutdownError::Incomplete {
                total,
                destroyed,
                failed,
            } => {
                assert_eq!(total, 2);
                assert_eq!(destroyed, 0);
                assert_eq!(failed, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn destroyed_plus_failed_always_equals_total() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        for (sid, iid) in [("a", "i-a"), ("b", "i-b"), ("c", ""), ("d", "i-d")] {
            if !iid.is_empty() {
                provider.seed_instance(iid, tags(sid));
            }
            store.create(&session(sid, iid)).await.unwrap();
        }
        provider.fail_destroy_forever("i-b");

        let m = manager(provider, store, ShutdownConfig::default());
        match m.graceful_shutdown().await {
            Ok(summary) => assert_eq!(summary.destroyed + summary.failed, summary.total),
            Err(ShutdownError::Incomplete {
                total,
                destroyed,
                failed,
            }) => assert_eq!(destroyed + failed, total),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
