use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shopper_reconciler::Reconciler;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// Bound on the whole boot sweep (stuck recovery + one reconcile tick).
    pub timeout: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupMetrics {
    pub stuck_recovered: usize,
    pub orphans_found: usize,
    pub orphans_destroyed: usize,
    pub ghosts_fixed: usize,
    pub completed_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
}

/// Runs exactly one boot-time sweep: recover sessions stuck mid-transition
/// from the previous process, then one reconciliation tick to clean orphans
/// left by a crash.
pub struct StartupManager {
    reconciler: Arc<Reconciler>,
    config: StartupConfig,
    sweep_complete: AtomicBool,
    // Hot reads from the status endpoint, one write at boot.
    metrics: RwLock<StartupMetrics>,
}

impl StartupManager {
    pub fn new(reconciler: Arc<Reconciler>, config: StartupConfig) -> Self {
        Self {
            reconciler,
            config,
            sweep_complete: AtomicBool::new(false),
            metrics: RwLock::new(StartupMetrics::default()),
        }
    }

    /// Sticky: set once the sweep finishes (or times out) and never cleared.
    pub fn is_sweep_complete(&self) -> bool {
        self.sweep_complete.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> StartupMetrics {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }

    pub async fn run_sweep(&self) -> StartupMetrics {
        let reconciler = self.reconciler.clone();
        let sweep = async move {
            // A failed stuck recovery must not prevent the reconcile pass.
            let stuck_recovered = match reconciler.recover_stuck_sessions().await {
                Ok(recovered) => {
                    for r in &recovered {
                        info!(session_id = %r.session_id, action = %r.action, "recovered stuck session");
                    }
                    recovered.len()
                }
                Err(e) => {
                    warn!(error = %e, "stuck session recovery failed, continuing with reconcile");
                    0
                }
            };
            let report = reconciler.tick().await;
            (stuck_recovered, report)
        };

        let mut metrics = StartupMetrics::default();
        match tokio::time::timeout(self.config.timeout, sweep).await {
            Ok((stuck_recovered, report)) => {
                metrics.stuck_recovered = stuck_recovered;
                metrics.orphans_found = report.orphans_found;
                metrics.orphans_destroyed = report.orphans_destroyed;
                metrics.ghosts_fixed = report.ghosts_fixed;
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.timeout.as_secs(),
                    "startup sweep timed out"
                );
                metrics.timed_out = true;
            }
        }
        metrics.completed_at = Some(Utc::now());

        *self.metrics.write().expect("metrics lock poisoned") = metrics.clone();
        self.sweep_complete.store(true, Ordering::SeqCst);
        info!(?metrics, "startup sweep complete");
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use shopper_domain::{
        InstanceTags, LaunchMode, OfferId, RetryScope, Session, SessionId, SessionStatus,
        StoragePolicy,
    };
    use shopper_provider::{MockProvider, ProviderRegistry};
    use shopper_store::{InMemoryStore, SessionStore};

    const DEPLOYMENT: &str = "dep-test";

    fn stuck_session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(id),
            consumer_id: "c".to_string(),
            status: SessionStatus::Provisioning,
            error: None,
            provider: "mock".to_string(),
            provider_instance_id: String::new(),
            offer_id: OfferId::new("mock-1"),
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
            expires_at: now + ChronoDuration::hours(2),
            stopped_at: None,
        }
    }

    fn build(provider: Arc<MockProvider>, store: Arc<InMemoryStore>) -> StartupManager {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let reconciler = Arc::new(Reconciler::new(store, Arc::new(registry), DEPLOYMENT));
        StartupManager::new(reconciler, StartupConfig::default())
    }

    #[tokio::test]
    async fn sweep_recovers_stuck_sessions_and_cleans_orphans() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_instance(
            "inst-orphan",
            InstanceTags::new(SessionId::new("S9"), DEPLOYMENT, "c", Utc::now()),
        );
        let store = Arc::new(InMemoryStore::new());
        store.create(&stuck_session("S1")).await.unwrap();

        let manager = build(provider.clone(), store.clone());
        assert!(!manager.is_sweep_complete());

        let metrics = manager.run_sweep().await;
        assert_eq!(metrics.stuck_recovered, 1);
        assert_eq!(metrics.orphans_destroyed, 1);
        assert!(!metrics.timed_out);
        assert!(manager.is_sweep_complete());

        let s = store.get(&SessionId::new("S1")).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(provider.destroyed_ids(), vec!["inst-orphan".to_string()]);
    }

    #[tokio::test]
    async fn sweep_flag_is_sticky() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        let manager = build(provider, store);

        manager.run_sweep().await;
        assert!(manager.is_sweep_complete());
        manager.run_sweep().await;
        assert!(manager.is_sweep_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_timeout_still_sets_the_flag() {
        let provider = Arc::new(MockProvider::new());
        provider.set_destroy_delay(Duration::from_secs(600));
        provider.seed_instance(
            "inst-orphan",
            InstanceTags::new(SessionId::new("S9"), DEPLOYMENT, "c", Utc::now()),
        );
        let store = Arc::new(InMemoryStore::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let reconciler = Arc::new(Reconciler::new(store, Arc::new(registry), DEPLOYMENT));
        let manager = StartupManager::new(
            reconciler,
            StartupConfig {
                timeout: Duration::from_secs(5),
            },
        );

        let metrics = manager.run_sweep().await;
        assert!(metrics.timed_out);
        assert!(manager.is_sweep_complete());
    }
}
