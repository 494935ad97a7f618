use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shopper_domain::{ProviderInstance, SessionStatus};
use shopper_provider::{Provider, ProviderRegistry};
use shopper_store::SessionStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::metrics::ReconcilerMetrics;
use crate::report::{
    logging_event_handler, EventHandler, ReconcileEvent, ReconcileReport, RecoveredSession,
};

/// The drift-repair control loop.
///
/// Each tick compares desired state (active sessions in the store) with
/// observed state (instances enumerated from every provider) and repairs the
/// difference: orphans (provider has, store doesn't) are destroyed, ghosts
/// (store has, provider doesn't) are marked stopped. Instances tagged with a
/// different deployment id belong to another control plane and are ignored
/// entirely.
pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
    deployment_id: String,
    auto_destroy_orphans: bool,
    metrics: Arc<ReconcilerMetrics>,
    events: EventHandler,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ProviderRegistry>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            deployment_id: deployment_id.into(),
            auto_destroy_orphans: true,
            metrics: Arc::new(ReconcilerMetrics::new()),
            events: logging_event_handler(),
        }
    }

    pub fn with_auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy_orphans = auto_destroy;
        self
    }

    pub fn with_event_handler(mut self, events: EventHandler) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(&self) -> Arc<ReconcilerMetrics> {
        self.metrics.clone()
    }

    /// Run ticks on a fixed interval until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.is_clean() {
                        info!(
                            orphans = report.orphans_found,
                            ghosts = report.ghosts_found,
                            errors = report.errors.len(),
                            "reconcile tick repaired drift"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over every enabled provider.
    pub async fn tick(&self) -> ReconcileReport {
        self.metrics.record_tick();
        let mut report = ReconcileReport::default();

        // Enumerate all providers in parallel; a failing provider is skipped
        // for this tick, never aborts the others.
        let mut join_set = JoinSet::new();
        for provider in self.registry.all() {
            join_set.spawn(async move {
                let instances = provider.list_all_instances().await;
                (provider, instances)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (provider, instances) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    self.metrics.record_error();
                    report.errors.push(format!("reconcile task panicked: {}", e));
                    continue;
                }
            };
            match instances {
                Ok(instances) => {
                    if let Err(e) = self
                        .reconcile_provider(provider.as_ref(), &instances, &mut report)
                        .await
                    {
                        self.metrics.record_error();
                        report.errors.push(format!("{}: {}", provider.name(), e));
                    }
                }
                Err(e) => {
                    self.metrics.record_error();
                    (self.events)(&ReconcileEvent::ProviderError {
                        provider: provider.name().to_string(),
                        error: e.to_string(),
                    });
                    report.errors.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        report
    }

    async fn reconcile_provider(
        &self,
        provider: &dyn Provider,
        instances: &[ProviderInstance],
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let name = provider.name();

        let ours: Vec<&ProviderInstance> = instances
            .iter()
            .filter(|i| i.is_ours(&self.deployment_id))
            .collect();

        let sessions: Vec<_> = self
            .store
            .get_active_sessions_by_provider(name)
            .await?
            .into_iter()
            .filter(|s| !s.provider_instance_id.is_empty())
            .collect();

        let known_instance_ids: HashSet<&str> = sessions
            .iter()
            .map(|s| s.provider_instance_id.as_str())
            .collect();
        let observed_ids: HashSet<&str> = ours.iter().map(|i| i.id.as_str()).collect();

        // Orphans: the provider has it, the store doesn't.
        for instance in &ours {
            if known_instance_ids.contains(instance.id.as_str()) {
                continue;
            }
            self.metrics.record_orphan_found();
            report.orphans_found += 1;
            (self.events)(&ReconcileEvent::OrphanFound {
                provider: name.to_string(),
                instance_id: instance.id.clone(),
                session_id: instance.session_id().cloned(),
            });

            if !self.auto_destroy_orphans {
                continue;
            }
            match provider.destroy_instance(&instance.id).await {
                Ok(()) => {
                    self.metrics.record_orphan_destroyed();
                    report.orphans_destroyed += 1;
                    (self.events)(&ReconcileEvent::OrphanDestroyed {
                        provider: name.to_string(),
                        instance_id: instance.id.clone(),
                    });
                }
                Err(e) => {
                    self.metrics.record_error();
                    report
                        .errors
                        .push(format!("destroy orphan {}/{}: {}", name, instance.id, e));
                }
            }
        }

        // Ghosts: the store has it, the provider doesn't.
        for mut session in sessions {
            if observed_ids.contains(session.provider_instance_id.as_str()) {
                continue;
            }
            self.metrics.record_ghost_found();
            report.ghosts_found += 1;
            (self.events)(&ReconcileEvent::GhostFound {
                provider: name.to_string(),
                session_id: session.id.clone(),
                instance_id: session.provider_instance_id.clone(),
            });

            session.transition(SessionStatus::Stopped, Utc::now())?;
            session.error = Some("instance not found on provider".to_string());
            self.store.update(&session).await?;

            self.metrics.record_ghost_fixed();
            report.ghosts_fixed += 1;
            (self.events)(&ReconcileEvent::GhostFixed {
                provider: name.to_string(),
                session_id: session.id.clone(),
            });
        }

        Ok(())
    }

    /// Repair sessions caught mid-transition across a process boundary.
    ///
    /// - `provisioning` with no provider id: nothing to adopt, mark failed.
    /// - `provisioning` whose instance is already running: adopt it.
    /// - `stopping` with a live instance: re-issue the destroy.
    pub async fn recover_stuck_sessions(&self) -> Result<Vec<RecoveredSession>, ReconcileError> {
        let stuck = self
            .store
            .get_sessions_by_status(&[SessionStatus::Provisioning, SessionStatus::Stopping])
            .await?;
        let mut recovered = Vec::new();

        for mut session in stuck {
            let id = session.id.clone();
            match session.status {
                SessionStatus::Provisioning if session.provider_instance_id.is_empty() => {
                    session.mark_failed(Utc::now(), "no provider instance ID");
                    self.store.update(&session).await?;
                    recovered.push(RecoveredSession {
                        session_id: id,
                        action: "marked failed (no provider instance ID)".to_string(),
                    });
                }
                SessionStatus::Provisioning => {
                    let provider = match self.registry.get(&session.provider) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "stuck session references unknown provider");
                            continue;
                        }
                    };
                    match provider.get_instance_status(&session.provider_instance_id).await {
                        Ok(status) if status.ssh_ready() => {
                            let host = status.ssh_host.clone().unwrap_or_default();
                            let port = status.ssh_port.unwrap_or_default();
                            session.mark_running(Utc::now(), &host, port, "root")?;
                            self.store.update(&session).await?;
                            recovered.push(RecoveredSession {
                                session_id: id,
                                action: "adopted running instance".to_string(),
                            });
                        }
                        Ok(status) => {
                            debug!(
                                session_id = %id,
                                status = %status.raw_status,
                                "stuck provisioning session not running yet, leaving for next sweep"
                            );
                        }
                        Err(e) if e.is_not_found() => {
                            // The instance never materialized; the tick loop
                            // would call this a ghost anyway.
                            session.mark_failed(Utc::now(), "instance not found on provider");
                            self.store.update(&session).await?;
                            recovered.push(RecoveredSession {
                                session_id: id,
                                action: "marked failed (instance gone)".to_string(),
                            });
                        }
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "status check failed during recovery");
                        }
                    }
                }
                SessionStatus::Stopping => {
                    let provider = match self.registry.get(&session.provider) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "stuck session references unknown provider");
                            continue;
                        }
                    };
                    match provider.destroy_instance(&session.provider_instance_id).await {
                        Ok(()) => {
                            session.transition(SessionStatus::Stopped, Utc::now())?;
                            self.store.update(&session).await?;
                            recovered.push(RecoveredSession {
                                session_id: id,
                                action: "re-issued destroy".to_string(),
                            });
                        }
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "destroy re-issue failed");
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(recovered)
    }
}
