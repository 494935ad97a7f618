use std::sync::Arc;

use serde::Serialize;
use shopper_domain::SessionId;
use tracing::{info, warn};

/// Drift observations emitted during reconciliation, delivered to an
/// injectable handler. The default handler logs via `tracing`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum ReconcileEvent {
    OrphanFound {
        provider: String,
        instance_id: String,
        session_id: Option<SessionId>,
    },
    OrphanDestroyed {
        provider: String,
        instance_id: String,
    },
    GhostFound {
        provider: String,
        session_id: SessionId,
        instance_id: String,
    },
    GhostFixed {
        provider: String,
        session_id: SessionId,
    },
    ProviderError {
        provider: String,
        error: String,
    },
}

pub type EventHandler = Arc<dyn Fn(&ReconcileEvent) + Send + Sync>;

pub fn logging_event_handler() -> EventHandler {
    Arc::new(|event| match event {
        ReconcileEvent::OrphanFound { provider, instance_id, .. } => {
            warn!(provider, instance_id, "orphan instance found");
        }
        ReconcileEvent::OrphanDestroyed { provider, instance_id } => {
            info!(provider, instance_id, "orphan instance destroyed");
        }
        ReconcileEvent::GhostFound { provider, session_id, instance_id } => {
            warn!(provider, session_id = %session_id, instance_id, "ghost session found");
        }
        ReconcileEvent::GhostFixed { provider, session_id } => {
            info!(provider, session_id = %session_id, "ghost session marked stopped");
        }
        ReconcileEvent::ProviderError { provider, error } => {
            warn!(provider, error, "provider enumeration failed, skipping this tick");
        }
    })
}

/// What one reconciliation tick did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub orphans_found: usize,
    pub orphans_destroyed: usize,
    pub ghosts_found: usize,
    pub ghosts_fixed: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// True when the tick observed no drift and hit no errors.
    pub fn is_clean(&self) -> bool {
        self.orphans_found == 0 && self.ghosts_found == 0 && self.errors.is_empty()
    }
}

/// One stuck session repaired by `recover_stuck_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredSession {
    pub session_id: SessionId,
    pub action: String,
}
