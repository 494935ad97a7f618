use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        SessionId(s.into())
    }

    /// Allocate a fresh random session id.
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable offer id of the form `{provider}-{providerLocalId}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

impl OfferId {
    pub fn new(s: impl Into<String>) -> Self {
        OfferId(s.into())
    }

    pub fn from_parts(provider: &str, local_id: &str) -> Self {
        OfferId(format!("{}-{}", provider, local_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The provider prefix of a composed offer id, if the id has one.
    pub fn provider_part(&self) -> Option<&str> {
        self.0.split_once('-').map(|(p, _)| p)
    }

    /// The provider-local part of a composed offer id.
    pub fn local_part(&self) -> Option<&str> {
        self.0.split_once('-').map(|(_, l)| l)
    }
}

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// The lifecycle state of a session.
///
/// Transitions:
///   Pending → Provisioning | Failed | Stopped
///   Provisioning → Running | Stopping | Stopped | Failed
///   Running → Stopping | Stopped | Failed
///   Stopping → Stopped | Failed
///   Stopped, Failed → (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// Active sessions have (or may soon have) a provider instance behind them.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Provisioning | SessionStatus::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }

    /// Whether `from → to` is a legal state-machine edge.
    pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (from, to) {
            (Pending, Provisioning) | (Pending, Failed) | (Pending, Stopped) => true,
            (Provisioning, Running)
            | (Provisioning, Stopping)
            | (Provisioning, Stopped)
            | (Provisioning, Failed) => true,
            (Running, Stopping) | (Running, Stopped) | (Running, Failed) => true,
            (Stopping, Stopped) | (Stopping, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "provisioning" => Ok(SessionStatus::Provisioning),
            "running" => Ok(SessionStatus::Running),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// What happens to instance storage when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoragePolicy {
    Preserve,
    #[default]
    Destroy,
}

impl std::fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoragePolicy::Preserve => write!(f, "preserve"),
            StoragePolicy::Destroy => write!(f, "destroy"),
        }
    }
}

/// How a replacement offer is chosen during auto-retry failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    /// Same normalized GPU model as the original offer.
    #[default]
    SameGpu,
    /// Any GPU with at least the original offer's VRAM.
    SameVram,
    /// Any offer matching the original request filter.
    Any,
}

impl std::fmt::Display for RetryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryScope::SameGpu => write!(f, "same_gpu"),
            RetryScope::SameVram => write!(f, "same_vram"),
            RetryScope::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Interactive SSH server.
    #[default]
    Ssh,
    /// Run a workload container and expose its ports.
    Entrypoint,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Ssh => write!(f, "ssh"),
            LaunchMode::Entrypoint => write!(f, "entrypoint"),
        }
    }
}

// ── Offers ────────────────────────────────────────────────────────────────────

/// A purchasable offer snapshot from one provider. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOffer {
    /// Stable id: `{provider}-{providerLocalId}`.
    pub id: OfferId,
    pub provider: String,
    /// Provider-local offer id.
    pub provider_offer_id: String,
    /// Normalized GPU model, e.g. "RTX 4090".
    pub gpu_model: String,
    pub gpu_count: u32,
    pub vram_gb: u32,
    pub price_per_hour: f64,
    pub location: String,
    /// Provider-reported reliability in [0, 1].
    pub reliability: f64,
    pub available: bool,
    pub fetched_at: DateTime<Utc>,
    /// Prior on whether this offer is actually available; providers with
    /// known-stale inventory publish < 1.0.
    #[serde(default = "default_confidence")]
    pub availability_confidence: f64,
    #[serde(default)]
    pub cuda_version: Option<f64>,
}

fn default_confidence() -> f64 {
    1.0
}

impl GpuOffer {
    /// Sort key for cheapest-first selection: low-confidence inventory must be
    /// proportionally cheaper to win.
    pub fn effective_price(&self) -> f64 {
        self.price_per_hour / self.availability_confidence.max(f64::EPSILON)
    }
}

/// A selection predicate over offers. An offer matches iff every set
/// constraint holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferFilter {
    pub provider: Option<String>,
    pub gpu_type: Option<String>,
    pub min_vram_gb: Option<u32>,
    pub max_price_per_hour: Option<f64>,
    pub location: Option<String>,
    pub min_reliability: Option<f64>,
    pub min_gpu_count: Option<u32>,
    pub min_availability_confidence: Option<f64>,
    pub min_cuda_version: Option<f64>,
}

impl OfferFilter {
    pub fn matches(&self, offer: &GpuOffer) -> bool {
        if let Some(p) = &self.provider {
            if !offer.provider.eq_ignore_ascii_case(p) {
                return false;
            }
        }
        if let Some(g) = &self.gpu_type {
            if offer.gpu_model != crate::gpu::normalize_gpu_name(g) {
                return false;
            }
        }
        if let Some(v) = self.min_vram_gb {
            if offer.vram_gb < v {
                return false;
            }
        }
        if let Some(p) = self.max_price_per_hour {
            if offer.price_per_hour > p {
                return false;
            }
        }
        if let Some(l) = &self.location {
            if !offer.location.eq_ignore_ascii_case(l) {
                return false;
            }
        }
        if let Some(r) = self.min_reliability {
            if offer.reliability < r {
                return false;
            }
        }
        if let Some(c) = self.min_gpu_count {
            if offer.gpu_count < c {
                return false;
            }
        }
        if let Some(a) = self.min_availability_confidence {
            if offer.availability_confidence < a {
                return false;
            }
        }
        if let Some(cuda) = self.min_cuda_version {
            match offer.cuda_version {
                Some(v) if v >= cuda => {}
                _ => return false,
            }
        }
        true
    }
}

// ── Workload / endpoint ───────────────────────────────────────────────────────

/// Inference workload parameters handed to the provider at create time.
/// The control plane never interprets these; it only forwards them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkloadConfig {
    pub model_id: String,
    pub gpu_memory_fraction: Option<f64>,
    pub quantization: Option<String>,
    pub max_context: Option<u32>,
    pub tensor_parallel: Option<u32>,
}

/// Host/port of the workload API when launch mode is `entrypoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// The persistent control-plane record of one GPU rental lifecycle.
///
/// The SSH private key is deliberately not a field here: it is returned once
/// from session creation and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Caller-supplied grouping key; not unique.
    pub consumer_id: String,
    pub status: SessionStatus,
    pub error: Option<String>,

    // Provisioning attributes
    pub provider: String,
    /// Provider-local instance id. Empty until the adapter assigns one;
    /// immutable once non-empty.
    #[serde(default)]
    pub provider_instance_id: String,
    pub offer_id: OfferId,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    #[serde(default)]
    pub workload_type: Option<String>,
    pub reservation_hours: u32,
    #[serde(default)]
    pub idle_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub storage_policy: StoragePolicy,
    #[serde(default)]
    pub launch_mode: LaunchMode,

    // Access attributes (populated on transition to running)
    #[serde(default)]
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_public_key: String,
    #[serde(default)]
    pub api_endpoint: Option<ApiEndpoint>,

    // Retry metadata
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_scope: RetryScope,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_parent_id: Option<SessionId>,
    #[serde(default)]
    pub retry_child_id: Option<SessionId>,
    /// Offer ids that failed for this session lineage. Joined with commas at
    /// the API boundary.
    #[serde(default)]
    pub failed_offers: Vec<OfferId>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the session to a new status, enforcing the transition table and
    /// the provider-id immutability rule. The single choke point for status
    /// writes.
    pub fn transition(&mut self, to: SessionStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !SessionStatus::can_transition(self.status, to) {
            return Err(DomainError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() && self.stopped_at.is_none() {
            self.stopped_at = Some(now);
        }
        Ok(())
    }

    /// Record the provider-local instance id. Returns an error if a different
    /// id was already assigned.
    pub fn assign_provider_instance(&mut self, instance_id: &str) -> Result<(), DomainError> {
        if !self.provider_instance_id.is_empty() && self.provider_instance_id != instance_id {
            return Err(DomainError::ProviderIdImmutable {
                id: self.id.to_string(),
                existing: self.provider_instance_id.clone(),
            });
        }
        self.provider_instance_id = instance_id.to_string();
        Ok(())
    }

    /// Record SSH access and move to running. Enforces the running-implies-SSH
    /// invariant.
    pub fn mark_running(
        &mut self,
        now: DateTime<Utc>,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<(), DomainError> {
        if host.is_empty() || port == 0 {
            return Err(DomainError::MissingSshCoordinates(self.id.to_string()));
        }
        self.transition(SessionStatus::Running, now)?;
        self.ssh_host = host.to_string();
        self.ssh_port = port;
        self.ssh_user = user.to_string();
        self.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        // Failure is recorded even from states with no legal edge to Failed
        // (terminal states excepted) so that crash-recovery paths can always
        // park a broken session.
        if !self.is_terminal() {
            self.status = SessionStatus::Failed;
            if self.stopped_at.is_none() {
                self.stopped_at = Some(now);
            }
        }
        self.error = Some(message.into());
    }

    /// Move `expires_at` forward by whole hours in [1, 12]. Only valid while
    /// running; extensions never move the deadline backwards.
    pub fn extend(&mut self, additional_hours: u32) -> Result<DateTime<Utc>, DomainError> {
        if !(1..=12).contains(&additional_hours) {
            return Err(DomainError::InvalidReservationHours(additional_hours));
        }
        if self.status != SessionStatus::Running {
            return Err(DomainError::InvalidState {
                id: self.id.to_string(),
                status: self.status,
                action: "extend",
            });
        }
        self.expires_at += Duration::hours(additional_hours as i64);
        Ok(self.expires_at)
    }

    pub fn failed_offers_csv(&self) -> String {
        self.failed_offers
            .iter()
            .map(|o| o.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}
