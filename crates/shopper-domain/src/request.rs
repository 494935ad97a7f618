use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::{LaunchMode, OfferId, RetryScope, StoragePolicy, WorkloadConfig};

/// Auto-retry failover settings for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub scope: RetryScope,
}

/// A request to rent one GPU instance. Shared by the HTTP API, the CLI, and
/// the lifecycle engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub consumer_id: String,

    /// Explicit offer to buy. When absent, the engine picks the cheapest
    /// offer matching the constraints below.
    #[serde(default)]
    pub offer_id: Option<OfferId>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub min_vram_gb: Option<u32>,
    #[serde(default)]
    pub max_price_per_hour: Option<f64>,
    #[serde(default)]
    pub min_gpu_count: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub workload_type: Option<String>,
    pub reservation_hours: u32,
    #[serde(default)]
    pub idle_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub storage_policy: StoragePolicy,

    #[serde(default)]
    pub launch_mode: LaunchMode,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub on_start: Option<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(default)]
    pub workload: Option<WorkloadConfig>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub disk_gb: Option<u32>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Opaque token forwarded to the instance environment as
    /// `SHOPPER_AGENT_TOKEN`; never interpreted by the control plane.
    #[serde(default)]
    pub agent_token: Option<String>,
}

impl CreateSessionRequest {
    /// Reject requests the state machine would refuse later anyway.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.consumer_id.is_empty() {
            return Err(DomainError::InvalidRequest("consumer_id is required".into()));
        }
        if !(1..=12).contains(&self.reservation_hours) {
            return Err(DomainError::InvalidReservationHours(self.reservation_hours));
        }
        if self.launch_mode == LaunchMode::Entrypoint && self.entrypoint.is_empty() {
            return Err(DomainError::InvalidRequest(
                "entrypoint launch mode requires an entrypoint argv".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            consumer_id: "bench".to_string(),
            offer_id: None,
            provider: None,
            gpu_type: Some("RTX 4090".to_string()),
            min_vram_gb: None,
            max_price_per_hour: None,
            min_gpu_count: None,
            location: None,
            workload_type: None,
            reservation_hours: 2,
            idle_threshold_minutes: None,
            storage_policy: StoragePolicy::Destroy,
            launch_mode: LaunchMode::Ssh,
            image: None,
            env: HashMap::new(),
            on_start: None,
            entrypoint: vec![],
            exposed_ports: vec![],
            workload: None,
            template_id: None,
            disk_gb: None,
            retry: RetryPolicy::default(),
            agent_token: None,
        }
    }

    #[test]
    fn reservation_hours_bounds_are_enforced() {
        let mut req = request();
        req.reservation_hours = 0;
        assert!(req.validate().is_err());
        req.reservation_hours = 13;
        assert!(req.validate().is_err());
        req.reservation_hours = 12;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn entrypoint_mode_requires_argv() {
        let mut req = request();
        req.launch_mode = LaunchMode::Entrypoint;
        assert!(req.validate().is_err());
        req.entrypoint = vec!["python".to_string(), "serve.py".to_string()];
        assert!(req.validate().is_ok());
    }
}
