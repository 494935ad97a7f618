use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shopper_domain::{
    GpuOffer, InstanceTags, LaunchMode, OfferFilter, OfferId, ProviderInstance, SessionId,
    WorkloadConfig,
};

use crate::error::ProviderError;

/// Optional capabilities an adapter may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Key/value instance metadata beyond the single free-form label.
    InstanceTags,
    SpotPricing,
    CustomImages,
    IdleDetection,
}

/// Everything an adapter needs to create one instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub offer_id: OfferId,
    pub session_id: SessionId,
    /// OpenSSH-encoded public key installed on the instance.
    pub ssh_public_key: String,
    pub image: Option<String>,
    pub env: HashMap<String, String>,
    pub on_start: Option<String>,
    pub tags: InstanceTags,
    pub launch_mode: LaunchMode,
    pub entrypoint: Vec<String>,
    pub exposed_ports: Vec<u16>,
    pub workload: Option<WorkloadConfig>,
    pub template_id: Option<String>,
    pub disk_gb: Option<u32>,
}

/// Result of a create call. Provisional: the instance is not running yet and
/// the SSH coordinates, when present, may still change.
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
}

/// Coarse instance state parsed from the provider's status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Running,
    Exited,
    Failed,
    Unknown,
}

impl InstanceState {
    pub fn from_provider(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        match lower.as_str() {
            "running" | "active" => InstanceState::Running,
            "exited" | "stopped" | "terminated" => InstanceState::Exited,
            "failed" | "error" => InstanceState::Failed,
            "loading" | "creating" | "starting" | "pending" | "provisioning" | "booting" => {
                InstanceState::Provisioning
            }
            _ => InstanceState::Unknown,
        }
    }
}

/// Current observed status of one instance.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub state: InstanceState,
    /// The provider's status string verbatim, for error messages.
    pub raw_status: String,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub public_ip: Option<String>,
    /// internal port → externally exposed port, for providers that assign
    /// bindings dynamically.
    pub port_mappings: HashMap<u16, u16>,
}

impl InstanceStatus {
    pub fn ssh_ready(&self) -> bool {
        self.state == InstanceState::Running
            && self.ssh_host.as_deref().map_or(false, |h| !h.is_empty())
            && self.ssh_port.map_or(false, |p| p > 0)
    }
}

/// The normalized adapter contract every GPU provider implements.
///
/// Adapters are thread-safe for concurrent calls; the internal rate limiter
/// is the only serializing point. Every method may suspend on HTTP I/O and
/// is cancel-safe: dropping the future abandons the call.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn supports(&self, feature: Feature) -> bool;

    /// Offers currently purchasable on this provider that match the filter.
    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<GpuOffer>, ProviderError>;

    /// Every instance on this provider account whose label carries the
    /// shopper prefix. Used by the reconciler.
    async fn list_all_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError>;

    /// Start creating an instance. Returns as soon as the provider accepted
    /// the request; callers poll [`get_instance_status`](Self::get_instance_status)
    /// until it is running.
    async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError>;

    async fn get_instance_status(&self, id: &str) -> Result<InstanceStatus, ProviderError>;

    /// Destroy an instance. Idempotent: "not found" counts as success.
    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError>;
}

// ── Templates (optional capability) ───────────────────────────────────────────

/// A reusable provider-side image template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub hash_id: String,
    pub name: String,
    pub image: String,
    /// The template's declared run type ("ssh", "jupyter", "args"). Creates
    /// always force SSH-proxy regardless; this field is informational.
    pub run_type: String,
    /// Heavy images get an extended provisioning deadline.
    #[serde(default)]
    pub heavy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub name_contains: Option<String>,
}

impl TemplateFilter {
    pub fn matches(&self, template: &Template) -> bool {
        match &self.name_contains {
            Some(needle) => template
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Adapters that support reusable image templates.
#[async_trait]
pub trait TemplateProvider: Provider {
    async fn list_templates(
        &self,
        filter: &TemplateFilter,
    ) -> Result<Vec<Template>, ProviderError>;

    /// Fails with [`ProviderError::TemplateNotFound`] when no template has
    /// the given hash id.
    async fn get_template(&self, hash_id: &str) -> Result<Template, ProviderError>;

    async fn get_compatible_templates(
        &self,
        offer_id: &OfferId,
    ) -> Result<Vec<Template>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_parses_common_provider_strings() {
        assert_eq!(InstanceState::from_provider("running"), InstanceState::Running);
        assert_eq!(InstanceState::from_provider("Running"), InstanceState::Running);
        assert_eq!(InstanceState::from_provider("exited"), InstanceState::Exited);
        assert_eq!(InstanceState::from_provider("loading"), InstanceState::Provisioning);
        assert_eq!(InstanceState::from_provider("weird"), InstanceState::Unknown);
    }

    #[test]
    fn ssh_ready_requires_running_plus_coordinates() {
        let status = |state, host: Option<&str>, port| InstanceStatus {
            state,
            raw_status: String::new(),
            ssh_host: host.map(String::from),
            ssh_port: port,
            public_ip: None,
            port_mappings: HashMap::new(),
        };
        assert!(status(InstanceState::Running, Some("h"), Some(22)).ssh_ready());
        assert!(!status(InstanceState::Running, Some(""), Some(22)).ssh_ready());
        assert!(!status(InstanceState::Running, Some("h"), None).ssh_ready());
        assert!(!status(InstanceState::Provisioning, Some("h"), Some(22)).ssh_ready());
    }
}
