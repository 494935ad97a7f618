use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use shopper_domain::{
    normalize_gpu_name, GpuOffer, InstanceTags, OfferFilter, OfferId, ProviderInstance,
    LABEL_PREFIX,
};
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{
    CreateInstanceRequest, CreatedInstance, Feature, InstanceState, InstanceStatus, Provider,
};
use crate::rate_limit::RateLimiter;

const PROVIDER: &str = "tensordock";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Operator-level settings for the TensorDock adapter.
#[derive(Clone)]
pub struct TensorDockConfig {
    /// From `TENSORDOCK_AUTH_ID`.
    pub auth_id: String,
    /// From `TENSORDOCK_API_TOKEN`.
    pub api_token: String,
    pub min_request_interval: Duration,
}

impl TensorDockConfig {
    pub fn new(auth_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
            api_token: api_token.into(),
            min_request_interval: Duration::from_secs(1),
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// TensorDock rents whole Ubuntu VMs. Two quirks shape this adapter:
///
/// - SSH is only reachable through the host's port forwarding, so every
///   create includes an explicit `22 → 22` forward and the actual external
///   port is read back from status.
/// - The deploy API's `ssh_key` field is unreliable, so the key is also
///   installed via a cloud-init `runcmd` block.
pub struct TensorDockProvider {
    config: TensorDockConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
}

impl TensorDockProvider {
    pub fn new(config: TensorDockConfig) -> Self {
        let limiter = RateLimiter::every(config.min_request_interval);
        Self {
            config,
            client: reqwest::Client::new(),
            limiter,
            base_url: "https://marketplace.tensordock.com".to_string(),
        }
    }

    /// Point the adapter at a mock server. Used exclusively in tests.
    #[cfg(test)]
    fn with_base_url(config: TensorDockConfig, base_url: impl Into<String>) -> Self {
        let mut p = Self::new(config);
        p.base_url = base_url.into();
        p
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_params(&self) -> [(&'static str, &str); 2] {
        [
            ("api_key", self.config.auth_id.as_str()),
            ("api_token", self.config.api_token.as_str()),
        ]
    }

    fn extract_error(body: &Value) -> String {
        for key in ["error", "message", "detail"] {
            if let Some(s) = body[key].as_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
        body.to_string()
    }

    async fn request_json(
        &self,
        operation: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<Value, ProviderError> {
        self.limiter.acquire().await;
        let resp = builder
            .query(&self.auth_params())
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, operation, e))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let success = (200..300).contains(&status) && body["success"].as_bool().unwrap_or(true);
        if !success {
            let msg = Self::extract_error(&body);
            debug!(operation, status, error = %msg, "tensordock error response");
            return Err(ProviderError::from_status(PROVIDER, operation, status, msg));
        }
        Ok(body)
    }

    /// Cloud-init user data that installs the session key even when the
    /// deploy API's `ssh_key` field is silently dropped.
    fn cloud_init_for_key(public_key: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(public_key);
        format!(
            "#cloud-config\nruncmd:\n  - mkdir -p /root/.ssh\n  - echo {encoded} | base64 -d >> /root/.ssh/authorized_keys\n  - chmod 700 /root/.ssh\n  - chmod 600 /root/.ssh/authorized_keys\n"
        )
    }

    fn instance_from_json(id: &str, vm: &Value) -> ProviderInstance {
        let label = vm["name"].as_str().unwrap_or("").to_string();
        let tags = vm["tags"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect::<HashMap<String, String>>()
            })
            .and_then(|m| InstanceTags::from_map(&m))
            .or_else(|| InstanceTags::from_label(&label).ok());
        let started_at = vm["started_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        ProviderInstance {
            id: id.to_string(),
            label,
            status: vm["status"].as_str().unwrap_or("").to_string(),
            started_at,
            tags,
            price_per_hour: vm["price_per_hour"].as_f64(),
        }
    }
}

/// Turn a TensorDock GPU inventory key like `rtx4090-pcie-24gb` into a
/// canonical model name ("RTX 4090"). Single-letter families stay fused
/// ("a100" is "A100", not "A 100").
fn gpu_model_from_key(key: &str) -> String {
    let family = key.split('-').next().unwrap_or(key);
    let split_at = family
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(family.len());
    let (alpha, digits) = family.split_at(split_at);
    let spaced = if alpha.len() >= 2 && !digits.is_empty() {
        format!("{} {}", alpha, digits)
    } else {
        family.to_string()
    };
    normalize_gpu_name(&spaced)
}

#[async_trait]
impl Provider for TensorDockProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::InstanceTags | Feature::CustomImages)
    }

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<GpuOffer>, ProviderError> {
        let body = self
            .request_json(
                "list_offers",
                self.client.get(self.url("/api/v0/client/deploy/hostnodes")),
            )
            .await?;

        let hostnodes = body["hostnodes"].as_object().ok_or_else(|| {
            ProviderError::invalid_response(PROVIDER, "list_offers", "missing 'hostnodes'")
        })?;

        let fetched_at = Utc::now();
        let mut offers = Vec::new();
        for (hostnode_id, node) in hostnodes {
            let location = node["location"]["country"].as_str().unwrap_or("").to_string();
            let reliability = node["reliability"].as_f64().unwrap_or(1.0);
            let Some(gpus) = node["specs"]["gpu"].as_object() else {
                continue;
            };
            for (gpu_key, gpu) in gpus {
                let amount = gpu["amount"].as_u64().unwrap_or(0) as u32;
                if amount == 0 {
                    continue;
                }
                let local_id = format!("{}:{}", hostnode_id, gpu_key);
                offers.push(GpuOffer {
                    id: OfferId::from_parts(PROVIDER, &local_id),
                    provider: PROVIDER.to_string(),
                    provider_offer_id: local_id,
                    gpu_model: gpu_model_from_key(gpu_key),
                    gpu_count: amount,
                    vram_gb: gpu["vram"].as_u64().unwrap_or(0) as u32,
                    price_per_hour: gpu["price"].as_f64().unwrap_or(0.0),
                    location: location.clone(),
                    reliability,
                    available: true,
                    fetched_at,
                    availability_confidence: 1.0,
                    cuda_version: None,
                });
            }
        }

        Ok(offers.into_iter().filter(|o| filter.matches(o)).collect())
    }

    async fn list_all_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        let body = self
            .request_json("list_instances", self.client.get(self.url("/api/v0/client/list")))
            .await?;

        let vms = body["virtualmachines"].as_object().ok_or_else(|| {
            ProviderError::invalid_response(PROVIDER, "list_instances", "missing 'virtualmachines'")
        })?;

        Ok(vms
            .iter()
            .map(|(id, vm)| Self::instance_from_json(id, vm))
            .filter(|i| i.label.starts_with(LABEL_PREFIX))
            .collect())
    }

    async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        let local = req.offer_id.local_part().ok_or_else(|| {
            ProviderError::invalid_response(
                PROVIDER,
                "create_instance",
                format!("offer id '{}' has no provider-local part", req.offer_id),
            )
        })?;
        let (hostnode, gpu_key) = local.split_once(':').ok_or_else(|| {
            ProviderError::invalid_response(
                PROVIDER,
                "create_instance",
                format!("offer id '{}' is not hostnode:gpu", req.offer_id),
            )
        })?;

        // SSH must always be forwarded; additional exposed ports ride along
        // as identity mappings and their real externals come from status.
        let mut forwards: HashMap<String, String> = HashMap::new();
        forwards.insert("22".to_string(), "22".to_string());
        for port in &req.exposed_ports {
            forwards.insert(port.to_string(), port.to_string());
        }

        let payload = json!({
            "hostnode": hostnode,
            "gpu_model": gpu_key,
            "gpu_count": 1,
            "name": req.tags.to_label(),
            "operating_system": "Ubuntu 22.04 LTS",
            "storage": req.disk_gb.unwrap_or(40),
            "port_forwards": forwards,
            "ssh_key": req.ssh_public_key,
            "cloudinit_script": Self::cloud_init_for_key(&req.ssh_public_key),
            "tags": req.tags.to_map(),
        });

        self.limiter.acquire().await;
        let resp = self
            .client
            .post(self.url("/api/v0/client/deploy/single"))
            .query(&self.auth_params())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, "create_instance", e))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let success = (200..300).contains(&status) && body["success"].as_bool().unwrap_or(false);
        if !success {
            let msg = Self::extract_error(&body);
            return Err(ProviderError::map_create_error(
                PROVIDER,
                "create_instance",
                status,
                msg,
            ));
        }

        let server = &body["server"];
        let instance_id = server["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::invalid_response(PROVIDER, "create_instance", "missing 'server.id'")
            })?;

        Ok(CreatedInstance {
            instance_id,
            ssh_host: server["ip"].as_str().map(String::from),
            ssh_port: None,
        })
    }

    async fn get_instance_status(&self, id: &str) -> Result<InstanceStatus, ProviderError> {
        let body = self
            .request_json(
                "get_instance_status",
                self.client
                    .get(self.url("/api/v0/client/get/single"))
                    .query(&[("server", id)]),
            )
            .await?;

        let vm = &body["virtualmachine"];
        if vm.is_null() {
            return Err(ProviderError::NotFound {
                provider: PROVIDER.to_string(),
                operation: "get_instance_status".to_string(),
                message: id.to_string(),
            });
        }

        let raw_status = vm["status"].as_str().unwrap_or("").to_string();
        let mut port_mappings = HashMap::new();
        if let Some(forwards) = vm["port_forwards"].as_object() {
            for (internal, external) in forwards {
                let Ok(internal) = internal.parse::<u16>() else {
                    continue;
                };
                let external = match external {
                    Value::String(s) => s.parse::<u16>().ok(),
                    Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
                    _ => None,
                };
                if let Some(external) = external {
                    port_mappings.insert(internal, external);
                }
            }
        }

        let ssh_host = vm["ip_address"].as_str().map(String::from);
        // The external SSH port is whatever the host mapped 22 to.
        let ssh_port = port_mappings.get(&22).copied();

        Ok(InstanceStatus {
            state: InstanceState::from_provider(&raw_status),
            raw_status,
            ssh_host,
            ssh_port,
            public_ip: vm["ip_address"].as_str().map(String::from),
            port_mappings,
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError> {
        let result = self
            .request_json(
                "destroy_instance",
                self.client
                    .post(self.url("/api/v0/client/delete/single"))
                    .query(&[("server", id)]),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
