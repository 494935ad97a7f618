use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use shopper_domain::{
    normalize_gpu_name, GpuOffer, InstanceTags, LaunchMode, OfferFilter, OfferId,
    ProviderInstance, LABEL_PREFIX,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{
    CreateInstanceRequest, CreatedInstance, Feature, InstanceState, InstanceStatus, Provider,
    Template, TemplateFilter, TemplateProvider,
};
use crate::rate_limit::RateLimiter;

const PROVIDER: &str = "vastai";

/// Vast.ai is a spot marketplace; listed offers regularly vanish between
/// listing and create, so its inventory is published with reduced confidence.
const OFFER_CONFIDENCE: f64 = 0.85;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Operator-level settings for the Vast.ai adapter.
#[derive(Clone)]
pub struct VastAiConfig {
    /// API key from `VASTAI_API_KEY`.
    pub api_key: String,
    /// Minimum gap between API requests. Vast.ai throttles aggressively.
    pub min_request_interval: Duration,
}

impl VastAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            min_request_interval: Duration::from_secs(1),
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct VastAiProvider {
    config: VastAiConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
    /// Templates are cached after the first successful fetch.
    template_cache: RwLock<Option<Vec<Template>>>,
}

impl VastAiProvider {
    pub fn new(config: VastAiConfig) -> Self {
        let limiter = RateLimiter::every(config.min_request_interval);
        Self {
            config,
            client: reqwest::Client::new(),
            limiter,
            base_url: "https://console.vast.ai".to_string(),
            template_cache: RwLock::new(None),
        }
    }

    /// Point the adapter at a mock server. Used exclusively in tests.
    #[cfg(test)]
    fn with_base_url(config: VastAiConfig, base_url: impl Into<String>) -> Self {
        let mut p = Self::new(config);
        p.base_url = base_url.into();
        p
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Pull a human-readable message out of a Vast.ai error body. The API
    /// uses `error`, `msg`, and `detail` interchangeably.
    fn extract_error(body: &Value) -> String {
        for key in ["error", "msg", "detail", "message"] {
            if let Some(s) = body[key].as_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
        body.to_string()
    }

    /// Rate-limit, send, and decode one API call, mapping failures onto the
    /// uniform taxonomy.
    async fn request_json(
        &self,
        operation: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<Value, ProviderError> {
        self.limiter.acquire().await;
        let resp = builder
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, operation, e))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            let msg = Self::extract_error(&body);
            debug!(operation, status, error = %msg, "vast.ai error response");
            return Err(ProviderError::from_status(PROVIDER, operation, status, msg));
        }
        Ok(body)
    }

    fn offer_from_bundle(bundle: &Value) -> Option<GpuOffer> {
        let local_id = match &bundle["id"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return None,
        };
        let gpu_name = bundle["gpu_name"].as_str()?;
        let vram_mb = bundle["gpu_ram"].as_f64().unwrap_or(0.0);

        Some(GpuOffer {
            id: OfferId::from_parts(PROVIDER, &local_id),
            provider: PROVIDER.to_string(),
            provider_offer_id: local_id,
            gpu_model: normalize_gpu_name(gpu_name),
            gpu_count: bundle["num_gpus"].as_u64().unwrap_or(1) as u32,
            vram_gb: (vram_mb / 1024.0).round() as u32,
            price_per_hour: bundle["dph_total"].as_f64().unwrap_or(0.0),
            location: bundle["geolocation"].as_str().unwrap_or("").to_string(),
            reliability: bundle["reliability2"].as_f64().unwrap_or(0.0),
            available: bundle["rentable"].as_bool().unwrap_or(false),
            fetched_at: Utc::now(),
            availability_confidence: OFFER_CONFIDENCE,
            cuda_version: bundle["cuda_max_good"].as_f64(),
        })
    }

    fn instance_from_json(inst: &Value) -> Option<ProviderInstance> {
        let id = match &inst["id"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return None,
        };
        let label = inst["label"].as_str().unwrap_or("").to_string();
        let started_at = inst["start_date"]
            .as_f64()
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0));
        Some(ProviderInstance {
            id,
            tags: InstanceTags::from_label(&label).ok(),
            label,
            status: inst["actual_status"].as_str().unwrap_or("").to_string(),
            started_at,
            price_per_hour: inst["dph_total"].as_f64(),
        })
    }

    /// Attach the session SSH key in a follow-up call. Key propagation on the
    /// instance takes ~10-15 s, so callers must keep polling SSH afterwards.
    ///
    /// Failure here is non-fatal: the instance already exists and a broken
    /// key attach will surface at SSH verification, not before.
    async fn attach_ssh_key(&self, instance_id: &str, public_key: &str) {
        let url = self.url(&format!("/api/v0/instances/{}/ssh/", instance_id));
        let result = self
            .request_json(
                "attach_ssh_key",
                self.client.post(&url).json(&json!({ "ssh_key": public_key })),
            )
            .await;
        if let Err(e) = result {
            warn!(instance_id, error = %e, "vast.ai SSH key attach failed; relying on SSH verification");
        }
    }

    async fn fetch_templates(&self) -> Result<Vec<Template>, ProviderError> {
        if let Some(cached) = self.template_cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let body = self
            .request_json("list_templates", self.client.get(self.url("/api/v0/templates/")))
            .await?;
        let templates: Vec<Template> = body["templates"]
            .as_array()
            .ok_or_else(|| {
                ProviderError::invalid_response(PROVIDER, "list_templates", "missing 'templates'")
            })?
            .iter()
            .filter_map(|t| {
                Some(Template {
                    hash_id: t["hash_id"].as_str()?.to_string(),
                    name: t["name"].as_str().unwrap_or("").to_string(),
                    image: t["image"].as_str().unwrap_or("").to_string(),
                    run_type: t["runtype"].as_str().unwrap_or("ssh").to_string(),
                    heavy: t["heavy"].as_bool().unwrap_or(false),
                })
            })
            .collect();

        *self.template_cache.write().await = Some(templates.clone());
        Ok(templates)
    }
}

/// Parse Vast.ai port bindings (`{"22/tcp": [{"HostIp": ..., "HostPort": ...}]}`)
/// into an internal-port → external-port map. Invalid or empty bindings are
/// skipped, never errored.
fn parse_port_bindings(ports: &Value) -> HashMap<u16, u16> {
    let mut mappings = HashMap::new();
    let Some(obj) = ports.as_object() else {
        return mappings;
    };
    for (spec, bindings) in obj {
        let Some(internal) = spec.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let Some(first) = bindings.as_array().and_then(|a| a.first()) else {
            continue;
        };
        let external = match &first["HostPort"] {
            Value::String(s) => s.parse::<u16>().ok(),
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            _ => None,
        };
        if let Some(external) = external {
            mappings.insert(internal, external);
        }
    }
    mappings
}

#[async_trait]
impl Provider for VastAiProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::SpotPricing | Feature::CustomImages)
    }

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<GpuOffer>, ProviderError> {
        let url = self.url("/api/v0/bundles/");
        let body = self
            .request_json(
                "list_offers",
                self.client.get(&url).query(&[("rentable", "true")]),
            )
            .await?;

        let offers = body["offers"]
            .as_array()
            .ok_or_else(|| {
                ProviderError::invalid_response(PROVIDER, "list_offers", "missing 'offers'")
            })?
            .iter()
            .filter_map(Self::offer_from_bundle)
            .filter(|o| o.available && filter.matches(o))
            .collect();
        Ok(offers)
    }

    async fn list_all_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        let body = self
            .request_json("list_instances", self.client.get(self.url("/api/v0/instances/")))
            .await?;

        let instances = body["instances"]
            .as_array()
            .ok_or_else(|| {
                ProviderError::invalid_response(PROVIDER, "list_instances", "missing 'instances'")
            })?
            .iter()
            .filter_map(Self::instance_from_json)
            .filter(|i| i.label.starts_with(LABEL_PREFIX))
            .collect();
        Ok(instances)
    }

    async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        let local_id = req.offer_id.local_part().ok_or_else(|| {
            ProviderError::invalid_response(
                PROVIDER,
                "create_instance",
                format!("offer id '{}' has no provider-local part", req.offer_id),
            )
        })?;

        let mut payload = json!({
            "label": req.tags.to_label(),
            "disk": req.disk_gb.unwrap_or(40),
        });

        if let Some(template_id) = &req.template_id {
            // Template creates send the reference instead of a locally built
            // image/env/args payload. The run type is forced to SSH-proxy
            // regardless of what the template declares: `jupyter` and `args`
            // templates would otherwise come up without SSH access.
            payload["template_hash_id"] = json!(template_id);
            payload["runtype"] = json!("ssh ssh_proxy");
        } else {
            payload["image"] = json!(req
                .image
                .clone()
                .unwrap_or_else(|| "vastai/base-image:cuda-12.4".to_string()));
            payload["env"] = json!(req.env);
            if let Some(on_start) = &req.on_start {
                payload["onstart"] = json!(on_start);
            }
            match req.launch_mode {
                LaunchMode::Ssh => {
                    payload["runtype"] = json!("ssh");
                }
                LaunchMode::Entrypoint => {
                    payload["runtype"] = json!("args");
                    payload["args"] = json!(req.entrypoint);
                }
            }
            if !req.exposed_ports.is_empty() {
                payload["ports"] = json!(req
                    .exposed_ports
                    .iter()
                    .map(|p| format!("{}/tcp", p))
                    .collect::<Vec<_>>());
            }
        }

        let url = self.url(&format!("/api/v0/asks/{}/", local_id));

        self.limiter.acquire().await;
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, "create_instance", e))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        let accepted = (200..300).contains(&status) && body["success"].as_bool().unwrap_or(true);
        if !accepted {
            let msg = Self::extract_error(&body);
            return Err(ProviderError::map_create_error(
                PROVIDER,
                "create_instance",
                status,
                msg,
            ));
        }

        let instance_id = match &body["new_contract"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => {
                return Err(ProviderError::invalid_response(
                    PROVIDER,
                    "create_instance",
                    "missing 'new_contract'",
                ))
            }
        };

        self.attach_ssh_key(&instance_id, &req.ssh_public_key).await;

        Ok(CreatedInstance {
            instance_id,
            ssh_host: None,
            ssh_port: None,
        })
    }

    async fn get_instance_status(&self, id: &str) -> Result<InstanceStatus, ProviderError> {
        let body = self
            .request_json(
                "get_instance_status",
                self.client.get(self.url(&format!("/api/v0/instances/{}/", id))),
            )
            .await?;
        let inst = &body["instances"];
        if inst.is_null() {
            return Err(ProviderError::NotFound {
                provider: PROVIDER.to_string(),
                operation: "get_instance_status".to_string(),
                message: id.to_string(),
            });
        }

        let raw_status = inst["actual_status"].as_str().unwrap_or("").to_string();
        let port_mappings = parse_port_bindings(&inst["ports"]);
        let ssh_port = inst["ssh_port"]
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| port_mappings.get(&22).copied());

        Ok(InstanceStatus {
            state: InstanceState::from_provider(&raw_status),
            raw_status,
            ssh_host: inst["ssh_host"].as_str().map(String::from),
            ssh_port,
            public_ip: inst["public_ipaddr"].as_str().map(String::from),
            port_mappings,
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("/api/v0/instances/{}/", id));
        match self.request_json("destroy_instance", self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            // Already gone counts as destroyed.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TemplateProvider for VastAiProvider {
    async fn list_templates(
        &self,
        filter: &TemplateFilter,
    ) -> Result<Vec<Template>, ProviderError> {
        Ok(self
            .fetch_templates()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect())
    }

    async fn get_template(&self, hash_id: &str) -> Result<Template, ProviderError> {
        self.fetch_templates()
            .await?
            .into_iter()
            .find(|t| t.hash_id == hash_id)
            .ok_or_else(|| ProviderError::TemplateNotFound {
                provider: PROVIDER.to_string(),
                template: hash_id.to_string(),
            })
    }

    async fn get_compatible_templates(
        &self,
        offer_id: &OfferId,
    ) -> Result<Vec<Template>, ProviderError> {
        let local_id = offer_id.local_part().unwrap_or(offer_id.as_str());
        let body = self
            .request_json(
                "get_compatible_templates",
                self.client
                    .get(self.url(&format!("/api/v0/asks/{}/templates/", local_id))),
            )
            .await?;

        let compatible: Vec<String> = body["template_hash_ids"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(self
            .fetch_templates()
            .await?
            .into_iter()
            .filter(|t| compatible.contains(&t.hash_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopper_domain::SessionId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> VastAiProvider {
        let mut config = VastAiConfig::new("test-key");
        config.min_request_interval = Duration::from_millis(0);
        VastAiProvider::with_base_url(config, server.uri())
    }

    fn create_req(template: Option<&str>) -> CreateInstanceRequest {
        CreateInstanceRequest {
            offer_id: OfferId::from_parts(PROVIDER, "42"),
            session_id: SessionId::new("s1"),
            ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
            image: Some("pytorch/pytorch:latest".to_string()),
            env: HashMap::new(),
            on_start: None,
            tags: InstanceTags::new(SessionId::new("s1"), "dep-1", "con-1", Utc::now()),
            launch_mode: LaunchMode::Ssh,
            entrypoint: vec![],
            exposed_ports: vec![],
            workload: None,
            template_id: template.map(String::from),
            disk_gb: Some(60),
        }
    }

    #[tokio::test]
    async fn list_offers_maps_bundles_and_applies_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/bundles/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "offers": [
                    {
                        "id": 42,
                        "gpu_name": "NVIDIA RTX 4090",
                        "num_gpus": 1,
                        "gpu_ram": 24576.0,
                        "dph_total": 0.45,
                        "geolocation": "US",
                        "reliability2": 0.98,
                        "rentable": true,
                        "cuda_max_good": 12.4
                    },
                    {
                        "id": 43,
                        "gpu_name": "RTX 3090",
                        "num_gpus": 1,
                        "gpu_ram": 24576.0,
                        "dph_total": 0.25,
                        "geolocation": "EU",
                        "reliability2": 0.90,
                        "rentable": false
                    }
                ]
            })))
            .mount(&server)
            .await;

        let filter = OfferFilter::default();
        let offers = provider(&server).list_offers(&filter).await.unwrap();

        // The unrentable offer is dropped.
        assert_eq!(offers.len(), 1);
        let offer = &offers[0];
        assert_eq!(offer.id.as_str(), "vastai-42");
        assert_eq!(offer.gpu_model, "RTX 4090");
        assert_eq!(offer.vram_gb, 24);
        assert!((offer.availability_confidence - OFFER_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn create_maps_stale_inventory_phrases() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v0/asks/42/"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "error": "No available nodes matching this ask"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_instance(&create_req(None))
            .await
            .unwrap_err();
        assert!(err.is_stale_inventory());
    }

    #[tokio::test]
    async fn create_attaches_ssh_key_and_survives_attach_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v0/asks/42/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "new_contract": 9001
            })))
            .mount(&server)
            .await;
        // Key attach fails server-side; create must still succeed.
        Mock::given(method("POST"))
            .and(path("/api/v0/instances/9001/ssh/"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create_instance(&create_req(None))
            .await
            .unwrap();
        assert_eq!(created.instance_id, "9001");
    }

    #[tokio::test]
    async fn template_create_forces_ssh_proxy_runtype() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v0/asks/42/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "new_contract": 7
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/instances/7/ssh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        provider(&server)
            .create_instance(&create_req(Some("tmpl-abc")))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let create = requests
            .iter()
            .find(|r| r.url.path() == "/api/v0/asks/42/")
            .unwrap();
        let body: Value = serde_json::from_slice(&create.body).unwrap();
        assert_eq!(body["template_hash_id"], "tmpl-abc");
        assert_eq!(body["runtype"], "ssh ssh_proxy");
        assert!(body.get("image").is_none(), "template creates must not build an image payload");
    }

    #[tokio::test]
    async fn status_reads_back_port_bindings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/instances/9001/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": {
                    "id": 9001,
                    "actual_status": "running",
                    "ssh_host": "ssh4.vast.ai",
                    "public_ipaddr": "203.0.113.9",
                    "ports": {
                        "22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "40022"}],
                        "8000/tcp": [{"HostIp": "0.0.0.0", "HostPort": 48000}],
                        "bogus": [{"HostIp": "0.0.0.0", "HostPort": "x"}]
                    }
                }
            })))
            .mount(&server)
            .await;

        let status = provider(&server).get_instance_status("9001").await.unwrap();
        assert_eq!(status.state, InstanceState::Running);
        assert_eq!(status.port_mappings.get(&22), Some(&40022));
        assert_eq!(status.port_mappings.get(&8000), Some(&48000));
        assert_eq!(status.port_mappings.len(), 2, "invalid bindings are skipped");
        assert_eq!(status.ssh_port, Some(40022));
        assert!(status.ssh_ready());
    }

    #[tokio::test]
    async fn destroy_treats_not_found_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v0/instances/404404/"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "no such instance"})))
            .mount(&server)
            .await;

        provider(&server).destroy_instance("404404").await.unwrap();
    }

    #[tokio::test]
    async fn list_instances_filters_to_shopper_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/instances/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": [
                    {"id": 1, "label": "shopper-s1", "actual_status": "running", "dph_total": 0.4},
                    {"id": 2, "label": "my-own-box", "actual_status": "running"},
                    {"id": 3, "label": "", "actual_status": "exited"}
                ]
            })))
            .mount(&server)
            .await;

        let instances = provider(&server).list_all_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "1");
        assert_eq!(
            instances[0].session_id().map(|s| s.as_str()),
            Some("s1")
        );
    }

    #[tokio::test]
    async fn templates_are_cached_after_first_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/templates/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "templates": [
                    {"hash_id": "tmpl-a", "name": "vLLM", "image": "vllm/vllm", "runtype": "jupyter"},
                    {"hash_id": "tmpl-b", "name": "ComfyUI", "image": "comfy/ui", "runtype": "args", "heavy": true}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider(&server);
        let all = p.list_templates(&TemplateFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        // Second call must hit the cache, not the server (expect(1) above).
        let t = p.get_template("tmpl-b").await.unwrap();
        assert!(t.heavy);

        let err = p.get_template("nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn rate_limit_status_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/bundles/"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": "too many requests"})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .list_offers(&OfferFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
    }
}
