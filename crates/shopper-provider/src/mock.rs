use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shopper_domain::{GpuOffer, InstanceTags, OfferFilter, OfferId, ProviderInstance};

use crate::error::ProviderError;
use crate::provider::{
    CreateInstanceRequest, CreatedInstance, Feature, InstanceState, InstanceStatus, Provider,
};

#[derive(Debug, Clone)]
struct MockInstance {
    label: String,
    tags: Option<InstanceTags>,
    state: InstanceState,
    ssh_host: String,
    ssh_port: u16,
}

/// An in-process fake provider.
///
/// Simulates a provider account locally: seedable offers, scriptable
/// create/destroy failures, and call counters. No I/O. Every downstream
/// crate's tests drive the lifecycle through this adapter.
pub struct MockProvider {
    name: &'static str,
    offers: RwLock<Vec<GpuOffer>>,
    instances: RwLock<HashMap<String, MockInstance>>,
    create_failures: Mutex<VecDeque<ProviderError>>,
    destroy_failures: Mutex<VecDeque<ProviderError>>,
    always_fail_destroy: RwLock<HashSet<String>>,
    destroy_delay: Mutex<Option<Duration>>,
    /// State newly created instances start in. Defaults to `Running`; tests
    /// set `Provisioning` or `Failed` and move instances along with
    /// [`set_instance_state`](Self::set_instance_state).
    created_state: Mutex<InstanceState>,
    next_id: AtomicU64,
    create_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    destroyed_ids: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            offers: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
            create_failures: Mutex::new(VecDeque::new()),
            destroy_failures: Mutex::new(VecDeque::new()),
            always_fail_destroy: RwLock::new(HashSet::new()),
            destroy_delay: Mutex::new(None),
            created_state: Mutex::new(InstanceState::Running),
            next_id: AtomicU64::new(1),
            create_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            destroyed_ids: Mutex::new(Vec::new()),
        }
    }

    /// Convenience offer builder for tests.
    pub fn offer(provider: &str, local_id: &str, gpu: &str, vram_gb: u32, price: f64) -> GpuOffer {
        GpuOffer {
            id: OfferId::from_parts(provider, local_id),
            provider: provider.to_string(),
            provider_offer_id: local_id.to_string(),
            gpu_model: shopper_domain::normalize_gpu_name(gpu),
            gpu_count: 1,
            vram_gb,
            price_per_hour: price,
            location: "US".to_string(),
            reliability: 0.99,
            available: true,
            fetched_at: Utc::now(),
            availability_confidence: 1.0,
            cuda_version: Some(12.4),
        }
    }

    pub fn seed_offer(&self, offer: GpuOffer) {
        self.offers.write().unwrap().push(offer);
    }

    pub fn seed_offers(&self, offers: impl IntoIterator<Item = GpuOffer>) {
        self.offers.write().unwrap().extend(offers);
    }

    /// Plant a shopper-tagged instance, as if a previous run created it.
    pub fn seed_instance(&self, id: &str, tags: InstanceTags) {
        self.instances.write().unwrap().insert(
            id.to_string(),
            MockInstance {
                label: tags.to_label(),
                tags: Some(tags),
                state: InstanceState::Running,
                ssh_host: "mock-host".to_string(),
                ssh_port: 20022,
            },
        );
    }

    /// Plant an instance with an arbitrary (non-shopper) label.
    pub fn seed_foreign_instance(&self, id: &str, label: &str) {
        self.instances.write().unwrap().insert(
            id.to_string(),
            MockInstance {
                label: label.to_string(),
                tags: InstanceTags::from_label(label).ok(),
                state: InstanceState::Running,
                ssh_host: "mock-host".to_string(),
                ssh_port: 20022,
            },
        );
    }

    /// The next create call fails with this error.
    pub fn queue_create_failure(&self, err: ProviderError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    /// The next destroy call fails with this error.
    pub fn queue_destroy_failure(&self, err: ProviderError) {
        self.destroy_failures.lock().unwrap().push_back(err);
    }

    /// Every destroy of this instance id fails.
    pub fn fail_destroy_forever(&self, id: &str) {
        self.always_fail_destroy.write().unwrap().insert(id.to_string());
    }

    pub fn set_destroy_delay(&self, delay: Duration) {
        *self.destroy_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_created_state(&self, state: InstanceState) {
        *self.created_state.lock().unwrap() = state;
    }

    pub fn set_instance_state(&self, id: &str, state: InstanceState) {
        if let Some(inst) = self.instances.write().unwrap().get_mut(id) {
            inst.state = state;
        }
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn destroyed_ids(&self) -> Vec<String> {
        self.destroyed_ids.lock().unwrap().clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().unwrap().len()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::InstanceTags | Feature::CustomImages)
    }

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<GpuOffer>, ProviderError> {
        Ok(self
            .offers
            .read()
            .unwrap()
            .iter()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect())
    }

    async fn list_all_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        Ok(self
            .instances
            .read()
            .unwrap()
            .iter()
            .filter(|(_, inst)| inst.label.starts_with(shopper_domain::LABEL_PREFIX))
            .map(|(id, inst)| ProviderInstance {
                id: id.clone(),
                label: inst.label.clone(),
                status: format!("{:?}", inst.state).to_lowercase(),
                started_at: None,
                tags: inst.tags.clone(),
                price_per_hour: None,
            })
            .collect())
    }

    async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-inst-{}", n);
        let state = *self.created_state.lock().unwrap();
        self.instances.write().unwrap().insert(
            id.clone(),
            MockInstance {
                label: req.tags.to_label(),
                tags: Some(req.tags.clone()),
                state,
                ssh_host: "mock-host".to_string(),
                ssh_port: 20000 + n as u16,
            },
        );
        Ok(CreatedInstance {
            instance_id: id,
            ssh_host: None,
            ssh_port: None,
        })
    }

    async fn get_instance_status(&self, id: &str) -> Result<InstanceStatus, ProviderError> {
        let guard = self.instances.read().unwrap();
        let inst = guard.get(id).ok_or_else(|| ProviderError::NotFound {
            provider: self.name.to_string(),
            operation: "get_instance_status".to_string(),
            message: id.to_string(),
        })?;
        let mut port_mappings = HashMap::new();
        port_mappings.insert(22, inst.ssh_port);
        Ok(InstanceStatus {
            state: inst.state,
            raw_status: format!("{:?}", inst.state).to_lowercase(),
            ssh_host: Some(inst.ssh_host.clone()),
            ssh_port: Some(inst.ssh_port),
            public_ip: Some("198.51.100.7".to_string()),
            port_mappings,
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.destroy_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        if self.always_fail_destroy.read().unwrap().contains(id) {
            return Err(ProviderError::Server {
                provider: self.name.to_string(),
                operation: "destroy_instance".to_string(),
                status: 500,
                message: format!("simulated destroy failure for {}", id),
            });
        }
        if let Some(err) = self.destroy_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        // Idempotent: removing a missing instance is success.
        self.instances.write().unwrap().remove(id);
        self.destroyed_ids.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopper_domain::SessionId;

    fn tags(session: &str) -> InstanceTags {
        InstanceTags::new(SessionId::new(session), "dep-1", "con-1", Utc::now())
    }

    fn create_req(session: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            offer_id: OfferId::new("mock-1"),
            session_id: SessionId::new(session),
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
            image: None,
            env: HashMap::new(),
            on_start: None,
            tags: tags(session),
            launch_mode: Default::default(),
            entrypoint: vec![],
            exposed_ports: vec![],
            workload: None,
            template_id: None,
            disk_gb: None,
        }
    }

    #[tokio::test]
    async fn create_then_status_then_destroy() {
        let provider = MockProvider::new();
        let created = provider.create_instance(&create_req("s1")).await.unwrap();

        let status = provider.get_instance_status(&created.instance_id).await.unwrap();
        assert!(status.ssh_ready());
        assert_eq!(status.port_mappings.get(&22), status.ssh_port.as_ref());

        provider.destroy_instance(&created.instance_id).await.unwrap();
        assert_eq!(provider.instance_count(), 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let provider = MockProvider::new();
        provider.destroy_instance("never-existed").await.unwrap();
        provider.destroy_instance("never-existed").await.unwrap();
        assert_eq!(provider.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn queued_create_failure_fires_once() {
        let provider = MockProvider::new();
        provider.queue_create_failure(ProviderError::map_create_error(
            "mock",
            "create",
            400,
            "no available nodes",
        ));

        let err = provider.create_instance(&create_req("s1")).await.unwrap_err();
        assert!(err.is_stale_inventory());
        assert!(provider.create_instance(&create_req("s1")).await.is_ok());
    }

    #[tokio::test]
    async fn foreign_labels_are_not_listed() {
        let provider = MockProvider::new();
        provider.seed_instance("inst-ours", tags("s9"));
        provider.seed_foreign_instance("inst-theirs", "someone-elses-vm");

        let listed = provider.list_all_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "inst-ours");
    }
}
