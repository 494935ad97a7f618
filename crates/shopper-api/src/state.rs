use std::sync::Arc;

use shopper_lifecycle::LifecycleEngine;
use shopper_provider::ProviderRegistry;
use shopper_reconciler::ReconcilerMetrics;
use shopper_store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ProviderRegistry>,
    pub engine: Arc<LifecycleEngine>,
    pub reconciler_metrics: Arc<ReconcilerMetrics>,
    pub auth_token: Arc<String>,
}
