use serde::{Deserialize, Serialize};

/// Raw YAML representation of the config file (`~/.gpu-shopper/config.yml`).
/// Every field is optional; the loader fills defaults and overlays env vars.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawSettings {
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub providers: RawProviders,

    pub reconcile_interval_secs: Option<u64>,
    pub auto_destroy_orphans: Option<bool>,

    pub poll_interval_secs: Option<u64>,
    pub provision_deadline_secs: Option<u64>,

    pub startup_timeout_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub shutdown_max_parallel: Option<usize>,

    pub bind: Option<String>,
    pub port: Option<u16>,
    pub store_path: Option<String>,
    pub server_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawProviders {
    pub vastai: Option<RawVastAi>,
    pub tensordock: Option<RawTensorDock>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawVastAi {
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawTensorDock {
    pub auth_id: Option<String>,
    pub api_token: Option<String>,
}
