use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::raw::RawSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VastAiSettings {
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDockSettings {
    pub auth_id: String,
    pub api_token: String,
}

/// Fully resolved control-plane settings: YAML file overlaid by environment
/// variables (env wins), with defaults for everything else.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Identity stamped onto every instance tag; lets several control planes
    /// share one provider account. Generated when not configured.
    pub deployment_id: String,

    pub vastai: Option<VastAiSettings>,
    pub tensordock: Option<TensorDockSettings>,

    pub reconcile_interval: Duration,
    pub auto_destroy_orphans: bool,

    pub poll_interval: Duration,
    pub provision_deadline: Duration,

    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_max_parallel: usize,

    pub bind: String,
    pub port: u16,
    pub store_path: Option<PathBuf>,
    /// Base URL CLI commands talk to (`GPU_SHOPPER_URL`).
    pub server_url: String,
}

/// Load settings from the optional YAML file, overlaying process env vars.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    load_with(path, &|name| std::env::var(name).ok())
}

/// Same as [`load`] with an injectable env lookup, so tests never mutate
/// process-wide environment state.
pub fn load_with(
    path: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let raw = match path {
        Some(path) if path.exists() => {
            debug!("loading config from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_yaml::from_str::<RawSettings>(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?
        }
        _ => RawSettings::default(),
    };

    let deployment_id = env("GPU_SHOPPER_DEPLOYMENT_ID")
        .or(raw.deployment_id)
        .unwrap_or_else(generate_deployment_id);

    let vastai = env("VASTAI_API_KEY")
        .or_else(|| raw.providers.vastai.as_ref().and_then(|v| v.api_key.clone()))
        .map(|api_key| VastAiSettings { api_key });

    let td_auth_id = env("TENSORDOCK_AUTH_ID")
        .or_else(|| raw.providers.tensordock.as_ref().and_then(|t| t.auth_id.clone()));
    let td_api_token = env("TENSORDOCK_API_TOKEN")
        .or_else(|| raw.providers.tensordock.as_ref().and_then(|t| t.api_token.clone()));
    let tensordock = match (td_auth_id, td_api_token) {
        (Some(auth_id), Some(api_token)) => Some(TensorDockSettings { auth_id, api_token }),
        (Some(_), None) | (None, Some(_)) => {
            return Err(ConfigError::Invalid(
                "tensordock requires both TENSORDOCK_AUTH_ID and TENSORDOCK_API_TOKEN".into(),
            ));
        }
        (None, None) => None,
    };

    Ok(Settings {
        deployment_id,
        vastai,
        tensordock,
        reconcile_interval: Duration::from_secs(raw.reconcile_interval_secs.unwrap_or(60)),
        auto_destroy_orphans: raw.auto_destroy_orphans.unwrap_or(true),
        poll_interval: Duration::from_secs(raw.poll_interval_secs.unwrap_or(15)),
        provision_deadline: Duration::from_secs(raw.provision_deadline_secs.unwrap_or(600)),
        startup_timeout: Duration::from_secs(raw.startup_timeout_secs.unwrap_or(120)),
        shutdown_timeout: Duration::from_secs(raw.shutdown_timeout_secs.unwrap_or(60)),
        shutdown_max_parallel: raw.shutdown_max_parallel.unwrap_or(5),
        bind: raw.bind.unwrap_or_else(|| "127.0.0.1".to_string()),
        port: raw.port.unwrap_or(8080),
        store_path: raw.store_path.map(PathBuf::from),
        server_url: env("GPU_SHOPPER_URL")
            .or(raw.server_url)
            .unwrap_or_else(|| "http://localhost:8080".to_string()),
    })
}

fn generate_deployment_id() -> String {
    let suffix = Uuid::new_v4().to_string().replace('-', "");
    format!("shopper-{}", &suffix[..12])
}
