use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use shopper_api::AppState;
use shopper_config::Settings;
use shopper_domain::RetryPolicy;
use shopper_lifecycle::{EngineConfig, LifecycleEngine};
use shopper_orchestrator::{load_specs, Orchestrator, OrchestratorConfig, SimulatedBenchmark};
use shopper_provider::{
    ProviderRegistry, TensorDockConfig, TensorDockProvider, VastAiConfig, VastAiProvider,
};
use shopper_reconciler::Reconciler;
use shopper_runtime::{ShutdownConfig, ShutdownManager, StartupConfig, StartupManager};
use shopper_store::{InMemoryStore, RedbStore, SessionStore};
use tokio::sync::watch;
use uuid::Uuid;

use crate::cli::RetryScopeArg;
use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn serve(
    config: Option<PathBuf>,
    ephemeral: bool,
    rotate_token: bool,
    store_path: Option<String>,
    port: u16,
    bind: String,
) -> Result<()> {
    let config_path = config.unwrap_or_else(default_config_path);
    let settings = shopper_config::load(Some(&config_path))?;

    // Reuse the existing token unless rotation is explicitly requested, so
    // server restarts don't invalidate client configurations.
    let token_path = default_token_path();
    let token = if !rotate_token {
        match std::fs::read_to_string(&token_path).map(|s| s.trim().to_string()) {
            Ok(existing) if !existing.is_empty() => {
                println!("Reusing existing token from {}", token_path.display());
                existing
            }
            _ => {
                let t = generate_token();
                write_token(&token_path, &t)?;
                println!("Generated new token (written to {})", token_path.display());
                t
            }
        }
    } else {
        let t = generate_token();
        write_token(&token_path, &t)?;
        println!("Rotated token (written to {})", token_path.display());
        println!("New token: {}", t);
        t
    };

    let store: Arc<dyn SessionStore> = if ephemeral {
        println!("Using in-memory (ephemeral) store — sessions will be lost on server stop");
        Arc::new(InMemoryStore::new())
    } else {
        let path = store_path
            .map(PathBuf::from)
            .or_else(|| settings.store_path.clone())
            .unwrap_or_else(default_store_path);
        println!("Using persistent store at {}", path.display());
        Arc::new(
            RedbStore::open(&path)
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        )
    };

    let registry = Arc::new(build_registry(&settings)?);
    println!(
        "Deployment {} with providers: {}",
        settings.deployment_id,
        registry.names().join(", ")
    );

    let mut engine_config = EngineConfig::default();
    engine_config.poll_interval = settings.poll_interval;
    engine_config.provision_deadline = settings.provision_deadline;
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        registry.clone(),
        settings.deployment_id.clone(),
        engine_config,
    ));

    let reconciler = Arc::new(
        Reconciler::new(store.clone(), registry.clone(), settings.deployment_id.clone())
            .with_auto_destroy(settings.auto_destroy_orphans),
    );
    let reconciler_metrics = reconciler.metrics();

    // One boot sweep before accepting traffic: recover what the previous
    // process left mid-flight, then clean any crash orphans.
    let startup = StartupManager::new(
        reconciler.clone(),
        StartupConfig { timeout: settings.startup_timeout },
    );
    let metrics = startup.run_sweep().await;
    println!(
        "Startup sweep: {} stuck sessions recovered, {} orphans destroyed",
        metrics.stuck_recovered, metrics.orphans_destroyed
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_task = tokio::spawn(
        reconciler
            .clone()
            .run(settings.reconcile_interval, shutdown_rx),
    );

    let state = AppState {
        store: store.clone(),
        registry: registry.clone(),
        engine,
        reconciler_metrics,
        auth_token: Arc::new(token),
    };
    let app = shopper_api::build_app(state);

    let addr = format!("{bind}:{port}");
    println!("Starting shopper API server on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down…");
        })
        .await
        .context("Server error")?;

    // Stop the reconciler before tearing sessions down, so it cannot fight
    // the shutdown manager over the same instances.
    let _ = shutdown_tx.send(true);
    let _ = reconciler_task.await;

    let shutdown = ShutdownManager::new(
        store,
        registry,
        ShutdownConfig {
            max_parallel: settings.shutdown_max_parallel,
            timeout: settings.shutdown_timeout,
        },
    );
    match shutdown.graceful_shutdown().await {
        Ok(summary) => {
            println!(
                "Destroyed {} of {} active sessions.",
                summary.destroyed, summary.total
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            anyhow::bail!("graceful shutdown incomplete");
        }
    }
}

fn build_registry(settings: &Settings) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    if let Some(vastai) = &settings.vastai {
        registry.register(Arc::new(VastAiProvider::new(VastAiConfig::new(
            vastai.api_key.clone(),
        ))));
    }
    if let Some(td) = &settings.tensordock {
        registry.register(Arc::new(TensorDockProvider::new(TensorDockConfig::new(
            td.auth_id.clone(),
            td.api_token.clone(),
        ))));
    }
    if registry.is_empty() {
        anyhow::bail!(
            "no providers configured. Set VASTAI_API_KEY and/or \
             TENSORDOCK_AUTH_ID + TENSORDOCK_API_TOKEN (or the config file equivalents)."
        );
    }
    Ok(registry)
}

// ── Inventory ─────────────────────────────────────────────────────────────────

pub async fn inventory(
    provider: Option<String>,
    gpu_type: Option<String>,
    max_price: Option<f64>,
    min_vram: Option<u32>,
    min_gpu_count: Option<u32>,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(p) = provider {
        query.push(("provider", p));
    }
    if let Some(g) = gpu_type {
        query.push(("gpu_type", g));
    }
    if let Some(p) = max_price {
        query.push(("max_price", p.to_string()));
    }
    if let Some(v) = min_vram {
        query.push(("min_vram", v.to_string()));
    }
    if let Some(c) = min_gpu_count {
        query.push(("min_gpu_count", c.to_string()));
    }

    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/api/v1/inventory", url.trim_end_matches('/')))
        .query(&query)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?
        .json()
        .await?;

    let offers = body["offers"].as_array().cloned().unwrap_or_default();
    if offers.is_empty() {
        println!("No offers match.");
    } else {
        print!("{}", output::render_offer_table(&offers));
    }
    for e in body["errors"].as_array().into_iter().flatten() {
        eprintln!("  ! {}", e.as_str().unwrap_or(&e.to_string()));
    }
    Ok(())
}

// ── Create ────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn create(
    consumer_id: String,
    offer: Option<String>,
    gpu_type: Option<String>,
    min_vram: Option<u32>,
    max_price: Option<f64>,
    image: Option<String>,
    hours: u32,
    auto_retry: bool,
    max_retries: u32,
    retry_scope: RetryScopeArg,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    let body = serde_json::json!({
        "consumer_id": consumer_id,
        "offer_id": offer,
        "gpu_type": gpu_type,
        "min_vram_gb": min_vram,
        "max_price_per_hour": max_price,
        "image": image,
        "reservation_hours": hours,
        "retry": RetryPolicy {
            enabled: auto_retry,
            max_retries,
            scope: retry_scope.into(),
        },
    });

    println!("Provisioning… (this polls until SSH is ready)");
    let resp = authed_client(&token)
        .post(format!("{}/api/v1/sessions", url.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let msg = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server error: {}", msg);
    }

    print!("{}", output::render_session_detail(&body["session"]));
    if let Some(key) = body["ssh_private_key"].as_str() {
        println!("\nSSH private key (shown once, save it now):\n{}", key);
    }
    Ok(())
}

// ── Session queries and signals ───────────────────────────────────────────────

pub async fn list(
    consumer_id: Option<String>,
    status: Option<String>,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(c) = consumer_id {
        query.push(("consumer_id", c));
    }
    if let Some(s) = status {
        query.push(("status", s));
    }

    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/api/v1/sessions", url.trim_end_matches('/')))
        .query(&query)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?
        .json()
        .await?;

    let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
    if sessions.is_empty() {
        println!("No sessions.");
    } else {
        print!("{}", output::render_session_table(&sessions));
    }
    Ok(())
}

pub async fn get(session_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let resp = authed_client(&token)
        .get(format!(
            "{}/api/v1/sessions/{}",
            url.trim_end_matches('/'),
            session_id
        ))
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let msg = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server error: {}", msg);
    }
    print!("{}", output::render_session_detail(&body));
    Ok(())
}

pub async fn signal(
    session_id: String,
    action: SessionSignal,
    hours: u32,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let base = url.trim_end_matches('/');
    let client = authed_client(&token);

    let request = match action {
        SessionSignal::Done => client.post(format!("{}/api/v1/sessions/{}/done", base, session_id)),
        SessionSignal::Destroy => client.delete(format!("{}/api/v1/sessions/{}", base, session_id)),
        SessionSignal::Extend => client
            .post(format!("{}/api/v1/sessions/{}/extend", base, session_id))
            .json(&serde_json::json!({ "additional_hours": hours })),
    };

    let resp = request
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let msg = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server error: {}", msg);
    }

    match action {
        SessionSignal::Done => println!("Session {} stopped.", session_id),
        SessionSignal::Destroy => println!("Session {} destroyed.", session_id),
        SessionSignal::Extend => println!(
            "Session {} extended until {}.",
            session_id,
            output::short_timestamp(body["expires_at"].as_str().unwrap_or("-"))
        ),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum SessionSignal {
    Done,
    Destroy,
    Extend,
}

// ── Costs ─────────────────────────────────────────────────────────────────────

pub async fn costs(summary: bool, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let path = if summary {
        "/api/v1/costs/summary"
    } else {
        "/api/v1/costs"
    };

    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}{}", url.trim_end_matches('/'), path))
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ── Bench ─────────────────────────────────────────────────────────────────────

pub async fn bench(
    specs_path: PathBuf,
    budget: f64,
    max_parallel: usize,
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
) -> Result<()> {
    let config_path = config.unwrap_or_else(default_config_path);
    let settings = shopper_config::load(Some(&config_path))?;
    let registry = Arc::new(build_registry(&settings)?);

    let specs = load_specs(&specs_path)?;
    println!(
        "Loaded {} specs from {} (budget: ${:.2})",
        specs.len(),
        specs_path.display(),
        budget
    );

    // Bench sessions are throwaway: an ephemeral store is enough, and the
    // orchestrator destroys everything it creates.
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let engine = Arc::new(LifecycleEngine::new(
        store,
        registry,
        settings.deployment_id.clone(),
        EngineConfig::default(),
    ));

    let mut orch_config = OrchestratorConfig::new(
        budget,
        log_dir.unwrap_or_else(|| PathBuf::from("bench-logs")),
    );
    orch_config.max_parallel = max_parallel;

    let orchestrator = Orchestrator::new(
        engine,
        Arc::new(SimulatedBenchmark::default()),
        orch_config,
    );
    let report = orchestrator.run(specs).await?;

    println!(
        "\n{:<34} {:<22} {:>10} {:>10}",
        "SPEC", "STATUS", "COST", "TPS"
    );
    println!("{}", "-".repeat(80));
    for outcome in &report.outcomes {
        println!(
            "{:<34} {:<22} {:>10.4} {:>10}",
            outcome.spec,
            format!("{:?}", outcome.status),
            outcome.cost_usd,
            outcome
                .tokens_per_second
                .map(|t| format!("{:.1}", t))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    println!(
        "\nTotal: ${:.4} of ${:.2} budget",
        report.total_cost_usd, report.budget_usd
    );
    Ok(())
}

// ── Token helpers ─────────────────────────────────────────────────────────────

/// Generate a cryptographically random token as a 64-character hex string.
fn generate_token() -> String {
    let a = Uuid::new_v4().to_string().replace('-', "");
    let b = Uuid::new_v4().to_string().replace('-', "");
    format!("{}{}", a, b)
}

/// Resolve the token to use for API calls.
///
/// Priority: explicit value (from --token / GPU_SHOPPER_TOKEN) → token file.
fn resolve_token(explicit: Option<String>) -> Result<String> {
    if let Some(t) = explicit {
        return Ok(t);
    }
    let path = default_token_path();
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .with_context(|| {
            format!(
                "No token provided and could not read token file at {}. \
                 Use --token, GPU_SHOPPER_TOKEN, or run `shopper serve` first.",
                path.display()
            )
        })
}

/// Write the token to the token file with owner-only permissions.
fn write_token(path: &PathBuf, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, token)
        .with_context(|| format!("Failed to write token to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// ── Other helpers ─────────────────────────────────────────────────────────────

fn server_url(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://localhost:8080".into())
}

/// Build a reqwest Client with the Authorization header pre-configured.
fn authed_client(token: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    let bearer = format!("Bearer {}", token);
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&bearer)
            .expect("token contains invalid header characters"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .expect("failed to build HTTP client")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
}

fn default_config_path() -> PathBuf {
    home_dir().join(".gpu-shopper").join("config.yml")
}

fn default_token_path() -> PathBuf {
    home_dir().join(".gpu-shopper").join("token")
}

fn default_store_path() -> PathBuf {
    home_dir().join(".gpu-shopper").join("sessions.redb")
}
