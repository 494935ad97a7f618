use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "shopper",
    about = "Multi-provider GPU rental control plane",
    version
)]
pub struct Cli {
    /// Connect to a remote shopper server instead of the default.
    #[arg(long, env = "GPU_SHOPPER_URL", global = true)]
    pub remote: Option<String>,

    /// API token. Falls back to ~/.gpu-shopper/token.
    #[arg(long, env = "GPU_SHOPPER_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the shopper API server with reconciler and startup sweep.
    Serve {
        /// Path to the config file. Defaults to ~/.gpu-shopper/config.yml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use an in-memory store (state lost on exit).
        #[arg(long)]
        ephemeral: bool,

        /// Generate a fresh API token even if one exists.
        #[arg(long)]
        rotate_token: bool,

        /// Session store path. Defaults to ~/.gpu-shopper/sessions.redb.
        #[arg(long)]
        store_path: Option<String>,

        #[arg(long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },

    /// List purchasable GPU offers across providers.
    Inventory {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        gpu_type: Option<String>,
        #[arg(long)]
        max_price: Option<f64>,
        #[arg(long)]
        min_vram: Option<u32>,
        #[arg(long)]
        min_gpu_count: Option<u32>,
    },

    /// Rent a GPU and print SSH access (the private key is shown once).
    Create {
        #[arg(long, default_value = "cli")]
        consumer_id: String,

        /// Explicit offer id ({provider}-{id}). Otherwise the cheapest match wins.
        #[arg(long)]
        offer: Option<String>,

        #[arg(long)]
        gpu_type: Option<String>,
        #[arg(long)]
        min_vram: Option<u32>,
        #[arg(long)]
        max_price: Option<f64>,
        #[arg(long)]
        image: Option<String>,

        /// Reservation length in whole hours (1-12).
        #[arg(long, default_value_t = 1)]
        hours: u32,

        /// Fail over to another offer when the chosen one is stale.
        #[arg(long)]
        auto_retry: bool,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long, value_enum, default_value_t = RetryScopeArg::SameGpu)]
        retry_scope: RetryScopeArg,
    },

    /// List sessions.
    List {
        #[arg(long)]
        consumer_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one session.
    Get { session_id: String },

    /// Gracefully stop a session (destroys the instance).
    Done { session_id: String },

    /// Force-destroy a session.
    Destroy { session_id: String },

    /// Extend a running session.
    Extend {
        session_id: String,
        #[arg(long, default_value_t = 1)]
        hours: u32,
    },

    /// Show per-session costs or the aggregate summary.
    Costs {
        #[arg(long)]
        summary: bool,
    },

    /// Run a benchmark matrix in-process under a dollar budget.
    Bench {
        /// YAML file with the test specs.
        specs: PathBuf,

        /// Stop launching new workers once this much has been spent (USD).
        #[arg(long)]
        budget: f64,

        #[arg(long, default_value_t = 3)]
        max_parallel: usize,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker log directory. Defaults to ./bench-logs.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RetryScopeArg {
    SameGpu,
    SameVram,
    Any,
}

impl From<RetryScopeArg> for shopper_domain::RetryScope {
    fn from(arg: RetryScopeArg) -> Self {
        match arg {
            RetryScopeArg::SameGpu => shopper_domain::RetryScope::SameGpu,
            RetryScopeArg::SameVram => shopper_domain::RetryScope::SameVram,
            RetryScopeArg::Any => shopper_domain::RetryScope::Any,
        }
    }
}
