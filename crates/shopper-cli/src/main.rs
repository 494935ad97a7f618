mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use commands::SessionSignal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            ephemeral,
            rotate_token,
            store_path,
            port,
            bind,
        } => commands::serve(config, ephemeral, rotate_token, store_path, port, bind).await,
        Command::Inventory {
            provider,
            gpu_type,
            max_price,
            min_vram,
            min_gpu_count,
        } => {
            commands::inventory(
                provider,
                gpu_type,
                max_price,
                min_vram,
                min_gpu_count,
                cli.remote,
                cli.token,
            )
            .await
        }
        Command::Create {
            consumer_id,
            offer,
            gpu_type,
            min_vram,
            max_price,
            image,
            hours,
            auto_retry,
            max_retries,
            retry_scope,
        } => {
            commands::create(
                consumer_id,
                offer,
                gpu_type,
                min_vram,
                max_price,
                image,
                hours,
                auto_retry,
                max_retries,
                retry_scope,
                cli.remote,
                cli.token,
            )
            .await
        }
        Command::List { consumer_id, status } => {
            commands::list(consumer_id, status, cli.remote, cli.token).await
        }
        Command::Get { session_id } => commands::get(session_id, cli.remote, cli.token).await,
        Command::Done { session_id } => {
            commands::signal(session_id, SessionSignal::Done, 0, cli.remote, cli.token).await
        }
        Command::Destroy { session_id } => {
            commands::signal(session_id, SessionSignal::Destroy, 0, cli.remote, cli.token).await
        }
        Command::Extend { session_id, hours } => {
            commands::signal(session_id, SessionSignal::Extend, hours, cli.remote, cli.token).await
        }
        Command::Costs { summary } => commands::costs(summary, cli.remote, cli.token).await,
        Command::Bench {
            specs,
            budget,
            max_parallel,
            config,
            log_dir,
        } => commands::bench(specs, budget, max_parallel, config, log_dir).await,
    }
}
