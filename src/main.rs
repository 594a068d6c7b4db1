use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::inference::models::qwen2::Qwen2Model;
use crate::routes::{router, AppState};
use crate::telemetry::init_telemetry;

mod config;
mod error;
mod inference;
mod routes;
mod telemetry;
mod ui;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "Normalizer.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_read = Config::from_toml(&args.config_file);
    let explicit_config = args.config_file != DEFAULT_CONFIG_FILE;
    let config = match config_read {
        Ok(conf) => conf.merge(args.opt_config),
        Err(_) if !explicit_config => Config::default().merge(args.opt_config),
        Err(err) => {
            eprintln!(
                "Failed to read configuration file {} with error: {}",
                args.config_file, err
            );
            std::process::exit(1);
        }
    };
    init_telemetry(config.otel_endpoint(), config.console)?;

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let load_config = config.clone();
    let model = tokio::task::spawn_blocking(move || {
        Qwen2Model::load(&Api::new()?, &load_config)
    })
    .await?;
    let model = match model {
        Ok(model) => model,
        Err(err) => exit_err!(1, "Failed to load model: {:#}", err),
    };

    let state = AppState {
        normalizer: Arc::new(model),
    };

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
