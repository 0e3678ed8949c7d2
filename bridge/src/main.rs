// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use klever_bridge::config::BridgeNodeConfig;
use klever_bridge::node::run_bridge_node;
use klever_bridge::orchestrator::ShutdownReason;
use klever_bridge_config::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = VERSION)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BridgeNodeConfig::load(&args.config_path)?;
    info!("Loaded config from {:?}", args.config_path);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
        }
        signal_cancel.cancel();
    });

    let prometheus_registry = prometheus::Registry::new();
    match run_bridge_node(config, VERSION, prometheus_registry, cancel).await {
        Ok(ShutdownReason::Cancelled) => Ok(()),
        Ok(ShutdownReason::CloseRequested) => {
            error!("Relayer stopped after an unrecoverable error");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Relayer failed: {:?}", e);
            Err(e)
        }
    }
}
