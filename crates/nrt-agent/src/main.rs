#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::env;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nrt_agent::{config, logger, topology};

const DEFAULT_CONFIG_PATH: &str = "nrt-aggregator.yaml";

#[tokio::main]
async fn main() {
    let log_level = env::var("NRT_LOG_LEVEL")
        .map(|v| v.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    logger::init(&log_level);

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    info!(
        "starting {} pipeline(s) across {} receiver(s)",
        config.pipelines.len(),
        config.receivers.len()
    );
    if let Err(e) = topology::run(&config, shutdown).await {
        error!("aggregator stopped on error: {e}");
        std::process::exit(1);
    }
    info!("aggregator stopped");
}
