//! Tidemesh console client.
//!
//! Connects to the relay, joins the region of the local avatar and accepts
//! seat commands on stdin.

mod commands;
mod host;
mod runtime;

use clap::Parser;
use tidemesh_config::{CliArgs, Config};
use tidemesh_net::PeerId;

use crate::runtime::ClientRuntime;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    tidemesh_log::init_logging(
        tidemesh_log::log_dir_from_config(&config),
        cfg!(debug_assertions),
        Some(&config),
    );

    let local = if config.identity.peer_id.is_empty() {
        PeerId::random()
    } else {
        PeerId::new(config.identity.peer_id.clone())
    };

    let runtime = match ClientRuntime::start(&config, local) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.run().await {
        tracing::error!("client stopped: {e}");
        std::process::exit(1);
    }
}
