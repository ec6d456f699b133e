//! Tidemesh relay binary.

use clap::Parser;
use tidemesh_config::{CliArgs, Config};
use tidemesh_relay::RelayServer;

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

    let server = match RelayServer::from_config(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("invalid relay configuration: {e}");
            std::process::exit(1);
        }
    };
    if !config.relay.known_entities.is_empty() {
        tracing::info!("arbitrating {} known entities", config.relay.known_entities.len());
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            server.shutdown();
        }
    }
}
