//! Configuration system for Tidemesh.
//!
//! Runtime-configurable settings for the relay connection, peer mesh, claim
//! protocol and logging, persisted to disk as RON. Supports CLI overrides via
//! clap, hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, ClaimConfig, Config, ControlConfig, DebugConfig, IdentityConfig, MeshConfig,
    RelayConfig, SignalingConfig,
};
pub use error::ConfigError;

/// Resolve the config directory from CLI args (or the platform default),
/// load `config.ron` from it and apply the remaining CLI overrides.
pub fn load_with_overrides(args: &CliArgs) -> Result<Config, ConfigError> {
    let dir = match args.config.clone() {
        Some(dir) => dir,
        None => Config::default_dir().ok_or(ConfigError::NoConfigDir)?,
    };
    let mut config = Config::load_or_create(&dir)?;
    config.apply_cli_overrides(args);
    Ok(config)
}
