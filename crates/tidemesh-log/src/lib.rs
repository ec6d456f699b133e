//! Structured logging for Tidemesh.
//!
//! Sets up span-based, filterable logging via the `tracing` ecosystem: a
//! console layer with uptime timestamps and module targets, plus a JSON file
//! layer in debug builds so a protocol trace (claims, grants, link state) can
//! be inspected after a session.

use std::path::Path;

use tidemesh_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config provides one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "tidemesh.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - whether file logging is enabled
/// * `config` - optional configuration whose `debug.log_level` is used as the
///   filter when `RUST_LOG` is unset
///
/// Calling this twice is harmless: the second installation fails quietly.
///
/// ```no_run
/// use tidemesh_config::Config;
///
/// let config = Config::default();
/// tidemesh_log::init_logging(None, false, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_from_config(config);

    // RUST_LOG wins over the config file.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// The filter string derived from config, falling back to [`DEFAULT_FILTER`].
pub fn filter_from_config(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.clone()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Log directory from config, if one is set.
pub fn log_dir_from_config(config: &Config) -> Option<&Path> {
    let dir = config.debug.log_dir.trim();
    (!dir.is_empty()).then(|| Path::new(dir))
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
