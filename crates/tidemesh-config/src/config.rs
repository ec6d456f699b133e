//! Configuration structs with sensible defaults and RON persistence.
//!
//! Every timing value is stored in milliseconds so the file stays readable;
//! each section exposes `Duration` accessors for the protocol code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

/// Top-level client/relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Who this client is and how the world is partitioned.
    pub identity: IdentityConfig,
    /// Relay connection settings.
    pub signaling: SignalingConfig,
    /// Direct peer mesh settings.
    pub mesh: MeshConfig,
    /// Claim/release protocol bounds.
    pub claims: ClaimConfig,
    /// Entity control and pose broadcast settings.
    pub control: ControlConfig,
    /// Relay server settings (relay binary only).
    pub relay: RelayConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Local identity and world partitioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer id for this session. Empty means "generate one at startup".
    pub peer_id: String,
    /// Edge length of a square region (chunk) in world units.
    pub region_size: f32,
}

/// Signaling channel (relay connection) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay host name or IP.
    pub relay_address: String,
    /// Relay TCP port.
    pub relay_port: u16,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval_ms: u64,
    /// Reconnection attempts before the session is terminally disconnected.
    pub max_reconnect_attempts: u32,
    /// Bound on a single TCP connect.
    pub connect_timeout_ms: u64,
    /// Interval between heartbeat pings.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
}

/// Peer mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Delay added per peer index when many peers become proximate at once.
    pub stagger_delay_ms: u64,
    /// Upper bound on links simultaneously in the `connecting` state.
    pub max_concurrent_connecting: usize,
    /// A handshake that has not opened within this window is failed.
    pub handshake_timeout_ms: u64,
    /// Interval of the link health scan.
    pub health_check_interval_ms: u64,
    /// Health-check retries per peer before giving up until it re-enters.
    pub max_handshake_retries: u32,
    /// Address advertised to peers as a connection candidate.
    pub advertise_address: String,
}

/// Claim/release protocol bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClaimConfig {
    /// Window for a claim response before reconciliation starts.
    pub claim_timeout_ms: u64,
    /// Window for the reconciliation query response.
    pub query_timeout_ms: u64,
    /// Window for a release acknowledgement before resending.
    pub release_ack_timeout_ms: u64,
    /// Release resends before the release is abandoned.
    pub max_release_resends: u32,
}

/// Entity control configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Minimum spacing between periodic pose broadcasts.
    pub pose_broadcast_interval_ms: u64,
    /// How far behind the newest remote sample observers render.
    pub interpolation_delay_ms: u64,
    /// Interval of the session tick driving timers and broadcasts.
    pub tick_interval_ms: u64,
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay binds to.
    pub bind_address: String,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Entity ids the relay arbitrates. Empty accepts any id.
    pub known_entities: Vec<String>,
    /// Claim/release decisions remembered for nonce replay.
    pub decision_cache_size: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "tidemesh_sync=trace").
    pub log_level: String,
    /// Directory for JSON log files in debug builds. Empty disables them.
    pub log_dir: String,
}

// --- Default implementations ---

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            region_size: 64.0,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1".to_string(),
            relay_port: 7700,
            reconnect_interval_ms: 2_000,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stagger_delay_ms: 250,
            max_concurrent_connecting: 3,
            handshake_timeout_ms: 8_000,
            health_check_interval_ms: 3_000,
            max_handshake_retries: 5,
            advertise_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            claim_timeout_ms: 10_000,
            query_timeout_ms: 3_000,
            release_ack_timeout_ms: 5_000,
            max_release_resends: 3,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pose_broadcast_interval_ms: 100,
            interpolation_delay_ms: 100,
            tick_interval_ms: 50,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7700".to_string(),
            max_connections: 256,
            known_entities: Vec::new(),
            decision_cache_size: 1_024,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

// --- Duration accessors ---

impl SignalingConfig {
    /// Fixed delay between reconnection attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Bound on a single TCP connect.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Interval between heartbeat pings.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which the connection is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// `host:port` string for the relay.
    pub fn relay_endpoint(&self) -> String {
        format!("{}:{}", self.relay_address, self.relay_port)
    }
}

impl MeshConfig {
    /// Per-index stagger delay.
    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    /// Handshake window.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Health scan interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl ClaimConfig {
    /// Claim response window.
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// Reconciliation query window.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Release acknowledgement window.
    pub fn release_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.release_ack_timeout_ms)
    }
}

impl ControlConfig {
    /// Periodic pose broadcast spacing.
    pub fn pose_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.pose_broadcast_interval_ms)
    }

    /// Remote render delay.
    pub fn interpolation_delay(&self) -> Duration {
        Duration::from_millis(self.interpolation_delay_ms)
    }

    /// Session tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Default config directory (`<platform config dir>/tidemesh`).
    pub fn default_dir() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tidemesh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("relay_port: 7700"));
        assert!(ron_str.contains("claim_timeout_ms: 10000"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(signaling: (relay_port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.signaling.relay_port, 9000);
        assert_eq!(config.signaling.max_reconnect_attempts, 10);
        assert_eq!(config.claims, ClaimConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.claims.claim_timeout(), Duration::from_secs(10));
        assert_eq!(config.claims.query_timeout(), Duration::from_secs(3));
        assert_eq!(config.mesh.stagger_delay(), Duration::from_millis(250));
        assert_eq!(
            config.control.pose_broadcast_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(config.signaling.relay_endpoint(), "127.0.0.1:7700");
    }

    #[test]
    fn test_query_window_shorter_than_claim_window() {
        let claims = ClaimConfig::default();
        assert!(claims.query_timeout() < claims.claim_timeout());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.identity.peer_id = "alice".to_string();
        config.signaling.relay_address = "10.0.0.1".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.mesh.max_concurrent_connecting = 8;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().mesh.max_concurrent_connecting, 8);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
