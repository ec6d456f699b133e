//! Command-line argument parsing shared by the client and relay binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tidemesh command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tidemesh", about = "Tidemesh world synchronization")]
pub struct CliArgs {
    /// Relay host name or IP.
    #[arg(long)]
    pub relay: Option<String>,

    /// Relay port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Peer id for this session.
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Relay bind address (relay binary only).
    #[arg(long)]
    pub bind: Option<String>,

    /// Address advertised to peers for direct links.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Log level (error, warn, info, debug, trace) or a full filter string.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref relay) = args.relay {
            self.signaling.relay_address = relay.clone();
        }
        if let Some(port) = args.port {
            self.signaling.relay_port = port;
        }
        if let Some(ref peer_id) = args.peer_id {
            self.identity.peer_id = peer_id.clone();
        }
        if let Some(ref bind) = args.bind {
            self.relay.bind_address = bind.clone();
        }
        if let Some(ref advertise) = args.advertise {
            self.mesh.advertise_address = advertise.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
