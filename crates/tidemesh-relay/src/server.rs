//! TCP front end of the relay: accept loop and per-connection tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tidemesh_config::Config;
use tidemesh_net::{
    FrameConfig, FrameError, SignalMessage, WireMessage, read_message, write_message,
};
use tidemesh_sync::{OccupancyTable, RelayState};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::hub::{ConnectionId, Hub, HubCommand};

/// Errors that stop the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The configured bind address does not parse.
    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    /// Binding or accepting failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for [`RelayServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7700`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Frame size limits.
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7700)),
            max_connections: 256,
            frame: FrameConfig::default(),
        }
    }
}

impl TryFrom<&Config> for ServerConfig {
    type Error = RelayError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let bind_addr = config
            .relay
            .bind_address
            .parse()
            .map_err(|_| RelayError::InvalidBindAddress(config.relay.bind_address.clone()))?;
        Ok(Self {
            bind_addr,
            max_connections: config.relay.max_connections,
            frame: FrameConfig {
                max_payload_size: config.signaling.max_frame_size,
            },
        })
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Counts live connections; the slot is returned when the guard drops.
struct ConnectionSlots {
    active: AtomicUsize,
    max: usize,
}

struct SlotGuard(Arc<ConnectionSlots>);

impl ConnectionSlots {
    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max).then_some(n + 1))
            .ok()
            .map(|_| SlotGuard(Arc::clone(self)))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: mpsc::UnboundedSender<HubCommand>,
    slots: Arc<ConnectionSlots>,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// Create a server and spawn its hub task over `state`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, state: RelayState) -> Self {
        let (hub, commands) = mpsc::unbounded_channel();
        tokio::spawn(Hub::new(state).run(commands));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            slots: Arc::new(ConnectionSlots {
                active: AtomicUsize::new(0),
                max: config.max_connections,
            }),
            config,
            hub,
            id_gen: IdGenerator::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Server configured from `config`, arbitrating its known entities.
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let server_config = ServerConfig::try_from(config)?;
        let state = RelayState::new(OccupancyTable::from_config(&config.relay));
        Ok(Self::new(server_config, state))
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("relay listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), RelayError> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    let Some(slot) = self.slots.try_acquire() else {
                        tracing::warn!("connection limit reached, rejecting {peer_addr}");
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {peer_addr}: {e}");
                    }

                    let id = self.id_gen.next_id();
                    tracing::info!("accepted connection {id:?} from {peer_addr}");
                    tokio::spawn(serve_connection(
                        id,
                        stream,
                        self.hub.clone(),
                        self.config.frame,
                        self.shutdown_rx.clone(),
                        slot,
                    ));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("relay shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server and its connections to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn serve_connection(
    id: ConnectionId,
    stream: TcpStream,
    hub: mpsc::UnboundedSender<HubCommand>,
    frame: FrameConfig,
    mut shutdown: watch::Receiver<bool>,
    _slot: SlotGuard,
) {
    let (reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    if hub.send(HubCommand::Opened { conn: id, outbound }).is_err() {
        return;
    }

    let mut writer_task = tokio::spawn(write_loop(id, writer, outbound_rx, frame));

    tokio::select! {
        _ = read_loop(id, reader, &hub, &frame) => {}
        _ = &mut writer_task => {}
        _ = shutdown.changed() => {}
    }
    writer_task.abort();

    let _ = hub.send(HubCommand::Closed { conn: id });
    tracing::info!("connection {id:?} closed");
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    hub: &mpsc::UnboundedSender<HubCommand>,
    frame: &FrameConfig,
) {
    loop {
        match read_message::<SignalMessage, _>(&mut reader, frame).await {
            Ok(msg) => {
                tracing::trace!("{id:?} -> {}", msg.kind());
                if hub.send(HubCommand::Inbound { conn: id, msg }).is_err() {
                    return;
                }
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("{id:?} sent a bad message: {e}");
            }
            Err(FrameError::ConnectionClosed) => return,
            Err(e) => {
                tracing::debug!("{id:?} read failed: {e}");
                return;
            }
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<SignalMessage>,
    frame: FrameConfig,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &msg, &frame).await {
            tracing::debug!("{id:?} write failed: {e}");
            return;
        }
    }
}
