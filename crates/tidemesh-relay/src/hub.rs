//! The relay hub: one task owning all arbitration state.
//!
//! Connection tasks never touch [`RelayState`] directly. They send
//! [`HubCommand`]s over one channel, so every claim is decided in arrival
//! order by a single owner.

use std::collections::HashMap;

use tidemesh_net::{PeerId, Pong, SignalMessage, WireMessage};
use tidemesh_sync::{Outbound, RelayState};
use tokio::sync::mpsc;

/// Unique identifier for a TCP connection within a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// What connection tasks report to the hub.
#[derive(Debug)]
pub enum HubCommand {
    /// A connection was accepted; `outbound` feeds its writer.
    Opened {
        /// Connection.
        conn: ConnectionId,
        /// Writer queue.
        outbound: mpsc::UnboundedSender<SignalMessage>,
    },
    /// A message arrived.
    Inbound {
        /// Connection.
        conn: ConnectionId,
        /// Message.
        msg: SignalMessage,
    },
    /// The connection ended.
    Closed {
        /// Connection.
        conn: ConnectionId,
    },
}

struct Connection {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    peer: Option<PeerId>,
}

/// Owner of [`RelayState`] and the peer/connection binding.
///
/// A connection binds to a peer id with its first `join_region`. A later
/// connection announcing the same id takes the binding over; closing the
/// older one then frees nothing.
pub struct Hub {
    state: RelayState,
    connections: HashMap<ConnectionId, Connection>,
    peers: HashMap<PeerId, ConnectionId>,
}

impl Hub {
    /// Hub over `state`.
    pub fn new(state: RelayState) -> Self {
        Self {
            state,
            connections: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    /// Arbitration state.
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Peer bound to a connection, if any.
    #[cfg(test)]
    fn peer_of(&self, conn: ConnectionId) -> Option<&PeerId> {
        self.connections.get(&conn)?.peer.as_ref()
    }

    /// Number of open connections.
    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Process commands until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        tracing::debug!("hub stopped");
    }

    /// Apply one command.
    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Opened { conn, outbound } => {
                self.connections.insert(conn, Connection { outbound, peer: None });
                tracing::debug!("{conn:?} opened, {} open", self.connection_count());
            }
            HubCommand::Inbound { conn, msg } => self.on_inbound(conn, msg),
            HubCommand::Closed { conn } => self.on_closed(conn),
        }
    }

    fn on_inbound(&mut self, conn: ConnectionId, msg: SignalMessage) {
        let Some(connection) = self.connections.get(&conn) else {
            tracing::debug!("message from replaced connection {conn:?} dropped");
            return;
        };

        let peer = match (connection.peer.clone(), &msg) {
            (Some(peer), _) => peer,
            (None, SignalMessage::Ping(ping)) => {
                let _ = connection
                    .outbound
                    .send(SignalMessage::Pong(Pong { nonce: ping.nonce }));
                return;
            }
            (None, SignalMessage::JoinRegion(join)) => {
                let peer = join.peer_id.clone();
                self.bind(conn, peer.clone());
                peer
            }
            (None, other) => {
                tracing::warn!("{} from unidentified connection {conn:?} dropped", other.kind());
                return;
            }
        };

        let out = self.state.handle(&peer, msg);
        self.deliver(out);
    }

    fn bind(&mut self, conn: ConnectionId, peer: PeerId) {
        if let Some(previous) = self.peers.insert(peer.clone(), conn)
            && previous != conn
        {
            tracing::info!("{peer} reconnected on {conn:?}, dropping {previous:?}");
            // Dropping the sender ends the old writer task.
            self.connections.remove(&previous);
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.peer = Some(peer.clone());
        }
        tracing::info!("{conn:?} is {peer}");
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        tracing::debug!("{conn:?} closed, {} open", self.connection_count());
        let Some(peer) = connection.peer else {
            return;
        };
        if self.peers.get(&peer) != Some(&conn) {
            return;
        }
        self.peers.remove(&peer);
        tracing::info!("{peer} disconnected");
        let out = self.state.disconnect(&peer);
        self.deliver(out);
    }

    fn deliver(&self, out: Vec<Outbound>) {
        for Outbound { to, msg } in out {
            let Some(connection) = self.peers.get(&to).and_then(|c| self.connections.get(c)) else {
                tracing::debug!("{} for absent {to} dropped", msg.kind());
                continue;
            };
            let _ = connection.outbound.send(msg);
        }
    }
}
