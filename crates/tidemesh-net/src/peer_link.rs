//! Direct peer links over TCP.
//!
//! A link is set up through payloads the caller relays over signaling:
//!
//! 1. The initiator binds an ephemeral listener and emits an **offer**
//!    carrying a random 64-bit token, then one **candidate** per reachable
//!    address.
//! 2. The responder emits an **answer** echoing the token and dials each
//!    candidate it receives.
//! 3. The first dialed connection whose first frame is the token becomes the
//!    link. Both sides then report [`LinkEventKind::Open`].
//!
//! Socket tasks report through one [`LinkEvent`] channel. Every event carries
//! the generation of the link that produced it; pass events through
//! [`DirectLinkBackend::admit`] so events from a link that was since closed
//! or replaced are dropped.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::framing::{FrameConfig, FrameError, read_frame, read_message, write_frame, write_message};
use crate::ids::PeerId;
use crate::messages::PeerMessage;

/// Bound on dialing one candidate, and on the token frame arriving.
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// What a peer-link backend must offer the mesh manager.
///
/// All methods return immediately; progress is reported as [`LinkEvent`]s.
pub trait PeerTransport {
    /// Start an outbound link to `peer` (local side is the initiator).
    fn connect(&mut self, peer: &PeerId);

    /// Respond to an offer from `peer`.
    fn accept_offer(&mut self, peer: &PeerId, offer: &[u8]);

    /// Apply the responder's answer.
    fn apply_answer(&mut self, peer: &PeerId, answer: &[u8]);

    /// Apply a connectivity candidate from `peer`.
    fn add_candidate(&mut self, peer: &PeerId, candidate: &[u8]);

    /// Tear down any link or handshake with `peer`. Idempotent.
    fn close(&mut self, peer: &PeerId);

    /// Best-effort send over an open link. `false` if no link is open.
    fn send(&mut self, peer: &PeerId, msg: &PeerMessage) -> bool;
}

/// Progress report from a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    /// Remote peer.
    pub peer: PeerId,
    /// Link generation that produced the event.
    pub generation: u64,
    /// What happened.
    pub kind: LinkEventKind,
}

/// The kinds of [`LinkEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// Offer payload to forward to the peer via signaling.
    Offer(Vec<u8>),
    /// Answer payload to forward to the peer via signaling.
    Answer(Vec<u8>),
    /// Candidate payload to forward to the peer via signaling.
    Candidate(Vec<u8>),
    /// The link is open and accepts sends.
    Open,
    /// A message arrived on the link.
    Message(PeerMessage),
    /// The handshake or the link failed.
    Failed(String),
    /// The remote side closed the link.
    Closed,
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LinkOffer {
    token: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkAnswer {
    token: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkCandidate {
    address: SocketAddr,
}

/// Errors raised while building a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The configured advertise address is not an IP address.
    #[error("invalid advertise address: {0}")]
    InvalidAddress(String),

    /// The ephemeral listener could not be bound.
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    /// A handshake payload did not decode.
    #[error("malformed handshake payload: {0}")]
    Payload(#[from] postcard::Error),

    /// The answer echoed a different token than the one offered.
    #[error("answer token does not match offer")]
    TokenMismatch,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct LinkSlot {
    generation: u64,
    open: bool,
    token: u64,
    outbound: mpsc::UnboundedSender<PeerMessage>,
    candidates: Option<mpsc::UnboundedSender<SocketAddr>>,
    task: JoinHandle<()>,
}

impl Drop for LinkSlot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// [`PeerTransport`] over direct TCP connections.
///
/// Must be used from within a tokio runtime.
pub struct DirectLinkBackend {
    local: PeerId,
    advertise: IpAddr,
    frame: FrameConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    links: HashMap<PeerId, LinkSlot>,
    /// Links that failed before any socket task existed.
    failed_starts: HashSet<(PeerId, u64)>,
    next_generation: u64,
}

impl DirectLinkBackend {
    /// Create a backend advertising `advertise` as its reachable address.
    pub fn new(
        local: PeerId,
        advertise: &str,
        frame: FrameConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let advertise: IpAddr = advertise
            .parse()
            .map_err(|_| LinkError::InvalidAddress(advertise.to_string()))?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let backend = Self {
            local,
            advertise,
            frame,
            events,
            links: HashMap::new(),
            failed_starts: HashSet::new(),
            next_generation: 0,
        };
        Ok((backend, events_rx))
    }

    /// Local peer id.
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Filter an event against the current links.
    ///
    /// Returns `None` for events of a closed or replaced link. Updates link
    /// bookkeeping (open flag, removal on close or failure).
    pub fn admit(&mut self, event: LinkEvent) -> Option<LinkEvent> {
        let Some(slot) = self.links.get_mut(&event.peer) else {
            let start_failed = matches!(event.kind, LinkEventKind::Failed(_))
                && self
                    .failed_starts
                    .remove(&(event.peer.clone(), event.generation));
            return start_failed.then_some(event);
        };
        if slot.generation != event.generation {
            tracing::trace!(
                "dropping stale link event from {} (generation {})",
                event.peer,
                event.generation
            );
            return None;
        }
        match &event.kind {
            LinkEventKind::Open => slot.open = true,
            LinkEventKind::Failed(_) | LinkEventKind::Closed => {
                self.links.remove(&event.peer);
            }
            _ => {}
        }
        Some(event)
    }

    /// Number of links currently open.
    pub fn open_count(&self) -> usize {
        self.links.values().filter(|slot| slot.open).count()
    }

    fn allocate(&mut self, peer: &PeerId) -> u64 {
        self.links.remove(peer);
        self.failed_starts.retain(|(p, _)| p != peer);
        self.next_generation += 1;
        self.next_generation
    }

    fn start_failed(&mut self, peer: &PeerId, generation: u64, error: LinkError) {
        self.links.remove(peer);
        self.failed_starts.insert((peer.clone(), generation));
        self.emit(peer, generation, LinkEventKind::Failed(error.to_string()));
    }

    fn emit(&self, peer: &PeerId, generation: u64, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            peer: peer.clone(),
            generation,
            kind,
        });
    }

    fn bind_listener(&self) -> Result<TcpListener, LinkError> {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let listener = std::net::TcpListener::bind(any).map_err(LinkError::Bind)?;
        listener.set_nonblocking(true).map_err(LinkError::Bind)?;
        TcpListener::from_std(listener).map_err(LinkError::Bind)
    }

    fn start_initiator(&mut self, peer: &PeerId, generation: u64) -> Result<(), LinkError> {
        let listener = self.bind_listener()?;
        let port = listener.local_addr().map_err(LinkError::Bind)?.port();
        let token = rand::random::<u64>();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let link = LinkTask {
            peer: peer.clone(),
            generation,
            frame: self.frame,
            events: self.events.clone(),
        };
        let task = tokio::spawn(link.run_initiator(listener, token, outbound_rx));
        self.links.insert(
            peer.clone(),
            LinkSlot {
                generation,
                open: false,
                token,
                outbound,
                candidates: None,
                task,
            },
        );

        self.emit(
            peer,
            generation,
            LinkEventKind::Offer(postcard::to_allocvec(&LinkOffer { token })?),
        );
        let mut addresses = vec![SocketAddr::new(self.advertise, port)];
        if !self.advertise.is_loopback() {
            addresses.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }
        for address in addresses {
            let candidate = postcard::to_allocvec(&LinkCandidate { address })?;
            self.emit(peer, generation, LinkEventKind::Candidate(candidate));
        }
        Ok(())
    }

    fn start_responder(&mut self, peer: &PeerId, offer: &[u8], generation: u64) -> Result<(), LinkError> {
        let LinkOffer { token } = postcard::from_bytes(offer)?;
        let answer = postcard::to_allocvec(&LinkAnswer { token })?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (candidates, candidates_rx) = mpsc::unbounded_channel();
        let link = LinkTask {
            peer: peer.clone(),
            generation,
            frame: self.frame,
            events: self.events.clone(),
        };
        let task = tokio::spawn(link.run_responder(token, candidates_rx, outbound_rx));
        self.links.insert(
            peer.clone(),
            LinkSlot {
                generation,
                open: false,
                token,
                outbound,
                candidates: Some(candidates),
                task,
            },
        );
        self.emit(peer, generation, LinkEventKind::Answer(answer));
        Ok(())
    }
}

impl PeerTransport for DirectLinkBackend {
    fn connect(&mut self, peer: &PeerId) {
        let generation = self.allocate(peer);
        tracing::debug!("opening direct link to {peer}");
        if let Err(e) = self.start_initiator(peer, generation) {
            tracing::warn!("direct link to {peer} failed to start: {e}");
            self.start_failed(peer, generation, e);
        }
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &[u8]) {
        let generation = self.allocate(peer);
        tracing::debug!("answering direct link offer from {peer}");
        if let Err(e) = self.start_responder(peer, offer, generation) {
            tracing::warn!("direct link offer from {peer} rejected: {e}");
            self.start_failed(peer, generation, e);
        }
    }

    fn apply_answer(&mut self, peer: &PeerId, answer: &[u8]) {
        let Some(slot) = self.links.get(peer) else {
            tracing::debug!("answer from {peer} without a pending link");
            return;
        };
        let generation = slot.generation;
        let result = postcard::from_bytes::<LinkAnswer>(answer)
            .map_err(LinkError::from)
            .and_then(|answer| {
                if answer.token == slot.token {
                    Ok(())
                } else {
                    Err(LinkError::TokenMismatch)
                }
            });
        if let Err(e) = result {
            tracing::warn!("bad answer from {peer}: {e}");
            self.emit(peer, generation, LinkEventKind::Failed(e.to_string()));
        }
    }

    fn add_candidate(&mut self, peer: &PeerId, candidate: &[u8]) {
        let Some(sender) = self.links.get(peer).and_then(|slot| slot.candidates.as_ref()) else {
            tracing::debug!("candidate from {peer} without a responding link");
            return;
        };
        match postcard::from_bytes::<LinkCandidate>(candidate) {
            Ok(LinkCandidate { address }) => {
                let _ = sender.send(address);
            }
            Err(e) => tracing::warn!("malformed candidate from {peer}: {e}"),
        }
    }

    fn close(&mut self, peer: &PeerId) {
        self.failed_starts.retain(|(p, _)| p != peer);
        if self.links.remove(peer).is_some() {
            tracing::debug!("closed direct link to {peer}");
        }
    }

    fn send(&mut self, peer: &PeerId, msg: &PeerMessage) -> bool {
        match self.links.get(peer) {
            Some(slot) if slot.open => slot.outbound.send(msg.clone()).is_ok(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Socket tasks
// ---------------------------------------------------------------------------

struct LinkTask {
    peer: PeerId,
    generation: u64,
    frame: FrameConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkTask {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Accept connections until one presents the token.
    async fn run_initiator(
        self,
        listener: TcpListener,
        token: u64,
        outbound: mpsc::UnboundedReceiver<PeerMessage>,
    ) {
        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.emit(LinkEventKind::Failed(format!("accept failed: {e}")));
                    return;
                }
            };
            let presented = tokio::time::timeout(DIAL_TIMEOUT, read_frame(&mut stream, &self.frame)).await;
            match presented {
                Ok(Ok(bytes)) if bytes == token.to_le_bytes() => {
                    drop(listener);
                    self.run_open(stream, outbound).await;
                    return;
                }
                _ => tracing::debug!("rejecting connection from {addr} without the link token"),
            }
        }
    }

    /// Dial candidates as they arrive until one accepts the token.
    async fn run_responder(
        self,
        token: u64,
        mut candidates: mpsc::UnboundedReceiver<SocketAddr>,
        outbound: mpsc::UnboundedReceiver<PeerMessage>,
    ) {
        while let Some(address) = candidates.recv().await {
            match self.dial(address, token).await {
                Ok(stream) => {
                    self.run_open(stream, outbound).await;
                    return;
                }
                Err(e) => tracing::debug!("candidate {address} for {} failed: {e}", self.peer),
            }
        }
    }

    async fn dial(&self, address: SocketAddr, token: u64) -> Result<TcpStream, FrameError> {
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &token.to_le_bytes(), &self.frame).await?;
        Ok(stream)
    }

    async fn run_open(&self, stream: TcpStream, mut outbound: mpsc::UnboundedReceiver<PeerMessage>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {e}");
        }
        let (mut reader, mut writer) = stream.into_split();
        tracing::info!("direct link to {} open", self.peer);
        self.emit(LinkEventKind::Open);

        let mut readers = JoinSet::new();
        let frame = self.frame;
        let events = self.events.clone();
        let peer = self.peer.clone();
        let generation = self.generation;
        readers.spawn(async move {
            loop {
                match read_message::<PeerMessage, _>(&mut reader, &frame).await {
                    Ok(msg) => {
                        let _ = events.send(LinkEvent {
                            peer: peer.clone(),
                            generation,
                            kind: LinkEventKind::Message(msg),
                        });
                    }
                    Err(FrameError::Message(e)) => {
                        tracing::warn!("ignoring undecodable message from {peer}: {e}");
                    }
                    Err(FrameError::ConnectionClosed) => return LinkEventKind::Closed,
                    Err(e) => return LinkEventKind::Failed(e.to_string()),
                }
            }
        });

        let end = loop {
            tokio::select! {
                finished = readers.join_next() => {
                    break match finished {
                        Some(Ok(kind)) => kind,
                        _ => LinkEventKind::Closed,
                    };
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        return;
                    };
                    if let Err(e) = write_message(&mut writer, &msg, &frame).await {
                        break LinkEventKind::Failed(e.to_string());
                    }
                }
            }
        };
        tracing::info!("direct link to {} ended: {end:?}", self.peer);
        self.emit(end);
    }
}
