//! Peer mesh: one direct link per proximate peer.
//!
//! [`PeerMeshManager`] decides who to connect to and when. It never touches a
//! socket; links are driven through a [`PeerTransport`] and handshake payloads
//! leave through a [`SignalSink`].
//!
//! Rules:
//! - Only the lower [`PeerId`] of a pair initiates. The other side waits for
//!   the offer, so two offers never cross.
//! - Newly proximate peers are connected with a fixed stagger per index, and
//!   no more than `max_concurrent_connecting` handshakes run at once.
//! - A handshake that does not open within `handshake_timeout` fails.
//! - A periodic health check retries failed or closed links the local side
//!   initiates, within a per-peer retry budget.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tidemesh_config::MeshConfig;
use tidemesh_net::{
    LinkEvent, LinkEventKind, PeerId, PeerMessage, PeerTransport, RegionId, SignalMessage,
    SignalPayload, SignalSink,
};

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Link lifecycle of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link and no handshake in progress.
    Absent,
    /// Handshake in progress.
    Connecting,
    /// Link open.
    Open,
    /// Handshake or link failed.
    Failed,
    /// Remote closed the link.
    Closed,
}

/// One remote participant in proximity.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote id.
    pub peer_id: PeerId,
    /// Current link state.
    pub link_state: LinkState,
    /// `true` if the local side opens the link.
    pub is_initiator: bool,
    /// Last region the relay reported for this peer.
    pub last_seen_region: Option<RegionId>,
    connect_due: Option<Instant>,
    connecting_since: Option<Instant>,
    broken_since: Option<Instant>,
    retries: u32,
}

impl Peer {
    fn new(local: &PeerId, peer_id: PeerId, region: Option<RegionId>) -> Self {
        Self {
            is_initiator: local.initiates_with(&peer_id),
            peer_id,
            link_state: LinkState::Absent,
            last_seen_region: region,
            connect_due: None,
            connecting_since: None,
            broken_since: None,
            retries: 0,
        }
    }

    /// Health-check retries used since the link last opened.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

// ---------------------------------------------------------------------------
// Options and events
// ---------------------------------------------------------------------------

/// Mesh timing and limits.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// Delay per peer index for simultaneous arrivals.
    pub stagger_delay: Duration,
    /// Cap on concurrent handshakes.
    pub max_concurrent_connecting: usize,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
    /// Health check spacing (also the retry backoff).
    pub health_check_interval: Duration,
    /// Health-check retries per peer.
    pub max_handshake_retries: u32,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for MeshOptions {
    fn from(config: &MeshConfig) -> Self {
        Self {
            stagger_delay: config.stagger_delay(),
            max_concurrent_connecting: config.max_concurrent_connecting.max(1),
            handshake_timeout: config.handshake_timeout(),
            health_check_interval: config.health_check_interval(),
            max_handshake_retries: config.max_handshake_retries,
        }
    }
}

/// What the mesh reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A link opened; the session sends its `sync` snapshot.
    LinkOpened(PeerId),
    /// An open or connecting link went away.
    LinkLost(PeerId),
    /// A message arrived from a peer.
    Message {
        /// Sender.
        peer: PeerId,
        /// Payload.
        msg: PeerMessage,
    },
    /// Retry budget for a peer is spent.
    GaveUp(PeerId),
}

// ---------------------------------------------------------------------------
// PeerMeshManager
// ---------------------------------------------------------------------------

/// Owns the set of proximate peers and their links.
pub struct PeerMeshManager<T: PeerTransport> {
    local: PeerId,
    transport: T,
    options: MeshOptions,
    peers: BTreeMap<PeerId, Peer>,
    next_health_check: Option<Instant>,
}

impl<T: PeerTransport> PeerMeshManager<T> {
    /// Create a manager for `local` over `transport`.
    pub fn new(local: PeerId, transport: T, options: MeshOptions) -> Self {
        Self {
            local,
            transport,
            options,
            peers: BTreeMap::new(),
            next_health_check: None,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Look up a peer.
    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Iterate peers in id order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of peers with a handshake in progress.
    pub fn connecting_count(&self) -> usize {
        self.count(LinkState::Connecting)
    }

    /// Number of peers with an open link.
    pub fn open_count(&self) -> usize {
        self.count(LinkState::Open)
    }

    fn count(&self, state: LinkState) -> usize {
        self.peers.values().filter(|p| p.link_state == state).count()
    }

    fn mark_broken(peer: &mut Peer, state: LinkState, now: Instant) {
        peer.link_state = state;
        peer.connecting_since = None;
        peer.broken_since = Some(now);
    }

    /// Apply a new proximate set.
    ///
    /// Peers no longer proximate are torn down. New peers are scheduled with
    /// a stagger of `stagger_delay * index` when the local side initiates.
    /// `region_of` supplies each new peer's last known region.
    pub fn set_proximate(
        &mut self,
        proximate: &BTreeSet<PeerId>,
        region_of: impl Fn(&PeerId) -> Option<RegionId>,
        now: Instant,
    ) {
        let departed: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| !proximate.contains(*id))
            .cloned()
            .collect();
        for id in departed {
            self.peers.remove(&id);
            self.transport.close(&id);
            tracing::debug!("peer {id} left proximity");
        }

        let mut index = 0u32;
        for id in proximate {
            if *id == self.local {
                continue;
            }
            if let Some(peer) = self.peers.get_mut(id) {
                peer.last_seen_region = region_of(id);
                continue;
            }
            let mut peer = Peer::new(&self.local, id.clone(), region_of(id));
            if peer.is_initiator {
                peer.connect_due = Some(now + self.options.stagger_delay * index);
                index += 1;
            }
            tracing::debug!("peer {id} entered proximity (initiator: {})", peer.is_initiator);
            self.peers.insert(id.clone(), peer);
        }
    }

    /// Advance timers: handshake timeouts, due connects, health checks.
    pub fn tick(&mut self, now: Instant) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        // Handshake deadlines.
        let timeout = self.options.handshake_timeout;
        for peer in self.peers.values_mut() {
            if peer.link_state == LinkState::Connecting
                && let Some(since) = peer.connecting_since
                && now.saturating_duration_since(since) >= timeout
            {
                tracing::warn!("handshake with {} timed out", peer.peer_id);
                Self::mark_broken(peer, LinkState::Failed, now);
                self.transport.close(&peer.peer_id);
                events.push(MeshEvent::LinkLost(peer.peer_id.clone()));
            }
        }

        // Health check: schedule retries for links we own, one interval after
        // they broke.
        let backoff = self.options.health_check_interval;
        let due = self.next_health_check.is_none_or(|at| now >= at);
        if due {
            self.next_health_check = Some(now + backoff);
            let max = self.options.max_handshake_retries;
            for peer in self.peers.values_mut() {
                let broken = matches!(peer.link_state, LinkState::Failed | LinkState::Closed);
                let waited = peer
                    .broken_since
                    .is_none_or(|since| now.saturating_duration_since(since) >= backoff);
                if !broken || !peer.is_initiator || peer.connect_due.is_some() || !waited {
                    continue;
                }
                if peer.retries >= max {
                    peer.link_state = LinkState::Absent;
                    tracing::warn!("giving up on {} after {} retries", peer.peer_id, peer.retries);
                    events.push(MeshEvent::GaveUp(peer.peer_id.clone()));
                    continue;
                }
                peer.retries += 1;
                peer.connect_due = Some(now);
                tracing::debug!("retrying link to {} ({}/{max})", peer.peer_id, peer.retries);
            }
        }

        // Start due connects, oldest first, within the cap.
        let mut due: Vec<(Instant, PeerId)> = self
            .peers
            .values()
            .filter_map(|p| p.connect_due.filter(|at| *at <= now).map(|at| (at, p.peer_id.clone())))
            .collect();
        due.sort();
        let mut connecting = self.connecting_count();
        for (_, id) in due {
            if connecting >= self.options.max_concurrent_connecting {
                break;
            }
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            peer.connect_due = None;
            peer.link_state = LinkState::Connecting;
            peer.connecting_since = Some(now);
            self.transport.connect(&id);
            connecting += 1;
        }

        events
    }

    /// Handle a handshake message forwarded by the relay.
    pub fn handle_signal(&mut self, msg: &SignalMessage, now: Instant) {
        match msg {
            SignalMessage::SignalOffer(p) => {
                let Some(peer) = self.peers.get_mut(&p.sender) else {
                    tracing::debug!("ignoring offer from non-proximate {}", p.sender);
                    return;
                };
                if peer.is_initiator {
                    tracing::warn!("ignoring offer from {}: local side initiates", p.sender);
                    return;
                }
                peer.link_state = LinkState::Connecting;
                peer.connecting_since = Some(now);
                self.transport.accept_offer(&p.sender, &p.payload);
            }
            SignalMessage::SignalAnswer(p) => {
                if self.peers.contains_key(&p.sender) {
                    self.transport.apply_answer(&p.sender, &p.payload);
                }
            }
            SignalMessage::SignalCandidate(p) => {
                if self.peers.contains_key(&p.sender) {
                    self.transport.add_candidate(&p.sender, &p.payload);
                }
            }
            _ => {}
        }
    }

    /// Handle a transport event. Handshake payloads are forwarded through
    /// `signal`.
    pub fn handle_link_event(
        &mut self,
        event: LinkEvent,
        signal: &mut impl SignalSink,
        now: Instant,
    ) -> Option<MeshEvent> {
        let LinkEvent { peer: id, kind, .. } = event;
        let Some(peer) = self.peers.get_mut(&id) else {
            if !matches!(kind, LinkEventKind::Closed | LinkEventKind::Failed(_)) {
                tracing::debug!("link event from non-proximate {id}, closing");
                self.transport.close(&id);
            }
            return None;
        };

        let payload = |payload: Vec<u8>| SignalPayload {
            recipient: id.clone(),
            sender: self.local.clone(),
            payload,
        };
        let forward = match kind {
            LinkEventKind::Offer(p) => Some(SignalMessage::SignalOffer(payload(p))),
            LinkEventKind::Answer(p) => Some(SignalMessage::SignalAnswer(payload(p))),
            LinkEventKind::Candidate(p) => Some(SignalMessage::SignalCandidate(payload(p))),
            LinkEventKind::Open => {
                peer.link_state = LinkState::Open;
                peer.connecting_since = None;
                peer.broken_since = None;
                peer.retries = 0;
                return Some(MeshEvent::LinkOpened(id));
            }
            LinkEventKind::Message(msg) => return Some(MeshEvent::Message { peer: id, msg }),
            LinkEventKind::Failed(reason) => {
                tracing::debug!("link to {id} failed: {reason}");
                Self::mark_broken(peer, LinkState::Failed, now);
                return Some(MeshEvent::LinkLost(id));
            }
            LinkEventKind::Closed => {
                tracing::debug!("link to {id} closed");
                Self::mark_broken(peer, LinkState::Closed, now);
                return Some(MeshEvent::LinkLost(id));
            }
        };

        if let Some(msg) = forward
            && !signal.send(msg)
        {
            tracing::debug!("signaling down, handshake payload for {id} dropped");
        }
        None
    }

    /// Best-effort send to every open link. Returns the number of successful
    /// sends.
    pub fn broadcast(&mut self, msg: &PeerMessage) -> usize {
        let mut sent = 0;
        for peer in self.peers.values() {
            if peer.link_state == LinkState::Open && self.transport.send(&peer.peer_id, msg) {
                sent += 1;
            }
        }
        sent
    }

    /// Send to one peer if its link is open.
    pub fn send_to(&mut self, id: &PeerId, msg: &PeerMessage) -> bool {
        match self.peers.get(id) {
            Some(peer) if peer.link_state == LinkState::Open => self.transport.send(id, msg),
            _ => false,
        }
    }

    /// Close every link and forget every peer.
    pub fn clear(&mut self) {
        for id in std::mem::take(&mut self.peers).into_keys() {
            self.transport.close(&id);
        }
        self.next_health_check = None;
    }
}
