//! Multi-client simulation: several [`ClientSession`]s against one in-process
//! [`RelayState`] over a fake network with deterministic delivery.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use glam::Vec3;
use tidemesh_net::{
    EntityId, LinkEvent, LinkEventKind, PeerId, PeerMessage, PeerTransport, Pose, RegionId,
    SignalMessage, SignalSink, SlotName, SubjectId, WireMessage,
};

use crate::control::{ControlBinding, ControlBindings, EntityControlState};
use crate::entity::{ControllableEntity, EntityCategory};
use crate::relay::RelayState;
use crate::roster::Occupant;
use crate::session::{ClientSession, RejectReason, SessionEvent, SessionInput, SessionOptions};

// ---------------------------------------------------------------------------
// Fake network
// ---------------------------------------------------------------------------

enum Delivery {
    Signal(PeerId, SignalMessage),
    Link(PeerId, LinkEvent),
}

#[derive(Default)]
struct Network {
    relay: RelayState,
    connected: HashSet<PeerId>,
    to_relay: VecDeque<(PeerId, SignalMessage)>,
    relay_log: Vec<(PeerId, SignalMessage)>,
    to_client: VecDeque<(PeerId, SignalMessage)>,
    link_events: VecDeque<(PeerId, LinkEvent)>,
    open_links: HashSet<(PeerId, PeerId)>,
    /// Drop the next relay message of this kind addressed to this peer.
    drop_once: Option<(PeerId, &'static str)>,
}

impl Network {
    fn route(&mut self) {
        while let Some((from, msg)) = self.to_relay.pop_front() {
            self.relay_log.push((from.clone(), msg.clone()));
            // Like the hub, nothing but a join or ping is taken from a peer
            // that has not joined a region on this connection.
            if self.relay.region_of(&from).is_none()
                && !matches!(msg, SignalMessage::JoinRegion(_) | SignalMessage::Ping(_))
            {
                continue;
            }
            for out in self.relay.handle(&from, msg) {
                if !self.connected.contains(&out.to) {
                    continue;
                }
                if let Some((peer, kind)) = &self.drop_once
                    && *peer == out.to
                    && *kind == out.msg.kind()
                {
                    self.drop_once = None;
                    continue;
                }
                self.to_client.push_back((out.to, out.msg));
            }
        }
    }

    fn next(&mut self) -> Option<Delivery> {
        self.route();
        if let Some((to, msg)) = self.to_client.pop_front() {
            return Some(Delivery::Signal(to, msg));
        }
        self.link_events
            .pop_front()
            .map(|(to, event)| Delivery::Link(to, event))
    }

    fn link_event(&mut self, owner: &PeerId, peer: &PeerId, kind: LinkEventKind) {
        self.link_events.push_back((
            owner.clone(),
            LinkEvent {
                peer: peer.clone(),
                generation: 0,
                kind,
            },
        ));
    }
}

type Net = Rc<RefCell<Network>>;

struct FakeSignal {
    me: PeerId,
    net: Net,
    greeting: Option<SignalMessage>,
}

impl FakeSignal {
    /// A new connection comes up; the greeting goes out ahead of anything
    /// else.
    fn reopen(&mut self) {
        let mut net = self.net.borrow_mut();
        net.connected.insert(self.me.clone());
        if let Some(greeting) = self.greeting.clone() {
            net.to_relay.push_back((self.me.clone(), greeting));
        }
    }
}

impl SignalSink for FakeSignal {
    fn send(&mut self, msg: SignalMessage) -> bool {
        let mut net = self.net.borrow_mut();
        if !net.connected.contains(&self.me) {
            return false;
        }
        net.to_relay.push_back((self.me.clone(), msg));
        true
    }

    fn is_open(&self) -> bool {
        self.net.borrow().connected.contains(&self.me)
    }

    fn set_greeting(&mut self, msg: SignalMessage) {
        self.greeting = Some(msg);
    }
}

/// Links open as soon as the responder accepts the offer.
struct FakeTransport {
    me: PeerId,
    net: Net,
}

impl PeerTransport for FakeTransport {
    fn connect(&mut self, peer: &PeerId) {
        self.net
            .borrow_mut()
            .link_event(&self.me, peer, LinkEventKind::Offer(Vec::new()));
    }

    fn accept_offer(&mut self, peer: &PeerId, _offer: &[u8]) {
        let mut net = self.net.borrow_mut();
        net.open_links.insert((self.me.clone(), peer.clone()));
        net.open_links.insert((peer.clone(), self.me.clone()));
        net.link_event(&self.me, peer, LinkEventKind::Open);
        net.link_event(peer, &self.me, LinkEventKind::Open);
    }

    fn apply_answer(&mut self, _peer: &PeerId, _answer: &[u8]) {}

    fn add_candidate(&mut self, _peer: &PeerId, _candidate: &[u8]) {}

    fn close(&mut self, peer: &PeerId) {
        let mut net = self.net.borrow_mut();
        net.open_links.remove(&(self.me.clone(), peer.clone()));
        if net.open_links.remove(&(peer.clone(), self.me.clone())) {
            net.link_event(peer, &self.me, LinkEventKind::Closed);
        }
    }

    fn send(&mut self, peer: &PeerId, msg: &PeerMessage) -> bool {
        let mut net = self.net.borrow_mut();
        if !net.open_links.contains(&(self.me.clone(), peer.clone())) {
            return false;
        }
        net.link_event(peer, &self.me, LinkEventKind::Message(msg.clone()));
        true
    }
}

#[derive(Default)]
struct CountingBindings {
    acquired: usize,
    released: usize,
    held: HashMap<(EntityId, ControlBinding), i32>,
}

impl ControlBindings for CountingBindings {
    fn acquire(&mut self, entity: &EntityId, binding: ControlBinding) {
        self.acquired += 1;
        *self.held.entry((entity.clone(), binding)).or_default() += 1;
    }

    fn release(&mut self, entity: &EntityId, binding: ControlBinding) {
        self.released += 1;
        *self.held.entry((entity.clone(), binding)).or_default() -= 1;
    }
}

impl CountingBindings {
    fn balanced(&self) -> bool {
        self.held.values().all(|count| *count == 0)
    }
}

type Client = ClientSession<FakeSignal, FakeTransport, CountingBindings>;

// ---------------------------------------------------------------------------
// Simulation driver
// ---------------------------------------------------------------------------

struct Sim {
    net: Net,
    clients: BTreeMap<PeerId, Client>,
    now: Instant,
}

fn boat() -> EntityId {
    EntityId::new("boat_7")
}

fn pilot() -> SlotName {
    SlotName::pilot()
}

fn ship() -> EntityId {
    EntityId::new("ship_1")
}

fn gunner() -> SlotName {
    SlotName::new("gunnerPort")
}

fn id(name: &str) -> PeerId {
    PeerId::new(name)
}

impl Sim {
    fn new() -> Self {
        Self {
            net: Rc::default(),
            clients: BTreeMap::new(),
            now: Instant::now(),
        }
    }

    fn with_clients(names: &[&str]) -> Self {
        let mut sim = Self::new();
        for name in names {
            sim.join(name);
        }
        sim.pump();
        sim
    }

    fn join(&mut self, name: &str) {
        let me = id(name);
        let mut client = ClientSession::new(
            me.clone(),
            FakeSignal {
                me: me.clone(),
                net: self.net.clone(),
                greeting: None,
            },
            FakeTransport {
                me: me.clone(),
                net: self.net.clone(),
            },
            CountingBindings::default(),
            SessionOptions::default(),
            self.now,
        );
        self.net.borrow_mut().connected.insert(me.clone());
        let inputs = [
            SessionInput::SignalConnected,
            SessionInput::SpawnEntity(ControllableEntity::new(
                boat(),
                EntityCategory::Vehicle,
                Vec::new(),
                Pose::default(),
                RegionId::new(0, 0),
            )),
            SessionInput::MoveLocal(Pose::new(Vec3::new(1.0, 0.0, 1.0), 0.0)),
        ];
        for input in inputs {
            client.handle(input, self.now).unwrap();
        }
        self.clients.insert(me, client);
    }

    fn client(&mut self, name: &str) -> &mut Client {
        self.clients.get_mut(&id(name)).unwrap()
    }

    fn input(&mut self, name: &str, input: SessionInput) {
        let now = self.now;
        self.client(name).handle(input, now).unwrap();
    }

    /// Every client learns about a two-seat ship next to the boat.
    fn spawn_ship(&mut self) {
        let now = self.now;
        for client in self.clients.values_mut() {
            let ship = ControllableEntity::new(
                ship(),
                EntityCategory::Vehicle,
                vec![pilot(), gunner()],
                Pose::default(),
                RegionId::new(0, 0),
            );
            client.handle(SessionInput::SpawnEntity(ship), now).unwrap();
        }
    }

    fn claim(&mut self, name: &str) {
        self.claim_seat(name, boat(), pilot());
    }

    fn claim_seat(&mut self, name: &str, entity: EntityId, slot: SlotName) {
        self.input(name, SessionInput::Claim { entity, slot });
    }

    fn release(&mut self, name: &str) {
        self.input(
            name,
            SessionInput::Release {
                entity: boat(),
                slot: pilot(),
            },
        );
    }

    /// Deliver until the network is quiet, checking mutual exclusion after
    /// every delivery.
    fn pump(&mut self) {
        for _ in 0..100_000 {
            let next = self.net.borrow_mut().next();
            let Some(delivery) = next else {
                return;
            };
            let (to, input) = match delivery {
                Delivery::Signal(to, msg) => (to, SessionInput::Signal(msg)),
                Delivery::Link(to, event) => (to, SessionInput::Link(event)),
            };
            let now = self.now;
            if let Some(client) = self.clients.get_mut(&to) {
                client.handle(input, now).unwrap();
            }
            self.assert_exclusive();
        }
        panic!("network never went quiet");
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for client in self.clients.values_mut() {
            client.handle(SessionInput::Tick, now).unwrap();
        }
        self.pump();
    }

    fn advance_in_steps(&mut self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    fn controllers(&self) -> Vec<PeerId> {
        self.clients
            .iter()
            .filter(|(_, c)| matches!(c.control_state(&boat()), EntityControlState::Controlling { .. }))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// No seat is controlled by two clients, and every controlled seat is
    /// the relay's grant to that client.
    fn assert_exclusive(&self) {
        let net = self.net.borrow();
        let mut seated: HashMap<(EntityId, SlotName), &PeerId> = HashMap::new();
        for (peer, client) in &self.clients {
            for entity in client.entities().iter() {
                let EntityControlState::Controlling { slot } = client.control_state(&entity.id) else {
                    continue;
                };
                let holder = net.relay.occupancy().query(&entity.id, &slot);
                assert_eq!(
                    holder,
                    Some(peer),
                    "{peer} controls {}/{slot} without a relay grant",
                    entity.id
                );
                if let Some(other) = seated.insert((entity.id.clone(), slot.clone()), peer) {
                    panic!("{other} and {peer} both control {}/{slot}", entity.id);
                }
            }
        }
    }

    fn holder(&self) -> Option<PeerId> {
        self.seat_holder(&boat(), &pilot())
    }

    fn seat_holder(&self, entity: &EntityId, slot: &SlotName) -> Option<PeerId> {
        self.net
            .borrow()
            .relay
            .occupancy()
            .query(entity, slot)
            .cloned()
    }

    fn claims_sent_by(&self, name: &str) -> usize {
        self.net
            .borrow()
            .relay_log
            .iter()
            .filter(|(from, msg)| *from == id(name) && matches!(msg, SignalMessage::ClaimEntity(_)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_simultaneous_claims_grant_exactly_one() {
    let names = ["a", "b", "c", "d", "e", "f"];
    let mut sim = Sim::with_clients(&names);
    for name in names {
        sim.claim(name);
    }
    sim.pump();

    let controllers = sim.controllers();
    assert_eq!(controllers.len(), 1);
    assert_eq!(sim.holder().as_ref(), controllers.first());

    let rejected = names
        .iter()
        .filter(|name| {
            sim.client(name).drain_events().iter().any(|e| {
                matches!(
                    e,
                    SessionEvent::ClaimRejected {
                        reason: RejectReason::Denied(_),
                        ..
                    }
                )
            })
        })
        .count();
    assert_eq!(rejected, names.len() - 1);
}

#[test]
fn test_control_rotates_without_overlap() {
    let names = ["a", "b", "c", "d"];
    let mut sim = Sim::with_clients(&names);

    for _ in 0..names.len() {
        for name in names {
            if sim.client(name).control_state(&boat()) == EntityControlState::Unowned {
                sim.claim(name);
            }
        }
        sim.pump();
        let controller = sim.controllers().pop().expect("someone controls the boat");
        sim.release(controller.as_str());
        sim.pump();
        assert_eq!(sim.holder(), None);
    }

    for name in names {
        assert!(sim.client(name).bindings().balanced());
    }
}

#[test]
fn test_boat_claim_deny_release_regrant() {
    let mut sim = Sim::with_clients(&["a", "b"]);

    sim.claim("a");
    sim.pump();
    assert_eq!(
        sim.client("a").control_state(&boat()),
        EntityControlState::Controlling { slot: pilot() }
    );

    sim.advance(Duration::from_millis(50));
    sim.claim("b");
    sim.pump();
    let events = sim.client("b").drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::ClaimRejected { reason, .. } if reason.to_string() == "that seat is taken by a"
    )));

    sim.release("a");
    sim.pump();
    assert_eq!(sim.holder(), None);

    sim.claim("b");
    sim.pump();
    assert_eq!(
        sim.client("b").control_state(&boat()),
        EntityControlState::Controlling { slot: pilot() }
    );
    assert_eq!(sim.holder(), Some(id("b")));
}

#[test]
fn test_dropped_grant_reconciles_without_resend() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.net.borrow_mut().drop_once = Some((id("a"), "claim_granted"));

    sim.claim("a");
    sim.pump();
    assert!(matches!(
        sim.client("a").control_state(&boat()),
        EntityControlState::PendingClaim { .. }
    ));
    assert_eq!(sim.holder(), Some(id("a")));

    // Nobody else gets the slot in the meantime.
    sim.claim("b");
    sim.pump();
    assert_eq!(sim.holder(), Some(id("a")));

    sim.advance_in_steps(Duration::from_secs(11), Duration::from_millis(500));
    assert_eq!(
        sim.client("a").control_state(&boat()),
        EntityControlState::Controlling { slot: pilot() }
    );
    assert_eq!(sim.claims_sent_by("a"), 1);
    let queried = sim
        .net
        .borrow()
        .relay_log
        .iter()
        .any(|(from, msg)| *from == id("a") && matches!(msg, SignalMessage::QueryClaimState(_)));
    assert!(queried);
}

#[test]
fn test_cancelled_claim_frees_slot() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.claim("a");
    sim.input(
        "a",
        SessionInput::Cancel {
            entity: boat(),
            slot: pilot(),
        },
    );
    assert_eq!(sim.client("a").control_state(&boat()), EntityControlState::Unowned);

    sim.pump();
    assert_eq!(sim.holder(), None);
    assert_eq!(sim.client("a").control_state(&boat()), EntityControlState::Unowned);
    assert_eq!(sim.client("a").bindings().acquired, 0);

    sim.claim("b");
    sim.pump();
    assert_eq!(sim.holder(), Some(id("b")));
}

#[test]
fn test_bindings_released_once_per_cycle() {
    let mut sim = Sim::with_clients(&["a"]);
    for _ in 0..3 {
        sim.claim("a");
        sim.pump();
        sim.release("a");
        sim.pump();
    }
    let bindings = sim.client("a").bindings();
    assert_eq!(bindings.acquired, 12);
    assert_eq!(bindings.released, 12);
    assert!(bindings.balanced());
}

#[test]
fn test_terminal_disconnect_resets_and_frees() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.claim("a");
    sim.pump();

    {
        let mut net = sim.net.borrow_mut();
        net.connected.remove(&id("a"));
        net.relay.disconnect(&id("a"));
    }
    sim.input("a", SessionInput::SignalDisconnected);
    sim.input("a", SessionInput::SignalTerminated);

    let a = sim.client("a");
    assert_eq!(a.control_state(&boat()), EntityControlState::Unowned);
    assert!(a.bindings().balanced());
    assert!(a.drain_events().contains(&SessionEvent::TerminallyDisconnected));

    sim.claim("b");
    sim.pump();
    assert_eq!(sim.holder(), Some(id("b")));
}

#[test]
fn test_driver_pose_reaches_observer() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.advance_in_steps(Duration::from_secs(1), Duration::from_millis(50));
    assert_eq!(sim.client("a").mesh().open_count(), 1);
    assert_eq!(sim.client("b").mesh().open_count(), 1);

    sim.claim("a");
    sim.pump();
    assert_eq!(
        sim.client("b").control_state(&boat()),
        EntityControlState::ObservingRemoteControl {
            peer: id("a"),
            slot: pilot()
        }
    );

    let target = Pose::new(Vec3::new(12.0, 0.0, 3.0), 0.75);
    sim.input(
        "a",
        SessionInput::UpdateEntityPose {
            entity: boat(),
            pose: target,
        },
    );
    sim.advance_in_steps(Duration::from_millis(500), Duration::from_millis(50));

    let now = sim.now;
    let seen = sim
        .client("b")
        .interpolated_pose(&SubjectId::Entity(boat()), now)
        .unwrap();
    assert!((seen.position - target.position).length() < 1e-3);
    assert!((seen.heading - target.heading).abs() < 1e-3);

    // The observer never wrote the authoritative pose.
    assert_eq!(sim.client("b").entity(&boat()).unwrap().pose, Pose::default());
}

#[test]
fn test_observer_cannot_drive() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.claim("a");
    sim.pump();
    let now = sim.now;
    let result = sim.client("b").handle(
        SessionInput::UpdateEntityPose {
            entity: boat(),
            pose: Pose::new(Vec3::ONE, 0.0),
        },
        now,
    );
    assert!(result.is_err());
}

#[test]
fn test_claim_on_reopened_channel_reaches_relay() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    {
        let mut net = sim.net.borrow_mut();
        net.connected.remove(&id("a"));
        net.relay.disconnect(&id("a"));
    }
    sim.input("a", SessionInput::SignalDisconnected);
    sim.pump();

    // The new connection is up but its connected event is still queued.
    sim.client("a").signal_mut().reopen();
    sim.claim("a");
    sim.pump();
    assert_eq!(sim.holder(), Some(id("a")));
    assert_eq!(
        sim.client("a").control_state(&boat()),
        EntityControlState::Controlling { slot: pilot() }
    );

    sim.input("a", SessionInput::SignalConnected);
    sim.pump();
    assert_eq!(sim.holder(), Some(id("a")));
    assert_eq!(
        sim.client("a").control_state(&boat()),
        EntityControlState::Controlling { slot: pilot() }
    );
}

#[test]
fn test_two_seats_held_by_two_clients() {
    let mut sim = Sim::with_clients(&["a", "b", "c"]);
    sim.spawn_ship();
    sim.advance_in_steps(Duration::from_secs(1), Duration::from_millis(50));
    assert_eq!(sim.client("c").mesh().open_count(), 2);

    sim.claim_seat("a", ship(), pilot());
    sim.claim_seat("b", ship(), gunner());
    sim.pump();

    assert_eq!(sim.seat_holder(&ship(), &pilot()), Some(id("a")));
    assert_eq!(sim.seat_holder(&ship(), &gunner()), Some(id("b")));
    assert_eq!(
        sim.client("a").control_state(&ship()),
        EntityControlState::Controlling { slot: pilot() }
    );
    assert_eq!(
        sim.client("b").control_state(&ship()),
        EntityControlState::Controlling { slot: gunner() }
    );
    assert_eq!(
        sim.client("c").control_state(&ship()),
        EntityControlState::ObservingRemoteControl {
            peer: id("a"),
            slot: pilot()
        }
    );

    // Rosters converge through the occupancy gossip.
    assert_eq!(sim.client("a").crew(&ship()), vec![(gunner(), id("b"))]);
    assert_eq!(sim.client("b").crew(&ship()), vec![(pilot(), id("a"))]);
    assert_eq!(
        sim.client("c").crew(&ship()),
        vec![(gunner(), id("b")), (pilot(), id("a"))]
    );
    assert_eq!(
        sim.client("a").roster(&ship()).and_then(|r| r.get(&pilot())),
        Some(&Occupant::Local)
    );
    assert_eq!(
        sim.client("b").roster(&ship()).and_then(|r| r.get(&gunner())),
        Some(&Occupant::Local)
    );
}

#[test]
fn test_only_pilot_pose_drives_shared_entity() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.spawn_ship();
    sim.advance_in_steps(Duration::from_secs(1), Duration::from_millis(50));
    sim.claim_seat("a", ship(), pilot());
    sim.claim_seat("b", ship(), gunner());
    sim.pump();

    let now = sim.now;
    let refused = sim.client("b").handle(
        SessionInput::UpdateEntityPose {
            entity: ship(),
            pose: Pose::new(Vec3::new(-40.0, 0.0, 0.0), 0.0),
        },
        now,
    );
    assert!(refused.is_err());

    let target = Pose::new(Vec3::new(20.0, 0.0, 6.0), -0.5);
    sim.input(
        "a",
        SessionInput::UpdateEntityPose {
            entity: ship(),
            pose: target,
        },
    );
    sim.advance_in_steps(Duration::from_millis(500), Duration::from_millis(50));

    let now = sim.now;
    let seen = sim
        .client("b")
        .interpolated_pose(&SubjectId::Entity(ship()), now)
        .unwrap();
    assert!((seen.position - target.position).length() < 1e-3);
    assert!((seen.heading - target.heading).abs() < 1e-3);
    assert_eq!(sim.client("b").entity(&ship()).unwrap().pose, Pose::default());
    assert_eq!(sim.client("a").entity(&ship()).unwrap().pose, target);
}

#[test]
fn test_transfer_moves_seat_through_relay() {
    let mut sim = Sim::with_clients(&["a", "b"]);
    sim.spawn_ship();
    sim.advance_in_steps(Duration::from_secs(1), Duration::from_millis(50));
    sim.claim_seat("a", ship(), pilot());
    sim.pump();
    assert_eq!(sim.client("b").crew(&ship()), vec![(pilot(), id("a"))]);

    sim.input(
        "a",
        SessionInput::Transfer {
            entity: ship(),
            to: gunner(),
        },
    );
    sim.pump();

    assert_eq!(
        sim.client("a").control_state(&ship()),
        EntityControlState::Controlling { slot: gunner() }
    );
    assert_eq!(sim.seat_holder(&ship(), &pilot()), None);
    assert_eq!(sim.seat_holder(&ship(), &gunner()), Some(id("a")));
    assert_eq!(sim.client("b").crew(&ship()), vec![(gunner(), id("a"))]);

    // The vacated seat is free for someone else.
    sim.claim_seat("b", ship(), pilot());
    sim.pump();
    assert_eq!(
        sim.client("b").control_state(&ship()),
        EntityControlState::Controlling { slot: pilot() }
    );
    assert_eq!(sim.client("a").crew(&ship()), vec![(pilot(), id("b"))]);
}
