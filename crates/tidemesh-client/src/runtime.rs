//! The client event loop.
//!
//! One task owns the [`ClientSession`] and feeds it from four sources:
//! signaling events, direct-link events, console lines and a fixed tick.

use std::time::{Duration, Instant};

use tidemesh_config::Config;
use tidemesh_net::{
    DirectLinkBackend, EntityId, FrameConfig, LinkError, LinkEvent, PeerId, Pose,
    SignalingChannel, SignalingEvent, SignalingHandle, SignalingOptions, SlotName,
};
use tidemesh_sync::{
    ClientSession, ControllableEntity, EntityControlState, SessionEvent, SessionInput,
    SessionOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::commands::{self, Command, HELP};
use crate::host::ConsoleBindings;

/// Fatal client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The link backend could not start.
    #[error("link backend: {0}")]
    Link(#[from] LinkError),

    /// Console I/O failed.
    #[error("console: {0}")]
    Io(#[from] std::io::Error),
}

type Session = ClientSession<SignalingHandle, DirectLinkBackend, ConsoleBindings>;

/// Whether the loop keeps going after a console line.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Running client.
pub struct ClientRuntime {
    session: Session,
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    tick_interval: Duration,
}

impl ClientRuntime {
    /// Start the signaling channel and link backend for `local`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config, local: PeerId) -> Result<Self, ClientError> {
        let frame = FrameConfig {
            max_payload_size: config.signaling.max_frame_size,
        };
        let (transport, links) =
            DirectLinkBackend::new(local.clone(), &config.mesh.advertise_address, frame)?;
        let (handle, signaling) = SignalingChannel::connect(SignalingOptions::from(&config.signaling));

        let session = ClientSession::new(
            local,
            handle,
            transport,
            ConsoleBindings::new(),
            SessionOptions::from(config),
            Instant::now(),
        );
        Ok(Self {
            session,
            signaling,
            links,
            tick_interval: config.control.tick_interval(),
        })
    }

    /// Run until `quit`, end of input, or terminal disconnection.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        tracing::info!("client {} started; type 'help' for commands", self.session.local());

        loop {
            tokio::select! {
                Some(event) = self.signaling.recv() => self.on_signaling(event),
                Some(event) = self.links.recv() => {
                    if let Some(event) = self.session.transport_mut().admit(event) {
                        self.input(SessionInput::Link(event));
                    }
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if self.on_line(&line) == Flow::Quit {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.input(SessionInput::Tick),
            }

            self.report_events();
            if self.session.is_terminated() {
                tracing::error!("relay unreachable, giving up");
                break;
            }
        }

        self.session.signal().close();
        Ok(())
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        let input = match event {
            SignalingEvent::Connected => SessionInput::SignalConnected,
            SignalingEvent::Disconnected(code) => {
                tracing::warn!("relay connection lost: {code:?}");
                SessionInput::SignalDisconnected
            }
            SignalingEvent::Message(msg) => SessionInput::Signal(msg),
            SignalingEvent::Terminated { attempts } => {
                tracing::error!("relay reconnection failed after {attempts} attempts");
                SessionInput::SignalTerminated
            }
        };
        self.input(input);
    }

    fn input(&mut self, input: SessionInput) {
        if let Err(e) = self.session.handle(input, Instant::now()) {
            println!("refused: {e}");
        }
    }

    fn on_line(&mut self, line: &str) -> Flow {
        let command = match commands::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                println!("{e}");
                return Flow::Continue;
            }
        };

        let input = match command {
            Command::Spawn {
                entity,
                category,
                position,
                slots,
            } => {
                let region = self.session.regions().region_at(position);
                let pose = Pose::new(position, 0.0);
                SessionInput::SpawnEntity(ControllableEntity::new(entity, category, slots, pose, region))
            }
            Command::Despawn(entity) => SessionInput::DespawnEntity(entity),
            Command::Move(pose) => SessionInput::MoveLocal(pose),
            Command::Claim { entity, slot } => {
                let Some(slot) = slot.or_else(|| self.driving_slot(&entity)) else {
                    println!("unknown entity {entity}");
                    return Flow::Continue;
                };
                SessionInput::Claim { entity, slot }
            }
            Command::Release { entity, slot } => {
                let Some(slot) = slot.or_else(|| self.held_slot(&entity)) else {
                    println!("you are not in {entity}");
                    return Flow::Continue;
                };
                SessionInput::Release { entity, slot }
            }
            Command::Cancel { entity, slot } => {
                let Some(slot) = slot.or_else(|| self.pending_slot(&entity)) else {
                    println!("no claim pending on {entity}");
                    return Flow::Continue;
                };
                SessionInput::Cancel { entity, slot }
            }
            Command::Seat { entity, to } => SessionInput::Transfer { entity, to },
            Command::Drive { entity, pose } => SessionInput::UpdateEntityPose { entity, pose },
            Command::Event(event) => SessionInput::SendGameEvent(event),
            Command::Status => {
                self.print_status();
                return Flow::Continue;
            }
            Command::Help => {
                println!("{HELP}");
                return Flow::Continue;
            }
            Command::Quit => return Flow::Quit,
        };
        self.input(input);
        Flow::Continue
    }

    fn driving_slot(&self, entity: &EntityId) -> Option<SlotName> {
        self.session.entity(entity).map(|e| e.driving_slot().clone())
    }

    fn held_slot(&self, entity: &EntityId) -> Option<SlotName> {
        match self.session.control_state(entity) {
            EntityControlState::Controlling { slot } | EntityControlState::PendingRelease { slot } => {
                Some(slot)
            }
            _ => None,
        }
    }

    fn pending_slot(&self, entity: &EntityId) -> Option<SlotName> {
        match self.session.control_state(entity) {
            EntityControlState::PendingClaim { slot, .. } => Some(slot),
            _ => None,
        }
    }

    fn print_status(&self) {
        let s = &self.session;
        let region = s
            .regions()
            .local_region()
            .map_or_else(|| "-".to_string(), |r| r.to_string());
        println!(
            "peer {} | relay {} | region {} | links {}/{}",
            s.local(),
            if s.signal().is_open() { "up" } else { "down" },
            region,
            s.mesh().open_count(),
            s.regions().proximate().len(),
        );
        for entity in s.entities().iter() {
            println!("  {} @ {}: {:?}", entity.id, entity.region, s.control_state(&entity.id));
            for (slot, peer) in s.crew(&entity.id) {
                println!("    {slot}: {peer}");
            }
        }
        println!("  bindings live: {}", s.bindings().active_count());
    }

    fn report_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::ControlChanged { entity, state } => {
                    tracing::info!("{entity}: {state:?}");
                }
                SessionEvent::ClaimRejected {
                    entity,
                    slot,
                    reason,
                } => println!("could not take {slot} of {entity}: {reason}"),
                SessionEvent::ControlLost { entity, slot } => {
                    println!("lost {slot} of {entity} while disconnected");
                }
                SessionEvent::InvariantViolation {
                    entity,
                    slot,
                    holder,
                } => {
                    tracing::error!("{slot} of {entity} is held by {holder} according to the relay");
                }
                SessionEvent::RemotePose { subject, pose } => {
                    tracing::trace!("{subject} at {:?}", pose.position);
                }
                SessionEvent::ProximityChanged { entered, left } => {
                    tracing::info!("nearby: +{entered:?} -{left:?}");
                }
                SessionEvent::TerminallyDisconnected => {
                    println!("disconnected from the relay");
                }
                SessionEvent::GameEvent { from, event } => {
                    println!("[{from}] {}: {}", event.kind, String::from_utf8_lossy(&event.payload));
                }
            }
        }
    }
}
