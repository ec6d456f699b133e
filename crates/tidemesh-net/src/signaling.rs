//! Signaling channel: the single reliable, ordered connection to the relay.
//!
//! [`SignalingChannel::connect`] spawns a supervisor task that owns the TCP
//! stream, keeps it alive with heartbeats, and reconnects on a fixed interval
//! within a bounded budget. Everything the rest of the client needs comes out
//! of one event receiver ([`SignalingEvent`]), and everything it sends goes
//! through a cloneable [`SignalingHandle`].
//!
//! Sends are never replayed across connections: a message accepted while one
//! connection was open is discarded if that connection drops before the
//! message is written. The one exception is the greeting set with
//! [`SignalingHandle::set_greeting`], which is written first on every new
//! connection before sends are accepted on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tidemesh_config::SignalingConfig;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::framing::{FrameConfig, FrameError, read_message, write_message};
use crate::messages::{Ping, Pong, SignalMessage, WireMessage};
use crate::reconnection::{RetryPolicy, RetryState};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// Connected, sends are accepted.
    Connected,
    /// Connection lost; a retry may follow.
    Disconnected,
    /// Retry budget exhausted or closed locally. No further attempts.
    Terminated,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    /// The relay closed the stream.
    Closed,
    /// Read or write failed.
    Io,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// The TCP connect itself failed or timed out.
    ConnectFailed,
    /// [`SignalingHandle::close`] was called or every handle was dropped.
    LocalShutdown,
}

/// Everything the signaling channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A connection is open (first connect or reconnect).
    Connected,
    /// The open connection ended.
    Disconnected(DisconnectCode),
    /// An inbound message other than heartbeat traffic.
    Message(SignalMessage),
    /// The retry budget is spent; the session is over.
    Terminated {
        /// Attempts made since the last successful connection.
        attempts: u32,
    },
}

/// Tunables for one channel.
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    /// `host:port` of the relay.
    pub endpoint: String,
    /// Reconnect schedule.
    pub retry: RetryPolicy,
    /// Bound on a single TCP connect.
    pub connect_timeout: Duration,
    /// Ping spacing.
    pub heartbeat_interval: Duration,
    /// Inbound silence that ends the connection.
    pub heartbeat_timeout: Duration,
    /// Frame size limits.
    pub frame: FrameConfig,
}

impl From<&SignalingConfig> for SignalingOptions {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            endpoint: config.relay_endpoint(),
            retry: RetryPolicy::from(config),
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            frame: FrameConfig {
                max_payload_size: config.max_frame_size,
            },
        }
    }
}

/// Where protocol components send signaling messages.
pub trait SignalSink {
    /// Queue `msg`; `false` means undeliverable now.
    fn send(&mut self, msg: SignalMessage) -> bool;

    /// `true` while the channel is open.
    fn is_open(&self) -> bool;

    /// Message the channel writes first on every new connection, before any
    /// other send is accepted on it. Replaces the previous greeting.
    fn set_greeting(&mut self, msg: SignalMessage);
}

/// Cloneable sending side of the channel.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<(u64, SignalMessage)>,
    epoch: Arc<AtomicU64>,
    state: Arc<watch::Sender<ConnectionState>>,
    greeting: Arc<watch::Sender<Option<SignalMessage>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SignalingHandle {
    /// Queue a message for the open connection.
    ///
    /// Returns `false` without queuing when the channel is not open. The
    /// caller treats that as "undeliverable now"; nothing is replayed later.
    pub fn send(&self, msg: SignalMessage) -> bool {
        if !self.is_open() {
            tracing::debug!("signaling closed, dropping {}", msg.kind());
            return false;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        self.outbound.send((epoch, msg)).is_ok()
    }

    /// `true` while a connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Set the message written first on every new connection.
    pub fn set_greeting(&self, msg: SignalMessage) {
        self.greeting.send_replace(Some(msg));
    }

    /// Close the channel for good. No reconnection follows.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl SignalSink for SignalingHandle {
    fn send(&mut self, msg: SignalMessage) -> bool {
        SignalingHandle::send(self, msg)
    }

    fn is_open(&self) -> bool {
        SignalingHandle::is_open(self)
    }

    fn set_greeting(&mut self, msg: SignalMessage) {
        SignalingHandle::set_greeting(self, msg);
    }
}

/// Entry point for the signaling connection.
pub struct SignalingChannel;

impl SignalingChannel {
    /// Spawn the supervisor task and return the handle plus event stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        options: SignalingOptions,
    ) -> (SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let (greeting, greeting_rx) = watch::channel(None);
        let epoch = Arc::new(AtomicU64::new(0));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            options,
            state: Arc::clone(&state),
            epoch: Arc::clone(&epoch),
            greeting: greeting_rx,
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(supervisor.run());

        let handle = SignalingHandle {
            outbound: outbound_tx,
            epoch,
            state,
            greeting: Arc::new(greeting),
            shutdown_tx: Arc::new(shutdown_tx),
        };
        (handle, events_rx)
    }
}

struct Supervisor {
    options: SignalingOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<AtomicU64>,
    greeting: watch::Receiver<Option<SignalMessage>>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    outbound: mpsc::UnboundedReceiver<(u64, SignalMessage)>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let mut retry = RetryState::new(self.options.retry.clone());

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.open().await {
                Ok(stream) => {
                    retry.reset();
                    let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("signaling connected to {}", self.options.endpoint);
                    let _ = self.events.send(SignalingEvent::Connected);

                    let code = self.run_connection(stream, epoch).await;

                    self.set_state(ConnectionState::Disconnected);
                    self.discard_queued();
                    tracing::warn!("signaling disconnected: {code:?}");
                    let _ = self.events.send(SignalingEvent::Disconnected(code));
                    if code == DisconnectCode::LocalShutdown {
                        break;
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::debug!(
                        "signaling connect to {} failed: {e}",
                        self.options.endpoint
                    );
                }
            }

            let Some(delay) = retry.next_delay() else {
                tracing::error!(
                    "signaling gave up after {} reconnection attempts",
                    retry.attempts()
                );
                self.set_state(ConnectionState::Terminated);
                let _ = self.events.send(SignalingEvent::Terminated {
                    attempts: retry.attempts(),
                });
                return;
            };

            tracing::info!(
                "signaling reconnect attempt {} in {delay:?}",
                retry.attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Terminated);
    }

    async fn open(&self) -> std::io::Result<TcpStream> {
        let connect = TcpStream::connect(self.options.endpoint.as_str());
        let mut stream = tokio::time::timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        self.greet(&mut stream).await?;
        Ok(stream)
    }

    /// Write the greeting, if any, ahead of everything else.
    async fn greet(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let Some(msg) = self.greeting.borrow().clone() else {
            return Ok(());
        };
        write_message(stream, &msg, &self.options.frame)
            .await
            .map_err(std::io::Error::other)
    }

    /// Drive one open connection until it ends; returns why it ended.
    async fn run_connection(&mut self, stream: TcpStream, epoch: u64) -> DisconnectCode {
        let (mut reader, mut writer) = stream.into_split();
        let frame = self.options.frame;

        // Reads run in their own task so a half-read frame is never dropped
        // by `select!`.
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                let result = read_message::<SignalMessage, _>(&mut reader, &frame).await;
                let fatal = matches!(&result, Err(e) if !e.is_recoverable());
                if inbound_tx.send(result).is_err() || fatal {
                    break;
                }
            }
        });

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();
        let mut ping_nonce = 0u64;

        let code = loop {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    let Some(result) = inbound else {
                        break DisconnectCode::Closed;
                    };
                    last_inbound = Instant::now();
                    match result {
                        Ok(SignalMessage::Ping(ping)) => {
                            let pong = SignalMessage::Pong(Pong { nonce: ping.nonce });
                            if write_message(&mut writer, &pong, &frame).await.is_err() {
                                break DisconnectCode::Io;
                            }
                        }
                        Ok(SignalMessage::Pong(_)) => {}
                        Ok(msg) => {
                            let _ = self.events.send(SignalingEvent::Message(msg));
                        }
                        Err(FrameError::Message(e)) => {
                            tracing::warn!("ignoring undecodable signaling message: {e}");
                        }
                        Err(FrameError::ConnectionClosed) => break DisconnectCode::Closed,
                        Err(e) => {
                            tracing::warn!("signaling read failed: {e}");
                            break DisconnectCode::Io;
                        }
                    }
                }
                outbound = self.outbound.recv() => {
                    let Some((msg_epoch, msg)) = outbound else {
                        break DisconnectCode::LocalShutdown;
                    };
                    if msg_epoch != epoch {
                        tracing::debug!("discarding {} queued for an earlier connection", msg.kind());
                        continue;
                    }
                    if let Err(e) = write_message(&mut writer, &msg, &frame).await {
                        tracing::warn!("signaling write failed: {e}");
                        break DisconnectCode::Io;
                    }
                }
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > self.options.heartbeat_timeout {
                        break DisconnectCode::HeartbeatTimeout;
                    }
                    ping_nonce += 1;
                    let ping = SignalMessage::Ping(Ping { nonce: ping_nonce });
                    if write_message(&mut writer, &ping, &frame).await.is_err() {
                        break DisconnectCode::Io;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break DisconnectCode::LocalShutdown;
                    }
                }
            }
        };

        reader_task.abort();
        code
    }

    fn discard_queued(&mut self) {
        while let Ok((_, msg)) = self.outbound.try_recv() {
            tracing::debug!("discarding unsent {} after disconnect", msg.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EntityId, Nonce, PeerId, RegionId, SlotName};
    use crate::messages::{ClaimEntity, Envelope, JoinRegion, PROTOCOL_VERSION, QueryClaimState};
    use tokio::net::TcpListener;

    fn test_options(endpoint: String) -> SignalingOptions {
        SignalingOptions {
            endpoint,
            retry: RetryPolicy::fixed(Duration::from_millis(20), 3),
            connect_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            frame: FrameConfig::default(),
        }
    }

    fn claim() -> SignalMessage {
        SignalMessage::ClaimEntity(ClaimEntity {
            entity: EntityId::new("boat_7"),
            slot: SlotName::pilot(),
            nonce: Nonce(11),
        })
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_connects_and_delivers_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let config = FrameConfig::default();
            let first: SignalMessage = read_message(&mut stream, &config).await.unwrap();
            let second: SignalMessage = read_message(&mut stream, &config).await.unwrap();
            (first, second)
        });

        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert!(handle.is_open());

        let query = SignalMessage::QueryClaimState(QueryClaimState {
            entity: EntityId::new("boat_7"),
            slot: SlotName::pilot(),
        });
        assert!(handle.send(claim()));
        assert!(handle.send(query.clone()));

        let (first, second) = server.await.unwrap();
        assert_eq!(first, claim());
        assert_eq!(second, query);
        handle.close();
    }

    #[tokio::test]
    async fn test_inbound_messages_become_events_and_unknown_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let config = FrameConfig::default();
            let envelope = Envelope {
                kind: "weather_report".to_string(),
                body: Vec::new(),
            };
            let mut unknown = vec![PROTOCOL_VERSION];
            unknown.extend(postcard::to_allocvec(&envelope).unwrap());
            crate::framing::write_frame(&mut stream, &unknown, &config)
                .await
                .unwrap();
            write_message(&mut stream, &claim(), &config).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Message(claim())
        );
        handle.close();
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (_second, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Disconnected(DisconnectCode::Closed)
        );
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        handle.close();
    }

    #[tokio::test]
    async fn test_terminates_after_budget() {
        // Bind then drop so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Terminated { attempts: 3 }
        );
        assert_eq!(handle.state(), ConnectionState::Terminated);
        assert!(!handle.send(claim()), "send must fail once terminated");
    }

    #[tokio::test]
    async fn test_send_fails_while_not_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, _events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert!(!handle.is_open());
        assert!(!handle.send(claim()));
    }

    #[tokio::test]
    async fn test_close_stops_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        handle.close();
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Disconnected(DisconnectCode::LocalShutdown)
        );
        let mut state = handle.state.subscribe();
        while *state.borrow() != ConnectionState::Terminated {
            state.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_greeting_precedes_sends_on_every_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let config = FrameConfig::default();
            let (mut first, _) = listener.accept().await.unwrap();
            let greeted: SignalMessage = read_message(&mut first, &config).await.unwrap();
            drop(first);
            let (mut second, _) = listener.accept().await.unwrap();
            let regreeted: SignalMessage = read_message(&mut second, &config).await.unwrap();
            let next: SignalMessage = read_message(&mut second, &config).await.unwrap();
            (greeted, regreeted, next)
        });

        let join = SignalMessage::JoinRegion(JoinRegion {
            region: RegionId::new(0, 0),
            peer_id: PeerId::new("alice"),
        });
        let (handle, mut events) = SignalingChannel::connect(test_options(addr.to_string()));
        handle.set_greeting(join.clone());

        let mut connects = 0;
        while connects < 2 {
            if next_event(&mut events).await == SignalingEvent::Connected {
                connects += 1;
            }
        }
        assert!(handle.send(claim()));

        let (greeted, regreeted, next) = server.await.unwrap();
        assert_eq!(greeted, join);
        assert_eq!(regreeted, join);
        assert_eq!(next, claim());
        handle.close();
    }
}
