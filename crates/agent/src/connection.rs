//! Sync channel connection manager.
//!
//! One background task owns the WebSocket connection to the paired peer
//! and drives the channel state machine:
//!
//! ```text
//! Idle -> Connecting -> AwaitingPairingAck -> Connected
//!           ^                  |                  |
//!           |                  v                  v
//!           +----------- Disconnected <-----------+
//!                              |
//!                       (backoff timer)
//! ```
//!
//! Interaction happens through a [`ConnectionHandle`]: commands flow in on
//! a bounded channel, state flows out as [`StateSnapshot`] values on a
//! watch channel. The manager is the only writer of connection state, so a
//! snapshot is always internally consistent (a `Connected` snapshot never
//! carries a stale attempt counter).
//!
//! On transport open the manager sends a PAIRING_REQUEST carrying the
//! pairing code and a fresh public key. A truthy PAIRING_RESPONSE promotes
//! the channel to `Connected`, derives the session key when the peer sent
//! its own key, and persists the pairing. Anything falsy rejects the code
//! and stops reconnecting; transport failures instead schedule a reconnect
//! with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::Url;

use tether_protocol::{
    decode_public_key, to_payload, Envelope, ErrorPayload, HeartbeatPayload, Keypair, MessageType,
    PairingRequestPayload, PairingResponsePayload, ProtocolError, SessionCipher, TypedEnvelope,
};

use crate::config::Config;
use crate::dispatcher::MessageDispatcher;
use crate::pairing::{LocalIdentity, PairingStore};
use crate::platform::PowerMonitor;

/// Bound on the command and outbound frame queues.
const QUEUE_DEPTH: usize = 256;

/// Channel connection settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket path of the peer's sync endpoint.
    pub service_path: String,
    /// Limit on the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Interval between transport-level keepalive pings.
    pub keepalive_interval: Duration,
    /// How long to wait for the pairing acknowledgement.
    pub pairing_ack_timeout: Duration,
    /// Base reconnect delay.
    pub base_delay: Duration,
    /// Reconnect delay cap.
    pub max_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            service_path: "/tether".to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            pairing_ack_timeout: Duration::from_secs(15),
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl ChannelConfig {
    /// Builds channel settings from the agent configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_path: config.network.service_path.clone(),
            base_delay: config.reconnect.base_delay(),
            max_delay: config.reconnect.max_delay(),
            ..Self::default()
        }
    }
}

/// Reconnect delay for the given attempt count: exponential in the number
/// of consecutive failures, with the exponent and the delay both capped.
pub fn reconnect_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.min(5);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Where the channel should connect and how to introduce ourselves.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    /// Out-of-band pairing code shown on the peer.
    pub code: String,
    /// Peer public key recorded by a previous pairing, if any. Used when
    /// the pairing response does not carry one.
    pub peer_public_key: Option<String>,
}

/// The channel state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No target configured.
    Idle,
    /// Transport handshake in progress.
    Connecting,
    /// Transport open, PAIRING_REQUEST sent, waiting for the ack.
    AwaitingPairingAck,
    /// Pairing acknowledged; application traffic flows.
    Connected {
        peer_name: String,
    },
    /// User-requested shutdown in progress.
    Closing,
    /// Transport lost or pairing failed.
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// One consistent observation of the channel.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    /// Consecutive reconnect attempts since the last successful pairing.
    pub attempts: u32,
    /// Whether a session key protects application frames.
    pub encrypted: bool,
}

impl StateSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            encrypted: false,
        }
    }
}

enum Command {
    Connect(ConnectTarget),
    Disconnect,
    Send(Envelope),
}

enum TransportEvent {
    Frame(String),
    Closed(String),
}

enum Tick {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Keepalive,
    Reconnect,
    PairingExpired,
}

/// Cloneable front end to the connection manager task.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<StateSnapshot>,
}

impl ConnectionHandle {
    /// Configures a target and starts connecting to it.
    pub async fn connect(&self, target: ConnectTarget) -> Result<()> {
        self.cmd_tx
            .send(Command::Connect(target))
            .await
            .context("connection manager stopped")
    }

    /// Closes the channel and stops reconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Disconnect)
            .await
            .context("connection manager stopped")
    }

    /// Queues an envelope for the peer.
    ///
    /// Non-blocking: while the channel is down or the queue is full the
    /// envelope is dropped with a log line, never an error.
    pub fn send(&self, envelope: Envelope) {
        if let Err(e) = self.cmd_tx.try_send(Command::Send(envelope)) {
            debug!("Dropping outbound envelope: {}", e);
        }
    }

    /// The latest state snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state_rx.borrow().clone()
    }

    /// A watch receiver for following state changes.
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_rx.clone()
    }

    /// Waits until a snapshot satisfies the predicate, or the timeout
    /// elapses. Returns the matching snapshot.
    pub async fn wait_for(
        &self,
        limit: Duration,
        predicate: impl Fn(&StateSnapshot) -> bool,
    ) -> Option<StateSnapshot> {
        let mut rx = self.state_rx.clone();
        timeout(limit, async move {
            loop {
                {
                    let current = rx.borrow_and_update().clone();
                    if predicate(&current) {
                        return current;
                    }
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .ok()
    }
}

/// The connection manager task. Create with [`ConnectionManager::new`],
/// then drive it with [`ConnectionManager::run`] (or `spawn`).
pub struct ConnectionManager {
    config: ChannelConfig,
    identity: LocalIdentity,
    dispatcher: MessageDispatcher,
    power: Arc<dyn PowerMonitor>,
    store: Arc<PairingStore>,

    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<StateSnapshot>,

    state: ConnectionState,
    attempts: u32,
    target: Option<ConnectTarget>,
    user_disconnected: bool,

    keypair: Option<Keypair>,
    cipher: SessionCipher,

    out_tx: Option<mpsc::Sender<WsMessage>>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,

    reconnect_at: Option<Instant>,
    pairing_deadline: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        config: ChannelConfig,
        identity: LocalIdentity,
        dispatcher: MessageDispatcher,
        power: Arc<dyn PowerMonitor>,
        store: Arc<PairingStore>,
    ) -> (Self, ConnectionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(StateSnapshot::initial());

        let manager = Self {
            config,
            identity,
            dispatcher,
            power,
            store,
            cmd_rx,
            state_tx,
            state: ConnectionState::Idle,
            attempts: 0,
            target: None,
            user_disconnected: false,
            keypair: None,
            cipher: SessionCipher::Passthrough,
            out_tx: None,
            transport_rx: None,
            reconnect_at: None,
            pairing_deadline: None,
        };
        let handle = ConnectionHandle { cmd_tx, state_rx };
        (manager, handle)
    }

    /// Spawns the manager onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until every [`ConnectionHandle`] is dropped.
    pub async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let tick = tokio::select! {
                cmd = self.cmd_rx.recv() => Tick::Command(cmd),
                event = recv_or_pending(&mut self.transport_rx) => Tick::Transport(event),
                _ = keepalive.tick(), if self.out_tx.is_some() => Tick::Keepalive,
                _ = sleep_until_opt(self.reconnect_at), if self.reconnect_at.is_some() => Tick::Reconnect,
                _ = sleep_until_opt(self.pairing_deadline), if self.pairing_deadline.is_some() => Tick::PairingExpired,
            };

            match tick {
                Tick::Command(Some(command)) => self.handle_command(command).await,
                Tick::Command(None) => {
                    debug!("All handles dropped, stopping connection manager");
                    self.teardown_transport();
                    break;
                }
                Tick::Transport(Some(TransportEvent::Frame(text))) => {
                    self.handle_frame(&text).await;
                }
                Tick::Transport(Some(TransportEvent::Closed(reason))) => {
                    warn!("Channel transport closed: {}", reason);
                    self.on_transport_lost();
                }
                Tick::Transport(None) => {
                    self.on_transport_lost();
                }
                Tick::Keepalive => self.send_ping(),
                Tick::Reconnect => {
                    self.reconnect_at = None;
                    self.attempts += 1;
                    self.begin_connect().await;
                }
                Tick::PairingExpired => {
                    warn!("Timed out waiting for pairing acknowledgement");
                    self.pairing_deadline = None;
                    self.on_transport_lost();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(target) => {
                self.user_disconnected = false;
                self.teardown_transport();
                self.reconnect_at = None;
                self.attempts = 0;
                self.target = Some(target);
                self.begin_connect().await;
            }
            Command::Disconnect => {
                info!("Disconnect requested");
                self.user_disconnected = true;
                self.set_state(ConnectionState::Closing);
                self.teardown_transport();
                self.target = None;
                self.reconnect_at = None;
                self.pairing_deadline = None;
                self.attempts = 0;
                self.set_state(ConnectionState::Idle);
            }
            Command::Send(envelope) => {
                // Writable as soon as the transport is up; the peer decides
                // what it accepts before acknowledging the pairing
                let writable = self.state.is_connected()
                    || self.state == ConnectionState::AwaitingPairingAck;
                if writable {
                    self.send_envelope(&envelope);
                } else {
                    debug!(
                        "Dropping {} envelope while {:?}",
                        envelope.kind, self.state
                    );
                }
            }
        }
    }

    async fn begin_connect(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let raw = format!(
            "ws://{}:{}{}",
            target.host, target.port, self.config.service_path
        );
        let url = match Url::parse(&raw) {
            Ok(url) => url,
            Err(e) => {
                error!("Invalid channel URL {}: {}", raw, e);
                self.target = None;
                self.on_transport_lost();
                return;
            }
        };
        info!("Connecting to {}", url);

        let connected = timeout(self.config.connect_timeout, connect_async(url.as_str())).await;
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", url, e);
                self.on_transport_lost();
                return;
            }
            Err(_) => {
                warn!("Connection to {} timed out", url);
                self.on_transport_lost();
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(QUEUE_DEPTH);

        // Writer task: owns the sink until the queue closes.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Channel write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: forwards text frames, reports the close reason.
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if event_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "peer closed".to_string());
                        let _ = event_tx.send(TransportEvent::Closed(reason)).await;
                        break;
                    }
                    // Binary frames and control frames carry no envelopes
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(TransportEvent::Closed(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = event_tx
                            .send(TransportEvent::Closed("stream ended".to_string()))
                            .await;
                        break;
                    }
                }
            }
        });

        self.out_tx = Some(out_tx);
        self.transport_rx = Some(event_rx);

        // Fresh key per connection attempt
        let keypair = Keypair::generate();
        let request = PairingRequestPayload {
            code: target.code.clone(),
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            device_model: self.identity.device_model.clone(),
            public_key: Some(keypair.public_key_base64()),
        };
        self.keypair = Some(keypair);
        self.cipher = SessionCipher::Passthrough;

        match to_payload(&request) {
            Ok(payload) => {
                let envelope = Envelope::new(MessageType::PairingRequest, payload);
                self.send_envelope(&envelope);
                self.pairing_deadline = Some(Instant::now() + self.config.pairing_ack_timeout);
                self.set_state(ConnectionState::AwaitingPairingAck);
            }
            Err(e) => {
                error!("Failed to build pairing request: {}", e);
                self.on_transport_lost();
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let envelope = match self.decode_frame(text) {
            Ok(envelope) => envelope,
            Err(ProtocolError::AuthFailure(reason)) => {
                warn!("Rejecting unauthenticated frame: {}", reason);
                self.send_error("CRYPTO_FAILURE", "frame failed authentication");
                return;
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match envelope.message_type() {
            Some(MessageType::PairingResponse) => self.handle_pairing_response(&envelope),
            Some(MessageType::Heartbeat) if self.state.is_connected() => self.reply_heartbeat(),
            _ if self.state.is_connected() => {
                if let Some(reply) = self.dispatcher.dispatch(&envelope) {
                    self.send_envelope(&reply);
                }
            }
            _ => {
                // Pairing acknowledgement must come first
                warn!(
                    "Dropping {} received before pairing acknowledgement",
                    envelope.kind
                );
            }
        }
    }

    fn handle_pairing_response(&mut self, envelope: &Envelope) {
        if self.state != ConnectionState::AwaitingPairingAck {
            debug!("Ignoring pairing response while {:?}", self.state);
            return;
        }
        self.pairing_deadline = None;

        let payload = match TypedEnvelope::from_envelope(envelope) {
            Ok(TypedEnvelope::PairingResponse(payload)) => payload,
            _ => PairingResponsePayload {
                success: None,
                device_name: None,
                public_key: None,
            },
        };

        if !payload.accepted() {
            warn!("Pairing rejected by peer");
            // A rejected code will keep being rejected; do not retry it
            self.target = None;
            self.teardown_transport();
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let target = self.target.clone();
        let peer_name = payload
            .device_name
            .clone()
            .unwrap_or_else(|| "Desktop".to_string());

        // Prefer the key in the response, fall back to the stored one
        let peer_key = payload
            .public_key
            .clone()
            .or_else(|| target.as_ref().and_then(|t| t.peer_public_key.clone()));
        self.establish_session_key(peer_key.as_deref());

        self.attempts = 0;
        self.set_state(ConnectionState::Connected {
            peer_name: peer_name.clone(),
        });
        info!(
            "Paired with {} (encrypted: {})",
            peer_name,
            self.cipher.is_keyed()
        );

        if let Some(target) = target {
            if let Err(e) = self.store.record_pairing(
                &target.host,
                target.port,
                &peer_name,
                &target.code,
                peer_key.as_deref(),
            ) {
                warn!("Failed to persist pairing: {}", e);
            }
        }
    }

    /// Derives the session key from our ephemeral secret and the peer's
    /// public key. Stays in passthrough when the peer sent no usable key.
    fn establish_session_key(&mut self, peer_key: Option<&str>) {
        let (Some(keypair), Some(peer_key)) = (self.keypair.as_ref(), peer_key) else {
            debug!("No peer public key; channel stays unencrypted");
            return;
        };

        match decode_public_key(peer_key) {
            Ok(peer_public) => {
                self.cipher = SessionCipher::Keyed(keypair.derive_session_key(&peer_public));
            }
            Err(e) => {
                warn!("Peer public key unusable ({}); channel stays unencrypted", e);
            }
        }
    }

    fn reply_heartbeat(&mut self) {
        let payload = HeartbeatPayload {
            battery: self.power.battery_level(),
            charging: self.power.is_charging(),
        };
        debug!(
            "Answering heartbeat (battery {}%, charging {})",
            payload.battery, payload.charging
        );
        match to_payload(&payload) {
            Ok(payload) => {
                let envelope = Envelope::new(MessageType::Heartbeat, payload);
                self.send_envelope(&envelope);
            }
            Err(e) => warn!("Failed to build heartbeat reply: {}", e),
        }
    }

    fn send_error(&mut self, code: &str, message: &str) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        if let Ok(payload) = to_payload(&payload) {
            let envelope = Envelope::new(MessageType::Error, payload);
            self.send_envelope(&envelope);
        }
    }

    /// Encodes and queues an envelope, sealing application frames when a
    /// session key is established. Handshake frames always go in clear:
    /// they are what the key is derived from.
    fn send_envelope(&mut self, envelope: &Envelope) {
        let frame = match self.frame_for(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.kind, e);
                return;
            }
        };
        let Some(out_tx) = &self.out_tx else {
            debug!("Dropping {} envelope without transport", envelope.kind);
            return;
        };
        if let Err(e) = out_tx.try_send(WsMessage::Text(frame)) {
            warn!("Outbound queue rejected {} envelope: {}", envelope.kind, e);
        }
    }

    fn frame_for(&self, envelope: &Envelope) -> tether_protocol::Result<String> {
        let text = envelope.encode()?;
        if self.cipher.is_keyed() && !is_handshake(envelope) {
            self.cipher.seal(&text)
        } else {
            Ok(text)
        }
    }

    fn decode_frame(&self, text: &str) -> tether_protocol::Result<Envelope> {
        if self.cipher.is_keyed() {
            let plain = self.cipher.open(text)?;
            Envelope::decode(&plain)
        } else {
            Envelope::decode(text)
        }
    }

    fn send_ping(&mut self) {
        if let Some(out_tx) = &self.out_tx {
            if let Err(e) = out_tx.try_send(WsMessage::Ping(Vec::new())) {
                debug!("Failed to queue keepalive ping: {}", e);
            }
        }
    }

    /// Transport gone: drop it and either stay down (user asked, or no
    /// target) or schedule the next attempt.
    fn on_transport_lost(&mut self) {
        self.teardown_transport();
        self.pairing_deadline = None;

        if self.user_disconnected || self.target.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = reconnect_delay(self.config.base_delay, self.config.max_delay, self.attempts);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
        info!(
            "Reconnecting in {:?} (attempt {})",
            delay,
            self.attempts + 1
        );
    }

    fn teardown_transport(&mut self) {
        if let Some(out_tx) = self.out_tx.take() {
            let _ = out_tx.try_send(WsMessage::Close(None));
        }
        self.transport_rx = None;
        self.keypair = None;
        self.cipher = SessionCipher::Passthrough;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Channel state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(StateSnapshot {
            state: self.state.clone(),
            attempts: self.attempts,
            encrypted: self.cipher.is_keyed(),
        });
    }
}

fn is_handshake(envelope: &Envelope) -> bool {
    matches!(
        envelope.message_type(),
        Some(MessageType::PairingRequest | MessageType::PairingResponse)
    )
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
