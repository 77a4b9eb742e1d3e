//! The client engine: one outbound connection, driven by a single serialized
//! task.
//!
//! All session and handshake state lives inside the connection task's
//! `select!` loop, so no two callbacks ever race. Auxiliary work — relay
//! uploads/downloads, the ping timer — runs in spawned tasks that report back
//! through the loop's command channel; if the connection is gone by the time
//! a result arrives, the channel send fails and the result is discarded with
//! the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use airlift_core::relay::{ProgressFn, RelayError, RelayId, RelayStore};
use airlift_core::{
    decode_message, encode_message, HandshakeMessage, Initiator, InitiatorAction,
    NoTransportAvailable, PeerBrowser, PeerDescriptor, Reachability, Route, RoutePolicy, Session,
    SupplyOutcome, WireMessage,
};

/// Read buffer size for the connection loop.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Configuration for the client engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local reachability flags consulted by the route policy.
    pub reachability: Reachability,
    /// Direct-vs-relay selection policy.
    pub route: RoutePolicy,
    /// Bytes written per chunk on the direct path; controls send-progress
    /// granularity.
    pub write_chunk: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reachability: Reachability::default(),
            route: RoutePolicy::default(),
            write_chunk: 64 * 1024,
        }
    }
}

/// Why a connection attempt did not become usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailReason {
    /// The server requires a passcode; supply one via
    /// [`ClientEngine::supply_passcode`].
    PasscodeRequired,
    Other(String),
}

/// Events delivered to the consumer.
#[derive(Debug)]
pub enum ClientEvent {
    /// A discovery scan settled; this list replaces the previous one.
    PeerList(Vec<PeerDescriptor>),
    /// The handshake finished and user payloads may be sent.
    Established,
    /// The connection is up but unusable for user payloads.
    ConnectionFailed { reason: ConnectFailReason },
    /// An application payload arrived (directly or via relay download).
    PayloadReceived(Vec<u8>),
    /// Outgoing transfer progress, 0.0–1.0. NaN on a zero-length transfer.
    SendProgress(f64),
    /// Incoming transfer progress, 0.0–1.0. NaN on a zero-length transfer.
    ReceiveProgress(f64),
    /// A relay upload failed; the send was abandoned.
    SendFailed { error: String },
    /// A relay download failed; the incoming payload was abandoned.
    ReceiveFailed { error: String },
    /// The server answered the ping in time.
    PingAcknowledged,
    /// The ping timeout elapsed without an answer.
    PingTimedOut,
    /// The connection is gone and the session was discarded.
    Disconnected,
}

/// Error type for client engine operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The name did not appear in the last discovery batch.
    #[error("no discovered peer is named {0:?}")]
    NoSuchPeer(String),

    /// Every candidate address of the peer was tried and failed.
    #[error("could not connect to any address of {name:?}: {last_error}")]
    ConnectFailed { name: String, last_error: String },

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// A client owns exactly one connection; disconnect first.
    #[error("already connected")]
    AlreadyConnected,

    /// The handshake gate is closed; supply the required passcode first.
    #[error("not allowed to send before the passcode gate is open")]
    NotAllowedToSend,

    /// Neither the direct nor the relay path is usable.
    #[error(transparent)]
    NoTransport(#[from] NoTransportAvailable),
}

/// State shared between the engine handle and the connection task. Mutated
/// only by the task (and by `connect`/`disconnect` on the handle).
#[derive(Default)]
struct SharedState {
    connected: bool,
    allowed_to_send: bool,
    peers: HashMap<String, PeerDescriptor>,
    scan_generation: u64,
}

/// Commands processed by the connection task.
enum Command {
    SendDirect(Vec<u8>),
    StartRelay(Vec<u8>),
    RelayUploaded(Result<RelayId, RelayError>),
    RelayDownloaded(Result<Vec<u8>, RelayError>),
    SupplyPasscode(String),
    Ping(Duration),
    PingTimeout(u64),
    Disconnect,
}

/// Client engine handle. Construction returns the event receiver the
/// consumer owns; the engine holds only the sending half.
pub struct ClientEngine {
    config: ClientConfig,
    browser: Arc<dyn PeerBrowser>,
    relay: Arc<dyn RelayStore>,
    event_tx: mpsc::Sender<ClientEvent>,
    shared: Arc<RwLock<SharedState>>,
    cmd_tx: RwLock<Option<mpsc::Sender<Command>>>,
}

impl ClientEngine {
    /// Creates a new engine and returns it together with the event receiver.
    pub fn new(
        config: ClientConfig,
        browser: Arc<dyn PeerBrowser>,
        relay: Arc<dyn RelayStore>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let engine = Self {
            config,
            browser,
            relay,
            event_tx,
            shared: Arc::new(RwLock::new(SharedState::default())),
            cmd_tx: RwLock::new(None),
        };
        (engine, event_rx)
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Starts a discovery scan. When the batch settles, the peer table is
    /// replaced wholesale and one [`ClientEvent::PeerList`] fires.
    pub async fn discover_peers(&self) {
        let generation = {
            let mut shared = self.shared.write().await;
            shared.scan_generation += 1;
            shared.scan_generation
        };

        let browser = Arc::clone(&self.browser);
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match browser.scan().await {
                Ok(batch) => {
                    {
                        let mut s = shared.write().await;
                        if s.scan_generation != generation {
                            debug!("scan superseded or stopped; dropping batch");
                            return;
                        }
                        s.peers = batch
                            .iter()
                            .map(|p| (p.name.clone(), p.clone()))
                            .collect();
                    }
                    info!(count = batch.len(), "discovery scan settled");
                    let _ = event_tx.send(ClientEvent::PeerList(batch)).await;
                }
                Err(e) => warn!("discovery scan failed: {e}"),
            }
        });
    }

    /// Halts scanning; results of any in-flight scan are dropped and no
    /// further peer-list events fire.
    pub async fn stop_discovering(&self) {
        let mut shared = self.shared.write().await;
        shared.scan_generation += 1;
    }

    /// Peers from the last settled scan.
    pub async fn discovered_peers(&self) -> Vec<PeerDescriptor> {
        self.shared.read().await.peers.values().cloned().collect()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Connects to a peer by its discovered name, trying its candidate
    /// addresses in order and stopping at the first success.
    ///
    /// The handshake outcome arrives as an event: [`ClientEvent::Established`]
    /// or [`ClientEvent::ConnectionFailed`] with `PasscodeRequired`.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoSuchPeer`] for an unknown name,
    /// [`ClientError::ConnectFailed`] when every address was exhausted, and
    /// [`ClientError::AlreadyConnected`] when a connection exists.
    pub async fn connect(&self, peer_name: &str) -> Result<(), ClientError> {
        let peer = {
            let shared = self.shared.read().await;
            if shared.connected {
                return Err(ClientError::AlreadyConnected);
            }
            shared
                .peers
                .get(peer_name)
                .cloned()
                .ok_or_else(|| ClientError::NoSuchPeer(peer_name.to_string()))?
        };

        let mut last_error = "peer has no candidate addresses".to_string();
        let mut stream = None;
        for &addr in &peer.addresses {
            debug!(%addr, peer = %peer.name, "attempting connection");
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(%addr, "connection attempt failed: {e}");
                    last_error = e.to_string();
                }
            }
        }
        let stream = stream.ok_or(ClientError::ConnectFailed {
            name: peer.name.clone(),
            last_error,
        })?;

        info!(peer = %peer.name, "connected; starting handshake");
        let (reader, writer) = stream.into_split();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        {
            let mut shared = self.shared.write().await;
            shared.connected = true;
            shared.allowed_to_send = false;
        }
        *self.cmd_tx.write().await = Some(cmd_tx.clone());

        let task = ConnectionTask {
            write_chunk: self.config.write_chunk,
            relay: Arc::clone(&self.relay),
            writer,
            shared: Arc::clone(&self.shared),
            event_tx: self.event_tx.clone(),
            cmd_tx,
            session: Session::new(),
            initiator: Initiator::new(),
        };
        tokio::spawn(task.run(reader, cmd_rx));
        Ok(())
    }

    /// Tears down the connection and discards its session. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut shared = self.shared.write().await;
            shared.connected = false;
            shared.allowed_to_send = false;
        }
        if let Some(tx) = self.cmd_tx.write().await.take() {
            let _ = tx.send(Command::Disconnect).await;
        }
    }

    /// True iff a live connection exists. An engine that never connected (or
    /// already disconnected) reports false.
    pub async fn is_connected(&self) -> bool {
        self.shared.read().await.connected
    }

    /// Supplies a passcode guess for a `PasscodeRequired` connection. A
    /// matching guess opens the gate and emits [`ClientEvent::Established`];
    /// a wrong guess leaves the gate closed and may be retried.
    pub async fn supply_passcode(&self, guess: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::SupplyPasscode(guess.into())).await
    }

    // ── Transfer ─────────────────────────────────────────────────────────────

    /// Sends an application payload, choosing the direct or relay path per
    /// the route policy.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotAllowedToSend`] while the gate is closed and
    /// [`ClientError::NoTransport`] when no path is usable; in both cases
    /// nothing is sent.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        {
            let shared = self.shared.read().await;
            if !shared.connected {
                return Err(ClientError::NotConnected);
            }
            if !shared.allowed_to_send {
                return Err(ClientError::NotAllowedToSend);
            }
        }
        let route = self
            .config
            .route
            .route(payload.len(), self.config.reachability)?;
        let cmd = match route {
            Route::Direct => Command::SendDirect(payload),
            Route::Relay => Command::StartRelay(payload),
        };
        self.command(cmd).await
    }

    /// Pings the server. Exactly one of [`ClientEvent::PingAcknowledged`] or
    /// [`ClientEvent::PingTimedOut`] fires per call.
    pub async fn ping(&self, timeout: Duration) -> Result<(), ClientError> {
        self.command(Command::Ping(timeout)).await
    }

    async fn command(&self, cmd: Command) -> Result<(), ClientError> {
        let guard = self.cmd_tx.read().await;
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(cmd).await.map_err(|_| ClientError::NotConnected)
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

/// The single serialized loop that owns the session for one connection.
struct ConnectionTask {
    write_chunk: usize,
    relay: Arc<dyn RelayStore>,
    writer: OwnedWriteHalf,
    shared: Arc<RwLock<SharedState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    /// Loop-back handle given to relay tasks and ping timers.
    cmd_tx: mpsc::Sender<Command>,
    session: Session,
    initiator: Initiator,
}

impl ConnectionTask {
    async fn run(mut self, mut reader: OwnedReadHalf, mut cmd_rx: mpsc::Receiver<Command>) {
        // Ask for permission to send before anything else; the server's
        // answer decides between Established and PasscodeRequired.
        let ask = self.initiator.begin();
        if self
            .write_message(&WireMessage::Handshake(ask), false)
            .await
            .is_err()
        {
            self.finish().await;
            return;
        }

        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!("server closed the connection");
                            break;
                        }
                        Ok(n) => {
                            if !self.handle_chunk(&buf[..n]).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("read error: {e}");
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        // Engine handle dropped.
                        None => break,
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Feeds a chunk into the session; returns false when the connection
    /// must close.
    async fn handle_chunk(&mut self, chunk: &[u8]) -> bool {
        let completed: Vec<_> = self.session.feed(chunk).collect();
        for item in completed {
            let payload = match item {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("stopping read loop: {e}");
                    return false;
                }
            };
            let msg = match decode_message(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("undecodable frame payload, dropping connection: {e}");
                    return false;
                }
            };
            if !self.handle_message(msg).await {
                return false;
            }
        }

        if let Some(fraction) = self.session.receive_progress() {
            let _ = self
                .event_tx
                .send(ClientEvent::ReceiveProgress(fraction))
                .await;
        }
        true
    }

    async fn handle_message(&mut self, msg: WireMessage) -> bool {
        match msg {
            WireMessage::Ping => {
                // The server echoes our own sentinel back; an unsolicited or
                // duplicate echo is swallowed by the session.
                if self.session.acknowledge_ping() {
                    info!("ping acknowledged by server");
                    let _ = self.event_tx.send(ClientEvent::PingAcknowledged).await;
                } else {
                    debug!("ignoring unsolicited ping echo");
                }
            }
            WireMessage::Handshake(hs) => return self.handle_handshake(&hs).await,
            WireMessage::RelayRef(id) => self.start_relay_download(id),
            WireMessage::Blob(bytes) => {
                let _ = self.event_tx.send(ClientEvent::PayloadReceived(bytes)).await;
            }
        }
        true
    }

    async fn handle_handshake(&mut self, hs: &HandshakeMessage) -> bool {
        match self.initiator.on_message(hs) {
            InitiatorAction::Established { reply } => {
                if self
                    .write_message(&WireMessage::Handshake(reply), false)
                    .await
                    .is_err()
                {
                    return false;
                }
                self.shared.write().await.allowed_to_send = true;
                info!("handshake complete; connection established");
                let _ = self.event_tx.send(ClientEvent::Established).await;
            }
            InitiatorAction::PasscodeRequired => {
                info!("server requires a passcode");
                let _ = self
                    .event_tx
                    .send(ClientEvent::ConnectionFailed {
                        reason: ConnectFailReason::PasscodeRequired,
                    })
                    .await;
            }
            InitiatorAction::Ignored => debug!("ignoring unexpected handshake message"),
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendDirect(payload) => {
                if self
                    .write_message(&WireMessage::Blob(payload), true)
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            Command::StartRelay(payload) => self.start_relay_upload(payload),
            Command::RelayUploaded(Ok(id)) => {
                if self
                    .write_message(&WireMessage::RelayRef(id), false)
                    .await
                    .is_err()
                {
                    return false;
                }
                // The reference is on the wire; the transfer counts as done.
                let _ = self.event_tx.send(ClientEvent::SendProgress(1.0)).await;
            }
            Command::RelayUploaded(Err(e)) => {
                warn!("relay upload failed: {e}");
                let _ = self
                    .event_tx
                    .send(ClientEvent::SendFailed {
                        error: e.to_string(),
                    })
                    .await;
            }
            Command::RelayDownloaded(Ok(bytes)) => {
                let _ = self.event_tx.send(ClientEvent::PayloadReceived(bytes)).await;
            }
            Command::RelayDownloaded(Err(e)) => {
                warn!("relay download failed: {e}");
                let _ = self
                    .event_tx
                    .send(ClientEvent::ReceiveFailed {
                        error: e.to_string(),
                    })
                    .await;
            }
            Command::SupplyPasscode(guess) => match self.initiator.supply_passcode(guess) {
                SupplyOutcome::Unlocked { announce } => {
                    if self
                        .write_message(&WireMessage::Handshake(announce), false)
                        .await
                        .is_err()
                    {
                        return false;
                    }
                    self.shared.write().await.allowed_to_send = true;
                    info!("passcode accepted; connection established");
                    let _ = self.event_tx.send(ClientEvent::Established).await;
                }
                SupplyOutcome::StillLocked => {
                    debug!("passcode guess did not match; gate stays closed");
                }
            },
            Command::Ping(timeout) => {
                let token = self.session.arm_ping();
                if self.write_message(&WireMessage::Ping, false).await.is_err() {
                    return false;
                }
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = cmd_tx.send(Command::PingTimeout(token)).await;
                });
            }
            Command::PingTimeout(token) => {
                if self.session.ping_expired(token) {
                    warn!("ping timed out");
                    let _ = self.event_tx.send(ClientEvent::PingTimedOut).await;
                }
            }
            Command::Disconnect => {
                debug!("disconnect requested");
                return false;
            }
        }
        true
    }

    /// Uploads a payload to the relay store off-loop; the result re-enters
    /// through the command channel so it is discarded if the session is gone.
    fn start_relay_upload(&self, payload: Vec<u8>) {
        info!(len = payload.len(), "routing payload via relay");
        let relay = Arc::clone(&self.relay);
        let cmd_tx = self.cmd_tx.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let progress: ProgressFn = Arc::new(move |fraction| {
                let _ = event_tx.try_send(ClientEvent::SendProgress(fraction));
            });
            let result = relay.upload(payload, progress).await;
            let _ = cmd_tx.send(Command::RelayUploaded(result)).await;
        });
    }

    fn start_relay_download(&self, id: RelayId) {
        info!(%id, "received relay reference; downloading");
        let relay = Arc::clone(&self.relay);
        let cmd_tx = self.cmd_tx.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let progress: ProgressFn = Arc::new(move |fraction| {
                let _ = event_tx.try_send(ClientEvent::ReceiveProgress(fraction));
            });
            let result = relay.download(id, progress).await;
            let _ = cmd_tx.send(Command::RelayDownloaded(result)).await;
        });
    }

    /// Frames and writes one message. With `report` set, send progress is
    /// tracked over the message body and emitted per chunk.
    async fn write_message(&mut self, msg: &WireMessage, report: bool) -> std::io::Result<()> {
        let body = encode_message(msg);
        let header = format!("{}\r\n", body.len());
        if let Err(e) = self.write_all(header.as_bytes(), &body, report).await {
            warn!("write error: {e}");
            return Err(e);
        }
        Ok(())
    }

    async fn write_all(
        &mut self,
        header: &[u8],
        body: &[u8],
        report: bool,
    ) -> std::io::Result<()> {
        self.writer.write_all(header).await?;
        if report {
            self.session.begin_send(body.len());
        }
        for part in body.chunks(self.write_chunk.max(1)) {
            self.writer.write_all(part).await?;
            if report {
                let fraction = self.session.record_sent(part.len());
                let _ = self.event_tx.send(ClientEvent::SendProgress(fraction)).await;
            }
        }
        self.writer.flush().await?;
        if report {
            self.session.send_complete();
        }
        Ok(())
    }

    /// Discards the session and tells the consumer. Runs exactly once, at
    /// loop exit.
    async fn finish(self) {
        {
            let mut shared = self.shared.write().await;
            shared.connected = false;
            shared.allowed_to_send = false;
        }
        let _ = self.event_tx.send(ClientEvent::Disconnected).await;
        info!("disconnected");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
