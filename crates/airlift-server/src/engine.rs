//! The server engine: accept loop, session arena, and per-connection
//! multiplexing.
//!
//! Every accepted connection gets a monotonically increasing
//! [`ConnectionId`]; the session arena is keyed by that id, never by the
//! socket, so connection identity stays unambiguous for the whole lifetime
//! of the engine.
//!
//! Concurrency model: one central task owns the arena. Per-connection reader
//! tasks do nothing but forward raw chunks (tagged with their id) into the
//! central task's command channel, so all session mutation is serialized —
//! bytes from two clients can interleave on the network, but their sessions
//! are only ever touched one command at a time. Relay transfers run in
//! spawned tasks and re-enter through the same channel; a result whose
//! connection has disappeared is discarded with it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use airlift_core::discovery::{DiscoveryError, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE};
use airlift_core::relay::{ProgressFn, RelayError, RelayId, RelayStore};
use airlift_core::{
    decode_message, encode_message, NoTransportAvailable, Reachability, Responder,
    ResponderAction, Route, RoutePolicy, Session, WireMessage,
};

use crate::advertiser::{Advertiser, AdvertiserConfig};

/// Read buffer size for connection reader tasks.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Identifier of one accepted connection. Assigned at accept time and never
/// reused within an engine's lifetime.
pub type ConnectionId = u64;

/// Configuration for the server engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the transfer listener binds to.
    pub bind_address: std::net::IpAddr,
    /// TCP port for the transfer listener; 0 picks an ephemeral port that is
    /// then published via discovery.
    pub transfer_port: u16,
    /// UDP port the advertiser answers probes on; 0 picks an ephemeral port
    /// (used by tests).
    pub discovery_port: u16,
    /// Service label to advertise under.
    pub service: String,
    /// Server-wide passcode requirement; `None` means clients may send
    /// without one.
    pub passcode: Option<String>,
    /// Local reachability flags consulted by the route policy.
    pub reachability: Reachability,
    /// Direct-vs-relay selection policy, evaluated per send and per
    /// broadcast recipient.
    pub route: RoutePolicy,
    /// Bytes written per chunk on the direct path.
    pub write_chunk: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".parse().unwrap(),
            transfer_port: 0,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            service: DEFAULT_SERVICE.to_string(),
            passcode: None,
            reachability: Reachability::default(),
            route: RoutePolicy::default(),
            write_chunk: 64 * 1024,
        }
    }
}

/// Events delivered to the consumer.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client finished its handshake and announced readiness.
    PeerConnected(ConnectionId),
    /// A connection closed; its session was removed in the same step.
    PeerDisconnected(ConnectionId),
    /// An application payload arrived (directly or via relay download).
    PayloadReceived { from: ConnectionId, bytes: Vec<u8> },
    /// Outgoing transfer progress for one connection, 0.0–1.0.
    SendProgress { to: ConnectionId, fraction: f64 },
    /// Incoming transfer progress for one connection, 0.0–1.0. NaN on a
    /// zero-length transfer.
    ReceiveProgress { from: ConnectionId, fraction: f64 },
    /// A send to this connection was abandoned (relay fault or no
    /// transport during broadcast).
    SendFailed { to: ConnectionId, error: String },
    /// A relay download for this connection failed.
    ReceiveFailed { from: ConnectionId, error: String },
}

/// Error type for server engine operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The transfer listener could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The discovery advertiser could not start.
    #[error("advertiser error: {0}")]
    Advertise(#[from] DiscoveryError),

    /// The engine is already accepting connections.
    #[error("already advertising")]
    AlreadyRunning,

    /// The engine task is gone.
    #[error("engine is not running")]
    NotRunning,

    /// No live connection carries this id.
    #[error("no live connection with id {0}")]
    UnknownConnection(ConnectionId),

    /// Neither the direct nor the relay path is usable for this payload.
    #[error(transparent)]
    NoTransport(#[from] NoTransportAvailable),
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Listener/advertiser state owned by the handle.
struct Inner {
    accepting: bool,
    local_addr: Option<SocketAddr>,
    advertiser: Option<Advertiser>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

/// Server engine handle. Construction returns the event receiver the
/// consumer owns.
pub struct ServerEngine {
    config: EngineConfig,
    cmd_tx: mpsc::Sender<Cmd>,
    inner: RwLock<Inner>,
}

impl ServerEngine {
    /// Creates a new engine and returns it together with the event receiver.
    /// Nothing listens until [`ServerEngine::start_advertising`] is called.
    ///
    /// Must be called within a Tokio runtime; the engine task is spawned
    /// here.
    pub fn new(
        config: EngineConfig,
        relay: Arc<dyn RelayStore>,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let task = EngineTask {
            responder: Responder::new(config.passcode.clone()),
            relay,
            route: config.route,
            reachability: config.reachability,
            write_chunk: config.write_chunk,
            event_tx,
            cmd_tx: cmd_tx.clone(),
            conns: HashMap::new(),
            next_id: 1,
        };
        tokio::spawn(task.run(cmd_rx));

        let engine = Self {
            config,
            cmd_tx,
            inner: RwLock::new(Inner {
                accepting: false,
                local_addr: None,
                advertiser: None,
                shutdown_tx: None,
            }),
        };
        (engine, event_rx)
    }

    /// Binds the transfer listener, starts accepting connections, and
    /// publishes the service on the discovery port. Returns the listener's
    /// bound address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] / [`ServerError::Advertise`] when a socket
    /// cannot be bound, [`ServerError::AlreadyRunning`] when called twice.
    pub async fn start_advertising(
        &self,
        name: &str,
        metadata: HashMap<String, Vec<u8>>,
    ) -> Result<SocketAddr, ServerError> {
        let mut inner = self.inner.write().await;
        if inner.accepting {
            return Err(ServerError::AlreadyRunning);
        }

        let bind = SocketAddr::new(self.config.bind_address, self.config.transfer_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ServerError::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: bind, source })?;

        let advertiser = Advertiser::start(AdvertiserConfig {
            service: self.config.service.clone(),
            name: name.to_string(),
            transfer_port: local_addr.port(),
            discovery_port: self.config.discovery_port,
            metadata,
        })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(accept_loop(listener, self.cmd_tx.clone(), shutdown_rx));

        info!(addr = %local_addr, name, "advertising started");
        inner.accepting = true;
        inner.local_addr = Some(local_addr);
        inner.advertiser = Some(advertiser);
        inner.shutdown_tx = Some(shutdown_tx);
        Ok(local_addr)
    }

    /// Stops accepting new connections and withdraws the advertisement.
    /// Existing connections are left untouched; there is no forced teardown.
    pub async fn stop_advertising(&self) {
        let mut inner = self.inner.write().await;
        if let Some(tx) = inner.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(advertiser) = inner.advertiser.take() {
            advertiser.stop();
        }
        inner.accepting = false;
        inner.local_addr = None;
        info!("advertising stopped; existing connections remain open");
    }

    /// True iff both the accept listener and the advertisement are active.
    pub async fn is_running(&self) -> bool {
        let inner = self.inner.read().await;
        inner.accepting
            && inner
                .advertiser
                .as_ref()
                .map(Advertiser::is_running)
                .unwrap_or(false)
    }

    /// Bound address of the transfer listener while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.read().await.local_addr
    }

    /// UDP port the advertiser answers probes on while running.
    pub async fn discovery_port(&self) -> Option<u16> {
        self.inner.read().await.advertiser.as_ref().map(Advertiser::port)
    }

    /// Sends an application payload to one connection, choosing the direct
    /// or relay path per the route policy.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnknownConnection`] for a dead id and
    /// [`ServerError::NoTransport`] when no path is usable.
    pub async fn send(&self, to: ConnectionId, payload: Vec<u8>) -> Result<(), ServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Send {
                to,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        reply_rx.await.map_err(|_| ServerError::NotRunning)?
    }

    /// Sends an application payload to every live connection. The route is
    /// evaluated independently per recipient, and one recipient's failure
    /// (surfaced as [`ServerEvent::SendFailed`]) does not affect the others.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<(), ServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Broadcast {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        reply_rx.await.map_err(|_| ServerError::NotRunning)
    }

    /// Ids of the currently live connections.
    pub async fn connections(&self) -> Vec<ConnectionId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::ListConnections { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<Cmd>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(%addr, "new connection");
                        if cmd_tx.send(Cmd::Accepted(stream, addr)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
}

/// Forwards raw chunks from one connection into the central task.
async fn reader_task(id: ConnectionId, mut reader: OwnedReadHalf, cmd_tx: mpsc::Sender<Cmd>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if cmd_tx.send(Cmd::Chunk(id, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(id, "read error: {e}");
                break;
            }
        }
    }
    let _ = cmd_tx.send(Cmd::Closed(id)).await;
}

// ── Central task ──────────────────────────────────────────────────────────────

enum Cmd {
    Accepted(TcpStream, SocketAddr),
    Chunk(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
    Send {
        to: ConnectionId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    ListConnections {
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    RelayUploaded {
        to: ConnectionId,
        result: Result<RelayId, RelayError>,
    },
    RelayDownloaded {
        from: ConnectionId,
        result: Result<Vec<u8>, RelayError>,
    },
}

/// One live connection in the arena.
struct Connection {
    session: Session,
    writer: OwnedWriteHalf,
    /// Set when the client announced readiness via the handshake.
    peer_ready: bool,
    reader: tokio::task::JoinHandle<()>,
}

/// The central task owning the session arena.
struct EngineTask {
    responder: Responder,
    relay: Arc<dyn RelayStore>,
    route: RoutePolicy,
    reachability: Reachability,
    write_chunk: usize,
    event_tx: mpsc::Sender<ServerEvent>,
    /// Loop-back handle given to relay tasks.
    cmd_tx: mpsc::Sender<Cmd>,
    conns: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl EngineTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            self.handle(cmd).await;
        }
        // Engine handle dropped: stop the readers, drop the sockets.
        for (_, conn) in self.conns.drain() {
            conn.reader.abort();
        }
        debug!("engine task stopped");
    }

    async fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Accepted(stream, addr) => self.on_accept(stream, addr),
            Cmd::Chunk(id, bytes) => self.on_chunk(id, &bytes).await,
            Cmd::Closed(id) => {
                self.remove_connection(id, "connection closed").await;
            }
            Cmd::Send { to, payload, reply } => {
                let result = self.start_send(to, payload).await;
                let _ = reply.send(result);
            }
            Cmd::Broadcast { payload, reply } => {
                let _ = reply.send(());
                self.broadcast(payload).await;
            }
            Cmd::ListConnections { reply } => {
                let _ = reply.send(self.conns.keys().copied().collect());
            }
            Cmd::RelayUploaded { to, result } => self.on_relay_uploaded(to, result).await,
            Cmd::RelayDownloaded { from, result } => {
                self.on_relay_downloaded(from, result).await
            }
        }
    }

    /// Creates a fresh session for an accepted connection and starts its
    /// header-read loop. The handshake is client-driven; nothing is sent
    /// until the client asks.
    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(reader_task(id, read_half, self.cmd_tx.clone()));
        self.conns.insert(
            id,
            Connection {
                session: Session::new(),
                writer: write_half,
                peer_ready: false,
                reader,
            },
        );
        info!(id, %addr, "connection accepted; awaiting handshake");
    }

    async fn on_chunk(&mut self, id: ConnectionId, chunk: &[u8]) {
        let Some(conn) = self.conns.get_mut(&id) else {
            debug!(id, "chunk for a removed connection; dropping");
            return;
        };

        let completed: Vec<_> = conn.session.feed(chunk).collect();
        for item in completed {
            let payload = match item {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(id, "malformed frame header, dropping connection: {e}");
                    self.remove_connection(id, "malformed frame header").await;
                    return;
                }
            };
            let msg = match decode_message(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(id, "undecodable frame payload, dropping connection: {e}");
                    self.remove_connection(id, "undecodable frame payload").await;
                    return;
                }
            };
            if !self.dispatch(id, msg).await {
                self.remove_connection(id, "write failure").await;
                return;
            }
        }

        if let Some(conn) = self.conns.get(&id) {
            if let Some(fraction) = conn.session.receive_progress() {
                let _ = self
                    .event_tx
                    .send(ServerEvent::ReceiveProgress { from: id, fraction })
                    .await;
            }
        }
    }

    /// Classifies one completed payload. Returns false when the connection
    /// must be dropped because a reply could not be written.
    async fn dispatch(&mut self, id: ConnectionId, msg: WireMessage) -> bool {
        match msg {
            WireMessage::Ping => {
                debug!(id, "ping received; acknowledging");
                self.write_to(id, &WireMessage::Ping, false).await
            }
            WireMessage::Handshake(hs) => match self.responder.on_message(&hs) {
                ResponderAction::Reply(reply) => {
                    self.write_to(id, &WireMessage::Handshake(reply), false).await
                }
                ResponderAction::PeerReady => {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.peer_ready = true;
                    }
                    info!(id, "peer connected");
                    let _ = self.event_tx.send(ServerEvent::PeerConnected(id)).await;
                    true
                }
                ResponderAction::Ignored => {
                    debug!(id, "ignoring unexpected handshake message");
                    true
                }
            },
            WireMessage::RelayRef(relay_id) => {
                self.start_relay_download(id, relay_id);
                true
            }
            WireMessage::Blob(bytes) => {
                let _ = self
                    .event_tx
                    .send(ServerEvent::PayloadReceived { from: id, bytes })
                    .await;
                true
            }
        }
    }

    /// Routes one send. Called from the command handler with the caller
    /// waiting on the result, so route and liveness errors surface there.
    async fn start_send(
        &mut self,
        to: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), ServerError> {
        if !self.conns.contains_key(&to) {
            return Err(ServerError::UnknownConnection(to));
        }
        let route = self.route.route(payload.len(), self.reachability)?;
        match route {
            Route::Direct => {
                if !self.write_to(to, &WireMessage::Blob(payload), true).await {
                    self.remove_connection(to, "write failure").await;
                }
            }
            Route::Relay => self.start_relay_upload(to, payload),
        }
        Ok(())
    }

    /// One independent route decision per live connection; a failed
    /// recipient surfaces as `SendFailed` without affecting the rest.
    async fn broadcast(&mut self, payload: Vec<u8>) {
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        info!(recipients = ids.len(), len = payload.len(), "broadcast");
        for id in ids {
            match self.route.route(payload.len(), self.reachability) {
                Ok(Route::Direct) => {
                    if !self
                        .write_to(id, &WireMessage::Blob(payload.clone()), true)
                        .await
                    {
                        self.remove_connection(id, "write failure").await;
                    }
                }
                Ok(Route::Relay) => self.start_relay_upload(id, payload.clone()),
                Err(e) => {
                    let _ = self
                        .event_tx
                        .send(ServerEvent::SendFailed {
                            to: id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    fn start_relay_upload(&self, to: ConnectionId, payload: Vec<u8>) {
        info!(to, len = payload.len(), "routing payload via relay");
        let relay = Arc::clone(&self.relay);
        let cmd_tx = self.cmd_tx.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let progress: ProgressFn = Arc::new(move |fraction| {
                let _ = event_tx.try_send(ServerEvent::SendProgress { to, fraction });
            });
            let result = relay.upload(payload, progress).await;
            let _ = cmd_tx.send(Cmd::RelayUploaded { to, result }).await;
        });
    }

    fn start_relay_download(&self, from: ConnectionId, relay_id: RelayId) {
        info!(from, %relay_id, "received relay reference; downloading");
        let relay = Arc::clone(&self.relay);
        let cmd_tx = self.cmd_tx.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let progress: ProgressFn = Arc::new(move |fraction| {
                let _ = event_tx.try_send(ServerEvent::ReceiveProgress { from, fraction });
            });
            let result = relay.download(relay_id, progress).await;
            let _ = cmd_tx.send(Cmd::RelayDownloaded { from, result }).await;
        });
    }

    async fn on_relay_uploaded(&mut self, to: ConnectionId, result: Result<RelayId, RelayError>) {
        if !self.conns.contains_key(&to) {
            debug!(to, "relay upload finished for a dead connection; discarding");
            return;
        }
        match result {
            Ok(relay_id) => {
                if self.write_to(to, &WireMessage::RelayRef(relay_id), false).await {
                    // The reference is on the wire; the transfer counts as done.
                    let _ = self
                        .event_tx
                        .send(ServerEvent::SendProgress { to, fraction: 1.0 })
                        .await;
                } else {
                    self.remove_connection(to, "write failure").await;
                }
            }
            Err(e) => {
                warn!(to, "relay upload failed: {e}");
                let _ = self
                    .event_tx
                    .send(ServerEvent::SendFailed {
                        to,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn on_relay_downloaded(
        &mut self,
        from: ConnectionId,
        result: Result<Vec<u8>, RelayError>,
    ) {
        if !self.conns.contains_key(&from) {
            debug!(from, "relay download finished for a dead connection; discarding");
            return;
        }
        match result {
            Ok(bytes) => {
                let _ = self
                    .event_tx
                    .send(ServerEvent::PayloadReceived { from, bytes })
                    .await;
            }
            Err(e) => {
                warn!(from, "relay download failed: {e}");
                let _ = self
                    .event_tx
                    .send(ServerEvent::ReceiveFailed {
                        from,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Frames and writes one message to a connection. Returns false on I/O
    /// failure (the caller removes the connection).
    async fn write_to(&mut self, id: ConnectionId, msg: &WireMessage, report: bool) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            debug!(id, "write to a removed connection; dropping");
            return true;
        };

        let body = encode_message(msg);
        let header = format!("{}\r\n", body.len());

        if let Err(e) = conn.writer.write_all(header.as_bytes()).await {
            warn!(id, "write error: {e}");
            return false;
        }
        if report {
            conn.session.begin_send(body.len());
        }
        for part in body.chunks(self.write_chunk.max(1)) {
            if let Err(e) = conn.writer.write_all(part).await {
                warn!(id, "write error: {e}");
                return false;
            }
            if report {
                let fraction = conn.session.record_sent(part.len());
                let _ = self
                    .event_tx
                    .send(ServerEvent::SendProgress { to: id, fraction })
                    .await;
            }
        }
        if let Err(e) = conn.writer.flush().await {
            warn!(id, "flush error: {e}");
            return false;
        }
        if report {
            conn.session.send_complete();
        }
        true
    }

    /// Removes the session atomically with the disconnect notification; no
    /// orphaned sessions, and a partial assembly buffer vanishes silently.
    async fn remove_connection(&mut self, id: ConnectionId, why: &str) {
        if let Some(conn) = self.conns.remove(&id) {
            conn.reader.abort();
            info!(id, why, "peer disconnected");
            let _ = self.event_tx.send(ServerEvent::PeerDisconnected(id)).await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
