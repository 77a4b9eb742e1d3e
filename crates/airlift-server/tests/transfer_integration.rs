//! End-to-end tests for the client↔server protocol over loopback sockets.
//!
//! These tests exercise both engines through their public APIs, the same way
//! a consumer embeds them: a server advertises on an ephemeral discovery
//! port, clients find it with a real UDP probe, connect over TCP, run the
//! passcode handshake, and move payloads on the direct or relay path.
//!
//! Where a test needs byte-level control of the wire (interleaved transfers,
//! malformed headers, an unresponsive ping target), it speaks the frame
//! protocol directly through a raw socket instead of a `ClientEngine`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use airlift_client::{BrowserConfig, ClientConfig, ClientEngine, ClientError, ClientEvent, ConnectFailReason, UdpBrowser};
use airlift_core::relay::{ProgressFn, RelayError, RelayId, RelayStore};
use airlift_core::{
    decode_message, encode_frame, encode_message, FrameDecoder, HandshakeKind, HandshakeMessage,
    MemoryRelay, Reachability, WireMessage,
};
use airlift_server::{
    Advertiser, AdvertiserConfig, ConnectionId, EngineConfig, ServerEngine, ServerEvent,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Relay wrapper that counts uploads, to prove which path a send took.
struct CountingRelay {
    inner: MemoryRelay,
    uploads: AtomicUsize,
}

impl CountingRelay {
    fn new() -> Self {
        Self {
            inner: MemoryRelay::new(),
            uploads: AtomicUsize::new(0),
        }
    }

    fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl RelayStore for CountingRelay {
    async fn upload(&self, bytes: Vec<u8>, progress: ProgressFn) -> Result<RelayId, RelayError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.inner.upload(bytes, progress).await
    }

    async fn download(&self, id: RelayId, progress: ProgressFn) -> Result<Vec<u8>, RelayError> {
        self.inner.download(id, progress).await
    }
}

// ── Harness helpers ───────────────────────────────────────────────────────────

async fn start_server(
    name: &str,
    passcode: Option<&str>,
    relay: Arc<dyn RelayStore>,
    reachability: Reachability,
) -> (ServerEngine, mpsc::Receiver<ServerEvent>, SocketAddr, u16) {
    let config = EngineConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        discovery_port: 0,
        passcode: passcode.map(str::to_string),
        reachability,
        ..Default::default()
    };
    let (engine, events) = ServerEngine::new(config, relay);
    let addr = engine
        .start_advertising(name, HashMap::new())
        .await
        .expect("server must start");
    let discovery_port = engine.discovery_port().await.expect("advertiser port");
    (engine, events, addr, discovery_port)
}

fn make_client(
    discovery_port: u16,
    relay: Arc<dyn RelayStore>,
    reachability: Reachability,
) -> (ClientEngine, mpsc::Receiver<ClientEvent>) {
    let browser = UdpBrowser::new(BrowserConfig {
        probe_addr: SocketAddr::from(([127, 0, 0, 1], discovery_port)),
        settle_window: Duration::from_millis(250),
        ..Default::default()
    });
    let config = ClientConfig {
        reachability,
        ..Default::default()
    };
    ClientEngine::new(config, Arc::new(browser), relay)
}

/// Discovers the named server and connects to it.
async fn discover_and_connect(
    client: &ClientEngine,
    events: &mut mpsc::Receiver<ClientEvent>,
    name: &str,
) -> Result<()> {
    client.discover_peers().await;
    let list = match next_client_event(events, |e| matches!(e, ClientEvent::PeerList(_))).await {
        ClientEvent::PeerList(list) => list,
        _ => unreachable!(),
    };
    anyhow::ensure!(
        list.iter().any(|p| p.name == name),
        "scan must find {name:?}, got {list:?}"
    );
    client.connect(name).await?;
    Ok(())
}

/// Drains client events until one matches, skipping progress noise.
async fn next_client_event(
    events: &mut mpsc::Receiver<ClientEvent>,
    want: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client event channel closed");
        if want(&event) {
            return event;
        }
    }
}

/// Drains server events until one matches, skipping progress noise.
async fn next_server_event(
    events: &mut mpsc::Receiver<ServerEvent>,
    want: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("server event channel closed");
        if want(&event) {
            return event;
        }
    }
}

async fn expect_peer_connected(events: &mut mpsc::Receiver<ServerEvent>) -> ConnectionId {
    match next_server_event(events, |e| matches!(e, ServerEvent::PeerConnected(_))).await {
        ServerEvent::PeerConnected(id) => id,
        _ => unreachable!(),
    }
}

async fn expect_payload(events: &mut mpsc::Receiver<ServerEvent>) -> (ConnectionId, Vec<u8>) {
    match next_server_event(events, |e| matches!(e, ServerEvent::PayloadReceived { .. })).await {
        ServerEvent::PayloadReceived { from, bytes } => (from, bytes),
        _ => unreachable!(),
    }
}

/// A test peer speaking the frame protocol directly on a raw socket.
struct RawClient {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            decoder: FrameDecoder::new(),
        })
    }

    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        let frame = encode_frame(&encode_message(msg));
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<WireMessage> {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = self.stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "connection closed mid-read");
            let frames: Vec<_> = self.decoder.feed(&buf[..n]).collect();
            if let Some(first) = frames.into_iter().next() {
                let payload = first.map_err(|e| anyhow::anyhow!("frame error: {e}"))?;
                return Ok(decode_message(&payload)?);
            }
        }
    }

    /// Runs the no-passcode handshake to completion.
    async fn handshake(&mut self) -> Result<()> {
        self.write_message(&WireMessage::Handshake(HandshakeMessage::ask_pin_needed()))
            .await?;
        let answer = self.read_message().await?;
        match answer {
            WireMessage::Handshake(hs) if hs.kind == HandshakeKind::PinNotNeeded => {}
            other => anyhow::bail!("expected PinNotNeeded, got {other:?}"),
        }
        self.write_message(&WireMessage::Handshake(HandshakeMessage::client_ready()))
            .await
    }
}

fn patterned(len: usize, mul: u32, add: u32, modulus: u32) -> Vec<u8> {
    (0..len as u32).map(|i| (i.wrapping_mul(mul).wrapping_add(add) % modulus) as u8).collect()
}

// ── Handshake + transfer ──────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_without_passcode_then_transfer_both_ways() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (server, mut server_events, _addr, discovery_port) =
        start_server("open-box", None, Arc::clone(&relay), Reachability::default()).await;
    let (client, mut client_events) =
        make_client(discovery_port, Arc::clone(&relay), Reachability::default());

    discover_and_connect(&client, &mut client_events, "open-box").await?;

    // Both sides agree the connection is usable.
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    let id = expect_peer_connected(&mut server_events).await;
    assert!(client.is_connected().await);

    // Client → server.
    client.send(b"hello over the ether".to_vec()).await?;
    let (from, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(from, id);
    assert_eq!(bytes, b"hello over the ether");

    // Server → client.
    server.send(id, b"right back at you".to_vec()).await?;
    match next_client_event(&mut client_events, |e| {
        matches!(e, ClientEvent::PayloadReceived(_))
    })
    .await
    {
        ClientEvent::PayloadReceived(bytes) => assert_eq!(bytes, b"right back at you"),
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn zero_length_payload_is_delivered() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (_server, mut server_events, _addr, discovery_port) =
        start_server("empty-ok", None, Arc::clone(&relay), Reachability::default()).await;
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "empty-ok").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    client.send(Vec::new()).await?;
    let (_, bytes) = expect_payload(&mut server_events).await;
    assert!(bytes.is_empty());
    Ok(())
}

// ── Passcode gate ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn passcode_gate_locks_until_the_right_guess() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (_server, mut server_events, _addr, discovery_port) = start_server(
        "gated-box",
        Some("X"),
        Arc::clone(&relay),
        Reachability::default(),
    )
    .await;
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "gated-box").await?;

    // The server demands a passcode; the connection is up but unusable.
    match next_client_event(&mut client_events, |e| {
        matches!(e, ClientEvent::ConnectionFailed { .. })
    })
    .await
    {
        ClientEvent::ConnectionFailed { reason } => {
            assert_eq!(reason, ConnectFailReason::PasscodeRequired);
        }
        _ => unreachable!(),
    }
    assert!(matches!(
        client.send(b"blocked".to_vec()).await,
        Err(ClientError::NotAllowedToSend)
    ));

    // A wrong guess keeps the gate closed.
    client.supply_passcode("x").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        client.send(b"still blocked".to_vec()).await,
        Err(ClientError::NotAllowedToSend)
    ));

    // The right guess opens it on both sides.
    client.supply_passcode("X").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    client.send(b"through the gate".to_vec()).await?;
    let (_, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(bytes, b"through the gate");
    Ok(())
}

// ── Multiplexing ──────────────────────────────────────────────────────────────

/// Two connections push 250 kB each, interleaved in 1000-byte slices at the
/// byte-stream level; each payload must assemble intact with no bytes from
/// the other commingled.
#[tokio::test]
async fn interleaved_transfers_do_not_cross_contaminate() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (_server, mut server_events, addr, _discovery_port) =
        start_server("mux-box", None, relay, Reachability::default()).await;

    let mut first = RawClient::connect(addr).await?;
    first.handshake().await?;
    let first_id = expect_peer_connected(&mut server_events).await;

    let mut second = RawClient::connect(addr).await?;
    second.handshake().await?;
    let second_id = expect_peer_connected(&mut server_events).await;
    assert_ne!(first_id, second_id);

    let payload_a = patterned(250_000, 2, 0, 251);
    let payload_b = patterned(250_000, 3, 1, 249);
    let wire_a = encode_frame(&encode_message(&WireMessage::Blob(payload_a.clone())));
    let wire_b = encode_frame(&encode_message(&WireMessage::Blob(payload_b.clone())));

    // Alternate 1000-byte slices between the two sockets. The writer runs
    // in its own task so the test can drain server events concurrently.
    let writer = tokio::spawn(async move {
        let mut offset_a = 0;
        let mut offset_b = 0;
        while offset_a < wire_a.len() || offset_b < wire_b.len() {
            if offset_a < wire_a.len() {
                let end = (offset_a + 1000).min(wire_a.len());
                first.stream.write_all(&wire_a[offset_a..end]).await?;
                first.stream.flush().await?;
                offset_a = end;
            }
            if offset_b < wire_b.len() {
                let end = (offset_b + 1000).min(wire_b.len());
                second.stream.write_all(&wire_b[offset_b..end]).await?;
                second.stream.flush().await?;
                offset_b = end;
            }
        }
        // Keep both sockets open until the server has assembled everything.
        tokio::time::sleep(Duration::from_secs(2)).await;
        anyhow::Ok((first, second))
    });

    let mut received: HashMap<ConnectionId, Vec<u8>> = HashMap::new();
    for _ in 0..2 {
        let (from, bytes) = expect_payload(&mut server_events).await;
        received.insert(from, bytes);
    }

    assert_eq!(received[&first_id], payload_a);
    assert_eq!(received[&second_id], payload_b);
    writer.abort();
    Ok(())
}

// ── Ping ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_is_acknowledged_exactly_once() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (_server, mut server_events, _addr, discovery_port) =
        start_server("pingable", None, Arc::clone(&relay), Reachability::default()).await;
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "pingable").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    client.ping(Duration::from_millis(500)).await?;
    next_client_event(&mut client_events, |e| {
        matches!(e, ClientEvent::PingAcknowledged)
    })
    .await;

    // The timeout must stay silent after the acknowledgement, and no second
    // acknowledgement may appear.
    let extra = timeout(Duration::from_millis(800), async {
        loop {
            match client_events.recv().await {
                Some(ClientEvent::PingAcknowledged) => panic!("second acknowledgement"),
                Some(ClientEvent::PingTimedOut) => panic!("timeout after acknowledgement"),
                Some(_) => continue,
                None => return,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "no further ping events may arrive");
    Ok(())
}

#[tokio::test]
async fn ping_times_out_exactly_once_without_an_answer() -> Result<()> {
    init_tracing();

    // A responder that completes the handshake but swallows everything else,
    // pings included.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let stub_addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let frames: Vec<_> = decoder.feed(&buf[..n]).collect();
            for frame in frames {
                let Ok(payload) = frame else { return };
                if let Ok(WireMessage::Handshake(hs)) = decode_message(&payload) {
                    if hs.kind == HandshakeKind::AskPinNeeded {
                        let reply = encode_frame(&encode_message(&WireMessage::Handshake(
                            HandshakeMessage::pin_not_needed(),
                        )));
                        stream.write_all(&reply).await.unwrap();
                    }
                }
            }
        }
    });

    // Advertise the stub so the client can discover it.
    let advertiser = Advertiser::start(AdvertiserConfig {
        service: airlift_core::discovery::DEFAULT_SERVICE.to_string(),
        name: "mute-box".to_string(),
        transfer_port: stub_addr.port(),
        discovery_port: 0,
        metadata: HashMap::new(),
    })?;

    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (client, mut client_events) =
        make_client(advertiser.port(), relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "mute-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;

    client.ping(Duration::from_millis(200)).await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::PingTimedOut)).await;

    let extra = timeout(Duration::from_millis(500), async {
        loop {
            match client_events.recv().await {
                Some(ClientEvent::PingTimedOut) => panic!("second timeout event"),
                Some(ClientEvent::PingAcknowledged) => panic!("acknowledgement after timeout"),
                Some(_) => continue,
                None => return,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "no further ping events may arrive");
    Ok(())
}

// ── Relay fallback ────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_falls_back_to_relay_above_the_threshold() -> Result<()> {
    init_tracing();
    let relay = Arc::new(CountingRelay::new());
    let relay_dyn: Arc<dyn RelayStore> = relay.clone();

    let (_server, mut server_events, _addr, discovery_port) = start_server(
        "relay-box",
        None,
        Arc::clone(&relay_dyn),
        Reachability::default(),
    )
    .await;
    // Client is off wifi but has internet: small payloads stay direct, large
    // ones go through the relay.
    let (client, mut client_events) = make_client(
        discovery_port,
        Arc::clone(&relay_dyn),
        Reachability {
            wifi: false,
            internet: true,
        },
    );

    discover_and_connect(&client, &mut client_events, "relay-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    // 99 999 bytes: direct path, no upload.
    let small = patterned(99_999, 5, 7, 253);
    client.send(small.clone()).await?;
    let (_, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(bytes, small);
    assert_eq!(relay.uploads(), 0, "payload below threshold must go direct");

    // 100 001 bytes: uploaded once, reference sent, downloaded by the server.
    let large = patterned(100_001, 11, 3, 241);
    client.send(large.clone()).await?;
    let (_, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(bytes, large);
    assert_eq!(relay.uploads(), 1, "payload above threshold must use relay");
    assert!(
        relay.inner.is_empty(),
        "the identifier is single-use; the blob must be gone after download"
    );
    Ok(())
}

#[tokio::test]
async fn server_falls_back_to_relay_above_the_threshold() -> Result<()> {
    init_tracing();
    let relay = Arc::new(CountingRelay::new());
    let relay_dyn: Arc<dyn RelayStore> = relay.clone();

    // Server is off wifi; its big sends go through the relay.
    let (server, mut server_events, _addr, discovery_port) = start_server(
        "uplink-box",
        None,
        Arc::clone(&relay_dyn),
        Reachability {
            wifi: false,
            internet: true,
        },
    )
    .await;
    let (client, mut client_events) = make_client(
        discovery_port,
        Arc::clone(&relay_dyn),
        Reachability::default(),
    );

    discover_and_connect(&client, &mut client_events, "uplink-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    let id = expect_peer_connected(&mut server_events).await;

    let large = patterned(150_000, 13, 5, 239);
    server.send(id, large.clone()).await?;
    match next_client_event(&mut client_events, |e| {
        matches!(e, ClientEvent::PayloadReceived(_))
    })
    .await
    {
        ClientEvent::PayloadReceived(bytes) => assert_eq!(bytes, large),
        _ => unreachable!(),
    }
    assert_eq!(relay.uploads(), 1);
    Ok(())
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_every_client() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (server, mut server_events, _addr, discovery_port) = start_server(
        "chorus-box",
        None,
        Arc::clone(&relay),
        Reachability::default(),
    )
    .await;

    let (first, mut first_events) =
        make_client(discovery_port, Arc::clone(&relay), Reachability::default());
    discover_and_connect(&first, &mut first_events, "chorus-box").await?;
    next_client_event(&mut first_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    let (second, mut second_events) =
        make_client(discovery_port, Arc::clone(&relay), Reachability::default());
    discover_and_connect(&second, &mut second_events, "chorus-box").await?;
    next_client_event(&mut second_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    server.broadcast(b"to everyone at once".to_vec()).await?;

    for events in [&mut first_events, &mut second_events] {
        match next_client_event(events, |e| matches!(e, ClientEvent::PayloadReceived(_))).await {
            ClientEvent::PayloadReceived(bytes) => {
                assert_eq!(bytes, b"to everyone at once");
            }
            _ => unreachable!(),
        }
    }
    Ok(())
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_advertising_keeps_existing_connections_alive() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (server, mut server_events, addr, discovery_port) =
        start_server("closing-box", None, Arc::clone(&relay), Reachability::default()).await;
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "closing-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    expect_peer_connected(&mut server_events).await;

    server.stop_advertising().await;
    assert!(!server.is_running().await);

    // The existing connection still carries payloads.
    client.send(b"still here".to_vec()).await?;
    let (_, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(bytes, b"still here");

    // But nothing new is accepted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "the listener must be gone after stop_advertising"
    );
    Ok(())
}

#[tokio::test]
async fn malformed_header_drops_only_the_offending_connection() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (_server, mut server_events, addr, discovery_port) =
        start_server("tough-box", None, Arc::clone(&relay), Reachability::default()).await;

    // A healthy engine-driven client.
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());
    discover_and_connect(&client, &mut client_events, "tough-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    let healthy_id = expect_peer_connected(&mut server_events).await;

    // A raw socket that sends a garbage header.
    let mut vandal = TcpStream::connect(addr).await?;
    vandal.write_all(b"garbage\r\n").await?;
    vandal.flush().await?;

    match next_server_event(&mut server_events, |e| {
        matches!(e, ServerEvent::PeerDisconnected(_))
    })
    .await
    {
        ServerEvent::PeerDisconnected(id) => {
            assert_ne!(id, healthy_id, "the healthy connection must survive");
        }
        _ => unreachable!(),
    }

    // The healthy connection keeps working.
    client.send(b"unbothered".to_vec()).await?;
    let (from, bytes) = expect_payload(&mut server_events).await;
    assert_eq!(from, healthy_id);
    assert_eq!(bytes, b"unbothered");
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_the_session_on_the_server() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let (server, mut server_events, _addr, discovery_port) =
        start_server("parting-box", None, Arc::clone(&relay), Reachability::default()).await;
    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());

    discover_and_connect(&client, &mut client_events, "parting-box").await?;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Established)).await;
    let id = expect_peer_connected(&mut server_events).await;
    assert_eq!(server.connections().await, vec![id]);

    client.disconnect().await;
    next_client_event(&mut client_events, |e| matches!(e, ClientEvent::Disconnected)).await;
    match next_server_event(&mut server_events, |e| {
        matches!(e, ServerEvent::PeerDisconnected(_))
    })
    .await
    {
        ServerEvent::PeerDisconnected(gone) => assert_eq!(gone, id),
        _ => unreachable!(),
    }
    assert!(server.connections().await.is_empty());

    // Sending to the dead id is an explicit error.
    assert!(matches!(
        server.send(id, b"too late".to_vec()).await,
        Err(airlift_server::ServerError::UnknownConnection(_))
    ));
    Ok(())
}

// ── Discovery metadata ────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_reports_name_addresses_and_metadata() -> Result<()> {
    init_tracing();
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let config = EngineConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        discovery_port: 0,
        ..Default::default()
    };
    let (server, _server_events) = ServerEngine::new(config, Arc::clone(&relay));

    let mut metadata = HashMap::new();
    metadata.insert("kind".to_string(), b"demo".to_vec());
    let addr = server.start_advertising("meta-box", metadata).await?;
    let discovery_port = server.discovery_port().await.unwrap();

    let (client, mut client_events) =
        make_client(discovery_port, relay, Reachability::default());
    client.discover_peers().await;

    let list = match next_client_event(&mut client_events, |e| {
        matches!(e, ClientEvent::PeerList(_))
    })
    .await
    {
        ClientEvent::PeerList(list) => list,
        _ => unreachable!(),
    };

    let peer = list
        .iter()
        .find(|p| p.name == "meta-box")
        .expect("advertised peer must be found");
    assert_eq!(peer.addresses, vec![addr]);
    assert_eq!(peer.metadata.get("kind").unwrap(), b"demo");
    Ok(())
}
