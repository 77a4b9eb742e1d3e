//! UDP probe responder — the server side of discovery.
//!
//! The advertiser binds a UDP socket on the discovery port and answers every
//! `Probe` for its service label with a unicast `Announce` carrying the
//! server's display name, the TCP port of its transfer listener, and the
//! published metadata. Browsers on the LAN broadcast probes; the answer's
//! source address is how they learn where to connect.
//!
//! The responder runs as a blocking loop on a dedicated thread so the
//! synchronous socket I/O never touches the Tokio runtime. The socket uses a
//! 500 ms read timeout; on each timeout the loop checks the shutdown flag and
//! exits cleanly once [`Advertiser::stop`] has been called.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use airlift_core::discovery::{
    decode_discovery, encode_discovery, DiscoveryError, DiscoveryMessage,
};

/// Configuration for one advertisement.
#[derive(Debug, Clone)]
pub struct AdvertiserConfig {
    /// Service label to answer probes for.
    pub service: String,
    /// Display name other devices will see.
    pub name: String,
    /// TCP port of the transfer listener, published in the announce.
    pub transfer_port: u16,
    /// UDP port to listen for probes on; 0 picks an ephemeral port.
    pub discovery_port: u16,
    /// Opaque metadata published alongside the name.
    pub metadata: HashMap<String, Vec<u8>>,
}

/// Handle to a running probe responder.
pub struct Advertiser {
    running: Arc<AtomicBool>,
    port: u16,
}

impl Advertiser {
    /// Binds the discovery socket and spawns the responder thread.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Bind`] if the socket cannot be bound.
    pub fn start(config: AdvertiserConfig) -> Result<Self, DiscoveryError> {
        let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.discovery_port));
        let socket =
            UdpSocket::bind(addr).map_err(|source| DiscoveryError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .ok();
        let port = socket.local_addr().map(|a| a.port())?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_flag = Arc::clone(&running);
        std::thread::Builder::new()
            .name("airlift-advertiser".to_string())
            .spawn(move || advertise_loop(socket, config, thread_flag))
            .map_err(DiscoveryError::Io)?;

        info!(port, "advertiser listening for probes");
        Ok(Self { running, port })
    }

    /// UDP port the responder is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Withdraws the advertisement. The responder thread notices the flag at
    /// its next read timeout and exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// The receive loop executed on the advertiser thread.
fn advertise_loop(socket: UdpSocket, config: AdvertiserConfig, running: Arc<AtomicBool>) {
    let announce = encode_discovery(&DiscoveryMessage::Announce {
        service: config.service.clone(),
        name: config.name.clone(),
        port: config.transfer_port,
        metadata: config.metadata.clone(),
    });
    let mut buf = vec![0u8; 2048];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("advertiser recv error: {e}");
                continue;
            }
        };

        match decode_discovery(&buf[..len]) {
            Ok(DiscoveryMessage::Probe { service }) if service == config.service => {
                debug!(from = %src, "probe received; announcing as {:?}", config.name);
                if let Err(e) = socket.send_to(&announce, src) {
                    warn!("failed to answer probe from {src}: {e}");
                }
            }
            Ok(other) => {
                debug!(from = %src, "ignoring discovery datagram: {other:?}");
            }
            Err(e) => {
                debug!(from = %src, "undecodable discovery datagram: {e}");
            }
        }
    }

    info!("advertiser stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
