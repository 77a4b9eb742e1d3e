//! UDP probe/announce browsing — the client side of discovery.
//!
//! The browser broadcasts a `Probe` datagram for its service label and then
//! collects `Announce` answers until the settle window elapses. Every
//! advertiser on the LAN that serves the label replies unicast with its name,
//! transfer port, and metadata; the answer's source IP plus the advertised
//! port form the peer's candidate address.
//!
//! One [`UdpBrowser::scan`] call produces one settled batch; the engine
//! replaces its peer list with it wholesale.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

use airlift_core::discovery::{
    decode_discovery, encode_discovery, DiscoveryError, DiscoveryMessage, PeerBrowser,
    PeerDescriptor, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE,
};

/// Configuration for the UDP browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Service label to probe for.
    pub service: String,
    /// Where probes are sent. The default is the LAN broadcast address on
    /// the standard discovery port; tests point this at a loopback
    /// advertiser instead.
    pub probe_addr: SocketAddr,
    /// How long to collect answers before the batch settles.
    pub settle_window: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            probe_addr: SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)),
            settle_window: Duration::from_millis(750),
        }
    }
}

/// Probe/collect browser over a throwaway UDP socket per scan.
#[derive(Debug, Clone)]
pub struct UdpBrowser {
    config: BrowserConfig,
}

impl UdpBrowser {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerBrowser for UdpBrowser {
    async fn scan(&self) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        let probe = encode_discovery(&DiscoveryMessage::Probe {
            service: self.config.service.clone(),
        });
        socket.send_to(&probe, self.config.probe_addr).await?;
        debug!(to = %self.config.probe_addr, service = %self.config.service, "probe sent");

        let deadline = Instant::now() + self.config.settle_window;
        let mut peers: Vec<PeerDescriptor> = Vec::new();
        let mut buf = vec![0u8; 2048];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let received = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await
            {
                // Settle window elapsed; the batch is complete.
                Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            let (len, src) = received;

            match decode_discovery(&buf[..len]) {
                Ok(DiscoveryMessage::Announce {
                    service,
                    name,
                    port,
                    metadata,
                }) if service == self.config.service => {
                    let addr = SocketAddr::new(src.ip(), port);
                    debug!(%name, %addr, "announce received");
                    match peers.iter_mut().find(|p| p.name == name) {
                        // Same name announced from several interfaces: keep
                        // one descriptor, append the extra candidate address.
                        Some(existing) => {
                            if !existing.addresses.contains(&addr) {
                                existing.addresses.push(addr);
                            }
                        }
                        None => peers.push(PeerDescriptor {
                            name,
                            addresses: vec![addr],
                            metadata,
                        }),
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

        info!(count = peers.len(), "scan settled");
        Ok(peers)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
