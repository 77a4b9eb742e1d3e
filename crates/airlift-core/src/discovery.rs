//! Discovery boundary: the data model for found peers and the datagram codec
//! shared by the browsing and advertising sides.
//!
//! Discovery is probe/announce over UDP. A browser broadcasts a `Probe` for a
//! service label; every advertiser of that service answers with a unicast
//! `Announce` carrying its display name, the TCP port its transfer listener
//! is bound to, and optional metadata. The browser collects answers until the
//! batch settles and reports the whole list at once — the previous list is
//! replaced, never merged.
//!
//! Datagram format (big-endian, strings are u16-length-prefixed UTF-8):
//! ```text
//! [version:1][tag:1]...
//! 0x01 Probe     [service]
//! 0x02 Announce  [service][name][port:2][meta_count:1][key,value_len:2,value]*
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::messages::CodecError;

/// Discovery datagram format version.
pub const DISCOVERY_VERSION: u8 = 0x01;

/// Service label both sides use unless configured otherwise.
pub const DEFAULT_SERVICE: &str = "_airlift._tcp";

/// UDP port probes are sent to and advertisers listen on by default.
pub const DEFAULT_DISCOVERY_PORT: u16 = 28056;

const TAG_PROBE: u8 = 0x01;
const TAG_ANNOUNCE: u8 = 0x02;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred while sending or receiving a datagram.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The datagram carries an unsupported format version.
    #[error("unsupported discovery version: {0}")]
    UnsupportedVersion(u8),

    /// The datagram could not be decoded.
    #[error("malformed discovery datagram: {0}")]
    Malformed(String),
}

impl From<CodecError> for DiscoveryError {
    fn from(e: CodecError) -> Self {
        DiscoveryError::Malformed(e.to_string())
    }
}

/// A peer reported by a discovery scan.
///
/// `addresses` is ordered; connection attempts try them front to back and
/// stop at the first success. The whole descriptor list is replaced at the
/// end of every scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Display identifier, unique within one scan batch.
    pub name: String,
    /// Candidate endpoints in preference order.
    pub addresses: Vec<SocketAddr>,
    /// Opaque service metadata published by the advertiser.
    pub metadata: HashMap<String, Vec<u8>>,
}

/// The browsing side of discovery.
///
/// One call produces one settled batch. The UDP implementation lives in the
/// client crate; tests substitute a mock.
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait PeerBrowser: Send + Sync {
    async fn scan(&self) -> Result<Vec<PeerDescriptor>, DiscoveryError>;
}

/// A probe or announce datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// "Who serves `service`?" — broadcast by browsers.
    Probe { service: String },
    /// "I do" — unicast back by advertisers.
    Announce {
        service: String,
        name: String,
        /// TCP port of the advertiser's transfer listener.
        port: u16,
        metadata: HashMap<String, Vec<u8>>,
    },
}

/// Encodes a discovery datagram.
pub fn encode_discovery(msg: &DiscoveryMessage) -> Vec<u8> {
    use crate::protocol::messages::write_string;

    let mut buf = vec![DISCOVERY_VERSION];
    match msg {
        DiscoveryMessage::Probe { service } => {
            buf.push(TAG_PROBE);
            write_string(&mut buf, service);
        }
        DiscoveryMessage::Announce {
            service,
            name,
            port,
            metadata,
        } => {
            buf.push(TAG_ANNOUNCE);
            write_string(&mut buf, service);
            write_string(&mut buf, name);
            buf.extend_from_slice(&port.to_be_bytes());
            buf.push(metadata.len().min(u8::MAX as usize) as u8);
            // Deterministic order keeps encoded datagrams comparable.
            let mut keys: Vec<_> = metadata.keys().collect();
            keys.sort();
            for key in keys.into_iter().take(u8::MAX as usize) {
                write_string(&mut buf, key);
                let value = &metadata[key];
                let len = value.len().min(u16::MAX as usize) as u16;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(&value[..len as usize]);
            }
        }
    }
    buf
}

/// Decodes a discovery datagram.
///
/// # Errors
///
/// Returns [`DiscoveryError`] if the datagram is malformed or from an
/// unsupported version.
pub fn decode_discovery(bytes: &[u8]) -> Result<DiscoveryMessage, DiscoveryError> {
    use crate::protocol::messages::read_string;

    if bytes.len() < 2 {
        return Err(DiscoveryError::Malformed(format!(
            "datagram too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != DISCOVERY_VERSION {
        return Err(DiscoveryError::UnsupportedVersion(bytes[0]));
    }

    match bytes[1] {
        TAG_PROBE => {
            let (service, _) = read_string(bytes, 2)?;
            Ok(DiscoveryMessage::Probe { service })
        }
        TAG_ANNOUNCE => {
            let (service, off) = read_string(bytes, 2)?;
            let (name, off) = read_string(bytes, off)?;
            if bytes.len() < off + 3 {
                return Err(DiscoveryError::Malformed(
                    "announce truncated before port".into(),
                ));
            }
            let port = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
            let count = bytes[off + 2] as usize;
            let mut off = off + 3;

            let mut metadata = HashMap::with_capacity(count);
            for _ in 0..count {
                let (key, next) = read_string(bytes, off)?;
                if bytes.len() < next + 2 {
                    return Err(DiscoveryError::Malformed(format!(
                        "metadata value length missing for key {key:?}"
                    )));
                }
                let len = u16::from_be_bytes([bytes[next], bytes[next + 1]]) as usize;
                let start = next + 2;
                if bytes.len() < start + len {
                    return Err(DiscoveryError::Malformed(format!(
                        "metadata value truncated for key {key:?}"
                    )));
                }
                metadata.insert(key, bytes[start..start + len].to_vec());
                off = start + len;
            }

            Ok(DiscoveryMessage::Announce {
                service,
                name,
                port,
                metadata,
            })
        }
        other => Err(DiscoveryError::Malformed(format!(
            "unknown discovery tag: 0x{other:02X}"
        ))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_round_trip() {
        let msg = DiscoveryMessage::Probe {
            service: "_airlift._tcp".to_string(),
        };
        assert_eq!(decode_discovery(&encode_discovery(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_announce_round_trip_with_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), b"photos".to_vec());
        metadata.insert("v".to_string(), vec![0x01]);

        let msg = DiscoveryMessage::Announce {
            service: "_airlift._tcp".to_string(),
            name: "study-laptop".to_string(),
            port: 38211,
            metadata,
        };
        assert_eq!(decode_discovery(&encode_discovery(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_announce_round_trip_without_metadata() {
        let msg = DiscoveryMessage::Announce {
            service: "_airlift._tcp".to_string(),
            name: "bare".to_string(),
            port: 1,
            metadata: HashMap::new(),
        };
        assert_eq!(decode_discovery(&encode_discovery(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut bytes = encode_discovery(&DiscoveryMessage::Probe {
            service: "x".to_string(),
        });
        bytes[0] = 0x63;
        assert!(matches!(
            decode_discovery(&bytes),
            Err(DiscoveryError::UnsupportedVersion(0x63))
        ));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let bytes = [DISCOVERY_VERSION, 0x7F];
        assert!(matches!(
            decode_discovery(&bytes),
            Err(DiscoveryError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_announce_is_rejected() {
        let msg = DiscoveryMessage::Announce {
            service: "_airlift._tcp".to_string(),
            name: "clipped".to_string(),
            port: 9,
            metadata: HashMap::new(),
        };
        let bytes = encode_discovery(&msg);
        for cut in 2..bytes.len() {
            assert!(
                decode_discovery(&bytes[..cut]).is_err(),
                "cut at {cut} must not decode"
            );
        }
    }

    #[test]
    fn test_empty_datagram_is_rejected() {
        assert!(matches!(
            decode_discovery(&[]),
            Err(DiscoveryError::Malformed(_))
        ));
    }
}
