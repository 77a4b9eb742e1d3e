//! Tagged-variant codec for the messages carried inside frames.
//!
//! Every frame payload on the direct connection is one of a fixed message
//! set, distinguished by a leading tag byte:
//!
//! ```text
//! [tag:1][body:N]
//!
//! 0x01 Ping        – empty body; the liveness sentinel, echoed back verbatim
//! 0x02 Handshake   – [kind:1][has_passcode:1][len:2][utf8 passcode]
//! 0x03 RelayRef    – [uuid:16]; stands in for payload bytes parked on the relay
//! 0x04 Blob        – raw application payload; contents are opaque to airlift
//! ```
//!
//! Multi-byte integers are big-endian. Application payload contents are never
//! interpreted here — the consumer brings its own serialization and hands
//! this layer plain bytes.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while decoding a frame payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The payload was empty; even the tag byte is missing.
    #[error("empty message")]
    Empty,

    /// The leading tag byte is not a recognized value.
    #[error("unknown message tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// The body is shorter than the fields it must contain.
    #[error("truncated message: need at least {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// A field value could not be parsed (bad enum byte, invalid UTF-8, …).
    #[error("malformed message: {0}")]
    Malformed(String),
}

// ── Message tags ──────────────────────────────────────────────────────────────

/// Tag byte identifying the message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Ping = 0x01,
    Handshake = 0x02,
    RelayRef = 0x03,
    Blob = 0x04,
}

impl TryFrom<u8> for MessageTag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageTag::Ping),
            0x02 => Ok(MessageTag::Handshake),
            0x03 => Ok(MessageTag::RelayRef),
            0x04 => Ok(MessageTag::Blob),
            _ => Err(()),
        }
    }
}

// ── Handshake messages ────────────────────────────────────────────────────────

/// The four control messages of the passcode negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeKind {
    /// Initiator asks whether the responder requires a passcode.
    AskPinNeeded = 0x01,
    /// Responder: no passcode required.
    PinNotNeeded = 0x02,
    /// Responder: a passcode is required; the passcode field is present.
    PinNeeded = 0x03,
    /// Initiator: the gate is open on its side and user payloads may follow.
    ClientReady = 0x04,
}

impl TryFrom<u8> for HandshakeKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(HandshakeKind::AskPinNeeded),
            0x02 => Ok(HandshakeKind::PinNotNeeded),
            0x03 => Ok(HandshakeKind::PinNeeded),
            0x04 => Ok(HandshakeKind::ClientReady),
            _ => Err(()),
        }
    }
}

/// One step of the handshake exchange. Immutable; constructed per step.
///
/// `passcode` is present only on [`HandshakeKind::PinNeeded`] — use the
/// constructors rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub kind: HandshakeKind,
    pub passcode: Option<String>,
}

impl HandshakeMessage {
    pub fn ask_pin_needed() -> Self {
        Self {
            kind: HandshakeKind::AskPinNeeded,
            passcode: None,
        }
    }

    pub fn pin_not_needed() -> Self {
        Self {
            kind: HandshakeKind::PinNotNeeded,
            passcode: None,
        }
    }

    pub fn pin_needed(passcode: impl Into<String>) -> Self {
        Self {
            kind: HandshakeKind::PinNeeded,
            passcode: Some(passcode.into()),
        }
    }

    pub fn client_ready() -> Self {
        Self {
            kind: HandshakeKind::ClientReady,
            passcode: None,
        }
    }
}

// ── Wire messages ─────────────────────────────────────────────────────────────

/// Everything that can travel inside a frame.
///
/// Only [`WireMessage::Blob`] (and the bytes a [`WireMessage::RelayRef`]
/// resolves to after download) is ever surfaced to the consumer; the rest is
/// handled inside the engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Liveness probe. The receiver echoes it back unchanged.
    Ping,
    /// A step of the passcode negotiation.
    Handshake(HandshakeMessage),
    /// Identifier of payload bytes uploaded to the relay store. Single-use.
    RelayRef(Uuid),
    /// Opaque application payload.
    Blob(Vec<u8>),
}

/// Encodes a [`WireMessage`] into the byte payload of one frame.
pub fn encode_message(msg: &WireMessage) -> Vec<u8> {
    match msg {
        WireMessage::Ping => vec![MessageTag::Ping as u8],
        WireMessage::Handshake(hs) => {
            let mut buf = vec![MessageTag::Handshake as u8, hs.kind as u8];
            match &hs.passcode {
                Some(p) => {
                    buf.push(0x01);
                    write_string(&mut buf, p);
                }
                None => buf.push(0x00),
            }
            buf
        }
        WireMessage::RelayRef(id) => {
            let mut buf = Vec::with_capacity(17);
            buf.push(MessageTag::RelayRef as u8);
            buf.extend_from_slice(id.as_bytes());
            buf
        }
        WireMessage::Blob(bytes) => {
            let mut buf = Vec::with_capacity(1 + bytes.len());
            buf.push(MessageTag::Blob as u8);
            buf.extend_from_slice(bytes);
            buf
        }
    }
}

/// Decodes the byte payload of one frame back into a [`WireMessage`].
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are malformed.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    let (&tag_byte, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    let tag = MessageTag::try_from(tag_byte).map_err(|_| CodecError::UnknownTag(tag_byte))?;

    match tag {
        MessageTag::Ping => Ok(WireMessage::Ping),
        MessageTag::Handshake => decode_handshake(body).map(WireMessage::Handshake),
        MessageTag::RelayRef => {
            if body.len() < 16 {
                return Err(CodecError::Truncated {
                    needed: 16,
                    available: body.len(),
                });
            }
            // The slice length was just checked.
            let id = Uuid::from_bytes(body[..16].try_into().unwrap());
            Ok(WireMessage::RelayRef(id))
        }
        MessageTag::Blob => Ok(WireMessage::Blob(body.to_vec())),
    }
}

fn decode_handshake(body: &[u8]) -> Result<HandshakeMessage, CodecError> {
    if body.len() < 2 {
        return Err(CodecError::Truncated {
            needed: 2,
            available: body.len(),
        });
    }
    let kind = HandshakeKind::try_from(body[0])
        .map_err(|_| CodecError::Malformed(format!("unknown handshake kind: {}", body[0])))?;
    let passcode = match body[1] {
        0x00 => None,
        0x01 => {
            let (s, _) = read_string(body, 2)?;
            Some(s)
        }
        other => {
            return Err(CodecError::Malformed(format!(
                "invalid passcode presence byte: {other}"
            )))
        }
    };
    Ok(HandshakeMessage { kind, passcode })
}

// ── Field helpers ─────────────────────────────────────────────────────────────

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&bytes[..len as usize]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after it.
pub(crate) fn read_string(buf: &[u8], offset: usize) -> Result<(String, usize), CodecError> {
    if buf.len() < offset + 2 {
        return Err(CodecError::Truncated {
            needed: offset + 2,
            available: buf.len(),
        });
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(CodecError::Truncated {
            needed: start + len,
            available: buf.len(),
        });
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| CodecError::Malformed(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
