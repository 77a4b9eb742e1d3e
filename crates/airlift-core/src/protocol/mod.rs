//! Protocol module containing the frame codec, the wire-message codec, and
//! the handshake state machines.

pub mod frame;
pub mod handshake;
pub mod messages;

pub use frame::{encode_frame, FrameDecoder, FrameError};
pub use handshake::{Initiator, Responder};
pub use messages::{decode_message, encode_message, CodecError, WireMessage};
