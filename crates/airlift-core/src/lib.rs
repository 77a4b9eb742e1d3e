//! # airlift-core
//!
//! Shared protocol engine for airlift: the frame codec, the wire-message
//! codec, the passcode handshake state machines, per-connection session
//! state, transport route selection, and the collaborator boundaries for
//! discovery and the relay store.
//!
//! This crate is used by both the client and server roles. It has zero
//! dependencies on sockets, timers, or OS APIs — everything here can be
//! driven byte-by-byte from a unit test.
//!
//! - **`protocol`** – How bytes travel over the direct connection. Payloads
//!   are wrapped in a decimal-ASCII length-prefixed frame, and frame contents
//!   are a small tagged message set (ping, handshake, relay reference,
//!   application blob).
//!
//! - **`session`** – Mutable per-connection state: in-progress frame
//!   assembly, ping bookkeeping, outgoing transfer counters.
//!
//! - **`route`** – The direct-vs-relay decision applied to every outgoing
//!   payload.
//!
//! - **`discovery` / `relay`** – Trait boundaries for the local-network
//!   browse/advertise transport and the remote blob store used as the
//!   fallback path, plus an in-process relay implementation.

pub mod discovery;
pub mod protocol;
pub mod relay;
pub mod route;
pub mod session;

// Re-export the most-used types at the crate root so callers can write
// `airlift_core::WireMessage` instead of the full module path.
pub use discovery::{DiscoveryError, DiscoveryMessage, PeerBrowser, PeerDescriptor};
pub use protocol::frame::{encode_frame, FrameDecoder, FrameError};
pub use protocol::handshake::{
    Initiator, InitiatorAction, InitiatorState, Responder, ResponderAction, SupplyOutcome,
};
pub use protocol::messages::{
    decode_message, encode_message, CodecError, HandshakeKind, HandshakeMessage, WireMessage,
};
pub use relay::{MemoryRelay, ProgressFn, RelayError, RelayId, RelayStore};
pub use route::{NoTransportAvailable, Reachability, Route, RoutePolicy, RELAY_THRESHOLD};
pub use session::Session;
