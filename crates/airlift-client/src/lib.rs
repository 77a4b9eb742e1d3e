//! # airlift-client
//!
//! The initiator role: discovers peers advertising the airlift service on the
//! local network, connects to one of them, negotiates the passcode gate, and
//! exchanges payloads — falling back to the relay store when the route policy
//! says the direct path is unsuitable.
//!
//! A client owns at most one connection at a time. Consumers drive the
//! [`engine::ClientEngine`] and react to [`engine::ClientEvent`]s from the
//! receiver returned at construction.

pub mod browser;
pub mod engine;

pub use browser::{BrowserConfig, UdpBrowser};
pub use engine::{ClientConfig, ClientEngine, ClientError, ClientEvent, ConnectFailReason};
