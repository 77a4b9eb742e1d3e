//! # airlift-server
//!
//! The responder role: advertises the airlift service on the local network,
//! accepts any number of client connections, answers each client's passcode
//! handshake, and multiplexes per-connection sessions so that interleaved
//! transfers never contaminate each other.
//!
//! Consumers drive the [`engine::ServerEngine`] and react to
//! [`engine::ServerEvent`]s from the receiver returned at construction.
//! Settings persist via [`config::ServerConfig`].

pub mod advertiser;
pub mod config;
pub mod engine;

pub use advertiser::{Advertiser, AdvertiserConfig};
pub use config::{load_config, save_config, ConfigError, ServerConfig};
pub use engine::{ConnectionId, EngineConfig, ServerEngine, ServerError, ServerEvent};
