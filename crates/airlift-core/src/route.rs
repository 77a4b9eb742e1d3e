//! Direct-vs-relay transport selection.
//!
//! The policy is consulted for every outgoing payload — including each
//! recipient of a broadcast — so a single engine can mix both paths within
//! one burst of sends.

use thiserror::Error;

/// Payload size at and above which the relay path is preferred when the
/// local network is unavailable.
pub const RELAY_THRESHOLD: usize = 100_000;

/// Local reachability flags sampled by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub wifi: bool,
    pub internet: bool,
}

impl Default for Reachability {
    fn default() -> Self {
        Self {
            wifi: true,
            internet: true,
        }
    }
}

/// The transport strategy chosen for one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Frame the payload on the existing connection.
    Direct,
    /// Upload to the relay store, then send the reference on the connection.
    Relay,
}

/// Neither path is usable; the send is not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transport available: local network and internet are both unreachable")]
pub struct NoTransportAvailable;

/// The selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub threshold: usize,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            threshold: RELAY_THRESHOLD,
        }
    }
}

impl RoutePolicy {
    /// Picks the path for a payload of `len` bytes:
    /// direct when the local network is up or the payload is small, relay
    /// when only the internet is reachable, error otherwise.
    pub fn route(
        &self,
        len: usize,
        reachability: Reachability,
    ) -> Result<Route, NoTransportAvailable> {
        if reachability.wifi || len < self.threshold {
            Ok(Route::Direct)
        } else if reachability.internet {
            Ok(Route::Relay)
        } else {
            Err(NoTransportAvailable)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
