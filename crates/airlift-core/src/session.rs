//! Per-connection session state.
//!
//! One `Session` exists per logical connection and is exclusively owned by
//! the engine task that owns the connection — all mutation happens on that
//! task's loop, so no locking is needed. The session is destroyed together
//! with the connection; a disconnect mid-frame discards the partial assembly
//! buffer silently, since partial payloads are never delivered.

use crate::protocol::frame::{Completed, FrameDecoder};

/// Mutable state for one connection: frame assembly, ping bookkeeping, and
/// outgoing transfer counters.
#[derive(Debug, Default)]
pub struct Session {
    decoder: FrameDecoder,

    /// Bumped on every `arm_ping`; lets a late timeout for an old ping be
    /// told apart from the current one.
    ping_generation: u64,
    ping_armed: bool,
    ping_acknowledged: bool,

    outgoing_total: usize,
    outgoing_sent: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Receive side ──────────────────────────────────────────────────────────

    /// Feeds a chunk read from the connection; see [`FrameDecoder::feed`].
    pub fn feed<'a, 'b>(&'a mut self, chunk: &'b [u8]) -> Completed<'a, 'b> {
        self.decoder.feed(chunk)
    }

    /// Fraction of the current inbound frame received, if one is in flight.
    /// NaN for a zero-length frame.
    pub fn receive_progress(&self) -> Option<f64> {
        self.decoder.expected_len().map(|_| self.decoder.progress())
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    // ── Ping ─────────────────────────────────────────────────────────────────

    /// Arms a new ping and returns its generation token. Any previous ping
    /// still in flight is superseded; its timeout will no longer fire an
    /// event.
    pub fn arm_ping(&mut self) -> u64 {
        self.ping_generation += 1;
        self.ping_armed = true;
        self.ping_acknowledged = false;
        self.ping_generation
    }

    /// Records an acknowledgement. Returns true exactly once per armed ping;
    /// the matching timeout is suppressed from then on.
    pub fn acknowledge_ping(&mut self) -> bool {
        if self.ping_armed && !self.ping_acknowledged {
            self.ping_acknowledged = true;
            self.ping_armed = false;
            true
        } else {
            false
        }
    }

    /// Called when the timeout for `token` fires. Returns true iff that ping
    /// is still the current one and was never acknowledged — i.e. iff a
    /// "timed out" event must be emitted.
    pub fn ping_expired(&mut self, token: u64) -> bool {
        if token == self.ping_generation && self.ping_armed && !self.ping_acknowledged {
            self.ping_armed = false;
            true
        } else {
            false
        }
    }

    // ── Send side ────────────────────────────────────────────────────────────

    /// Starts tracking an outgoing direct transfer of `total` bytes.
    pub fn begin_send(&mut self, total: usize) {
        self.outgoing_total = total;
        self.outgoing_sent = 0;
    }

    /// Records `n` more bytes written and returns the progress fraction.
    /// NaN when the transfer is zero-length.
    pub fn record_sent(&mut self, n: usize) -> f64 {
        self.outgoing_sent += n;
        self.outgoing_sent as f64 / self.outgoing_total as f64
    }

    /// Resets the outgoing counters once the write has fully completed.
    pub fn send_complete(&mut self) {
        self.outgoing_total = 0;
        self.outgoing_sent = 0;
    }

    pub fn outgoing_total(&self) -> usize {
        self.outgoing_total
    }

    pub fn outgoing_sent(&self) -> usize {
        self.outgoing_sent
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
