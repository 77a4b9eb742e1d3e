//! Passcode negotiation state machines.
//!
//! Both sides run a small synchronous machine; all I/O stays in the engines,
//! which makes every transition testable without a socket.
//!
//! ```text
//! Initiator                                Responder
//! ─────────                                ─────────
//! begin() → AskPinNeeded        ──────►    on_message(AskPinNeeded)
//!   state: AwaitingPinAnswer               passcode configured?
//!                               ◄──────      yes → Reply(PinNeeded(pin))
//!                               ◄──────      no  → Reply(PinNotNeeded)
//! on_message(PinNotNeeded)
//!   state: Unlocked
//!   → Established(ClientReady)  ──────►    on_message(ClientReady) → PeerReady
//!
//! on_message(PinNeeded(p))
//!   state: Locked
//!   → PasscodeRequired
//! supply_passcode(guess)
//!   guess == p → Unlocked
//!   → Unlocked(ClientReady)     ──────►    on_message(ClientReady) → PeerReady
//! ```
//!
//! There are no terminal states; a disconnect discards the machine together
//! with its session. A wrong guess is not an error — the machine stays
//! `Locked` and accepts further guesses.

use crate::protocol::messages::{HandshakeKind, HandshakeMessage};

/// Initiator-side handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitiatorState {
    /// No handshake traffic yet.
    #[default]
    Init,
    /// AskPinNeeded sent; waiting for the responder's answer.
    AwaitingPinAnswer,
    /// User payloads may be sent.
    Unlocked,
    /// The responder requires a passcode that has not been matched yet.
    Locked,
}

/// What the engine must do after feeding a message to the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorAction {
    /// The connection is established; send `reply` and notify the consumer.
    Established { reply: HandshakeMessage },
    /// The responder requires a passcode; notify the consumer of the failed
    /// connection so it can supply a guess.
    PasscodeRequired,
    /// Not a message the initiator reacts to in its current state.
    Ignored,
}

/// Outcome of supplying a passcode guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplyOutcome {
    /// The guess matched; send `announce` and notify the consumer that the
    /// connection is established.
    Unlocked { announce: HandshakeMessage },
    /// The guess did not match; the gate stays closed.
    StillLocked,
}

/// The client side of the negotiation.
#[derive(Debug, Default)]
pub struct Initiator {
    state: InitiatorState,
    required_passcode: Option<String>,
    provided_passcode: Option<String>,
}

impl Initiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the opening message. Called once, immediately after the
    /// connection is established.
    pub fn begin(&mut self) -> HandshakeMessage {
        self.state = InitiatorState::AwaitingPinAnswer;
        HandshakeMessage::ask_pin_needed()
    }

    /// Feeds a handshake message received from the responder.
    pub fn on_message(&mut self, msg: &HandshakeMessage) -> InitiatorAction {
        match msg.kind {
            HandshakeKind::PinNotNeeded => {
                self.required_passcode = None;
                self.state = InitiatorState::Unlocked;
                InitiatorAction::Established {
                    reply: HandshakeMessage::client_ready(),
                }
            }
            HandshakeKind::PinNeeded => {
                self.required_passcode = msg.passcode.clone();
                self.state = InitiatorState::Locked;
                InitiatorAction::PasscodeRequired
            }
            // AskPinNeeded and ClientReady travel in the other direction.
            _ => InitiatorAction::Ignored,
        }
    }

    /// Records a passcode guess from the consumer and re-derives the gate.
    pub fn supply_passcode(&mut self, guess: impl Into<String>) -> SupplyOutcome {
        self.provided_passcode = Some(guess.into());
        let matched = self.required_passcode.is_some()
            && self.required_passcode == self.provided_passcode;
        if self.state == InitiatorState::Locked && matched {
            self.state = InitiatorState::Unlocked;
            SupplyOutcome::Unlocked {
                announce: HandshakeMessage::client_ready(),
            }
        } else {
            SupplyOutcome::StillLocked
        }
    }

    /// True iff user payloads may be sent: the responder either requires no
    /// passcode or the provided passcode matched. Handshake traffic itself is
    /// exempt from this gate.
    pub fn allowed_to_send(&self) -> bool {
        self.state == InitiatorState::Unlocked
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// The passcode the responder declared, once known.
    pub fn required_passcode(&self) -> Option<&str> {
        self.required_passcode.as_deref()
    }
}

/// What the engine must do after feeding a message to the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderAction {
    /// Send this answer back to the initiator.
    Reply(HandshakeMessage),
    /// The initiator announced readiness; notify the consumer that the peer
    /// is connected. The responder does not re-verify the passcode — the
    /// check happened on the initiator side.
    PeerReady,
    /// Not a message the responder reacts to.
    Ignored,
}

/// The server side of the negotiation. Stateless apart from the configured
/// passcode, so one value serves every connection.
#[derive(Debug, Clone, Default)]
pub struct Responder {
    passcode: Option<String>,
}

impl Responder {
    /// `passcode: None` means no passcode is required.
    pub fn new(passcode: Option<String>) -> Self {
        Self { passcode }
    }

    /// Feeds a handshake message received from an initiator.
    pub fn on_message(&self, msg: &HandshakeMessage) -> ResponderAction {
        match msg.kind {
            HandshakeKind::AskPinNeeded => {
                let reply = match &self.passcode {
                    Some(pin) => HandshakeMessage::pin_needed(pin.clone()),
                    None => HandshakeMessage::pin_not_needed(),
                };
                ResponderAction::Reply(reply)
            }
            HandshakeKind::ClientReady => ResponderAction::PeerReady,
            _ => ResponderAction::Ignored,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
