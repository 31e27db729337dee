//! Handshake Module
//!
//! Binds one server instance to one plugin instance before any command
//! traffic is allowed.
//!
//! ## Sequence
//! ```text
//! Plugin                                     Server
//!   |  -- InitiationRequest (optional) ---->   |
//!   |  <--------- Initiation { key } -------   |
//!   |  -- InitiationResponse { key } ------>   |
//!   |  <------ InitiationFinish { key } ----   |
//!   |                Bound                     |
//! ```
//!
//! ## Precedence
//! Only the server mints keys. An `InitiationRequest` always makes the
//! server start over with a fresh key, and a plugin always adopts the most
//! recent `Initiation` it sees. Responses or finishes carrying any other
//! key are stale and ignored without a state change.
//!
//! The machine is pure: it returns the packet to send and the event to
//! report, and the caller does the I/O.

use std::time::{Duration, Instant};

use crate::config::Role;
use crate::error::HapiError;
use crate::protocol::{InitiationPacket, MessageType};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    /// Server sent `Initiation` and waits for the echoed key.
    AwaitingPeerInitiation,
    /// Plugin asked the server to initiate.
    SentInitiationRequest,
    /// Plugin echoed a key and waits for `InitiationFinish`.
    AwaitingConfirmation,
    Bound,
    Failed,
}

/// Change of the bound status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    Bound,
    /// Left `Bound`; outstanding commands must be failed.
    Unbound,
}

/// What the caller must do after feeding the machine
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeStep {
    pub send: Option<InitiationPacket>,
    pub event: Option<HandshakeEvent>,
}

type KeySource = Box<dyn FnMut() -> u64 + Send>;

/// Handshake state machine for one endpoint
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    key: Option<u64>,
    started_at: Option<Instant>,
    timeout: Duration,
    next_key: KeySource,
}

impl Handshake {
    /// Keys are drawn from the thread-local RNG.
    pub fn new(role: Role, timeout: Duration) -> Self {
        Self::with_key_source(role, timeout, rand::random::<u64>)
    }

    /// Use `next_key` to mint server keys.
    pub fn with_key_source(
        role: Role,
        timeout: Duration,
        next_key: impl FnMut() -> u64 + Send + 'static,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            key: None,
            started_at: None,
            timeout,
            next_key: Box::new(next_key),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == HandshakeState::Bound
    }

    /// Key of the current (or last) attempt.
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    /// Begin a handshake (after a fresh connection).
    pub fn start(&mut self, now: Instant) -> HandshakeStep {
        let event = self.leave_bound();
        let send = match self.role {
            Role::Server => Some(self.send_initiation(now)),
            Role::Plugin => {
                self.key = None;
                self.started_at = Some(now);
                self.transition(HandshakeState::SentInitiationRequest);
                Some(InitiationPacket::new(MessageType::InitiationRequest, 0))
            }
        };
        HandshakeStep { send, event }
    }

    /// Feed one received initiation-family packet.
    pub fn on_packet(&mut self, packet: &InitiationPacket, now: Instant) -> HandshakeStep {
        match (self.role, packet.msg_type) {
            (Role::Server, MessageType::InitiationRequest) => {
                tracing::debug!("Peer requested initiation");
                let event = self.leave_bound();
                HandshakeStep {
                    send: Some(self.send_initiation(now)),
                    event,
                }
            }
            (Role::Server, MessageType::InitiationResponse) => {
                if self.state == HandshakeState::AwaitingPeerInitiation
                    && self.key == Some(packet.key)
                {
                    self.transition(HandshakeState::Bound);
                    HandshakeStep {
                        send: Some(InitiationPacket::new(
                            MessageType::InitiationFinish,
                            packet.key,
                        )),
                        event: Some(HandshakeEvent::Bound),
                    }
                } else {
                    tracing::debug!(
                        "Ignoring stale initiation response (key {:#x}, state {:?})",
                        packet.key,
                        self.state
                    );
                    HandshakeStep::default()
                }
            }
            (Role::Plugin, MessageType::Initiation) => {
                let event = self.leave_bound();
                self.key = Some(packet.key);
                self.started_at = Some(now);
                self.transition(HandshakeState::AwaitingConfirmation);
                HandshakeStep {
                    send: Some(InitiationPacket::new(
                        MessageType::InitiationResponse,
                        packet.key,
                    )),
                    event,
                }
            }
            (Role::Plugin, MessageType::InitiationFinish) => {
                if self.state == HandshakeState::AwaitingConfirmation
                    && self.key == Some(packet.key)
                {
                    self.transition(HandshakeState::Bound);
                    HandshakeStep {
                        send: None,
                        event: Some(HandshakeEvent::Bound),
                    }
                } else {
                    tracing::debug!(
                        "Ignoring stale initiation finish (key {:#x}, state {:?})",
                        packet.key,
                        self.state
                    );
                    HandshakeStep::default()
                }
            }
            (role, msg_type) => {
                tracing::warn!("{:?} endpoint ignores {:?}", role, msg_type);
                HandshakeStep::default()
            }
        }
    }

    /// Move to `Failed` if the peer has not completed its half in time.
    pub fn check_timeout(&mut self, now: Instant) -> Option<HapiError> {
        let waiting = matches!(
            self.state,
            HandshakeState::AwaitingPeerInitiation
                | HandshakeState::SentInitiationRequest
                | HandshakeState::AwaitingConfirmation
        );
        let started = self.started_at?;
        if waiting && now.duration_since(started) >= self.timeout {
            self.transition(HandshakeState::Failed);
            return Some(HapiError::HandshakeTimeout(self.timeout.as_millis() as u64));
        }
        None
    }

    /// The broker session went away.
    pub fn on_transport_lost(&mut self) -> Option<HandshakeEvent> {
        match self.state {
            HandshakeState::Bound => {
                self.transition(HandshakeState::Idle);
                Some(HandshakeEvent::Unbound)
            }
            HandshakeState::Idle => None,
            _ => {
                self.transition(HandshakeState::Failed);
                None
            }
        }
    }

    /// Return to `Idle` (explicit exit).
    pub fn reset(&mut self) -> Option<HandshakeEvent> {
        let event = self.leave_bound();
        self.key = None;
        self.started_at = None;
        self.transition(HandshakeState::Idle);
        event
    }

    fn send_initiation(&mut self, now: Instant) -> InitiationPacket {
        let key = (self.next_key)();
        self.key = Some(key);
        self.started_at = Some(now);
        self.transition(HandshakeState::AwaitingPeerInitiation);
        InitiationPacket::new(MessageType::Initiation, key)
    }

    fn leave_bound(&mut self) -> Option<HandshakeEvent> {
        if self.state == HandshakeState::Bound {
            Some(HandshakeEvent::Unbound)
        } else {
            None
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        if self.state != next {
            tracing::debug!("Handshake {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
