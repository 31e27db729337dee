//! Tests for the handshake state machine
//!
//! These tests verify:
//! - The server-initiated exchange on both sides
//! - Plugin-requested (re)initiation
//! - Stale keys and replays after `Bound`
//! - Timeouts and transport loss

use std::time::{Duration, Instant};

use hapi::config::Role;
use hapi::handshake::{Handshake, HandshakeEvent, HandshakeState, HandshakeStep};
use hapi::protocol::{InitiationPacket, MessageType};
use hapi::HapiError;

// =============================================================================
// Helper Functions
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(30);

/// Server whose keys are 100, 101, 102, ...
fn server() -> Handshake {
    let mut next = 100u64;
    Handshake::with_key_source(Role::Server, TIMEOUT, move || {
        let key = next;
        next += 1;
        key
    })
}

fn plugin() -> Handshake {
    Handshake::new(Role::Plugin, TIMEOUT)
}

fn packet(msg_type: MessageType, key: u64) -> InitiationPacket {
    InitiationPacket::new(msg_type, key)
}

/// Run the full exchange and return both machines bound.
fn bound_pair(now: Instant) -> (Handshake, Handshake) {
    let mut server = server();
    let mut plugin = plugin();
    plugin.start(now);

    let init = server.start(now).send.unwrap();
    let response = plugin.on_packet(&init, now).send.unwrap();
    let finish = server.on_packet(&response, now).send.unwrap();
    let step = plugin.on_packet(&finish, now);
    assert_eq!(step.event, Some(HandshakeEvent::Bound));
    (server, plugin)
}

// =============================================================================
// Exchange Tests
// =============================================================================

#[test]
fn test_server_start_sends_initiation() {
    let mut server = server();
    let step = server.start(Instant::now());

    assert_eq!(step.send, Some(packet(MessageType::Initiation, 100)));
    assert_eq!(step.event, None);
    assert_eq!(server.state(), HandshakeState::AwaitingPeerInitiation);
    assert_eq!(server.key(), Some(100));
}

#[test]
fn test_plugin_start_requests_initiation() {
    let mut plugin = plugin();
    let step = plugin.start(Instant::now());

    assert_eq!(step.send, Some(packet(MessageType::InitiationRequest, 0)));
    assert_eq!(plugin.state(), HandshakeState::SentInitiationRequest);
}

#[test]
fn test_full_exchange() {
    let now = Instant::now();
    let mut server = server();
    let mut plugin = plugin();

    let init = server.start(now).send.unwrap();

    let step = plugin.on_packet(&init, now);
    assert_eq!(step.send, Some(packet(MessageType::InitiationResponse, 100)));
    assert_eq!(plugin.state(), HandshakeState::AwaitingConfirmation);

    let step = server.on_packet(&step.send.unwrap(), now);
    assert_eq!(step.send, Some(packet(MessageType::InitiationFinish, 100)));
    assert_eq!(step.event, Some(HandshakeEvent::Bound));
    assert!(server.is_bound());

    let step = plugin.on_packet(&step.send.unwrap(), now);
    assert_eq!(
        step,
        HandshakeStep {
            send: None,
            event: Some(HandshakeEvent::Bound)
        }
    );
    assert!(plugin.is_bound());
}

#[test]
fn test_request_restarts_with_fresh_key() {
    let now = Instant::now();
    let mut server = server();
    server.start(now);

    let step = server.on_packet(&packet(MessageType::InitiationRequest, 0), now);
    assert_eq!(step.send, Some(packet(MessageType::Initiation, 101)));
    assert_eq!(server.key(), Some(101));

    // The response to the first initiation is now stale
    let step = server.on_packet(&packet(MessageType::InitiationResponse, 100), now);
    assert_eq!(step, HandshakeStep::default());
    assert_eq!(server.state(), HandshakeState::AwaitingPeerInitiation);
}

#[test]
fn test_request_while_bound_unbinds() {
    let (mut server, _) = bound_pair(Instant::now());

    let step = server.on_packet(&packet(MessageType::InitiationRequest, 0), Instant::now());
    assert_eq!(step.event, Some(HandshakeEvent::Unbound));
    assert_eq!(step.send.map(|p| p.msg_type), Some(MessageType::Initiation));
    assert!(!server.is_bound());
}

#[test]
fn test_plugin_adopts_latest_initiation() {
    let now = Instant::now();
    let mut plugin = plugin();

    plugin.on_packet(&packet(MessageType::Initiation, 1), now);
    plugin.on_packet(&packet(MessageType::Initiation, 2), now);
    assert_eq!(plugin.key(), Some(2));

    let step = plugin.on_packet(&packet(MessageType::InitiationFinish, 1), now);
    assert_eq!(step, HandshakeStep::default());
    assert_eq!(plugin.state(), HandshakeState::AwaitingConfirmation);

    let step = plugin.on_packet(&packet(MessageType::InitiationFinish, 2), now);
    assert_eq!(step.event, Some(HandshakeEvent::Bound));
}

// =============================================================================
// Idempotence Tests
// =============================================================================

#[test]
fn test_stale_response_after_bound_is_ignored() {
    let (mut server, _) = bound_pair(Instant::now());

    for key in [100, 7, 0] {
        let step = server.on_packet(&packet(MessageType::InitiationResponse, key), Instant::now());
        assert_eq!(step, HandshakeStep::default());
        assert!(server.is_bound());
        assert_eq!(server.key(), Some(100));
    }
}

#[test]
fn test_replayed_finish_after_bound_is_ignored() {
    let (_, mut plugin) = bound_pair(Instant::now());

    let step = plugin.on_packet(&packet(MessageType::InitiationFinish, 100), Instant::now());
    assert_eq!(step, HandshakeStep::default());
    assert!(plugin.is_bound());
}

#[test]
fn test_wrong_role_packets_ignored() {
    let now = Instant::now();
    let mut server = server();
    server.start(now);
    assert_eq!(
        server.on_packet(&packet(MessageType::Initiation, 5), now),
        HandshakeStep::default()
    );

    let mut plugin = plugin();
    plugin.start(now);
    assert_eq!(
        plugin.on_packet(&packet(MessageType::InitiationRequest, 0), now),
        HandshakeStep::default()
    );
    assert_eq!(plugin.state(), HandshakeState::SentInitiationRequest);
}

// =============================================================================
// Timeout / Teardown Tests
// =============================================================================

#[test]
fn test_timeout_while_waiting() {
    let start = Instant::now();
    let mut server = server();
    server.start(start);

    assert!(server.check_timeout(start + TIMEOUT / 2).is_none());

    let err = server.check_timeout(start + TIMEOUT).unwrap();
    assert!(matches!(err, HapiError::HandshakeTimeout(30_000)));
    assert_eq!(server.state(), HandshakeState::Failed);

    // Restart after failure
    let step = server.start(start + TIMEOUT);
    assert_eq!(step.send.map(|p| p.key), Some(101));
}

#[test]
fn test_no_timeout_once_bound() {
    let start = Instant::now();
    let (mut server, mut plugin) = bound_pair(start);
    assert!(server.check_timeout(start + TIMEOUT * 2).is_none());
    assert!(plugin.check_timeout(start + TIMEOUT * 2).is_none());
}

#[test]
fn test_transport_lost() {
    let (mut server, _) = bound_pair(Instant::now());
    assert_eq!(server.on_transport_lost(), Some(HandshakeEvent::Unbound));
    assert_eq!(server.state(), HandshakeState::Idle);
    assert_eq!(server.on_transport_lost(), None);

    let mut plugin = plugin();
    plugin.start(Instant::now());
    assert_eq!(plugin.on_transport_lost(), None);
    assert_eq!(plugin.state(), HandshakeState::Failed);
}

#[test]
fn test_reset() {
    let (mut server, _) = bound_pair(Instant::now());
    assert_eq!(server.reset(), Some(HandshakeEvent::Unbound));
    assert_eq!(server.state(), HandshakeState::Idle);
    assert_eq!(server.key(), None);
    assert_eq!(server.reset(), None);
}
