//! Tests for the plugin interface facade
//!
//! Every test runs a server endpoint and a plugin endpoint on their own
//! receive threads against one in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;

use hapi::handshake::HandshakeState;
use hapi::plugin::PluginObserver;
use hapi::protocol::{LastEventId, WireLayout};
use hapi::transport::{Broker, SessionInfo};
use hapi::{
    on_outcome, CommandCode, CommandOutcome, CommandRequest, Config, HapiError, InMemoryBroker,
    ItemData, ItemTable, ItemValue, PluginInterface, ResponseCode, Role,
};

// =============================================================================
// Helper Functions
// =============================================================================

const URL: &str = "mem://hapi";
const WAIT: Duration = Duration::from_secs(5);

fn config(role: Role, queue: &str) -> Config {
    Config::builder()
        .broker_url(URL)
        .queue_address(queue)
        .role(role)
        .handshake_timeout_ms(2_000)
        .receive_poll_ms(10)
        .reconnect_interval_ms(50)
        .build()
}

fn endpoint(broker: &InMemoryBroker, role: Role, queue: &str) -> PluginInterface {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    PluginInterface::new(config(role, queue), broker).unwrap()
}

/// Server and plugin, both started but not yet necessarily bound.
fn pair(queue: &str) -> (InMemoryBroker, PluginInterface, PluginInterface) {
    let broker = InMemoryBroker::new(URL);
    let server = endpoint(&broker, Role::Server, queue);
    let plugin = endpoint(&broker, Role::Plugin, queue);
    (broker, server, plugin)
}

fn start_bound(server: &PluginInterface, plugin: &PluginInterface) {
    server.start().unwrap();
    plugin.start().unwrap();
    assert!(plugin.wait_initiated(WAIT), "plugin never initiated");
    assert!(server.wait_initiated(WAIT), "server never initiated");
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct RecordingObserver {
    connected: AtomicUsize,
    initiated: AtomicUsize,
    sessions: Mutex<Vec<Option<String>>>,
    errors: Mutex<Vec<String>>,
    failures: AtomicUsize,
    timeouts: AtomicUsize,
}

impl PluginObserver for RecordingObserver {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure_connected(&self, error: &HapiError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        if matches!(error, HapiError::HandshakeTimeout(_)) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_session_changed(&self, session: Option<&SessionInfo>) {
        self.sessions
            .lock()
            .push(session.map(|s| s.queue_address.clone()));
    }

    fn on_initiated(&self) {
        self.initiated.fetch_add(1, Ordering::SeqCst);
    }

    fn on_got_error(&self, error: &HapiError) {
        self.errors.lock().push(error.to_string());
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_handshake_binds_both_sides() {
    let (_broker, server, plugin) = pair("q-bind");
    start_bound(&server, &plugin);

    assert!(server.is_connected());
    assert!(plugin.is_connected());
    assert_eq!(server.handshake_state(), HandshakeState::Bound);
    assert_eq!(plugin.handshake_state(), HandshakeState::Bound);

    plugin.exit_sync();
    server.exit_sync();
    assert!(!plugin.is_connected());
    assert!(!plugin.is_initiated());
}

#[test]
fn test_plugin_started_first() {
    let (_broker, server, plugin) = pair("q-early");
    plugin.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!plugin.is_initiated());

    server.start().unwrap();
    assert!(plugin.wait_initiated(WAIT));
    assert!(server.wait_initiated(WAIT));

    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_send_before_initiated() {
    let (_broker, _server, plugin) = pair("q-early-send");
    let err = plugin
        .send(CommandCode::GetLastEventId, &[], None)
        .unwrap_err();
    assert!(matches!(err, HapiError::NotInitiated));
}

#[test]
fn test_start_twice_and_after_exit() {
    let (_broker, server, _plugin) = pair("q-twice");
    server.start().unwrap();
    assert!(server.start().is_err());
    server.exit_sync();

    let (_broker, server, _plugin) = pair("q-exited");
    server.exit_sync();
    assert!(server.start().is_err());
}

#[test]
fn test_observer_hooks() {
    let broker = InMemoryBroker::new(URL);
    let observer = Arc::new(RecordingObserver::default());
    let server = PluginInterface::with_observer(
        config(Role::Server, "q-observe"),
        Arc::new(broker.clone()),
        Arc::clone(&observer) as Arc<dyn PluginObserver>,
    )
    .unwrap();
    let plugin = endpoint(&broker, Role::Plugin, "q-observe");

    start_bound(&server, &plugin);
    plugin.exit_sync();
    server.exit_sync();

    assert_eq!(observer.connected.load(Ordering::SeqCst), 1);
    assert_eq!(observer.initiated.load(Ordering::SeqCst), 1);
    assert_eq!(
        *observer.sessions.lock(),
        vec![Some("q-observe".to_string()), None]
    );
}

#[test]
fn test_missing_queue_address_reported() {
    let broker = InMemoryBroker::new(URL);
    let observer = Arc::new(RecordingObserver::default());
    let plugin = PluginInterface::with_observer(
        config(Role::Plugin, ""),
        Arc::new(broker),
        Arc::clone(&observer) as Arc<dyn PluginObserver>,
    )
    .unwrap();

    plugin.start().unwrap();
    wait_until("connection failure", || {
        observer.failures.load(Ordering::SeqCst) > 0
    });
    assert!(!plugin.is_connected());
    plugin.exit_sync();
}

#[test]
fn test_handshake_timeout_under_steady_traffic() {
    let broker = InMemoryBroker::new(URL);
    let observer = Arc::new(RecordingObserver::default());
    let config = Config::builder()
        .broker_url(URL)
        .queue_address("q-noisy")
        .role(Role::Plugin)
        .handshake_timeout_ms(200)
        .receive_poll_ms(100)
        .reconnect_interval_ms(50)
        .build();
    let plugin = PluginInterface::with_observer(
        config,
        Arc::new(broker.clone()),
        Arc::clone(&observer) as Arc<dyn PluginObserver>,
    )
    .unwrap();
    plugin.start().unwrap();

    // No server ever answers; junk keeps arriving faster than the poll interval
    let stop = Arc::new(AtomicUsize::new(0));
    let noise = {
        let broker = broker.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while stop.load(Ordering::SeqCst) == 0 {
                let _ = broker.publish("q-noisy-P", Bytes::from_static(&[0xff, 0xff, 0xff]));
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    wait_until("handshake timeout", || {
        observer.timeouts.load(Ordering::SeqCst) > 0
    });
    assert!(!plugin.is_initiated());

    stop.store(1, Ordering::SeqCst);
    noise.join().unwrap();
    plugin.exit_sync();
}

#[test]
fn test_accessors() {
    let (_broker, server, _plugin) = pair("q-access");
    assert_eq!(server.role(), Role::Server);
    assert_eq!(server.broker_url(), URL);
    assert_eq!(server.queue_address(), "q-access");

    server.set_queue_address("q-other");
    server.set_broker_url("mem://other");
    assert_eq!(server.queue_address(), "q-other");
    assert_eq!(server.broker_url(), "mem://other");
}

// =============================================================================
// Command Tests
// =============================================================================

#[test]
fn test_command_round_trip() {
    let (_broker, server, plugin) = pair("q-cmd");
    server.register_command_handler(CommandCode::GetLastEventId, |request: &CommandRequest<'_>| {
        request.reply(&LastEventId { event_id: 42 }.encode())
    });
    start_bound(&server, &plugin);

    let (tx, rx) = channel::bounded(1);
    plugin
        .send(
            CommandCode::GetLastEventId,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome);
            })),
        )
        .unwrap();

    let outcome = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.code(), ResponseCode::Ok);
    let body = outcome.into_body().unwrap();
    assert_eq!(LastEventId::decode(&body).unwrap().event_id, 42);
    assert_eq!(plugin.pending_count(), 0);

    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_reply_through_facade() {
    let (_broker, server, plugin) = pair("q-facade-reply");
    let responder = server.clone();
    server.register_command_handler(CommandCode::GetTimeOfLastEvent, move |_: &CommandRequest<'_>| {
        assert!(responder.messaging_context().is_some());
        responder.reply_with_code(ResponseCode::Ok, b"later")
    });
    start_bound(&server, &plugin);

    let (tx, rx) = channel::bounded(1);
    plugin
        .send(
            CommandCode::GetTimeOfLastEvent,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome.into_body());
            })),
        )
        .unwrap();
    let body = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(&body[..], b"later");

    // Not inside a handler here
    assert!(matches!(server.reply_ok(), Err(HapiError::NoMessagingContext)));

    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_table_handler() {
    let (_broker, server, plugin) = pair("q-table");
    let received: Arc<Mutex<Option<ItemTable>>> = Arc::default();
    let slot = Arc::clone(&received);
    server.register_table_handler(
        CommandCode::SendHosts,
        move |table: ItemTable, request: &CommandRequest<'_>| {
            *slot.lock() = Some(table);
            request.reply_ok()
        },
    );
    start_bound(&server, &plugin);

    let mut hosts = ItemTable::new();
    hosts.push(vec![
        ItemData::new(1, ItemValue::UInt64(10084)),
        ItemData::new(2, ItemValue::String("web01".to_string())),
    ]);

    let (tx, rx) = channel::bounded(1);
    plugin
        .send_table(
            CommandCode::SendHosts,
            &hosts,
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome.code());
            })),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResponseCode::Ok);
    assert_eq!(received.lock().as_ref(), Some(&hosts));

    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_unknown_command_answered() {
    let (_broker, server, plugin) = pair("q-unknown");
    start_bound(&server, &plugin);

    let (tx, rx) = channel::bounded(1);
    server
        .send(
            CommandCode::ReqFetchTriggers,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome.code());
            })),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResponseCode::UnknownCode);

    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_malformed_message_is_dropped() {
    let broker = InMemoryBroker::new(URL);
    let observer = Arc::new(RecordingObserver::default());
    let server = PluginInterface::with_observer(
        config(Role::Server, "q-garbage"),
        Arc::new(broker.clone()),
        Arc::clone(&observer) as Arc<dyn PluginObserver>,
    )
    .unwrap();
    let plugin = endpoint(&broker, Role::Plugin, "q-garbage");
    server.register_command_handler(CommandCode::GetLastEventId, |request: &CommandRequest<'_>| {
        request.reply(&LastEventId { event_id: 1 }.encode())
    });
    start_bound(&server, &plugin);

    broker.publish("q-garbage-S", Bytes::from_static(&[0xff])).unwrap();
    broker.publish("q-garbage-S", Bytes::from_static(&[42, 0, 0, 0])).unwrap();
    wait_until("two dropped messages", || observer.errors.lock().len() >= 2);

    // The loop is still serving
    let (tx, rx) = channel::bounded(1);
    plugin
        .send(
            CommandCode::GetLastEventId,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome.code());
            })),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResponseCode::Ok);
    assert!(server.is_initiated());

    plugin.exit_sync();
    server.exit_sync();
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[test]
fn test_exit_fails_outstanding_commands() {
    let (_broker, server, plugin) = pair("q-teardown");
    let held = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&held);
    server.register_command_handler(CommandCode::SendHostGroups, move |_: &CommandRequest<'_>| {
        // Never replies
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    start_bound(&server, &plugin);

    let destructed = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let destructed = Arc::clone(&destructed);
        let calls = Arc::clone(&calls);
        plugin
            .send(
                CommandCode::SendHostGroups,
                &[],
                Some(on_outcome(move |outcome: CommandOutcome| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if matches!(outcome.into_body(), Err(HapiError::Destructed)) {
                        destructed.fetch_add(1, Ordering::SeqCst);
                    }
                })),
            )
            .unwrap();
    }
    wait_until("server to hold three commands", || held.load(Ordering::SeqCst) == 3);
    assert_eq!(plugin.pending_count(), 3);

    plugin.exit_sync();
    assert_eq!(destructed.load(Ordering::SeqCst), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(plugin.pending_count(), 0);

    server.exit_sync();
}

#[test]
fn test_exit_requested_from_handler() {
    let (_broker, server, plugin) = pair("q-terminate");
    let this = plugin.clone();
    plugin.register_command_handler(CommandCode::ReqTerminate, move |request: &CommandRequest<'_>| {
        request.reply_ok()?;
        this.exit_sync();
        Ok(())
    });
    start_bound(&server, &plugin);

    let (tx, rx) = channel::bounded(1);
    server
        .send(
            CommandCode::ReqTerminate,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                let _ = tx.send(outcome.code());
            })),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResponseCode::Ok);

    wait_until("plugin to disconnect", || !plugin.is_connected());
    plugin.exit_sync();
    server.exit_sync();
}

#[test]
fn test_reconnect_after_broker_outage() {
    let (broker, server, plugin) = pair("q-outage");
    start_bound(&server, &plugin);

    broker.set_available(false);
    wait_until("plugin to unbind", || !plugin.is_initiated());
    wait_until("server to unbind", || !server.is_initiated());

    broker.set_available(true);
    assert!(plugin.wait_initiated(WAIT));
    assert!(server.wait_initiated(WAIT));
    wait_until("both sides bound", || {
        plugin.handshake_state() == HandshakeState::Bound
            && server.handshake_state() == HandshakeState::Bound
    });

    plugin.exit_sync();
    server.exit_sync();
}
