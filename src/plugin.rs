//! Plugin Interface
//!
//! The public endpoint type. One instance owns one broker session, one
//! handshake state machine and one correlator, and runs one receive thread.
//!
//! ## Receive Loop
//! ```text
//! connect ──► start handshake ──► receive_next ──► classify by type
//!    ▲                                 │             ├─ Initiation* ─► Handshake
//!    └──── wait reconnect_interval ◄───┘ (error)     ├─ Command ─────► Correlator ─► handler
//!                                                    └─ Response ────► Correlator ─► callback
//! ```
//!
//! Handlers and reply callbacks run on the receive thread. `send` and the
//! reply methods taking a [`MessagingContext`] may be used from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::{Config, Role};
use crate::correlator::{
    CommandCallback, CommandHandler, CommandRequest, Correlator, MessagingContext,
};
use crate::error::{HapiError, Result};
use crate::handshake::{Handshake, HandshakeEvent, HandshakeState, HandshakeStep};
use crate::protocol::{
    peek_message_type, CommandCode, InitiationPacket, MessageType, ResponseCode, WireLayout,
};
use crate::table::{encode_table, ItemTable};
use crate::transport::{Broker, MessageSink, SessionInfo, SessionListener, TransportSession};

/// Notifications raised by a [`PluginInterface`]
///
/// Every hook runs on the receive thread and defaults to doing nothing.
pub trait PluginObserver: Send + Sync {
    fn on_connected(&self) {}

    fn on_failure_connected(&self, _error: &HapiError) {}

    fn on_session_changed(&self, _session: Option<&SessionInfo>) {}

    /// The handshake reached `Bound`.
    fn on_initiated(&self) {}

    /// A message was dropped or could not be correlated.
    fn on_got_error(&self, _error: &HapiError) {}
}

/// Observer that ignores every notification
pub struct NoopObserver;

impl PluginObserver for NoopObserver {}

struct ObserverBridge(Arc<dyn PluginObserver>);

impl SessionListener for ObserverBridge {
    fn on_connected(&self) {
        self.0.on_connected();
    }

    fn on_failure_connected(&self, error: &HapiError) {
        self.0.on_failure_connected(error);
    }

    fn on_session_changed(&self, session: Option<&SessionInfo>) {
        self.0.on_session_changed(session);
    }
}

struct Inner {
    config: Config,
    session: Arc<TransportSession>,
    correlator: Correlator,
    handshake: Mutex<Handshake>,
    observer: Arc<dyn PluginObserver>,

    exit_requested: AtomicBool,
    exit_tx: Sender<()>,
    exit_rx: Receiver<()>,

    /// Mirrors the bound state for `wait_initiated`.
    initiated: Mutex<bool>,
    initiated_cv: Condvar,

    receiver: Mutex<Option<JoinHandle<()>>>,
    receiver_id: Mutex<Option<ThreadId>>,
}

/// One HAPI endpoint (server or plugin side)
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct PluginInterface {
    inner: Arc<Inner>,
}

impl PluginInterface {
    /// Create an endpoint that reports nothing upward.
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::with_observer(config, broker, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: Config,
        broker: Arc<dyn Broker>,
        observer: Arc<dyn PluginObserver>,
    ) -> Result<Self> {
        let handshake = Handshake::new(config.role, config.handshake_timeout());
        Self::with_handshake(config, broker, observer, handshake)
    }

    /// Create an endpoint around a prepared handshake (e.g. fixed keys).
    pub fn with_handshake(
        config: Config,
        broker: Arc<dyn Broker>,
        observer: Arc<dyn PluginObserver>,
        handshake: Handshake,
    ) -> Result<Self> {
        config.validate()?;
        if handshake.role() != config.role {
            return Err(HapiError::Config(format!(
                "handshake role {:?} does not match config role {:?}",
                handshake.role(),
                config.role
            )));
        }

        let session = Arc::new(TransportSession::new(
            broker,
            config.role,
            config.broker_url.clone(),
            config.queue_address.clone(),
            Arc::new(ObserverBridge(Arc::clone(&observer))),
        ));
        let correlator = Correlator::new(Arc::clone(&session) as Arc<dyn MessageSink>);
        let (exit_tx, exit_rx) = channel::bounded(1);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                session,
                correlator,
                handshake: Mutex::new(handshake),
                observer,
                exit_requested: AtomicBool::new(false),
                exit_tx,
                exit_rx,
                initiated: Mutex::new(false),
                initiated_cv: Condvar::new(),
                receiver: Mutex::new(None),
                receiver_id: Mutex::new(None),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the receive thread.
    pub fn start(&self) -> Result<()> {
        let mut receiver = self.inner.receiver.lock();
        if receiver.is_some() {
            return Err(HapiError::InvalidArg("receive loop already started".to_string()));
        }
        if self.inner.exit_requested.load(Ordering::Acquire) {
            return Err(HapiError::InvalidArg("endpoint has exited".to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("hapi-{:?}", self.inner.config.role).to_lowercase())
            .spawn(move || inner.run())
            .map_err(|e| HapiError::Transport(format!("failed to spawn receive thread: {}", e)))?;
        *self.inner.receiver_id.lock() = Some(handle.thread().id());
        *receiver = Some(handle);
        Ok(())
    }

    /// Stop the receive loop and wait for it.
    ///
    /// Every outstanding command has been failed with `ErrDestructed` by the
    /// time this returns. Called from a handler, it only requests the exit.
    pub fn exit_sync(&self) {
        let inner = &self.inner;
        inner.exit_requested.store(true, Ordering::Release);
        let _ = inner.exit_tx.try_send(());
        inner.session.interrupt();

        if *inner.receiver_id.lock() == Some(thread::current().id()) {
            tracing::debug!("Exit requested from the receive thread");
            return;
        }

        let handle = inner.receiver.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!("Receive thread panicked");
                    inner.teardown();
                }
            }
            None => inner.teardown(),
        }
    }

    /// Block until the handshake is bound or `timeout` elapses.
    pub fn wait_initiated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut initiated = self.inner.initiated.lock();
        while !*initiated {
            if self
                .inner
                .initiated_cv
                .wait_until(&mut initiated, deadline)
                .timed_out()
            {
                return *initiated;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Send a command; returns its sequence id.
    pub fn send(
        &self,
        code: CommandCode,
        body: &[u8],
        callback: Option<Box<dyn CommandCallback>>,
    ) -> Result<u32> {
        self.inner.correlator.send_command(code, body, callback)
    }

    /// Send a command whose body is one item table.
    pub fn send_table(
        &self,
        code: CommandCode,
        table: &ItemTable,
        callback: Option<Box<dyn CommandCallback>>,
    ) -> Result<u32> {
        let mut body = BytesMut::new();
        encode_table(&mut body, table)?;
        self.send(code, &body, callback)
    }

    pub fn register_command_handler<F>(&self, code: CommandCode, handler: F)
    where
        F: Fn(&CommandRequest<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.correlator.register_command_handler(code, handler);
    }

    pub fn register_handler(&self, code: CommandCode, handler: Arc<dyn CommandHandler>) {
        self.inner.correlator.register_handler(code, handler);
    }

    /// Register a handler that receives the command body decoded as a table.
    pub fn register_table_handler<F>(&self, code: CommandCode, handler: F)
    where
        F: Fn(ItemTable, &CommandRequest<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register_command_handler(code, move |request: &CommandRequest<'_>| {
            let table = request.body_table()?;
            handler(table, request)
        });
    }

    // -------------------------------------------------------------------------
    // Replies
    // -------------------------------------------------------------------------

    /// Reply `Ok` with `body` to the command being handled on this thread.
    pub fn reply(&self, body: &[u8]) -> Result<()> {
        self.reply_with_code(ResponseCode::Ok, body)
    }

    pub fn reply_ok(&self) -> Result<()> {
        self.reply_with_code(ResponseCode::Ok, &[])
    }

    pub fn reply_error(&self, code: ResponseCode) -> Result<()> {
        self.reply_with_code(code, &[])
    }

    pub fn reply_with_code(&self, code: ResponseCode, body: &[u8]) -> Result<()> {
        let context = self
            .messaging_context()
            .ok_or(HapiError::NoMessagingContext)?;
        self.reply_with_context(&context, code, body)
    }

    /// Reply later, from any thread, using a saved context.
    pub fn reply_with_context(
        &self,
        context: &MessagingContext,
        code: ResponseCode,
        body: &[u8],
    ) -> Result<()> {
        self.inner.correlator.reply_with_context(context, code, body)
    }

    /// Context of the command being handled; `None` outside a handler.
    pub fn messaging_context(&self) -> Option<MessagingContext> {
        self.inner.correlator.messaging_context()
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn broker_url(&self) -> String {
        self.inner.session.broker_url()
    }

    /// Takes effect on the next connection attempt.
    pub fn set_broker_url(&self, url: impl Into<String>) {
        self.inner.session.set_broker_url(url);
    }

    pub fn queue_address(&self) -> String {
        self.inner.session.queue_address()
    }

    /// Takes effect on the next connection attempt.
    pub fn set_queue_address(&self, addr: impl Into<String>) {
        self.inner.session.set_queue_address(addr);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn is_initiated(&self) -> bool {
        self.inner.correlator.is_bound()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.inner.handshake.lock().state()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

// =============================================================================
// Receive loop
// =============================================================================

impl Inner {
    fn exiting(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    fn run(&self) {
        tracing::info!(
            "Receive loop started ({:?}, queue {})",
            self.config.role,
            self.session.queue_address()
        );

        while !self.exiting() {
            if !self.session.is_connected() {
                if self.session.connect().is_err() {
                    self.wait_for_retry();
                    continue;
                }
                self.start_handshake();
            }

            match self.session.receive_next(self.config.receive_poll()) {
                Ok(Some(message)) => {
                    self.dispatch(&message);
                    // Steady traffic must not starve the deadline
                    self.check_handshake_timeout();
                }
                Ok(None) => self.check_handshake_timeout(),
                Err(e) => {
                    if self.exiting() {
                        break;
                    }
                    tracing::warn!("Broker session lost: {}", e);
                    self.observer.on_failure_connected(&e);
                    self.on_transport_lost();
                    self.wait_for_retry();
                }
            }
        }

        self.teardown();
    }

    /// Sleep for the reconnect interval unless an exit is requested.
    fn wait_for_retry(&self) {
        if self.exiting() {
            return;
        }
        let _ = self.exit_rx.recv_timeout(self.config.reconnect_interval());
    }

    fn start_handshake(&self) {
        let step = self.handshake.lock().start(Instant::now());
        self.apply_step(step);
    }

    fn check_handshake_timeout(&self) {
        let timed_out = self.handshake.lock().check_timeout(Instant::now());
        if let Some(e) = timed_out {
            tracing::warn!("{}", e);
            self.observer.on_failure_connected(&e);
            self.wait_for_retry();
            if !self.exiting() {
                self.start_handshake();
            }
        }
    }

    fn on_transport_lost(&self) {
        let event = self.handshake.lock().on_transport_lost();
        if let Some(event) = event {
            self.apply_event(event);
        }
        self.session.disconnect();
    }

    /// Classify one inbound message; anything malformed is logged and dropped.
    fn dispatch(&self, message: &[u8]) {
        if let Err(e) = self.route(message) {
            if e.is_protocol_error() {
                tracing::warn!("Dropping message ({} bytes): {}", message.len(), e);
            } else {
                tracing::warn!("Failed to handle message: {}", e);
            }
            self.observer.on_got_error(&e);
        }
    }

    fn route(&self, message: &[u8]) -> Result<()> {
        match peek_message_type(message)? {
            MessageType::Initiation
            | MessageType::InitiationResponse
            | MessageType::InitiationFinish
            | MessageType::InitiationRequest => {
                let packet = InitiationPacket::decode(message)?;
                let step = self.handshake.lock().on_packet(&packet, Instant::now());
                self.apply_step(step);
                Ok(())
            }
            MessageType::Command => self.correlator.on_command_received(message),
            MessageType::Response => self.correlator.on_response_received(message),
        }
    }

    /// Leaving `Bound` is applied before the packet goes out, entering it after.
    fn apply_step(&self, step: HandshakeStep) {
        if step.event == Some(HandshakeEvent::Unbound) {
            self.apply_event(HandshakeEvent::Unbound);
        }
        if let Some(packet) = step.send {
            tracing::debug!("Sending {:?}", packet.msg_type);
            if let Err(e) = self.session.send(packet.encode()) {
                tracing::warn!("Failed to send {:?}: {}", packet.msg_type, e);
                self.observer.on_got_error(&e);
            }
        }
        if step.event == Some(HandshakeEvent::Bound) {
            self.apply_event(HandshakeEvent::Bound);
        }
    }

    fn apply_event(&self, event: HandshakeEvent) {
        match event {
            HandshakeEvent::Bound => {
                tracing::info!("Session initiated ({:?})", self.config.role);
                self.correlator.set_bound(true);
                self.set_initiated(true);
                self.observer.on_initiated();
            }
            HandshakeEvent::Unbound => {
                tracing::info!("Session unbound ({:?})", self.config.role);
                self.set_initiated(false);
                self.correlator.unbind();
            }
        }
    }

    fn set_initiated(&self, value: bool) {
        *self.initiated.lock() = value;
        self.initiated_cv.notify_all();
    }

    fn teardown(&self) {
        self.handshake.lock().reset();
        self.set_initiated(false);
        let failed = self.correlator.unbind();
        self.session.disconnect();
        self.correlator.clear_handlers();
        tracing::info!(
            "Receive loop stopped ({:?}, {} pending commands failed)",
            self.config.role,
            failed
        );
    }
}
