//! Correlator Module
//!
//! Matches responses to the commands that caused them and dispatches
//! inbound commands to registered handlers.
//!
//! ## Responsibilities
//! - Issue sequence ids (wrapping at `SEQ_ID_MAX`, never reusing one that
//!   is still pending)
//! - Own one pending entry per outstanding command until its response,
//!   or teardown, consumes it
//! - Route inbound commands by code; an unknown code is answered with
//!   `UnknownCode` and reported
//!
//! ## Concurrency
//! `send_command` may be called from any thread. The pending table, the
//! sequence counter and the bound flag share one `Mutex` that is held only
//! for lookup/insert/remove, never while a callback or handler runs.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::error::{HapiError, Result};
use crate::protocol::{
    build_command, build_response, CommandCode, CommandHeader, ResponseCode,
    ResponseHeader, WireLayout, SEQ_ID_MAX, SEQ_ID_UNKNOWN,
};
use crate::table::{encode_table, ItemTable};
use crate::transport::MessageSink;

// =============================================================================
// Callbacks
// =============================================================================

/// Receives the outcome of one sent command
///
/// Exactly one of the two methods is called, exactly once.
pub trait CommandCallback: Send {
    /// `reply` is the whole response message, header included.
    fn on_got_reply(self: Box<Self>, reply: &[u8], command: &CommandHeader);

    fn on_error(self: Box<Self>, code: ResponseCode, command: &CommandHeader);
}

/// Callback for fire-and-forget commands
pub struct NoopCallback;

impl CommandCallback for NoopCallback {
    fn on_got_reply(self: Box<Self>, _reply: &[u8], _command: &CommandHeader) {}

    fn on_error(self: Box<Self>, code: ResponseCode, command: &CommandHeader) {
        tracing::debug!(
            "Fire-and-forget command {} (seq {}) failed: {:?}",
            command.code,
            command.sequence_id,
            code
        );
    }
}

/// Owned outcome handed to closure callbacks
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Reply {
        header: ResponseHeader,
        message: Bytes,
    },
    Error(ResponseCode),
}

impl CommandOutcome {
    /// Reply body (bytes after the response header).
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            CommandOutcome::Reply { message, .. } => message.get(ResponseHeader::SIZE..),
            CommandOutcome::Error(_) => None,
        }
    }

    pub fn code(&self) -> ResponseCode {
        match self {
            CommandOutcome::Reply { header, .. } => {
                header.response_code().unwrap_or(ResponseCode::InvalidHeader)
            }
            CommandOutcome::Error(code) => *code,
        }
    }

    /// The reply body, or the error code as `HapiError::ErrorReply`.
    pub fn into_body(self) -> Result<Bytes> {
        match self {
            CommandOutcome::Reply { message, .. } => Ok(message.slice(ResponseHeader::SIZE..)),
            CommandOutcome::Error(ResponseCode::ErrDestructed) => Err(HapiError::Destructed),
            CommandOutcome::Error(code) => Err(HapiError::ErrorReply(code)),
        }
    }
}

struct OutcomeFn<F>(F);

impl<F> CommandCallback for OutcomeFn<F>
where
    F: FnOnce(CommandOutcome) + Send,
{
    fn on_got_reply(self: Box<Self>, reply: &[u8], _command: &CommandHeader) {
        let outcome = match ResponseHeader::decode(reply) {
            Ok(header) => CommandOutcome::Reply {
                header,
                message: Bytes::copy_from_slice(reply),
            },
            Err(_) => CommandOutcome::Error(ResponseCode::InvalidHeader),
        };
        (self.0)(outcome)
    }

    fn on_error(self: Box<Self>, code: ResponseCode, _command: &CommandHeader) {
        (self.0)(CommandOutcome::Error(code))
    }
}

/// Wrap a closure as a [`CommandCallback`].
pub fn on_outcome<F>(f: F) -> Box<dyn CommandCallback>
where
    F: FnOnce(CommandOutcome) + Send + 'static,
{
    Box::new(OutcomeFn(f))
}

// =============================================================================
// Handlers
// =============================================================================

/// Addressing needed to answer a command later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingContext {
    pub reply_address: String,
    pub sequence_id: u32,
}

/// Handles one command code
pub trait CommandHandler: Send + Sync {
    fn handle(&self, request: &CommandRequest<'_>) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandRequest<'_>) -> Result<()> + Send + Sync,
{
    fn handle(&self, request: &CommandRequest<'_>) -> Result<()> {
        self(request)
    }
}

/// A command being handled on the receive thread
///
/// Every reply carries the sequence id of the inbound header.
pub struct CommandRequest<'a> {
    header: CommandHeader,
    message: &'a [u8],
    context: MessagingContext,
    correlator: &'a Correlator,
    replied: Cell<bool>,
}

impl<'a> CommandRequest<'a> {
    pub fn header(&self) -> &CommandHeader {
        &self.header
    }

    /// Whole message, header included.
    pub fn message(&self) -> &'a [u8] {
        self.message
    }

    /// Bytes after the command header.
    pub fn body(&self) -> &'a [u8] {
        &self.message[CommandHeader::SIZE..]
    }

    /// Decode the body as one item table.
    pub fn body_table(&self) -> Result<ItemTable> {
        ItemTable::decode(self.body())
    }

    pub fn messaging_context(&self) -> &MessagingContext {
        &self.context
    }

    pub fn has_replied(&self) -> bool {
        self.replied.get()
    }

    pub fn reply(&self, body: &[u8]) -> Result<()> {
        self.reply_with_code(ResponseCode::Ok, body)
    }

    pub fn reply_ok(&self) -> Result<()> {
        self.reply_with_code(ResponseCode::Ok, &[])
    }

    pub fn reply_error(&self, code: ResponseCode) -> Result<()> {
        self.reply_with_code(code, &[])
    }

    pub fn reply_table(&self, code: ResponseCode, table: &ItemTable) -> Result<()> {
        let mut body = BytesMut::new();
        encode_table(&mut body, table)?;
        self.reply_with_code(code, &body)
    }

    pub fn reply_with_code(&self, code: ResponseCode, body: &[u8]) -> Result<()> {
        self.replied.set(true);
        self.correlator
            .send_reply(self.header.sequence_id, code, body)
    }
}

// =============================================================================
// Correlator
// =============================================================================

/// An outstanding command; owned solely by the pending table
struct PendingCommand {
    header: CommandHeader,
    callback: Box<dyn CommandCallback>,
}

/// Pending table plus the bound flag; a command is only ever inserted
/// while bound, under the same lock that drains the table on unbind.
struct PendingState {
    bound: bool,
    next_sequence_id: u32,
    pending: HashMap<u32, PendingCommand>,
}

impl PendingState {
    fn ensure_bound(&self) -> Result<()> {
        if self.bound {
            Ok(())
        } else {
            Err(HapiError::NotInitiated)
        }
    }

    fn drain(&mut self) -> Vec<PendingCommand> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_sequence_id;
            self.next_sequence_id = if id >= SEQ_ID_MAX { 0 } else { id + 1 };
            if id != SEQ_ID_UNKNOWN && id <= SEQ_ID_MAX && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Command/response correlation for one session
pub struct Correlator {
    sink: Arc<dyn MessageSink>,
    state: Mutex<PendingState>,
    handlers: RwLock<HashMap<u16, Arc<dyn CommandHandler>>>,
    current: Mutex<Option<(ThreadId, MessagingContext)>>,
}

impl Correlator {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(PendingState {
                bound: false,
                next_sequence_id: 0,
                pending: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    /// Open or close the gate for command/response traffic.
    ///
    /// Closing leaves the pending table alone; see [`unbind`](Self::unbind).
    pub fn set_bound(&self, bound: bool) {
        self.state.lock().bound = bound;
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    fn ensure_bound(&self) -> Result<()> {
        self.state.lock().ensure_bound()
    }

    /// Close the gate and fail every pending command with `ErrDestructed`.
    ///
    /// No command can be added between the two steps. Returns how many
    /// commands were failed.
    pub fn unbind(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            state.bound = false;
            state.drain()
        };
        Self::fail(drained)
    }

    /// Next id to hand out; wrapped into range if above `SEQ_ID_MAX`.
    pub fn set_next_sequence_id(&self, id: u32) {
        self.state.lock().next_sequence_id = if id > SEQ_ID_MAX { 0 } else { id };
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Send a command and remember `callback` until its response arrives.
    ///
    /// Without a callback a bookkeeping-only one is installed. If the
    /// transport rejects the message the entry is removed again and the
    /// error returned, dropping the callback uninvoked. When an `unbind`
    /// raced the send and already failed the entry, the callback has seen
    /// `ErrDestructed` and the transport error is still returned.
    pub fn send_command(
        &self,
        code: CommandCode,
        body: &[u8],
        callback: Option<Box<dyn CommandCallback>>,
    ) -> Result<u32> {
        let callback = callback.unwrap_or_else(|| Box::new(NoopCallback));

        let header = {
            let mut state = self.state.lock();
            state.ensure_bound()?;
            let sequence_id = state.allocate();
            let header = CommandHeader::new(code, sequence_id);
            state
                .pending
                .insert(sequence_id, PendingCommand { header, callback });
            header
        };

        tracing::debug!("Sending {:?} (seq {})", code, header.sequence_id);
        if let Err(e) = self.sink.send(build_command(&header, body)) {
            self.state.lock().pending.remove(&header.sequence_id);
            return Err(e);
        }
        Ok(header.sequence_id)
    }

    /// Send a response carrying `sequence_id`.
    pub fn send_reply(&self, sequence_id: u32, code: ResponseCode, body: &[u8]) -> Result<()> {
        self.ensure_bound()?;
        tracing::trace!("Replying {:?} (seq {})", code, sequence_id);
        self.sink
            .send(build_response(&ResponseHeader::new(code, sequence_id), body))
    }

    /// Reply outside the handler, using a saved context.
    pub fn reply_with_context(
        &self,
        context: &MessagingContext,
        code: ResponseCode,
        body: &[u8],
    ) -> Result<()> {
        self.send_reply(context.sequence_id, code, body)
    }

    /// Context of the command being handled on the calling thread.
    pub fn messaging_context(&self) -> Option<MessagingContext> {
        let current = self.current.lock();
        match current.as_ref() {
            Some((owner, ctx)) if *owner == thread::current().id() => Some(ctx.clone()),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Match a response to its pending command.
    pub fn on_response_received(&self, buffer: &[u8]) -> Result<()> {
        let header = ResponseHeader::decode(buffer)
            .map_err(|e| HapiError::InvalidHeader(e.to_string()))?;

        let entry = {
            let mut state = self.state.lock();
            state.ensure_bound()?;
            state.pending.remove(&header.sequence_id)
        };
        let Some(PendingCommand {
            header: command,
            callback,
        }) = entry
        else {
            return Err(HapiError::UnexpectedSequenceId(header.sequence_id));
        };

        match header.response_code() {
            Ok(code) if code.is_success() => callback.on_got_reply(buffer, &command),
            Ok(code) => callback.on_error(code, &command),
            Err(e) => {
                tracing::warn!("Response for seq {}: {}", header.sequence_id, e);
                callback.on_error(ResponseCode::InvalidHeader, &command)
            }
        }
        Ok(())
    }

    /// Dispatch a command to the handler registered for its code.
    pub fn on_command_received(&self, buffer: &[u8]) -> Result<()> {
        self.ensure_bound()?;
        let header = CommandHeader::decode(buffer)?;

        let handler = self.handlers.read().get(&header.code).cloned();
        let Some(handler) = handler else {
            self.send_reply(header.sequence_id, ResponseCode::UnknownCode, &[])?;
            return Err(HapiError::UnknownCode(format!(
                "no handler for command code {}",
                header.code
            )));
        };

        let context = MessagingContext {
            reply_address: self.sink.reply_address(),
            sequence_id: header.sequence_id,
        };
        *self.current.lock() = Some((thread::current().id(), context.clone()));

        let request = CommandRequest {
            header,
            message: buffer,
            context,
            correlator: self,
            replied: Cell::new(false),
        };
        let result = handler.handle(&request);
        *self.current.lock() = None;

        if let Err(e) = result {
            if !request.has_replied() {
                self.send_reply(header.sequence_id, e.response_code(), &[])?;
            }
            return Err(e);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Handler table
    // -------------------------------------------------------------------------

    /// Register `handler` for `code`; a later registration replaces it.
    pub fn register_command_handler<F>(&self, code: CommandCode, handler: F)
    where
        F: Fn(&CommandRequest<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register_handler(code, Arc::new(handler));
    }

    pub fn register_handler(&self, code: CommandCode, handler: Arc<dyn CommandHandler>) {
        if self.handlers.write().insert(code.into(), handler).is_some() {
            tracing::debug!("Replaced handler for {:?}", code);
        }
    }

    pub fn has_handler(&self, code: CommandCode) -> bool {
        self.handlers.read().contains_key(&u16::from(code))
    }

    /// Drop every handler (breaks reference cycles on shutdown).
    pub fn clear_handlers(&self) {
        self.handlers.write().clear();
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Fail every outstanding command with `ErrDestructed`; returns how many.
    pub fn fail_all_pending(&self) -> usize {
        let drained = self.state.lock().drain();
        Self::fail(drained)
    }

    fn fail(drained: Vec<PendingCommand>) -> usize {
        let count = drained.len();
        if count > 0 {
            tracing::debug!("Failing {} pending commands", count);
        }
        for PendingCommand { header, callback } in drained {
            callback.on_error(ResponseCode::ErrDestructed, &header);
        }
        count
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.fail_all_pending();
    }
}
