//! Transport Module
//!
//! The only layer that touches the broker.
//!
//! ## Architecture
//! - [`Broker`] opens connections; [`BrokerConnection`] publishes to and
//!   receives from named queues
//! - [`TransportSession`] owns one (connection, queue address) pair and
//!   reports connect/disconnect upward
//! - [`InMemoryBroker`] is an in-process broker built on crossbeam channels
//!
//! ## Queue Naming
//! A queue address `q` maps to two broker queues: the server reads `q-S`
//! and writes `q-P`; the plugin reads `q-P` and writes `q-S`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{HapiError, Result};

mod memory;
mod session;

pub use memory::InMemoryBroker;
pub use session::TransportSession;

/// Entry point of a message broker
pub trait Broker: Send + Sync {
    /// Open a connection; each call is a single attempt with no retry.
    fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection
pub trait BrokerConnection: Send + Sync {
    /// Publish one message to `address`.
    fn send(&self, address: &str, message: Bytes) -> Result<()>;

    /// Wait up to `timeout` for the next message on `address`.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Disconnected)` once
    /// [`close`](Self::close) has been called, even from another thread.
    fn receive(&self, address: &str, timeout: Duration) -> Result<Option<Bytes>>;

    /// Close the connection and wake any blocked `receive`.
    fn close(&self);
}

/// Outbound half used by the correlator
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Bytes) -> Result<()>;

    /// Address replies end up on.
    fn reply_address(&self) -> String {
        String::new()
    }
}

/// Identifies the live broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub broker_url: String,
    pub queue_address: String,
}

/// Connection lifecycle notifications
pub trait SessionListener: Send + Sync {
    fn on_connected(&self) {}

    fn on_failure_connected(&self, _error: &HapiError) {}

    /// `None` when the session is gone.
    fn on_session_changed(&self, _session: Option<&SessionInfo>) {}
}

/// Listener that ignores every notification
pub struct NoopListener;

impl SessionListener for NoopListener {}
