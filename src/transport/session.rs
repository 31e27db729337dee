//! Transport Session
//!
//! Owns one broker connection bound to one queue address.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::config::Role;
use crate::error::{HapiError, Result};

use super::{Broker, BrokerConnection, MessageSink, SessionInfo, SessionListener};

/// A live connection and the queues it was opened for
///
/// Queue names are fixed at connect time; a later `set_queue_address`
/// only affects the next link.
struct Link {
    connection: Arc<dyn BrokerConnection>,
    inbound: String,
    outbound: String,
}

/// A single broker session
///
/// ## Concurrency:
/// - `link`: RwLock around an `Arc`; senders clone the `Arc` and
///   release the lock before touching the broker
/// - `receive_next` is only called from the receive loop
pub struct TransportSession {
    broker: Arc<dyn Broker>,
    role: Role,
    broker_url: RwLock<String>,
    queue_address: RwLock<String>,
    link: RwLock<Option<Arc<Link>>>,
    listener: Arc<dyn SessionListener>,
}

impl TransportSession {
    pub fn new(
        broker: Arc<dyn Broker>,
        role: Role,
        broker_url: impl Into<String>,
        queue_address: impl Into<String>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            broker,
            role,
            broker_url: RwLock::new(broker_url.into()),
            queue_address: RwLock::new(queue_address.into()),
            link: RwLock::new(None),
            listener,
        }
    }

    /// Make one connection attempt.
    ///
    /// Reports `on_connected` + `on_session_changed(Some)` on success and
    /// `on_failure_connected` on failure. Retrying is the caller's business.
    pub fn connect(&self) -> Result<()> {
        let info = self.session_info();
        let result = if info.queue_address.is_empty() {
            Err(HapiError::NotFoundQueueAddress(info.queue_address.clone()))
        } else {
            self.broker.connect(&info.broker_url)
        };

        match result {
            Ok(connection) => {
                let link = Link {
                    connection,
                    inbound: queue_name(&info.queue_address, self.role, true),
                    outbound: queue_name(&info.queue_address, self.role, false),
                };
                if let Some(old) = self.link.write().replace(Arc::new(link)) {
                    old.connection.close();
                }
                tracing::info!(
                    "Connected to broker {} (queue {})",
                    info.broker_url,
                    info.queue_address
                );
                self.listener.on_connected();
                self.listener.on_session_changed(Some(&info));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to connect to broker {}: {}", info.broker_url, e);
                self.listener.on_failure_connected(&e);
                Err(e)
            }
        }
    }

    /// Drop the connection, if any.
    pub fn disconnect(&self) {
        let old = self.link.write().take();
        if let Some(link) = old {
            link.connection.close();
            tracing::debug!("Disconnected from broker");
            self.listener.on_session_changed(None);
        }
    }

    /// Wake a blocked `receive_next` without forgetting the connection.
    pub fn interrupt(&self) {
        if let Some(link) = self.link.read().as_ref() {
            link.connection.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.read().is_some()
    }

    /// Block up to `timeout` for the next inbound message.
    pub fn receive_next(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let link = self.current()?;
        link.connection.receive(&link.inbound, timeout)
    }

    pub fn broker_url(&self) -> String {
        self.broker_url.read().clone()
    }

    /// Takes effect on the next `connect`.
    pub fn set_broker_url(&self, url: impl Into<String>) {
        *self.broker_url.write() = url.into();
    }

    pub fn queue_address(&self) -> String {
        self.queue_address.read().clone()
    }

    /// Takes effect on the next `connect`.
    pub fn set_queue_address(&self, addr: impl Into<String>) {
        *self.queue_address.write() = addr.into();
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            broker_url: self.broker_url(),
            queue_address: self.queue_address(),
        }
    }

    /// Broker queue this endpoint reads; the live one while connected.
    pub fn inbound_address(&self) -> String {
        match self.link.read().as_ref() {
            Some(link) => link.inbound.clone(),
            None => queue_name(&self.queue_address.read(), self.role, true),
        }
    }

    /// Broker queue this endpoint writes; the live one while connected.
    pub fn outbound_address(&self) -> String {
        match self.link.read().as_ref() {
            Some(link) => link.outbound.clone(),
            None => queue_name(&self.queue_address.read(), self.role, false),
        }
    }

    fn current(&self) -> Result<Arc<Link>> {
        self.link
            .read()
            .as_ref()
            .cloned()
            .ok_or(HapiError::Disconnected)
    }
}

impl MessageSink for TransportSession {
    fn send(&self, message: Bytes) -> Result<()> {
        let link = self.current()?;
        tracing::trace!("Sending {} bytes to {}", message.len(), link.outbound);
        link.connection.send(&link.outbound, message)
    }

    fn reply_address(&self) -> String {
        self.outbound_address()
    }
}

fn queue_name(base: &str, role: Role, inbound: bool) -> String {
    let suffix = match (role, inbound) {
        (Role::Server, true) | (Role::Plugin, false) => "S",
        (Role::Server, false) | (Role::Plugin, true) => "P",
    };
    format!("{}-{}", base, suffix)
}
