//! In-process broker
//!
//! Queues are unbounded crossbeam channels created on first use, so a
//! message published before anyone listens is kept until it is received.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::error::{HapiError, Result};

use super::{Broker, BrokerConnection};

struct Queue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

struct BrokerInner {
    url: String,
    available: AtomicBool,
    queues: Mutex<HashMap<String, Queue>>,
}

impl BrokerInner {
    fn sender(&self, address: &str) -> Sender<Bytes> {
        self.queues
            .lock()
            .entry(address.to_string())
            .or_insert_with(new_queue)
            .tx
            .clone()
    }

    fn receiver(&self, address: &str) -> Receiver<Bytes> {
        self.queues
            .lock()
            .entry(address.to_string())
            .or_insert_with(new_queue)
            .rx
            .clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HapiError::UnavailableBroker(self.url.clone()))
        }
    }
}

fn new_queue() -> Queue {
    let (tx, rx) = channel::unbounded();
    Queue { tx, rx }
}

/// Broker living inside the current process
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a broker that accepts connections to `url` only.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                url: url.into(),
                available: AtomicBool::new(true),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Publish raw bytes to `address`, bypassing any session.
    pub fn publish(&self, address: &str, message: Bytes) -> Result<()> {
        self.inner.check_available()?;
        self.inner
            .sender(address)
            .send(message)
            .map_err(|e| HapiError::Transport(e.to_string()))
    }

    /// Number of messages waiting on `address`.
    pub fn queue_len(&self, address: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(address)
            .map(|q| q.rx.len())
            .unwrap_or(0)
    }
}

impl Broker for InMemoryBroker {
    fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.check_available()?;
        if url != self.inner.url {
            return Err(HapiError::UnavailableBroker(format!(
                "no broker at {} (serving {})",
                url, self.inner.url
            )));
        }
        let (close_tx, close_rx) = channel::bounded(0);
        Ok(Arc::new(InMemoryConnection {
            inner: Arc::clone(&self.inner),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }))
    }
}

struct InMemoryConnection {
    inner: Arc<BrokerInner>,
    /// Dropping the sender disconnects `close_rx`, which wakes `receive`.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl InMemoryConnection {
    fn is_closed(&self) -> bool {
        self.close_tx.lock().is_none()
    }
}

impl BrokerConnection for InMemoryConnection {
    fn send(&self, address: &str, message: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(HapiError::Disconnected);
        }
        self.inner.check_available()?;
        self.inner
            .sender(address)
            .send(message)
            .map_err(|e| HapiError::Transport(e.to_string()))
    }

    fn receive(&self, address: &str, timeout: Duration) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Err(HapiError::Disconnected);
        }
        self.inner.check_available()?;
        let rx = self.inner.receiver(address);
        select! {
            recv(rx) -> msg => msg
                .map(Some)
                .map_err(|e| HapiError::Transport(e.to_string())),
            recv(self.close_rx) -> _ => Err(HapiError::Disconnected),
            default(timeout) => Ok(None),
        }
    }

    fn close(&self) {
        self.close_tx.lock().take();
    }
}
