//! In-memory transport implementation for testing
//!
//! Every connection opened through a [`MemoryTransport`] is paired with a
//! [`MemoryStream`] that the test side accepts and uses to play the remote
//! endpoint: pushing bytes in arbitrary increments, disconnecting, and
//! observing when the client closed the connection.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use shardline_subjects::Group;
use shardline_transport::{Connection, Transport, TransportError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Options for the in-memory transport
#[derive(Clone, Debug, Default)]
pub struct MemoryOptions {
    /// Largest group a single connection may carry
    pub max_group_size: Option<usize>,
}

/// Memory transport implementation
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    options: MemoryOptions,
    accepted_tx: flume::Sender<MemoryStream>,
    accepted_rx: flume::Receiver<MemoryStream>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
    open_delay: Mutex<Option<Duration>>,
    opened: Mutex<Vec<Group>>,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    /// Create a new memory transport with options
    #[must_use]
    pub fn new(options: MemoryOptions) -> Self {
        let (accepted_tx, accepted_rx) = flume::unbounded();

        Self {
            inner: Arc::new(Inner {
                options,
                accepted_tx,
                accepted_rx,
                scripted_failures: Mutex::new(VecDeque::new()),
                open_delay: Mutex::new(None),
                opened: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next call to `open` fail with `error`
    ///
    /// Calls queue up: each scripted failure is consumed by one `open`.
    pub fn fail_next_open(&self, error: TransportError) {
        self.inner.scripted_failures.lock().push_back(error);
    }

    /// Delay every subsequent `open` by `delay`, or remove the delay
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.inner.open_delay.lock() = delay;
    }

    /// Wait for the next connection opened by a client
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was dropped.
    pub async fn accept(&self) -> Result<MemoryStream, TransportError> {
        self.inner
            .accepted_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Take the next opened connection if one is waiting
    #[must_use]
    pub fn try_accept(&self) -> Option<MemoryStream> {
        self.inner.accepted_rx.try_recv().ok()
    }

    /// Groups of every successfully opened connection, in open order
    #[must_use]
    pub fn opened_groups(&self) -> Vec<Group> {
        self.inner.opened.lock().clone()
    }

    /// Number of successfully opened connections
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.opened.lock().len()
    }

    /// Number of calls to `open`, failed ones included
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, group: &Group) -> Result<Box<dyn Connection>, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.inner.scripted_failures.lock().pop_front();
        if let Some(error) = scripted {
            debug!(%group, "Failing scripted memory open: {}", error);
            return Err(error);
        }

        if let Some(max) = self.inner.options.max_group_size {
            if group.len() > max {
                return Err(TransportError::GroupTooLarge {
                    size: group.len(),
                    max,
                });
            }
        }

        let (data_tx, data_rx) = flume::unbounded();
        let (closed_tx, closed_rx) = watch::channel(false);

        let stream = MemoryStream {
            group: group.clone(),
            data_tx,
            closed_rx,
        };

        self.inner
            .accepted_tx
            .send(stream)
            .map_err(|_| TransportError::ConnectionFailed("Transport dropped".to_string()))?;
        self.inner.opened.lock().push(group.clone());

        info!(%group, "Memory connection opened");

        Ok(Box::new(MemoryConnection {
            data_rx,
            pending: Bytes::new(),
            closed_tx,
        }))
    }

    fn max_group_size(&self) -> Option<usize> {
        self.inner.options.max_group_size
    }
}

/// The client side of a memory connection
#[derive(Debug)]
struct MemoryConnection {
    data_rx: flume::Receiver<Bytes>,
    pending: Bytes,
    closed_tx: watch::Sender<bool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_some(&mut self, buf: &mut BytesMut, max: usize) -> Result<usize, TransportError> {
        if *self.closed_tx.borrow() {
            return Err(TransportError::Closed);
        }

        if self.pending.is_empty() {
            match self.data_rx.recv_async().await {
                Ok(data) => self.pending = data,
                // Remote side disconnected
                Err(_) => return Ok(0),
            }
        }

        let n = self.pending.len().min(max.max(1));
        buf.extend_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
    }
}

/// The remote-endpoint side of a memory connection
#[derive(Debug)]
pub struct MemoryStream {
    group: Group,
    data_tx: flume::Sender<Bytes>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryStream {
    /// The group this connection was opened for
    #[must_use]
    pub const fn group(&self) -> &Group {
        &self.group
    }

    /// Deliver raw bytes to the client, as a single increment
    ///
    /// # Errors
    ///
    /// Returns an error if the client is gone.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.data_tx
            .send(data.into())
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver `message` followed by the CRLF delimiter
    ///
    /// # Errors
    ///
    /// Returns an error if the client is gone.
    pub fn send_line(&self, message: &str) -> Result<(), TransportError> {
        self.send(format!("{message}\r\n"))
    }

    /// Deliver `data` split into increments of at most `chunk_size` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the client is gone.
    pub fn send_chunked(&self, data: &[u8], chunk_size: usize) -> Result<(), TransportError> {
        for chunk in data.chunks(chunk_size.max(1)) {
            self.send(Bytes::copy_from_slice(chunk))?;
        }
        Ok(())
    }

    /// Whether the client closed (or dropped) its side
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Wait until the client closes its side
    pub async fn closed(&mut self) {
        // An error means the client side was dropped, which also closes it
        let _ = self.closed_rx.wait_for(|closed| *closed).await;
    }

    /// Hang up, so the client observes end of stream
    pub fn disconnect(self) {
        debug!(group = %self.group, "Memory stream disconnected by remote");
    }
}
