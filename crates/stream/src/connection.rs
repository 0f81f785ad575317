//! A single long-lived streaming connection and its read loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use shardline_subjects::Group;
use shardline_transport::{Connection, Transport};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Decoder as _;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::decoder::Decoder;
use crate::error::{Error, ErrorKind};
use crate::framing::{DEFAULT_CONTROL_PREFIX, Frame, FrameClassifier, FrameCodec, MAX_FRAME_LEN};
use crate::state::{ConnectionEvent, ConnectionId, ConnectionState, ConnectionStatus};

/// Default deadline for a connection to become active.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(40);

/// Default deadline between two reads while active.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default upper bound on the bytes taken from the transport per read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default bound on frames buffered while a connection is held.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 10_000;

/// Options shared by every connection of a monitor.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Deadline for the transport to accept the request.
    pub setup_timeout: Duration,
    /// Deadline between two reads, heartbeats included.
    pub idle_timeout: Duration,
    /// Upper bound on the bytes taken from the transport per read.
    pub read_chunk_size: usize,
    /// Largest frame accepted, delimiter excluded.
    pub max_frame_len: usize,
    /// Frames buffered while held before the oldest are dropped.
    pub max_pending_frames: usize,
    /// Prefixes tagging control frames.
    pub control_prefixes: Vec<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_frame_len: MAX_FRAME_LEN,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            control_prefixes: vec![DEFAULT_CONTROL_PREFIX.to_string()],
        }
    }
}

/// What the owner of a connection wants it to do with its frames.
///
/// Directives only move forward: once a connection was told to drain it is
/// never held again.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Directive {
    /// Buffer frames until forwarded.
    Hold,
    /// Hand frames to the decoder.
    Forward,
    /// Keep forwarding, but the connection is being replaced.
    Drain,
    /// Dispatch what was received and close the transport.
    Close,
}

/// Handle to a spawned stream connection.
///
/// Dropping the handle shuts the connection down.
#[derive(Debug)]
pub struct StreamConnection {
    id: ConnectionId,
    group: Group,
    directive_tx: watch::Sender<Directive>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_token: CancellationToken,
}

impl StreamConnection {
    /// Spawn a connection for `group` onto `task_tracker`.
    ///
    /// The connection starts in [`ConnectionState::Connecting`]; every state
    /// change is published through [`Self::watch_status`] and sent to `events`.
    /// Cancelling `parent_token` closes the connection.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<T, D>(
        id: ConnectionId,
        group: Group,
        transport: T,
        decoder: D,
        options: Arc<ConnectionOptions>,
        directive: Directive,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        parent_token: &CancellationToken,
        task_tracker: &TaskTracker,
    ) -> Self
    where
        T: Transport,
        D: Decoder,
    {
        let (directive_tx, directive_rx) = watch::channel(directive);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            id,
            group: group.clone(),
            state: ConnectionState::Connecting,
            last_error: None,
        });
        let shutdown_token = parent_token.child_token();

        let read_loop = ReadLoop {
            id,
            group: group.clone(),
            transport,
            decoder,
            codec: FrameCodec::new().with_max_frame_len(options.max_frame_len),
            classifier: FrameClassifier::new(&options.control_prefixes),
            options,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            mode: Directive::Hold,
            directive_rx,
            status_tx,
            events,
            shutdown_token: shutdown_token.clone(),
        };

        debug!(connection = %id, %group, ?directive, "Spawning stream connection");
        task_tracker.spawn(read_loop.run());

        Self {
            id,
            group,
            directive_tx,
            status_rx,
            shutdown_token,
        }
    }

    /// Connection identity.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Subjects served by this connection.
    #[must_use]
    pub const fn group(&self) -> &Group {
        &self.group
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Directive currently in effect.
    #[must_use]
    pub fn directive(&self) -> Directive {
        *self.directive_tx.borrow()
    }

    /// Start handing frames to the decoder, flushing anything held.
    pub fn forward(&self) {
        self.advance(Directive::Forward);
    }

    /// Mark the connection as being replaced.
    pub fn drain(&self) {
        self.advance(Directive::Drain);
    }

    /// Dispatch frames already received, then close the transport.
    pub fn close(&self) {
        self.advance(Directive::Close);
    }

    /// Wait until the connection reached a terminal state.
    pub async fn terminated(&self) -> ConnectionStatus {
        let mut status_rx = self.status_rx.clone();
        // The read loop publishes a terminal state before dropping the sender
        let _ = status_rx.wait_for(|status| status.state.is_terminal()).await;
        status_rx.borrow().clone()
    }

    fn advance(&self, next: Directive) {
        let changed = self.directive_tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(connection = %self.id, directive = ?next, "Directive changed");
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

enum LoopEvent {
    Shutdown,
    DirectiveChanged(bool),
    Read(Result<usize, shardline_transport::TransportError>),
    Idle,
}

struct ReadLoop<T, D> {
    id: ConnectionId,
    group: Group,
    transport: T,
    decoder: D,
    options: Arc<ConnectionOptions>,
    codec: FrameCodec,
    classifier: FrameClassifier,
    buffer: BytesMut,
    pending: VecDeque<Frame>,
    mode: Directive,
    directive_rx: watch::Receiver<Directive>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown_token: CancellationToken,
}

impl<T, D> ReadLoop<T, D>
where
    T: Transport,
    D: Decoder,
{
    async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => self.transition(ConnectionState::Closed, None),
            Err(e) if self.state() == ConnectionState::Draining => {
                debug!(connection = %self.id, "Draining connection ended: {}", e);
                self.transition(ConnectionState::Closed, None);
            }
            Err(e) => {
                let kind = e.kind();
                if kind == ErrorKind::AuthFailure {
                    error!(connection = %self.id, group = %self.group, "Connection rejected: {}", e);
                } else {
                    warn!(connection = %self.id, group = %self.group, "Connection failed: {}", e);
                }
                self.transition(ConnectionState::Failed, Some(kind));
            }
        }

        if !self.pending.is_empty() {
            debug!(
                connection = %self.id,
                frames = self.pending.len(),
                "Discarding frames held by a connection that never went live"
            );
        }
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        let Some(mut connection) = self.connect().await? else {
            return Ok(());
        };

        self.transition(ConnectionState::Active, None);

        let result = self.read_frames(&mut connection).await;

        if let Err(e) = connection.close().await {
            debug!(connection = %self.id, "Error closing transport: {}", e);
        }

        result
    }

    /// Open the transport, or return `None` if shut down first.
    async fn connect(&mut self) -> Result<Option<Box<dyn Connection>>, Error> {
        let setup_timeout = self.options.setup_timeout;
        let open = timeout(setup_timeout, self.transport.open(&self.group));

        tokio::select! {
            biased;
            () = self.shutdown_token.cancelled() => Ok(None),
            () = close_requested(&mut self.directive_rx) => Ok(None),
            result = open => match result {
                Ok(Ok(connection)) => Ok(Some(connection)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Error::SetupTimeout(setup_timeout)),
            },
        }
    }

    async fn read_frames(&mut self, connection: &mut Box<dyn Connection>) -> Result<(), Error> {
        let idle_timeout = self.options.idle_timeout;
        let chunk_size = self.options.read_chunk_size.max(1);
        // Only bytes from the remote end push the deadline out
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            let directive = *self.directive_rx.borrow_and_update();
            if !self.apply(directive).await || directive == Directive::Close {
                return Ok(());
            }

            let event = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => LoopEvent::Shutdown,
                changed = self.directive_rx.changed() => LoopEvent::DirectiveChanged(changed.is_ok()),
                read = connection.read_some(&mut self.buffer, chunk_size) => LoopEvent::Read(read),
                () = sleep_until(idle_deadline) => LoopEvent::Idle,
            };

            match event {
                LoopEvent::Shutdown | LoopEvent::DirectiveChanged(false) => return Ok(()),
                LoopEvent::DirectiveChanged(true) => {}
                LoopEvent::Idle => return Err(Error::IdleTimeout(idle_timeout)),
                LoopEvent::Read(Err(e)) => return Err(e.into()),
                LoopEvent::Read(Ok(0)) => {
                    while let Some(payload) = self.codec.decode_eof(&mut self.buffer)? {
                        if !self.handle_payload(payload).await {
                            return Ok(());
                        }
                    }
                    return Err(Error::EndOfStream);
                }
                LoopEvent::Read(Ok(n)) => {
                    trace!(connection = %self.id, bytes = n, "Read from transport");
                    while let Some(payload) = self.codec.decode(&mut self.buffer)? {
                        if !self.handle_payload(payload).await {
                            return Ok(());
                        }
                    }
                    idle_deadline = Instant::now() + idle_timeout;
                }
            }
        }
    }

    /// Act on `directive`; false if shut down while flushing held frames.
    async fn apply(&mut self, directive: Directive) -> bool {
        // A held connection closed without going live drops what it held
        if self.mode == Directive::Hold && matches!(directive, Directive::Forward | Directive::Drain) {
            debug!(
                connection = %self.id,
                frames = self.pending.len(),
                "Flushing held frames"
            );
            while let Some(frame) = self.pending.pop_front() {
                if !self.dispatch(frame).await {
                    return false;
                }
            }
        }

        if directive >= Directive::Drain && self.state() == ConnectionState::Active {
            self.transition(ConnectionState::Draining, None);
        }

        self.mode = directive;
        true
    }

    /// Hold or dispatch one frame; false if shut down while dispatching.
    async fn handle_payload(&mut self, payload: bytes::Bytes) -> bool {
        let Some(frame) = self.classifier.classify(payload) else {
            trace!(connection = %self.id, "Heartbeat");
            return true;
        };

        if self.mode == Directive::Hold {
            if self.pending.len() >= self.options.max_pending_frames {
                self.pending.pop_front();
                warn!(
                    connection = %self.id,
                    limit = self.options.max_pending_frames,
                    "Held frame buffer full, dropping oldest frame"
                );
            }
            self.pending.push_back(frame);
            true
        } else {
            self.dispatch(frame).await
        }
    }

    /// Hand `frame` to the decoder, giving up if shut down while it waits.
    async fn dispatch(&self, frame: Frame) -> bool {
        tokio::select! {
            biased;
            () = self.shutdown_token.cancelled() => {
                debug!(connection = %self.id, "Shut down while the decoder was busy");
                false
            }
            result = self.decoder.on_frame(self.id, frame) => {
                if let Err(e) = result {
                    warn!(connection = %self.id, "Decoder failed to handle frame: {}", e);
                }
                true
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    fn transition(&self, next: ConnectionState, error: Option<ErrorKind>) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(connection = %self.id, from = %current, to = %next, "Ignoring illegal state transition");
            return;
        }

        self.status_tx.send_modify(|status| {
            status.state = next;
            if error.is_some() {
                status.last_error = error;
            }
        });

        info!(connection = %self.id, from = %current, to = %next, "Connection state changed");

        // The owner may already be gone during shutdown
        let _ = self.events.send(ConnectionEvent {
            id: self.id,
            state: next,
            error,
        });
    }
}

async fn close_requested(directive_rx: &mut watch::Receiver<Directive>) {
    // A dropped handle also means close
    let _ = directive_rx
        .wait_for(|directive| *directive == Directive::Close)
        .await;
}
