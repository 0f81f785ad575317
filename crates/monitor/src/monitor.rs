//! The caller-facing monitor handle

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use shardline_stream::Decoder;
use shardline_subjects::SubjectId;
use shardline_transport::Transport;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::status::MonitorStatus;
use crate::worker::Worker;

/// Keeps a monitored set of subjects covered by a near-minimal number of
/// stream connections
///
/// The handle is cheap to share behind an `Arc`; all coordination happens on
/// a background task spawned by [`Monitor::start`].
pub struct Monitor<T, D>
where
    T: Transport,
    D: Decoder,
{
    config: Arc<MonitorConfig>,
    transport: T,
    decoder: D,
    subjects_tx: watch::Sender<Arc<BTreeSet<SubjectId>>>,
    reevaluate: Arc<Notify>,
    status_tx: Mutex<Option<watch::Sender<MonitorStatus>>>,
    status_rx: watch::Receiver<MonitorStatus>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<T, D> Monitor<T, D>
where
    T: Transport,
    D: Decoder,
{
    /// Create a monitor for `subjects`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] if the configured capacity is zero or
    /// larger than the transport accepts.
    pub fn new(
        config: MonitorConfig,
        transport: T,
        decoder: D,
        subjects: impl IntoIterator<Item = SubjectId>,
    ) -> Result<Self> {
        config.validate(transport.max_group_size())?;

        let subjects: BTreeSet<SubjectId> = subjects.into_iter().collect();
        let (status_tx, status_rx) = watch::channel(MonitorStatus {
            monitored: subjects.len(),
            ..MonitorStatus::default()
        });
        let (subjects_tx, _) = watch::channel(Arc::new(subjects));

        Ok(Self {
            config: Arc::new(config),
            transport,
            decoder,
            subjects_tx,
            reevaluate: Arc::new(Notify::new()),
            status_tx: Mutex::new(Some(status_tx)),
            status_rx,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Start connecting
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once.
    pub fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }
        let status_tx = self.status_tx.lock().take().ok_or(Error::AlreadyStarted)?;

        let worker = Worker::new(
            self.config.clone(),
            self.transport.clone(),
            self.decoder.clone(),
            self.subjects_tx.subscribe(),
            self.reevaluate.clone(),
            status_tx,
            self.shutdown_token.clone(),
            self.task_tracker.clone(),
        );

        self.task_tracker.spawn(worker.run());
        self.task_tracker.close();

        Ok(())
    }

    /// Replace the monitored set
    ///
    /// Triggers a re-evaluation once the monitor is running.
    pub fn update(&self, subjects: impl IntoIterator<Item = SubjectId>) {
        let subjects: BTreeSet<SubjectId> = subjects.into_iter().collect();
        info!(subjects = subjects.len(), "Updating monitored set");

        // Before start the status is ours to keep current
        if let Some(status_tx) = self.status_tx.lock().as_ref() {
            status_tx.send_modify(|status| status.monitored = subjects.len());
        }
        self.subjects_tx.send_replace(Arc::new(subjects));
    }

    /// Ask the monitor to check whether its connections are still minimal
    pub fn reevaluate(&self) {
        self.reevaluate.notify_one();
    }

    /// Close every connection and wait for the monitor to finish
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the monitor was never started.
    pub async fn stop(&self) -> Result<()> {
        if !self.task_tracker.is_closed() {
            return Err(Error::NotStarted);
        }

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        Ok(())
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status snapshots
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    /// The monitored set most recently supplied
    #[must_use]
    pub fn monitored(&self) -> Arc<BTreeSet<SubjectId>> {
        self.subjects_tx.borrow().clone()
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

impl<T, D> Drop for Monitor<T, D>
where
    T: Transport,
    D: Decoder,
{
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
