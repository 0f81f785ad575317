//! The coordinating task that owns the connection sets.
//!
//! The worker is the only place where the live set, the consolidation in
//! progress and the retry bookkeeping change. Connections report state
//! changes over a channel; the worker publishes a fresh [`MonitorStatus`]
//! after handling each of them.

use std::collections::{BTreeSet, HashMap};
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shardline_stream::{
    ConnectionEvent, ConnectionId, ConnectionOptions, ConnectionState, Decoder, Directive,
    ErrorKind, StreamConnection,
};
use shardline_subjects::{Group, SubjectId};
use shardline_transport::Transport;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::allocator::allocate;
use crate::config::MonitorConfig;
use crate::connection_set::ConnectionSet;
use crate::status::MonitorStatus;

#[derive(Clone, Copy, Debug)]
enum Trigger {
    Start,
    SubjectsChanged,
    Requested,
    Periodic,
    Retry,
}

enum Wake {
    Shutdown,
    Event(ConnectionEvent),
    SubjectsChanged,
    HandleDropped,
    Requested,
    Periodic,
    Deadline,
}

/// A connection set being built to replace the live one
struct Pending {
    generation: u64,
    connections: Vec<PendingConnection>,
}

struct PendingConnection {
    connection: Arc<StreamConnection>,
    /// End of the grace interval, set once the connection is active
    ready_at: Option<Instant>,
}

impl Pending {
    fn groups(&self) -> Vec<Group> {
        self.connections
            .iter()
            .map(|pending| pending.connection.group().clone())
            .collect()
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.connections
            .iter()
            .all(|pending| pending.ready_at.is_some_and(|at| at <= now))
    }

    fn get_mut(&mut self, id: ConnectionId) -> Option<&mut PendingConnection> {
        self.connections
            .iter_mut()
            .find(|pending| pending.connection.id() == id)
    }

    fn close(&self) {
        for pending in &self.connections {
            pending.connection.close();
        }
    }
}

struct Retiring {
    connection: Arc<StreamConnection>,
    close_at: Instant,
}

#[derive(Debug, Default)]
struct RepairState {
    failures: u32,
    retry_at: Option<Instant>,
    exhausted: bool,
    active_since: Option<Instant>,
}

pub struct Worker<T, D> {
    config: Arc<MonitorConfig>,
    options: Arc<ConnectionOptions>,
    transport: T,
    decoder: D,
    subjects_rx: watch::Receiver<Arc<BTreeSet<SubjectId>>>,
    subjects: Arc<BTreeSet<SubjectId>>,
    reevaluate: Arc<Notify>,
    status_tx: watch::Sender<MonitorStatus>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    next_generation: u64,
    live: ConnectionSet,
    pending: Option<Pending>,
    retiring: Vec<Retiring>,
    repairs: HashMap<Group, RepairState>,
    consolidation_failures: u32,
    consolidation_retry_at: Option<Instant>,
    last_error: Option<ErrorKind>,
}

impl<T, D> Worker<T, D>
where
    T: Transport,
    D: Decoder,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<MonitorConfig>,
        transport: T,
        decoder: D,
        mut subjects_rx: watch::Receiver<Arc<BTreeSet<SubjectId>>>,
        reevaluate: Arc<Notify>,
        status_tx: watch::Sender<MonitorStatus>,
        shutdown_token: CancellationToken,
        task_tracker: TaskTracker,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subjects = subjects_rx.borrow_and_update().clone();

        Self {
            options: config.connection_options(),
            config,
            transport,
            decoder,
            subjects_rx,
            subjects,
            reevaluate,
            status_tx,
            events_tx,
            events_rx,
            shutdown_token,
            task_tracker,
            next_generation: 1,
            live: ConnectionSet::default(),
            pending: None,
            retiring: Vec::new(),
            repairs: HashMap::new(),
            consolidation_failures: 0,
            consolidation_retry_at: None,
            last_error: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            subjects = self.subjects.len(),
            capacity = self.config.capacity_per_connection,
            "Monitor started"
        );

        self.reevaluate(Trigger::Start);
        self.publish_status(true);

        let period = self.config.reevaluation_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();

            let wake = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => Wake::Shutdown,
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                changed = self.subjects_rx.changed() => {
                    if changed.is_ok() { Wake::SubjectsChanged } else { Wake::HandleDropped }
                }
                () = self.reevaluate.notified() => Wake::Requested,
                _ = ticker.tick() => Wake::Periodic,
                () = sleep_until_deadline(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Shutdown | Wake::HandleDropped => break,
                Wake::Event(event) => self.handle_event(event),
                Wake::SubjectsChanged => {
                    self.subjects = self.subjects_rx.borrow_and_update().clone();
                    info!(subjects = self.subjects.len(), "Monitored set changed");
                    self.reevaluate(Trigger::SubjectsChanged);
                }
                Wake::Requested => self.reevaluate(Trigger::Requested),
                Wake::Periodic => self.reevaluate(Trigger::Periodic),
                Wake::Deadline => self.handle_deadlines(),
            }

            self.publish_status(true);
        }

        self.shutdown().await;
    }

    fn reevaluate(&mut self, trigger: Trigger) {
        if matches!(trigger, Trigger::Periodic | Trigger::SubjectsChanged) {
            self.retry_exhausted();
        }

        if let Some(retry_at) = self.consolidation_retry_at {
            if Instant::now() < retry_at {
                debug!(?trigger, "Consolidation backing off, skipping re-evaluation");
                return;
            }
            self.consolidation_retry_at = None;
        }

        let groups = match allocate(&self.subjects, self.config.capacity_per_connection) {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to allocate groups: {}", e);
                return;
            }
        };

        if let Some(pending) = &self.pending {
            if pending.groups() == groups {
                debug!(
                    ?trigger,
                    generation = pending.generation,
                    "Consolidation for this partition already in progress"
                );
                return;
            }

            info!(
                generation = pending.generation,
                "Superseding consolidation in progress"
            );
            self.close_pending();
            self.resume_repairs();
        }

        if groups == self.live.groups() {
            debug!(
                ?trigger,
                generation = self.live.generation(),
                "Partition unchanged"
            );
            return;
        }

        self.begin_consolidation(groups, trigger);
    }

    fn begin_consolidation(&mut self, groups: Vec<Group>, trigger: Trigger) {
        let generation = self.take_generation();

        // At most one superseded set may still be dispatching
        for retiring in &self.retiring {
            retiring.connection.close();
        }

        if self.live.is_empty() {
            let connections = groups
                .into_iter()
                .enumerate()
                .map(|(index, group)| {
                    self.spawn(ConnectionId::new(generation, index), group, Directive::Forward)
                })
                .collect();
            self.live = ConnectionSet::new(generation, connections);

            info!(
                ?trigger,
                generation,
                connections = self.live.len(),
                "Created connection set"
            );
            return;
        }

        let connections = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| PendingConnection {
                connection: self.spawn(ConnectionId::new(generation, index), group, Directive::Hold),
                ready_at: None,
            })
            .collect();
        let pending = Pending {
            generation,
            connections,
        };

        info!(
            ?trigger,
            generation,
            live_generation = self.live.generation(),
            connections = pending.connections.len(),
            "Starting consolidation"
        );
        self.pending = Some(pending);

        self.check_consolidation_ready();
    }

    fn check_consolidation_ready(&mut self) {
        let now = Instant::now();
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.is_ready(now));

        if ready {
            self.swap();
        }
    }

    fn swap(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let connections: Vec<_> = pending
            .connections
            .into_iter()
            .map(|pending| pending.connection)
            .collect();
        for connection in &connections {
            connection.forward();
        }

        let previous =
            std::mem::replace(&mut self.live, ConnectionSet::new(pending.generation, connections));

        let close_at = Instant::now() + self.config.drain_interval;
        let mut retired = 0;
        for connection in previous.connections() {
            if connection.state().is_terminal() {
                continue;
            }
            connection.drain();
            self.retiring.push(Retiring {
                connection: Arc::clone(connection),
                close_at,
            });
            retired += 1;
        }

        self.consolidation_failures = 0;
        let groups = self.live.groups();
        self.repairs.retain(|group, _| groups.contains(group));

        info!(
            generation = self.live.generation(),
            previous = previous.generation(),
            connections = self.live.len(),
            retired,
            "Swapped to new connection set"
        );
    }

    fn abort_consolidation(&mut self, cause: Option<ErrorKind>) {
        let Some(generation) = self.close_pending() else {
            return;
        };

        self.last_error = Some(ErrorKind::ConsolidationTimeout);
        self.consolidation_failures += 1;
        let delay = self.config.backoff.delay(self.consolidation_failures);
        self.consolidation_retry_at = Some(Instant::now() + delay);

        warn!(
            generation,
            live_generation = self.live.generation(),
            ?cause,
            retry_in = ?delay,
            "Consolidation aborted, keeping the live set"
        );

        self.resume_repairs();
    }

    /// Close the new connections of the consolidation in progress
    fn close_pending(&mut self) -> Option<u64> {
        let pending = self.pending.take()?;
        let generation = pending.generation;
        pending.close();
        Some(generation)
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { id, state, error } = event;

        if let Some(pending) = self.pending.as_mut().and_then(|pending| pending.get_mut(id)) {
            match state {
                ConnectionState::Active => {
                    pending.ready_at = Some(Instant::now() + self.config.grace_interval);
                    debug!(connection = %id, grace = ?self.config.grace_interval, "New connection active, grace interval started");
                    self.check_consolidation_ready();
                }
                ConnectionState::Failed | ConnectionState::Closed => {
                    self.abort_consolidation(error);
                }
                ConnectionState::Connecting | ConnectionState::Draining => {}
            }
            return;
        }

        if let Some(index) = self.live.position(id) {
            if error.is_some() {
                self.last_error = error;
            }
            match state {
                ConnectionState::Active => {
                    let group = self.live.connections()[index].group();
                    if let Some(repair) = self.repairs.get_mut(group) {
                        repair.active_since = Some(Instant::now());
                    }
                }
                ConnectionState::Failed => {
                    self.on_live_failure(index, error.unwrap_or(ErrorKind::TransportFailure));
                }
                ConnectionState::Connecting
                | ConnectionState::Draining
                | ConnectionState::Closed => {}
            }
            return;
        }

        // Anything else is retiring, or stale from a closed consolidation
        if state.is_terminal() {
            self.retiring
                .retain(|retiring| retiring.connection.id() != id);
        }
    }

    fn on_live_failure(&mut self, index: usize, error: ErrorKind) {
        let connection = Arc::clone(&self.live.connections()[index]);
        let group = connection.group().clone();

        warn!(
            connection = %connection.id(),
            %group,
            ?error,
            "Live connection failed"
        );

        // The replacement set covers these subjects; stop holding back
        // whatever overlaps them.
        if let Some(pending) = &self.pending {
            for replacement in &pending.connections {
                let replacement = &replacement.connection;
                if replacement.group().iter().any(|subject| group.contains(subject)) {
                    debug!(connection = %replacement.id(), "Forwarding replacement early");
                    replacement.forward();
                }
            }
        }

        self.schedule_repair(group, error);
    }

    fn schedule_repair(&mut self, group: Group, error: ErrorKind) {
        let now = Instant::now();
        let backoff = &self.config.backoff;
        let stable_after = self.config.grace_interval;

        let repair = self.repairs.entry(group.clone()).or_default();
        if repair
            .active_since
            .take()
            .is_some_and(|since| now.duration_since(since) >= stable_after)
        {
            repair.failures = 0;
        }
        repair.failures += 1;

        if repair.failures > backoff.retry_limit {
            repair.exhausted = true;
            repair.retry_at = None;
            error!(
                %group,
                failures = repair.failures,
                "Giving up on group until the next re-evaluation"
            );
            return;
        }

        let delay = if error.always_backs_off() {
            backoff.delay(repair.failures)
        } else if repair.failures == 1 {
            Duration::ZERO
        } else {
            backoff.delay(repair.failures - 1)
        };

        if delay.is_zero() {
            repair.retry_at = None;
            self.repair(&group);
        } else {
            repair.retry_at = Some(now + delay);
            info!(
                %group,
                attempt = repair.failures,
                retry_in = ?delay,
                "Retrying group after backoff"
            );
        }
    }

    /// Replace the failed live connection serving `group`
    fn repair(&mut self, group: &Group) {
        if self.pending.is_some() {
            debug!(%group, "Consolidation in progress, deferring repair");
            return;
        }

        let Some(index) = self.live.connections().iter().position(|connection| {
            connection.group() == group && connection.state() == ConnectionState::Failed
        }) else {
            return;
        };

        let generation = self.take_generation();
        let connection = self.spawn(
            ConnectionId::new(generation, index),
            group.clone(),
            Directive::Forward,
        );

        info!(
            connection = %connection.id(),
            %group,
            "Repairing failed connection"
        );
        self.live = self.live.replace(generation, index, connection);
    }

    /// Repair failed live connections whose retry is due
    fn resume_repairs(&mut self) {
        if self.pending.is_some() {
            return;
        }

        let now = Instant::now();
        let due: Vec<Group> = self
            .live
            .connections()
            .iter()
            .filter(|connection| connection.state() == ConnectionState::Failed)
            .map(|connection| connection.group().clone())
            .filter(|group| {
                self.repairs.get(group).is_some_and(|repair| {
                    !repair.exhausted && repair.retry_at.is_none_or(|at| at <= now)
                })
            })
            .collect();

        for group in due {
            if let Some(repair) = self.repairs.get_mut(&group) {
                repair.retry_at = None;
            }
            self.repair(&group);
        }
    }

    fn retry_exhausted(&mut self) {
        let exhausted: Vec<Group> = self
            .repairs
            .iter_mut()
            .filter(|(_, repair)| repair.exhausted)
            .map(|(group, repair)| {
                *repair = RepairState::default();
                group.clone()
            })
            .collect();

        for group in exhausted {
            info!(%group, "Retrying group that was given up on");
            self.repair(&group);
        }
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        self.check_consolidation_ready();

        for retiring in &self.retiring {
            if retiring.close_at <= now && retiring.connection.directive() != Directive::Close {
                debug!(connection = %retiring.connection.id(), "Closing drained connection");
                retiring.connection.close();
            }
        }

        let due: Vec<Group> = self
            .repairs
            .iter_mut()
            .filter(|(_, repair)| repair.retry_at.is_some_and(|at| at <= now))
            .map(|(group, repair)| {
                repair.retry_at = None;
                group.clone()
            })
            .collect();
        for group in due {
            self.repair(&group);
        }

        if self.consolidation_retry_at.is_some_and(|at| at <= now) {
            self.consolidation_retry_at = None;
            self.reevaluate(Trigger::Retry);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();

        let grace = self
            .pending
            .iter()
            .flat_map(|pending| &pending.connections)
            .filter_map(|pending| pending.ready_at)
            .filter(|at| *at > now);
        let drains = self
            .retiring
            .iter()
            .filter(|retiring| retiring.connection.directive() != Directive::Close)
            .map(|retiring| retiring.close_at);
        let repairs = self.repairs.values().filter_map(|repair| repair.retry_at);

        grace
            .chain(drains)
            .chain(repairs)
            .chain(self.consolidation_retry_at)
            .min()
    }

    fn spawn(&self, id: ConnectionId, group: Group, directive: Directive) -> Arc<StreamConnection> {
        Arc::new(StreamConnection::spawn(
            id,
            group,
            self.transport.clone(),
            self.decoder.clone(),
            Arc::clone(&self.options),
            directive,
            self.events_tx.clone(),
            &self.shutdown_token,
            &self.task_tracker,
        ))
    }

    const fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn publish_status(&self, running: bool) {
        let status = MonitorStatus {
            running,
            generation: self.live.generation(),
            monitored: self.subjects.len(),
            live: self.live.statuses(),
            pending_generation: self.pending.as_ref().map(|pending| pending.generation),
            pending: self
                .pending
                .iter()
                .flat_map(|pending| &pending.connections)
                .map(|pending| pending.connection.status())
                .collect(),
            retiring: self
                .retiring
                .iter()
                .map(|retiring| retiring.connection.status())
                .collect(),
            last_error: self.last_error,
        };

        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        info!(generation = self.live.generation(), "Monitor stopping");

        let mut connections: Vec<Arc<StreamConnection>> = self.live.connections().to_vec();
        if let Some(pending) = self.pending.take() {
            connections.extend(pending.connections.into_iter().map(|pending| pending.connection));
        }
        connections.extend(self.retiring.drain(..).map(|retiring| retiring.connection));

        for connection in &connections {
            connection.close();
        }
        let statuses = join_all(connections.iter().map(|connection| connection.terminated())).await;

        self.publish_status(false);
        info!(closed = statuses.len(), "Monitor stopped");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
