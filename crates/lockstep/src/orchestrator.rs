//! Orchestrator - manages worker processes and the lock-step exchange.
//!
//! Flow:
//! 1. Start the listener, spawn N worker processes (all or nothing)
//! 2. Run the event loop until every slot is bound by a handshake (READY)
//! 3. Per tick: write the outbound frame to every slot, then collect replies
//! 4. On worker disconnect: unbind the slot and report it, never reconnect
//! 5. Shutdown: close connections, stop the loop, reap processes

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::{FrameError, StateFrame};
use crate::event_loop::{
    ConnEvent, Connection, EventMultiplexer, Readiness, ShutdownHandle,
};
use crate::listener::{HandshakeError, HandshakeListener, ListenerError};
use crate::process::{CommandSpawner, LaunchTemplate, ProcessHandle, SpawnError, WorkerSpawner};
use crate::registry::{ConnId, ConnectionRegistry};

pub const DEFAULT_PORT: u16 = 2000;
pub const DEFAULT_BACKLOG_FACTOR: u32 = 10;
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Spawning,
    Handshaking,
    Ready,
    Exchanging,
    ShuttingDown,
    Done,
}

pub struct OrchestratorConfig {
    pub num_workers: usize,
    pub launch: LaunchTemplate,
    pub port: u16,
    /// Listen backlog is `backlog_factor * num_workers`.
    pub backlog_factor: u32,
    /// `None` waits for workers indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// `None` waits for every reply indefinitely.
    pub tick_timeout: Option<Duration>,
    /// Time a worker gets to exit after SIGTERM before it is killed.
    pub reap_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl OrchestratorConfig {
    pub fn new(num_workers: usize, launch: LaunchTemplate) -> Self {
        Self {
            num_workers,
            launch,
            port: DEFAULT_PORT,
            backlog_factor: DEFAULT_BACKLOG_FACTOR,
            handshake_timeout: None,
            tick_timeout: None,
            reap_grace: DEFAULT_REAP_GRACE,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog_factor(mut self, factor: u32) -> Self {
        self.backlog_factor = factor;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = Some(timeout);
        self
    }

    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn backlog(&self) -> u32 {
        let workers = u32::try_from(self.num_workers).unwrap_or(u32::MAX);
        self.backlog_factor.saturating_mul(workers).max(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn workers: {0}")]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("workers not ready (orchestrator is {state:?})")]
    NotReady { state: OrchestratorState },
    #[error("cannot {action} while orchestrator is {state:?}")]
    InvalidState {
        action: &'static str,
        state: OrchestratorState,
    },
    #[error("handshake timed out with {bound} of {expected} workers bound")]
    HandshakeTimeout { bound: usize, expected: usize },
    #[error("interrupted by shutdown signal")]
    Interrupted,
}

/// Why a slot has no inbound frame for a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotFailure {
    /// Peer closed the connection.
    Disconnected,
    /// Peer sent bytes that do not decode as a frame; the slot is dropped.
    Malformed(String),
    /// The outbound frame could not be written; the slot is dropped.
    WriteFailed(String),
    /// Slot was already unbound when the tick started.
    Unbound,
    /// No reply within the tick timeout. The slot stays bound and its late
    /// reply is discarded when it arrives.
    TimedOut,
}

/// Outcome of one tick: a frame per responding slot, a failure per other slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickResult {
    pub cycle: u64,
    pub frames: BTreeMap<usize, StateFrame>,
    pub failures: BTreeMap<usize, SlotFailure>,
}

impl TickResult {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            frames: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&StateFrame> {
        self.frames.get(&index)
    }
}

/// What one turn of the event loop did.
#[derive(Debug)]
pub enum LoopEvent {
    Accepted { conn: ConnId, peer_port: u16 },
    /// Connection arrived after READY and was closed.
    Refused { conn: ConnId },
    AcceptFailed(ListenerError),
    Bound { index: usize, pid: u32, conn: ConnId },
    HandshakeRejected { conn: ConnId, error: HandshakeError },
    WorkerDisconnected { index: usize, reason: SlotFailure },
    /// Frame from a bound worker outside of a tick; dropped.
    StrayFrame { index: usize },
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    state: OrchestratorState,
    registry: ConnectionRegistry,
    listener: HandshakeListener,
    mux: EventMultiplexer,
    handles: Vec<ProcessHandle>,
    connections: HashMap<ConnId, Connection>,
    /// Accepted connections whose handshake has not been read yet.
    pending: HashSet<ConnId>,
    cycles: u64,
    /// Per slot: replies still due for ticks that timed out.
    owed: Vec<u32>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let workers = config.num_workers;
        let registry = ConnectionRegistry::new(workers);
        Self {
            config,
            state: OrchestratorState::Init,
            registry,
            listener: HandshakeListener::new(),
            mux: EventMultiplexer::new(),
            handles: Vec::new(),
            connections: HashMap::new(),
            pending: HashSet::new(),
            cycles: 0,
            owed: vec![0; workers],
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            OrchestratorState::Ready | OrchestratorState::Exchanging
        )
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// Port workers connect to (0 until the listener is started).
    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// Number of ticks issued so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Replies still due from `index` for ticks that timed out.
    pub fn owed_replies(&self, index: usize) -> u32 {
        self.owed.get(index).copied().unwrap_or(0)
    }

    /// Handle that interrupts the event loop from another task (e.g. Ctrl-C).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.mux.shutdown_handle()
    }

    /// Start listening and launch every worker.
    ///
    /// All or nothing: if any worker fails to launch, the ones already
    /// started are reaped and the orchestrator ends in `Done`.
    pub async fn spawn(&mut self) -> Result<(), OrchestratorError> {
        if self.state != OrchestratorState::Init {
            return Err(OrchestratorError::InvalidState {
                action: "spawn",
                state: self.state,
            });
        }
        let count = self.config.num_workers;
        if count == 0 {
            return Err(SpawnError::Other("no workers configured".to_string()).into());
        }

        let port = self.listener.start(self.config.port, self.config.backlog())?;
        self.state = OrchestratorState::Spawning;

        tracing::info!(count, port, launch = %self.config.launch, "Spawning workers");
        for index in 0..count {
            match self.config.spawner.spawn(index, &self.config.launch, port) {
                Ok(spawned) => {
                    tracing::debug!(slot = index, pid = spawned.pid, "Spawned worker");
                    self.handles
                        .push(ProcessHandle::new(index, &self.config.launch, port, spawned));
                }
                Err(e) => {
                    tracing::error!(
                        slot = index,
                        error = %e,
                        "Worker spawn failed, aborting startup"
                    );
                    for handle in &mut self.handles {
                        handle.reap(self.config.reap_grace).await;
                    }
                    self.handles.clear();
                    self.listener.drain();
                    self.state = OrchestratorState::Done;
                    return Err(e.into());
                }
            }
        }

        self.listener.mark_accepting();
        self.state = OrchestratorState::Handshaking;
        Ok(())
    }

    /// Block until every slot is bound.
    pub async fn wait_ready(&mut self) -> Result<(), OrchestratorError> {
        match self.state {
            OrchestratorState::Ready | OrchestratorState::Exchanging => return Ok(()),
            OrchestratorState::Handshaking => {}
            state => {
                return Err(OrchestratorError::InvalidState {
                    action: "wait for workers",
                    state,
                });
            }
        }

        let deadline = self.config.handshake_timeout.map(|t| Instant::now() + t);
        while !self.is_ready() {
            let stepped = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.step()).await.ok(),
                None => Some(self.step().await),
            };
            match stepped {
                Some(result) => {
                    result?;
                }
                None => {
                    return Err(OrchestratorError::HandshakeTimeout {
                        bound: self.registry.bound_count(),
                        expected: self.registry.capacity(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run one iteration of the event loop outside of a tick.
    ///
    /// Lets a driver poll for READY instead of blocking in [`wait_ready`].
    ///
    /// [`wait_ready`]: Self::wait_ready
    pub async fn step(&mut self) -> Result<LoopEvent, OrchestratorError> {
        match self.state {
            OrchestratorState::Handshaking
            | OrchestratorState::Ready
            | OrchestratorState::Exchanging => {}
            state => {
                return Err(OrchestratorError::InvalidState {
                    action: "run the event loop",
                    state,
                });
            }
        }

        let watched = self.watched();
        let readiness = self
            .mux
            .next(&self.listener, &watched)
            .await
            .ok_or(OrchestratorError::Interrupted)?;
        let event = self.dispatch(readiness);
        self.check_ready();
        Ok(event)
    }

    /// Send `outbound` to every bound worker and collect one reply from each.
    ///
    /// Every slot appears in the result exactly once, either with a frame or
    /// with the reason it has none.
    pub async fn on_tick(
        &mut self,
        outbound: &StateFrame,
    ) -> Result<TickResult, OrchestratorError> {
        if !self.is_ready() {
            return Err(OrchestratorError::NotReady { state: self.state });
        }
        self.state = OrchestratorState::Exchanging;

        let mut result = TickResult::new(self.cycles);
        self.cycles += 1;

        for index in self.drain_stale() {
            result.failures.insert(index, SlotFailure::Disconnected);
        }

        // Write to every slot before consuming any reply.
        let targets: Vec<(usize, ConnId)> = self
            .registry
            .iter()
            .filter_map(|slot| slot.conn().map(|conn| (slot.index(), conn)))
            .collect();
        for slot in self.registry.iter().filter(|s| !s.is_bound()) {
            result
                .failures
                .entry(slot.index())
                .or_insert(SlotFailure::Unbound);
        }

        let mut awaiting = BTreeSet::new();
        for (index, conn) in targets {
            let sent = match self.connections.get_mut(&conn) {
                Some(connection) => connection.send(outbound).await,
                None => Err(FrameError::malformed("connection missing from table")),
            };
            match sent {
                Ok(()) => {
                    awaiting.insert(index);
                }
                Err(e) => {
                    tracing::warn!(slot = index, error = %e, "Failed to write tick frame");
                    self.disconnect(index);
                    result
                        .failures
                        .insert(index, SlotFailure::WriteFailed(e.to_string()));
                }
            }
        }

        let deadline = self.config.tick_timeout.map(|t| Instant::now() + t);
        while !awaiting.is_empty() {
            let watched = self.registry.descriptors_snapshot();
            let next = self.mux.next(&self.listener, &watched);
            let readiness = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, next).await {
                    Ok(readiness) => readiness,
                    Err(_) => {
                        for index in std::mem::take(&mut awaiting) {
                            tracing::warn!(
                                slot = index,
                                cycle = result.cycle,
                                "Worker missed tick deadline"
                            );
                            self.owed[index] += 1;
                            result.failures.insert(index, SlotFailure::TimedOut);
                        }
                        break;
                    }
                },
                None => next.await,
            };

            match readiness.ok_or(OrchestratorError::Interrupted)? {
                Readiness::Read { conn, event } => {
                    let Some(index) = self.registry.index_of(conn) else {
                        continue;
                    };
                    match event {
                        ConnEvent::Frame(frame) => {
                            if self.settle_owed(index) {
                                continue;
                            }
                            if awaiting.remove(&index) {
                                result.frames.insert(index, frame);
                            } else {
                                tracing::warn!(
                                    slot = index,
                                    cycle = result.cycle,
                                    "Extra frame within tick, dropping"
                                );
                            }
                        }
                        ConnEvent::Closed => {
                            self.disconnect(index);
                            if awaiting.remove(&index) {
                                result.failures.insert(index, SlotFailure::Disconnected);
                            }
                        }
                        ConnEvent::Malformed(e) => {
                            tracing::warn!(slot = index, error = %e, "Malformed frame from worker");
                            self.disconnect(index);
                            if awaiting.remove(&index) {
                                result
                                    .failures
                                    .insert(index, SlotFailure::Malformed(e.to_string()));
                            }
                        }
                    }
                }
                other => {
                    self.dispatch(other);
                }
            }
        }

        if result.is_partial() {
            tracing::warn!(
                cycle = result.cycle,
                responded = result.frames.len(),
                failed = result.failures.len(),
                "Partial tick"
            );
        } else {
            tracing::debug!(cycle = result.cycle, responded = result.frames.len(), "Tick complete");
        }
        Ok(result)
    }

    /// Close every connection, stop the event loop and reap all workers.
    pub async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        if self.state == OrchestratorState::Done {
            return Ok(());
        }
        self.state = OrchestratorState::ShuttingDown;
        tracing::info!(connections = self.connections.len(), "Shutting down workers");

        for index in 0..self.registry.capacity() {
            self.registry.unbind(index);
        }
        self.pending.clear();
        self.connections.clear();
        self.mux.shutdown_handle().shutdown();
        self.listener.drain();

        for handle in &mut self.handles {
            handle.reap(self.config.reap_grace).await;
        }

        self.state = OrchestratorState::Done;
        tracing::info!("Orchestrator shut down");
        Ok(())
    }

    fn watched(&self) -> HashSet<ConnId> {
        let mut watched = self.registry.descriptors_snapshot();
        watched.extend(self.pending.iter().copied());
        watched
    }

    fn check_ready(&mut self) {
        if self.state != OrchestratorState::Handshaking || !self.registry.all_bound() {
            return;
        }
        // Anything still mid-handshake can no longer claim a slot.
        for conn in self.pending.drain() {
            self.connections.remove(&conn);
        }
        self.state = OrchestratorState::Ready;
        tracing::info!(workers = self.registry.capacity(), "All workers bound");
    }

    fn dispatch(&mut self, readiness: Readiness) -> LoopEvent {
        match readiness {
            Readiness::Accepted(connection) => self.on_accepted(connection),
            Readiness::AcceptFailed(e) => {
                tracing::warn!(error = %e, "Accept failed");
                LoopEvent::AcceptFailed(e)
            }
            Readiness::Read { conn, event } => {
                if self.pending.remove(&conn) {
                    return self.on_handshake(conn, event);
                }
                match self.registry.index_of(conn) {
                    Some(index) => self.on_idle_read(index, event),
                    // Not reachable through `watched`, but harmless.
                    None => LoopEvent::Refused { conn },
                }
            }
        }
    }

    fn on_accepted(&mut self, connection: Connection) -> LoopEvent {
        let conn = connection.id();
        let peer_port = connection.peer_port();
        if self.state != OrchestratorState::Handshaking {
            tracing::warn!(%conn, peer_port, "Connection after all workers bound, closing");
            return LoopEvent::Refused { conn };
        }
        self.connections.insert(conn, connection);
        self.pending.insert(conn);
        LoopEvent::Accepted { conn, peer_port }
    }

    fn on_handshake(&mut self, conn: ConnId, event: ConnEvent) -> LoopEvent {
        let bound = self
            .listener
            .complete_handshake(event.into())
            .and_then(|hs| self.admit(conn, hs.pid));

        match bound {
            Ok(index) => {
                let pid = self.registry.slot(index).map_or(0, |s| s.pid());
                tracing::info!(
                    slot = index,
                    pid,
                    %conn,
                    bound = self.registry.bound_count(),
                    expected = self.registry.capacity(),
                    "Worker bound"
                );
                LoopEvent::Bound { index, pid, conn }
            }
            Err(error) => {
                match &error {
                    HandshakeError::Disconnected => {
                        tracing::info!(%conn, "Connection closed before handshake")
                    }
                    _ => tracing::warn!(%conn, %error, "Handshake rejected"),
                }
                self.connections.remove(&conn);
                LoopEvent::HandshakeRejected { conn, error }
            }
        }
    }

    /// Map a declared pid onto the slot of the spawned, still unbound worker.
    fn admit(&mut self, conn: ConnId, pid: u32) -> Result<usize, HandshakeError> {
        let index = self
            .handles
            .iter()
            .find(|h| {
                h.pid() == pid && self.registry.slot(h.index()).is_some_and(|s| !s.is_bound())
            })
            .map(ProcessHandle::index)
            .ok_or(HandshakeError::UnknownWorkerIdentity { pid })?;
        let port = self
            .connections
            .get(&conn)
            .map_or(0, Connection::peer_port);
        self.registry.bind(index, conn, port, pid)?;
        Ok(index)
    }

    fn on_idle_read(&mut self, index: usize, event: ConnEvent) -> LoopEvent {
        let reason = match event {
            ConnEvent::Frame(_) => {
                if !self.settle_owed(index) {
                    tracing::warn!(slot = index, "Frame outside of a tick, dropping");
                }
                return LoopEvent::StrayFrame { index };
            }
            ConnEvent::Closed => SlotFailure::Disconnected,
            ConnEvent::Malformed(e) => SlotFailure::Malformed(e.to_string()),
        };
        self.disconnect(index);
        LoopEvent::WorkerDisconnected { index, reason }
    }

    /// Consume events queued since the last tick. Returns slots that closed.
    fn drain_stale(&mut self) -> Vec<usize> {
        let watched = self.registry.descriptors_snapshot();
        let mut closed = Vec::new();
        while let Some((conn, event)) = self.mux.try_next(&watched) {
            let Some(index) = self.registry.index_of(conn) else {
                continue;
            };
            match event {
                ConnEvent::Frame(_) => {
                    if !self.settle_owed(index) {
                        tracing::warn!(slot = index, "Dropping unexpected frame between ticks");
                    }
                }
                ConnEvent::Closed | ConnEvent::Malformed(_) => {
                    self.disconnect(index);
                    closed.push(index);
                }
            }
        }
        closed
    }

    /// Consume a frame as the late reply to a timed-out tick, if one is due.
    fn settle_owed(&mut self, index: usize) -> bool {
        match self.owed.get_mut(index) {
            Some(owed) if *owed > 0 => {
                *owed -= 1;
                tracing::debug!(slot = index, still_owed = *owed, "Discarding late reply");
                true
            }
            _ => false,
        }
    }

    fn disconnect(&mut self, index: usize) {
        if let Some(owed) = self.owed.get_mut(index) {
            *owed = 0;
        }
        if let Some(conn) = self.registry.unbind(index) {
            self.connections.remove(&conn);
            let pid = self.registry.slot(index).map_or(0, |s| s.pid());
            tracing::warn!(slot = index, pid, %conn, "Worker disconnected");
        }
    }
}
