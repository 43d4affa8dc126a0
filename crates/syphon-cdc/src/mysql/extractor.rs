//! Extraction coordinator
//!
//! Owns the run's phase sequencing:
//!
//! ```text
//! Init -> ResolveBusAddress -> RestorePosition -> DecidePlan
//!      -> {Snapshot | SkipSnapshot} -> AwaitStreamHandoff -> Streaming
//!      -> {Restarting | Dead}
//! ```
//!
//! The snapshot and streaming phases are stitched together by the
//! `coordinates_ready` and `snapshot_done` gates so live delivery attaches
//! at exactly the coordinate the copy is bound to. The coordinator is the
//! sole writer of the run's one-shot exit result and owns the single
//! idempotent teardown routine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::common::{
    build_statistics, encode, traffic_exceeded, BinlogCoordinates, BinlogEntry, BusConnector,
    Correlation, Counters, DumpComplete, ExitResult, ExtractError, ExtractorConfig,
    FilePosition, Gate, GtidSet, JobStore, MessageBus, Publisher, Result, Shutdown, TaskState,
    TaskStatistics,
};
use crate::mysql::{
    resolve_sources, DumpConnection, MemoryPressureGuard, MemoryProbe, ReplicationSource,
    ReplicationStream, ResolvedSource, SchemaInspector, SnapshotEngine, StreamAggregator,
};

/// What the run will do, decided once against the restored position and the
/// configuration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractPlan {
    /// Consistent snapshot first, then streaming from the snapshot's bound
    /// coordinate
    FullCopy,
    /// Streaming only, from `start`
    Incremental { start: BinlogCoordinates },
}

/// Position restored from the coordination store, merged with configuration.
#[derive(Debug, Clone, Default)]
struct PriorPosition {
    gtid: String,
    file_pos: FilePosition,
}

/// Everything the coordinator needs from its host.
pub struct ExtractorContext {
    pub subject: String,
    pub config: ExtractorConfig,
    pub store: Arc<dyn JobStore>,
    pub bus_connector: Arc<dyn BusConnector>,
    pub dump_connection: Arc<dyn DumpConnection>,
    pub inspector: Arc<dyn SchemaInspector>,
    pub replication: Arc<dyn ReplicationSource>,
    /// Addresses this process answers on, for the co-location memory guard
    pub local_addrs: Vec<String>,
    pub memory_probe: Arc<dyn MemoryProbe>,
}

/// The extraction coordinator. Cheap to clone; clones share one run.
#[derive(Clone)]
pub struct Extractor {
    inner: Arc<Inner>,
}

struct Inner {
    subject: String,
    cfg: ExtractorConfig,
    store: Arc<dyn JobStore>,
    bus_connector: Arc<dyn BusConnector>,
    dump_conn: Arc<dyn DumpConnection>,
    inspector: Arc<dyn SchemaInspector>,
    replication: Arc<dyn ReplicationSource>,
    local_addrs: Vec<String>,
    memory_probe: Arc<dyn MemoryProbe>,

    counters: Arc<Counters>,
    shutdown: Shutdown,
    coordinates_ready: Arc<Gate>,
    snapshot_done: Arc<Gate>,

    bus: parking_lot::RwLock<Option<Arc<dyn MessageBus>>>,
    stream: parking_lot::RwLock<Option<Arc<dyn ReplicationStream>>>,
    queue_tx: parking_lot::RwLock<Option<mpsc::Sender<BinlogEntry>>>,
    start_coordinates: Arc<parking_lot::Mutex<Option<BinlogCoordinates>>>,
    sources: Arc<parking_lot::RwLock<Vec<ResolvedSource>>>,
    restart_gtid: parking_lot::Mutex<Option<String>>,

    exit_tx: mpsc::Sender<ExitResult>,
    exit_rx: parking_lot::Mutex<Option<mpsc::Receiver<ExitResult>>>,
    exit_sent: AtomicBool,
    teardown_started: parking_lot::Mutex<bool>,
}

impl Extractor {
    pub fn new(ctx: ExtractorContext) -> Result<Self> {
        ctx.config.validate()?;
        info!(subject = %ctx.subject, "new extractor");

        let (exit_tx, exit_rx) = mpsc::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                subject: ctx.subject,
                cfg: ctx.config,
                store: ctx.store,
                bus_connector: ctx.bus_connector,
                dump_conn: ctx.dump_connection,
                inspector: ctx.inspector,
                replication: ctx.replication,
                local_addrs: ctx.local_addrs,
                memory_probe: ctx.memory_probe,
                counters: Counters::new(),
                shutdown: Shutdown::new(),
                coordinates_ready: Gate::new(),
                snapshot_done: Gate::new(),
                bus: parking_lot::RwLock::new(None),
                stream: parking_lot::RwLock::new(None),
                queue_tx: parking_lot::RwLock::new(None),
                start_coordinates: Arc::new(parking_lot::Mutex::new(None)),
                sources: Arc::new(parking_lot::RwLock::new(Vec::new())),
                restart_gtid: parking_lot::Mutex::new(None),
                exit_tx,
                exit_rx: parking_lot::Mutex::new(Some(exit_rx)),
                exit_sent: AtomicBool::new(false),
                teardown_started: parking_lot::Mutex::new(false),
            }),
        })
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.inner.counters
    }

    /// Replacement replication set delivered with a restart/error control
    /// message, for the host to relaunch from.
    pub fn restart_gtid(&self) -> Option<String> {
        self.inner.restart_gtid.lock().clone()
    }

    /// Execute the complete extract logic. Errors are routed through the
    /// one-shot exit path; the host observes them via [`Extractor::wait`].
    pub async fn run(&self) {
        if let Err(e) = self.run_inner().await {
            match e {
                ExtractError::Shutdown => debug!("run aborted by shutdown"),
                e => self.fail(TaskState::Dead, e),
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let inner = &self.inner;

        // ResolveBusAddress
        let addr = inner
            .store
            .watch_bus_addr(&inner.subject, &inner.shutdown)
            .await?;
        info!(addr = %addr, "resolved bus address");
        let bus = inner.bus_connector.connect(&addr).await?;
        *inner.bus.write() = Some(bus.clone());
        let publisher = Publisher::new(
            bus.clone(),
            Duration::from_secs(inner.cfg.connect_timeout_secs),
            inner.shutdown.clone(),
        );

        // RestorePosition / DecidePlan
        let prior = self.restore_position().await?;
        let plan = self.decide_plan(&prior).await?;
        debug!(full_copy = matches!(plan, ExtractPlan::FullCopy), "plan decided");

        let ready_rx = if inner.cfg.skip_incremental_copy {
            None
        } else {
            Some(self.spawn_streaming_setup(bus.clone()))
        };

        match plan {
            ExtractPlan::FullCopy => {
                inner.counters.mark_row_copy_start();
                let engine = SnapshotEngine::new(
                    inner.subject.clone(),
                    inner.cfg.clone(),
                    inner.dump_conn.clone(),
                    inner.inspector.clone(),
                    publisher.clone(),
                    inner.counters.clone(),
                    inner.coordinates_ready.clone(),
                    inner.start_coordinates.clone(),
                    inner.sources.clone(),
                );
                let coordinates = engine.dump().await?;
                let marker = DumpComplete {
                    gtid_set: coordinates.gtid_set.clone(),
                    log_file: coordinates.log_file.clone(),
                    log_pos: coordinates.log_pos,
                };
                let correlation = Correlation::caused_by(format!("{}_full", inner.subject));
                publisher
                    .publish(
                        &format!("{}_full_complete", inner.subject),
                        encode(&marker)?,
                        Some(&correlation),
                    )
                    .await?;
                info!(coordinates = %coordinates, "snapshot transmitted");
            }
            ExtractPlan::Incremental { start } => {
                // Table meta resolved outside a bound transaction: an
                // incremental-only run has no snapshot to anchor it to.
                let resolved = resolve_sources(
                    &inner.cfg.replicate_do_db,
                    &inner.cfg.replicate_ignore_db,
                    inner.inspector.as_ref(),
                )
                .await?;
                *inner.sources.write() = resolved;
                *inner.start_coordinates.lock() = Some(start);
                inner.coordinates_ready.open();
            }
        }

        if !inner.cfg.binlog_relay {
            inner.snapshot_done.open();
        }

        let Some(ready_rx) = ready_rx else {
            info!("skipping incremental copy");
            return Ok(());
        };

        // AwaitStreamHandoff
        match inner.shutdown.guard(ready_rx).await? {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ExtractError::other("streaming setup task dropped")),
        }
        self.initiate_streaming(publisher, bus).await
    }

    async fn restore_position(&self) -> Result<PriorPosition> {
        let inner = &self.inner;
        let stored_gtid = inner.store.load_gtid(&inner.subject).await?;
        let stored_pos = inner.store.load_file_pos(&inner.subject).await?;

        let gtid = if stored_gtid.is_empty() {
            inner.cfg.gtid.clone()
        } else {
            info!("resuming from stored replication set");
            stored_gtid
        };
        let file_pos = if stored_pos.is_empty() {
            FilePosition {
                file: inner.cfg.binlog_file.clone(),
                pos: inner.cfg.binlog_pos,
            }
        } else {
            stored_pos
        };
        Ok(PriorPosition { gtid, file_pos })
    }

    /// The snapshot-necessity decision table, evaluated once.
    async fn decide_plan(&self, prior: &PriorPosition) -> Result<ExtractPlan> {
        let inner = &self.inner;
        if prior.gtid.is_empty() {
            if inner.cfg.auto_gtid {
                let coordinates = inner.dump_conn.master_coordinates().await?;
                debug!(gtid = %coordinates.gtid_set, "using auto-detected coordinates");
                return Ok(ExtractPlan::Incremental { start: coordinates });
            }
            if !inner.cfg.gtid_start.is_empty() {
                let coordinates = inner.dump_conn.master_coordinates().await?;
                let executed = GtidSet::parse(&coordinates.gtid_set)?;
                let from = GtidSet::parse(&inner.cfg.gtid_start)?;
                let start = BinlogCoordinates {
                    gtid_set: executed.subtract(&from).to_string(),
                    log_file: if prior.file_pos.is_empty() {
                        coordinates.log_file
                    } else {
                        prior.file_pos.file.clone()
                    },
                    log_pos: if prior.file_pos.is_empty() {
                        coordinates.log_pos
                    } else {
                        prior.file_pos.pos
                    },
                };
                return Ok(ExtractPlan::Incremental { start });
            }
            if !prior.file_pos.is_empty() {
                return Ok(ExtractPlan::Incremental {
                    start: BinlogCoordinates {
                        gtid_set: String::new(),
                        log_file: prior.file_pos.file.clone(),
                        log_pos: prior.file_pos.pos,
                    },
                });
            }
            return Ok(ExtractPlan::FullCopy);
        }

        if inner.cfg.binlog_relay && prior.file_pos.is_empty() {
            return Err(ExtractError::config(
                "incremental job has binlog relay enabled but no binlog file/offset is provided",
            ));
        }
        // Parsing validates the stored set before the stream is attached.
        let set = GtidSet::parse(&prior.gtid)?;
        Ok(ExtractPlan::Incremental {
            start: BinlogCoordinates {
                gtid_set: set.to_string(),
                log_file: prior.file_pos.file.clone(),
                log_pos: prior.file_pos.pos,
            },
        })
    }

    /// Waits on the handoff gates, then attaches the replication source.
    fn spawn_streaming_setup(&self, bus: Arc<dyn MessageBus>) -> oneshot::Receiver<Result<()>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let inner = &this.inner;
            if inner
                .shutdown
                .guard(inner.coordinates_ready.wait())
                .await
                .is_err()
            {
                return;
            }
            if !inner.cfg.binlog_relay {
                // Live delivery must not start before the full copy is
                // acknowledged as sent. Relay mode tracks positions
                // externally and skips this wait.
                if inner.shutdown.guard(inner.snapshot_done.wait()).await.is_err() {
                    return;
                }
            }

            let start = inner.start_coordinates.lock().clone().unwrap_or_default();
            let sources = inner.sources.read().clone();
            info!(start = %start, "attaching replication stream");
            match inner.replication.attach(start, sources).await {
                Ok(stream) => {
                    *inner.stream.write() = Some(stream.clone());
                    this.spawn_progress_listener(bus, stream);
                    let _ = ready_tx.send(Ok(()));
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });
        ready_rx
    }

    /// Position-sync request/reply: acknowledge, then re-synchronize the
    /// reader to the applier's rotated file.
    fn spawn_progress_listener(&self, bus: Arc<dyn MessageBus>, stream: Arc<dyn ReplicationStream>) {
        let this = self.clone();
        tokio::spawn(async move {
            let subject = format!("{}_progress", this.inner.subject);
            let mut sub = match bus.subscribe(&subject).await {
                Ok(sub) => sub,
                Err(e) => {
                    this.fail(TaskState::Dead, e);
                    return;
                }
            };
            loop {
                let received = tokio::select! {
                    _ = this.inner.shutdown.wait() => return,
                    received = sub.recv() => received,
                };
                let Some(mut msg) = received else { return };
                let file = String::from_utf8_lossy(&msg.payload).to_string();
                debug!(file = %file, "applier progress");
                msg.respond(Bytes::new());
                stream.resync_from(&file);
            }
        });
    }

    /// Launch the drain/aggregation pipeline and the control listeners.
    async fn initiate_streaming(
        &self,
        publisher: Publisher,
        bus: Arc<dyn MessageBus>,
    ) -> Result<()> {
        info!("beginning streaming");
        let inner = &self.inner;
        let stream = inner
            .stream
            .read()
            .clone()
            .ok_or_else(|| ExtractError::other("replication stream not attached"))?;

        let (tx, rx) = mpsc::channel(inner.cfg.repl_chan_buffer_size);
        *inner.queue_tx.write() = Some(tx.clone());

        // Producer: the replication source pumps into the bounded queue and
        // blocks when it fills.
        {
            let this = self.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                if let Err(e) = stream.drive(tx).await {
                    if !this.inner.shutdown.is_triggered() {
                        this.fail(TaskState::Dead, e);
                    }
                }
                debug!("replication drive task exited");
            });
        }

        // Consumer: batch and publish.
        {
            let guard = MemoryPressureGuard::new(
                bus.server_addr(),
                &inner.local_addrs,
                inner.memory_probe.clone(),
            );
            let aggregator = StreamAggregator::new(
                inner.subject.clone(),
                publisher,
                inner.counters.clone(),
                inner.cfg.group_max_size,
                Duration::from_millis(inner.cfg.group_timeout_ms),
                inner.cfg.repl_chan_buffer_size,
                Some(guard),
            );
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = aggregator.run(rx).await {
                    this.fail(TaskState::Dead, e);
                }
            });
        }

        self.spawn_control_listener(bus.clone(), "restart", TaskState::Restart);
        self.spawn_control_listener(bus, "error", TaskState::Dead);
        self.spawn_coordinate_persistence();
        Ok(())
    }

    /// Restart/error control messages carry a replacement replication set
    /// and drive a one-shot state transition.
    fn spawn_control_listener(
        &self,
        bus: Arc<dyn MessageBus>,
        suffix: &'static str,
        state: TaskState,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let subject = format!("{}_{suffix}", this.inner.subject);
            let mut sub = match bus.subscribe(&subject).await {
                Ok(sub) => sub,
                Err(e) => {
                    this.fail(state, e);
                    return;
                }
            };
            loop {
                let received = tokio::select! {
                    _ = this.inner.shutdown.wait() => return,
                    received = sub.recv() => received,
                };
                let Some(msg) = received else { return };
                let gtid = String::from_utf8_lossy(&msg.payload).to_string();
                if !gtid.is_empty() {
                    *this.inner.restart_gtid.lock() = Some(gtid);
                }
                let reason = match state {
                    TaskState::Restart => "restart requested",
                    TaskState::Dead => "applier error",
                };
                this.fail(state, ExtractError::replication(reason));
            }
        });
    }

    /// Persist the live coordinate so a restarted run resumes without a
    /// re-scan.
    fn spawn_coordinate_persistence(&self) {
        let this = self.clone();
        let interval =
            Duration::from_secs(self.inner.cfg.coordinate_save_interval_secs.max(1));
        tokio::spawn(async move {
            let inner = &this.inner;
            loop {
                if inner
                    .shutdown
                    .guard(tokio::time::sleep(interval))
                    .await
                    .is_err()
                {
                    return;
                }
                let snapshot = inner
                    .stream
                    .read()
                    .as_ref()
                    .map(|s| (s.current_coordinates(), s.executed_gtid_set()));
                let Some((coordinates, gtid)) = snapshot else {
                    continue;
                };
                if coordinates.log_file.is_empty() {
                    continue;
                }
                if let Err(e) = inner
                    .store
                    .save_file_pos(&inner.subject, &coordinates.log_file, coordinates.log_pos)
                    .await
                {
                    warn!(error = %e, "failed to persist file position");
                }
                if gtid.is_empty() {
                    continue;
                }
                if let Err(e) = inner.store.save_gtid(&inner.subject, &gtid).await {
                    warn!(error = %e, "failed to persist replication set");
                }
            }
        });
    }

    /// Pollable statistics. Crossing the traffic ceiling is fatal and forces
    /// shutdown through the one-shot error path.
    pub fn stats(&self) -> TaskStatistics {
        let inner = &self.inner;
        let (pending, capacity) = match &*inner.queue_tx.read() {
            Some(tx) => (tx.max_capacity() - tx.capacity(), tx.max_capacity()),
            None => (0, inner.cfg.repl_chan_buffer_size),
        };
        let bytes_out = inner.bus.read().as_ref().map(|b| b.out_bytes()).unwrap_or(0);
        let current = inner
            .stream
            .read()
            .as_ref()
            .map(|s| s.current_coordinates().as_current())
            .unwrap_or_default();

        let stats = build_statistics(&inner.counters, pending, capacity, bytes_out, current);

        if traffic_exceeded(bytes_out, inner.cfg.traffic_limit_gb) {
            self.fail(
                TaskState::Dead,
                ExtractError::TrafficLimit(format!(
                    "{bytes_out} bytes transmitted, ceiling {} GB",
                    inner.cfg.traffic_limit_gb
                )),
            );
        }
        stats
    }

    /// Consume the one-shot exit result. Valid exactly once per run.
    pub async fn wait(&self) -> Result<ExitResult> {
        let rx = self.inner.exit_rx.lock().take();
        match rx {
            Some(mut rx) => rx
                .recv()
                .await
                .ok_or_else(|| ExtractError::other("exit channel closed")),
            None => Err(ExtractError::other("exit result already consumed")),
        }
    }

    /// Route a fatal condition into the one-shot exit path. Events arriving
    /// after shutdown has begun are dropped, not double-reported.
    fn fail(&self, state: TaskState, err: ExtractError) {
        error!(error = %err, ?state, "extractor error");
        let inner = &self.inner;
        if inner.shutdown.is_triggered() {
            return;
        }
        if !inner.exit_sent.swap(true, Ordering::SeqCst) {
            let result = match state {
                TaskState::Dead => ExitResult::dead(err),
                TaskState::Restart => ExitResult::restart(err),
            };
            let _ = inner.exit_tx.try_send(result);
        }
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.shutdown().await;
        });
    }

    /// Tear the run down. Guarded against concurrent and duplicate
    /// invocation: resources close exactly once.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut started = inner.teardown_started.lock();
            if *started {
                return Ok(());
            }
            *started = true;
        }
        debug!("extractor shutdown");
        inner.shutdown.trigger();

        let bus = inner.bus.write().take();
        if let Some(bus) = bus {
            if let Err(e) = bus.close().await {
                warn!(error = %e, "error closing bus");
            }
        }
        let stream = inner.stream.write().take();
        if let Some(stream) = stream {
            if let Err(e) = stream.close().await {
                warn!(error = %e, "error closing replication stream");
            }
        }
        if let Err(e) = inner.dump_conn.close().await {
            warn!(error = %e, "error closing dump connection");
        }
        if let Err(e) = inner.inspector.close().await {
            warn!(error = %e, "error closing inspector");
        }

        info!("shutting down");
        Ok(())
    }
}
