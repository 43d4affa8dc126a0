//! End-to-end extractor scenarios against in-process collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use syphon_cdc::common::{
    decode, BinlogCoordinates, BinlogEntries, BinlogEntry, DumpComplete, DumpEntry,
    ExtractorConfig, InMemoryBus, InMemoryBusConnector, JobStore, MemoryJobStore, Result,
    RowChange, RowOp, SchemaSelector, TaskState, TransactionCoordinates,
};
use syphon_cdc::mysql::{
    ColumnDef, DumpConnection, Extractor, ExtractorContext, MemoryProbe, ReplicationSource,
    ReplicationStream, ResolvedSource, ResolvedTable, RowChunk, SchemaInspector,
    SnapshotTransaction, TableColumns,
};
use syphon_cdc::ExtractError;

const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
const BUS_ADDR: &str = "10.0.0.1:4222";

// ============================================================================
// Collaborator doubles
// ============================================================================

struct StubDumpConnection {
    coordinates: BinlogCoordinates,
    rows: Vec<Vec<Option<String>>>,
    closes: AtomicUsize,
}

impl StubDumpConnection {
    fn new(gtid: &str, rows: Vec<Vec<Option<String>>>) -> Arc<Self> {
        Arc::new(Self {
            coordinates: BinlogCoordinates {
                gtid_set: gtid.to_string(),
                log_file: "mysql-bin.000011".to_string(),
                log_pos: 2000,
            },
            rows,
            closes: AtomicUsize::new(0),
        })
    }
}

struct StubTransaction {
    coordinates: BinlogCoordinates,
    rows: Vec<Vec<Option<String>>>,
}

#[async_trait]
impl DumpConnection for StubDumpConnection {
    async fn master_coordinates(&self) -> Result<BinlogCoordinates> {
        Ok(self.coordinates.clone())
    }

    async fn begin_snapshot_transaction(&self) -> Result<Box<dyn SnapshotTransaction>> {
        Ok(Box::new(StubTransaction {
            coordinates: self.coordinates.clone(),
            rows: self.rows.clone(),
        }))
    }

    async fn charset_system_variables(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("character_set_server".into(), "utf8mb4".into())])
    }

    async fn sql_mode(&self) -> Result<String> {
        Ok("STRICT_TRANS_TABLES".into())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SnapshotTransaction for StubTransaction {
    async fn master_coordinates(&self) -> Result<BinlogCoordinates> {
        Ok(self.coordinates.clone())
    }

    async fn show_create_table(&self, _: &str, table: &str, _: bool) -> Result<Vec<String>> {
        Ok(vec![format!("CREATE TABLE `{table}` (id bigint)")])
    }

    async fn read_chunk(
        &self,
        _table: &ResolvedTable,
        last_key: Option<String>,
        chunk_size: usize,
    ) -> Result<RowChunk> {
        let offset: usize = last_key.map(|k| k.parse().unwrap()).unwrap_or(0);
        let rows: Vec<_> = self.rows.iter().skip(offset).take(chunk_size).cloned().collect();
        let next = offset + rows.len();
        Ok(RowChunk {
            done: next >= self.rows.len(),
            last_key: Some(next.to_string()),
            rows,
        })
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

struct StubInspector {
    closes: AtomicUsize,
}

impl StubInspector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SchemaInspector for StubInspector {
    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(vec!["shop".into()])
    }

    async fn list_tables(&self, _: &str) -> Result<Vec<String>> {
        Ok(vec!["orders".into()])
    }

    async fn table_columns(&self, _: &str, _: &str) -> Result<TableColumns> {
        Ok(TableColumns {
            columns: vec![ColumnDef {
                name: "id".into(),
                data_type: "bigint".into(),
                key: true,
            }],
        })
    }

    async fn count_rows(&self, _: &str, _: &str, _: &str) -> Result<i64> {
        Ok(2)
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubReplication {
    entries: Vec<BinlogEntry>,
    attachments: parking_lot::Mutex<Vec<BinlogCoordinates>>,
    stream_closes: Arc<AtomicUsize>,
    resyncs: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl StubReplication {
    fn new(entries: Vec<BinlogEntry>) -> Arc<Self> {
        Arc::new(Self {
            entries,
            attachments: parking_lot::Mutex::new(Vec::new()),
            stream_closes: Arc::new(AtomicUsize::new(0)),
            resyncs: Arc::new(parking_lot::Mutex::new(Vec::new())),
        })
    }

    fn attachments(&self) -> Vec<BinlogCoordinates> {
        self.attachments.lock().clone()
    }
}

struct StubStream {
    entries: Vec<BinlogEntry>,
    closes: Arc<AtomicUsize>,
    resyncs: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl ReplicationSource for StubReplication {
    async fn attach(
        &self,
        start: BinlogCoordinates,
        _sources: Vec<ResolvedSource>,
    ) -> Result<Arc<dyn ReplicationStream>> {
        self.attachments.lock().push(start);
        Ok(Arc::new(StubStream {
            entries: self.entries.clone(),
            closes: self.stream_closes.clone(),
            resyncs: self.resyncs.clone(),
        }))
    }
}

#[async_trait]
impl ReplicationStream for StubStream {
    async fn drive(&self, out: mpsc::Sender<BinlogEntry>) -> Result<()> {
        for entry in &self.entries {
            if out.send(entry.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn current_coordinates(&self) -> TransactionCoordinates {
        self.entries
            .last()
            .map(|e| e.coordinates.clone())
            .unwrap_or_default()
    }

    fn executed_gtid_set(&self) -> String {
        format!("{SID}:1-{}", self.entries.len().max(1))
    }

    fn resync_from(&self, file: &str) {
        self.resyncs.lock().push(file.to_string());
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RoomyProbe;

impl MemoryProbe for RoomyProbe {
    fn available_bytes(&self) -> u64 {
        u64::MAX
    }
}

fn change_entry(gno: i64) -> BinlogEntry {
    BinlogEntry {
        coordinates: TransactionCoordinates::new(
            "mysql-bin.000011",
            2000 + gno as u32,
            Uuid::parse_str(SID).unwrap(),
            gno,
        ),
        events: vec![RowChange {
            schema: "shop".into(),
            table: "orders".into(),
            op: RowOp::Insert,
            before: None,
            after: Some(serde_json::json!({"id": gno})),
        }],
        original_size: 64,
    }
}

struct Harness {
    extractor: Extractor,
    bus: Arc<InMemoryBus>,
    dump: Arc<StubDumpConnection>,
    inspector: Arc<StubInspector>,
    replication: Arc<StubReplication>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn harness(config: ExtractorConfig, entries: Vec<BinlogEntry>) -> Harness {
    let store = MemoryJobStore::new();
    store.put_bus_addr("job1", BUS_ADDR).await.unwrap();
    harness_with_store(config, entries, store).await
}

async fn harness_with_store(
    mut config: ExtractorConfig,
    entries: Vec<BinlogEntry>,
    store: Arc<MemoryJobStore>,
) -> Harness {
    init_tracing();
    if config.replicate_do_db.is_empty() {
        config.replicate_do_db = vec![SchemaSelector::named("shop")];
    }
    let bus = InMemoryBus::new(BUS_ADDR);
    let dump = StubDumpConnection::new(
        &format!("{SID}:1-7"),
        vec![vec![Some("1".into())], vec![Some("2".into())]],
    );
    let inspector = StubInspector::new();
    let replication = StubReplication::new(entries);

    let extractor = Extractor::new(ExtractorContext {
        subject: "job1".into(),
        config,
        store,
        bus_connector: Arc::new(InMemoryBusConnector::new(bus.clone())),
        dump_connection: dump.clone(),
        inspector: inspector.clone(),
        replication: replication.clone(),
        local_addrs: vec![],
        memory_probe: Arc::new(RoomyProbe),
    })
    .unwrap();

    Harness {
        extractor,
        bus,
        dump,
        inspector,
        replication,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn auto_detect_runs_incremental_only_and_publishes_no_dump_entry() {
    let config = ExtractorConfig {
        auto_gtid: true,
        group_timeout_ms: 30,
        ..Default::default()
    };
    let h = harness(config, vec![change_entry(8), change_entry(9)]).await;

    h.extractor.run().await;

    // Streaming attached at exactly the coordinate read at plan time.
    let attachments = h.replication.attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].gtid_set, format!("{SID}:1-7"));
    assert_eq!(attachments[0].log_file, "mysql-bin.000011");

    // The change batches flow out in order.
    let bus = h.bus.clone();
    wait_for("incremental batch", || {
        bus.published_count("job1_incr_hete") > 0
    })
    .await;
    let gnos: Vec<i64> = h
        .bus
        .published_bodies("job1_incr_hete")
        .iter()
        .flat_map(|b| decode::<BinlogEntries>(b).unwrap().entries)
        .map(|e| e.coordinates.gno)
        .collect();
    assert_eq!(gnos, vec![8, 9]);

    // Incremental-only: not a single snapshot entry, ever.
    assert_eq!(h.bus.published_count("job1_full"), 0);
    assert_eq!(h.bus.published_count("job1_full_complete"), 0);

    // Position-sync probe: the applier announces a rotated file, the
    // extractor acknowledges and re-synchronizes the reader.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match h
            .bus
            .request_reply("job1_progress", Bytes::from_static(b"mysql-bin.000012"))
            .await
        {
            Ok(_) => break,
            Err(_) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "progress listener never came up"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    assert_eq!(
        h.replication.resyncs.lock().clone(),
        vec!["mysql-bin.000012".to_string()]
    );

    h.extractor.shutdown().await.unwrap();
}

#[tokio::test]
async fn cold_start_runs_full_copy_then_streams_from_snapshot_coordinate() {
    let config = ExtractorConfig {
        chunk_size: 1,
        group_timeout_ms: 30,
        ..Default::default()
    };
    let h = harness(config, vec![change_entry(8)]).await;

    h.extractor.run().await;

    // Exactly one snapshot-complete marker carrying the bound coordinate.
    let markers = h.bus.published_bodies("job1_full_complete");
    assert_eq!(markers.len(), 1);
    let marker: DumpComplete = decode(&markers[0]).unwrap();
    assert_eq!(marker.gtid_set, format!("{SID}:1-7"));
    assert_eq!(marker.log_file, "mysql-bin.000011");
    assert_eq!(marker.log_pos, 2000);

    // Dump entries: sysvar, DDL, then one chunk per row.
    let entries: Vec<DumpEntry> = h
        .bus
        .published_bodies("job1_full")
        .iter()
        .map(|b| decode(b).unwrap())
        .collect();
    assert_eq!(entries.len(), 4);
    assert!(entries[0].sysvar_sql.is_some());
    assert_eq!(entries[1].tb_sql.len(), 1);
    assert!(entries[2].table_def.is_some());
    assert!(entries[3].table_def.is_none());

    // Streaming attached at the snapshot's coordinate, after the copy.
    let attachments = h.replication.attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].gtid_set, format!("{SID}:1-7"));

    let bus = h.bus.clone();
    wait_for("incremental batch", || {
        bus.published_count("job1_incr_hete") > 0
    })
    .await;

    h.extractor.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_start_point_subtracts_from_executed_set() {
    let config = ExtractorConfig {
        gtid_start: format!("{SID}:1-3"),
        ..Default::default()
    };
    let h = harness(config, vec![]).await;

    h.extractor.run().await;

    // Plan time: executed 1-7 minus start point 1-3 is what streaming must
    // skip past; no snapshot is taken.
    let attachments = h.replication.attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].gtid_set, format!("{SID}:4-7"));
    assert_eq!(h.bus.published_count("job1_full"), 0);

    h.extractor.shutdown().await.unwrap();
}

#[tokio::test]
async fn prior_coordinate_with_relay_but_no_file_is_fatal_config_error() {
    let store = MemoryJobStore::new();
    store.put_bus_addr("job1", BUS_ADDR).await.unwrap();
    store.save_gtid("job1", &format!("{SID}:1-5")).await.unwrap();

    let config = ExtractorConfig {
        binlog_relay: true,
        ..Default::default()
    };
    let h = harness_with_store(config, vec![], store).await;

    h.extractor.run().await;
    let exit = h.extractor.wait().await.unwrap();
    assert_eq!(exit.state, TaskState::Dead);
    assert!(matches!(exit.error, Some(ExtractError::Config(_))));

    // No snapshot, no attach: the error was reported before extraction I/O.
    assert_eq!(h.bus.published_count("job1_full"), 0);
    assert!(h.replication.attachments().is_empty());
}

#[tokio::test]
async fn restart_control_message_carries_replacement_set() {
    let config = ExtractorConfig {
        auto_gtid: true,
        group_timeout_ms: 30,
        ..Default::default()
    };
    let h = harness(config, vec![change_entry(8)]).await;

    h.extractor.run().await;

    // The restart listener subscribes during streaming startup; retry the
    // control send until it lands.
    let replacement = format!("{SID}:1-99");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match h
            .bus
            .send("job1_restart", Bytes::from(replacement.clone()))
            .await
        {
            Ok(()) => break,
            Err(_) => {
                assert!(std::time::Instant::now() < deadline, "restart listener never came up");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let exit = h.extractor.wait().await.unwrap();
    assert_eq!(exit.state, TaskState::Restart);
    assert_eq!(h.extractor.restart_gtid(), Some(replacement));
}

#[tokio::test]
async fn concurrent_shutdown_closes_resources_exactly_once() {
    let config = ExtractorConfig {
        auto_gtid: true,
        group_timeout_ms: 30,
        ..Default::default()
    };
    let h = harness(config, vec![change_entry(8)]).await;
    h.extractor.run().await;

    let a = h.extractor.clone();
    let b = h.extractor.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.shutdown().await }),
        tokio::spawn(async move { b.shutdown().await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();
    // A third, later invocation is also a no-op.
    h.extractor.shutdown().await.unwrap();

    assert_eq!(h.dump.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.inspector.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.replication.stream_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn graceful_shutdown_delivers_no_exit_and_later_fatals_are_dropped() {
    let config = ExtractorConfig {
        auto_gtid: true,
        ..Default::default()
    };
    let h = harness(config, vec![]).await;
    h.extractor.run().await;

    h.extractor.shutdown().await.unwrap();

    // stats() after shutdown must not synthesize an exit result.
    let _ = h.extractor.stats();
    let wait = tokio::time::timeout(Duration::from_millis(100), h.extractor.wait()).await;
    assert!(wait.is_err(), "no exit result should be delivered after graceful shutdown");
}

#[tokio::test]
async fn statistics_reflect_copy_progress_and_coordinates() {
    let config = ExtractorConfig {
        chunk_size: 1,
        group_timeout_ms: 30,
        ..Default::default()
    };
    let h = harness(config, vec![change_entry(8)]).await;
    h.extractor.run().await;

    let bus = h.bus.clone();
    wait_for("incremental batch", || {
        bus.published_count("job1_incr_hete") > 0
    })
    .await;

    let stats = h.extractor.stats();
    // 2 data rows + 1 DDL pseudo-row, estimate latched after completion.
    assert_eq!(stats.rows_copied, 3);
    assert_eq!(stats.rows_estimate, 3);
    assert_eq!(stats.progress_pct, "100.0");
    assert_eq!(stats.eta, "0s");
    assert!(stats.bytes_out > 0);
    assert_eq!(stats.current_coordinates.file, "mysql-bin.000011");
    assert_eq!(stats.current_coordinates.gtid, format!("{SID}:8"));

    h.extractor.shutdown().await.unwrap();
}
