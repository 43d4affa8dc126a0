//! Consistent snapshot engine
//!
//! Produces a point-in-time consistent copy bound to an *exact* replication
//! coordinate. A plain `START TRANSACTION` does not reveal which coordinate
//! its read view corresponds to, so the engine brackets the transaction
//! open with two coordinate reads and only accepts the view when both agree:
//!
//! 1. read the server's coordinates (A)
//! 2. open a repeatable-read, consistent-snapshot transaction
//! 3. re-read the coordinates from inside the transaction (B)
//! 4. A == B proves the view is anchored at that coordinate; otherwise roll
//!    back and retry after a fixed delay
//!
//! The loop is unbounded: correctness requires an exact bound, and looping
//! is cheap next to an incorrect snapshot boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::{
    encode, BinlogCoordinates, Correlation, Counters, DumpEntry, ExtractorConfig, Gate,
    Publisher, Result, Stage, RESERVED_SCHEMA,
};
use crate::mysql::{resolve_sources, ResolvedSource, ResolvedTable, SchemaInspector};

/// Delay between consistency rounds when writes race view establishment.
const CONSISTENCY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// One chunk of rows read under the bound transaction.
#[derive(Debug, Clone, Default)]
pub struct RowChunk {
    /// Row values in inspected column order
    pub rows: Vec<Vec<Option<String>>>,
    /// Keyset continuation token for the next chunk
    pub last_key: Option<String>,
    /// No further rows follow
    pub done: bool,
}

/// The dump-side database connection, as the core needs it.
#[async_trait]
pub trait DumpConnection: Send + Sync {
    /// Server coordinates, read outside any transaction.
    async fn master_coordinates(&self) -> Result<BinlogCoordinates>;

    /// Open a repeatable-read transaction with an immediate consistent view.
    async fn begin_snapshot_transaction(&self) -> Result<Box<dyn SnapshotTransaction>>;

    /// Charset-related system variables of the server.
    async fn charset_system_variables(&self) -> Result<Vec<(String, String)>>;

    /// The server's sql_mode.
    async fn sql_mode(&self) -> Result<String>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A live consistent-snapshot transaction.
#[async_trait]
pub trait SnapshotTransaction: Send + Sync {
    /// Server coordinates as seen from inside this transaction.
    async fn master_coordinates(&self) -> Result<BinlogCoordinates>;

    /// Generated DDL for a table, one statement per element.
    async fn show_create_table(
        &self,
        schema: &str,
        table: &str,
        drop_if_exists: bool,
    ) -> Result<Vec<String>>;

    /// Read one bounded chunk of `table`, continuing after `last_key`.
    async fn read_chunk(
        &self,
        table: &ResolvedTable,
        last_key: Option<String>,
        chunk_size: usize,
    ) -> Result<RowChunk>;

    async fn rollback(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;
}

/// Escape a MySQL identifier.
pub fn escape_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Build the `SET var = value, ...` statement replayed on the applier before
/// any DDL. Values containing separators are quoted.
pub fn set_statement_for(variables: &[(String, String)]) -> String {
    let mut out = String::from("SET ");
    for (i, (name, value)) in variables.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(" = ");
        if value.contains(',') || value.contains(';') {
            out.push('\'');
            out.push_str(value);
            out.push('\'');
        } else {
            out.push_str(value);
        }
    }
    out
}

/// Apply schema/table renames to one generated DDL statement.
///
/// Mirrors what the applier expects: the schema name is substituted in `USE`
/// statements, the table name in `DROP TABLE IF EXISTS` and `CREATE TABLE`
/// statements, first occurrence only.
pub fn apply_renames(
    sql: &str,
    schema: &str,
    schema_rename: &str,
    table: &str,
    table_rename: &str,
) -> String {
    let mut out = sql.to_string();
    if !schema_rename.is_empty() && out.contains(&format!("USE {}", escape_name(schema))) {
        out = out.replacen(schema, schema_rename, 1);
    }
    if !table_rename.is_empty()
        && (out.contains(&format!("DROP TABLE IF EXISTS {}", escape_name(table)))
            || out.contains("CREATE TABLE"))
    {
        out = out.replacen(&escape_name(table), &escape_name(table_rename), 1);
    }
    out
}

/// Establishes the bound read view and dumps schema DDL plus row data in
/// ordered chunks.
pub struct SnapshotEngine {
    subject: String,
    cfg: ExtractorConfig,
    conn: Arc<dyn DumpConnection>,
    inspector: Arc<dyn SchemaInspector>,
    publisher: Publisher,
    counters: Arc<Counters>,
    coordinates_ready: Arc<Gate>,
    start_slot: Arc<parking_lot::Mutex<Option<BinlogCoordinates>>>,
    sources_slot: Arc<parking_lot::RwLock<Vec<ResolvedSource>>>,
    retry_delay: Duration,
}

impl SnapshotEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subject: impl Into<String>,
        cfg: ExtractorConfig,
        conn: Arc<dyn DumpConnection>,
        inspector: Arc<dyn SchemaInspector>,
        publisher: Publisher,
        counters: Arc<Counters>,
        coordinates_ready: Arc<Gate>,
        start_slot: Arc<parking_lot::Mutex<Option<BinlogCoordinates>>>,
        sources_slot: Arc<parking_lot::RwLock<Vec<ResolvedSource>>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            cfg,
            conn,
            inspector,
            publisher,
            counters,
            coordinates_ready,
            start_slot,
            sources_slot,
            retry_delay: CONSISTENCY_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The A==B loop. Terminates only on a provable bound.
    async fn acquire_consistent_view(
        &self,
    ) -> Result<(Box<dyn SnapshotTransaction>, BinlogCoordinates)> {
        let shutdown = self.publisher.shutdown();
        let mut round = 0u64;
        loop {
            round += 1;
            let before = self.conn.master_coordinates().await?;
            let txn = self.conn.begin_snapshot_transaction().await?;
            let inside = txn.master_coordinates().await?;
            debug!(round, before = %before, inside = %inside, "consistency round");

            if before.gtid_set == inside.gtid_set {
                info!(rounds = round, coordinates = %inside, "consistent view bound");
                return Ok((txn, inside));
            }

            warn!(round, "writes raced view establishment, retrying");
            txn.rollback().await?;
            shutdown.guard(tokio::time::sleep(self.retry_delay)).await?;
        }
    }

    /// Run the full copy. Returns the starting coordinate the snapshot is
    /// bound to; the `_full_complete` marker is the coordinator's to publish.
    pub async fn dump(&self) -> Result<BinlogCoordinates> {
        let (txn, coordinates) = self.acquire_consistent_view().await?;

        // Resolve tables inside the bound view so the copied set matches the
        // coordinate exactly.
        let sources = resolve_sources(
            &self.cfg.replicate_do_db,
            &self.cfg.replicate_ignore_db,
            self.inspector.as_ref(),
        )
        .await?;

        *self.start_slot.lock() = Some(coordinates.clone());
        *self.sources_slot.write() = sources.clone();
        self.coordinates_ready.open();

        self.send_sysvar_entry().await?;

        let table_count: usize = sources.iter().map(|s| s.tables.len()).sum();
        info!(tables = table_count, "scanning table contents");

        let mut scanned = 0usize;
        for source in &sources {
            if source.tables.is_empty() {
                self.send_schema_entry(source).await?;
                continue;
            }
            for table in &source.tables {
                scanned += 1;
                info!(
                    schema = %table.schema,
                    table = %table.name,
                    n = scanned,
                    of = table_count,
                    "scanning table"
                );
                self.dump_table(txn.as_ref(), source, table).await?;
            }
        }

        txn.commit().await?;
        self.counters.mark_row_copy_complete();
        info!(
            rows = self.counters.rows_copied(),
            tables = table_count,
            "snapshot scan finished"
        );
        Ok(coordinates)
    }

    /// First entry of the dump: session setup the applier replays before DDL.
    async fn send_sysvar_entry(&self) -> Result<()> {
        let variables = self.conn.charset_system_variables().await?;
        let sql_mode = self.conn.sql_mode().await?;
        let entry = DumpEntry {
            sysvar_sql: Some(set_statement_for(&variables)),
            sql_mode: Some(format!("SET @@session.sql_mode = '{sql_mode}'")),
            ..Default::default()
        };
        self.send_entry(&entry).await
    }

    /// Schema-only entry for a source with no tables.
    async fn send_schema_entry(&self, source: &ResolvedSource) -> Result<()> {
        let entry = DumpEntry {
            db_sql: self.create_database_sql(source),
            rows_count: 1,
            total_count: 1,
            ..Default::default()
        };
        self.counters.add_rows_estimate(1);
        self.counters.add_rows_copied(1);
        self.send_entry(&entry).await
    }

    async fn dump_table(
        &self,
        txn: &dyn SnapshotTransaction,
        source: &ResolvedSource,
        table: &ResolvedTable,
    ) -> Result<()> {
        self.counters.set_stage(Stage::SearchingRows);
        let total = self
            .inspector
            .count_rows(&table.schema, &table.name, &table.where_filter)
            .await?;
        self.counters.add_rows_estimate(total);
        debug!(schema = %table.schema, table = %table.name, rows = total, "counted rows");

        // DDL entry first: schema creation (reserved schema excluded), then
        // rename-aware table creation.
        let mut tb_sql = Vec::new();
        if !self.cfg.skip_create_db_table && !table.schema.eq_ignore_ascii_case(RESERVED_SCHEMA) {
            for sql in txn
                .show_create_table(&table.schema, &table.name, self.cfg.drop_table_if_exists)
                .await?
            {
                tb_sql.push(apply_renames(
                    &sql,
                    &table.schema,
                    &source.schema_rename,
                    &table.name,
                    &table.rename,
                ));
            }
        }
        let entry = DumpEntry {
            db_sql: self.create_database_sql(source),
            tb_sql,
            rows_count: 1,
            total_count: (total + 1) as u64,
            ..Default::default()
        };
        self.counters.add_rows_estimate(1);
        self.counters.add_rows_copied(1);
        self.send_entry(&entry).await?;

        // Row data in bounded chunks; the serialized table definition rides
        // on exactly the first chunk.
        let mut last_key = None;
        let mut sent_table_def = false;
        let mut running_total = 0u64;
        loop {
            let chunk = txn
                .read_chunk(table, last_key.take(), self.cfg.chunk_size)
                .await?;
            if chunk.rows.is_empty() {
                break;
            }

            let rows_count = chunk.rows.len() as u64;
            running_total += rows_count;
            let table_def = if sent_table_def {
                None
            } else {
                sent_table_def = true;
                Some(encode(table)?.to_vec())
            };
            let entry = DumpEntry {
                table_def,
                rows: chunk.rows,
                rows_count,
                total_count: running_total,
                ..Default::default()
            };
            self.counters.add_rows_copied(rows_count as i64);
            self.send_entry(&entry).await?;

            if chunk.done {
                break;
            }
            last_key = chunk.last_key;
        }
        Ok(())
    }

    fn create_database_sql(&self, source: &ResolvedSource) -> Option<String> {
        if self.cfg.skip_create_db_table
            || source.schema.eq_ignore_ascii_case(RESERVED_SCHEMA)
        {
            return None;
        }
        Some(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            escape_name(source.target_schema())
        ))
    }

    async fn send_entry(&self, entry: &DumpEntry) -> Result<()> {
        let body = encode(entry)?;
        self.publisher
            .publish(
                &format!("{}_full", self.subject),
                body,
                Some(&Correlation::new()),
            )
            .await?;
        self.counters.set_stage(Stage::SendingData);
        Ok(())
    }
}
