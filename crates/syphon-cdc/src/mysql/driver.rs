//! mysql_async-backed collaborators
//!
//! Concrete [`DumpConnection`], [`SnapshotTransaction`] and
//! [`SchemaInspector`] implementations for MySQL/MariaDB servers. The core
//! never depends on these; hosts that talk to a real server wire them into
//! the [`ExtractorContext`](crate::mysql::ExtractorContext).

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Pool, Row, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::common::{BinlogCoordinates, ExtractError, Result};
use crate::mysql::inspector::{ColumnDef, SchemaInspector, TableColumns};
use crate::mysql::snapshot::{escape_name, DumpConnection, RowChunk, SnapshotTransaction};
use crate::mysql::ResolvedTable;

/// Schemas never offered for replication.
const SYSTEM_SCHEMAS: [&str; 3] = ["information_schema", "performance_schema", "sys"];

fn conn_err(context: &str, e: mysql_async::Error) -> ExtractError {
    ExtractError::database(format!("{context}: {e}"))
}

async fn master_status(conn: &mut mysql_async::Conn) -> Result<BinlogCoordinates> {
    let row: Option<Row> = conn
        .query_first("SHOW MASTER STATUS")
        .await
        .map_err(|e| conn_err("SHOW MASTER STATUS", e))?;
    let row = row.ok_or_else(|| {
        ExtractError::database("SHOW MASTER STATUS returned nothing; is binlog enabled?")
    })?;

    let log_file: String = row.get(0).unwrap_or_default();
    let log_pos: u64 = row.get(1).unwrap_or(4);
    let gtid_set: String = row.get(4).unwrap_or_default();
    Ok(BinlogCoordinates {
        // The executed set is reported with embedded newlines.
        gtid_set: gtid_set.replace(['\n', ' '], ""),
        log_file,
        log_pos: log_pos as u32,
    })
}

/// Render one column value for a dump chunk.
fn render_value(row: &Row, idx: usize) -> Option<String> {
    match row.get_opt::<Value, _>(idx) {
        Some(Ok(Value::NULL)) | None => None,
        Some(Ok(Value::Int(n))) => Some(n.to_string()),
        Some(Ok(Value::UInt(n))) => Some(n.to_string()),
        Some(Ok(Value::Float(n))) => Some(n.to_string()),
        Some(Ok(Value::Double(n))) => Some(n.to_string()),
        Some(Ok(Value::Bytes(bytes))) => match String::from_utf8(bytes.clone()) {
            Ok(s) => Some(s),
            Err(_) => Some(hex::encode(bytes)),
        },
        Some(Ok(Value::Date(year, month, day, hour, min, sec, micro))) => Some(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}.{micro:06}"
        )),
        Some(Ok(Value::Time(neg, days, hours, mins, secs, micro))) => {
            let sign = if neg { "-" } else { "" };
            let total_hours = days * 24 + hours as u32;
            Some(format!("{sign}{total_hours:02}:{mins:02}:{secs:02}.{micro:06}"))
        }
        Some(Err(_)) => None,
    }
}

// ============================================================================
// Dump connection
// ============================================================================

/// Dump-side connection pool.
pub struct MySqlDumpConnection {
    pool: Pool,
}

impl MySqlDumpConnection {
    /// Connect and verify the server answers.
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let pool = Pool::new(conn_str);
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| conn_err("MySQL connection failed", e))?;
        let _: Option<Row> = conn
            .query_first("SELECT 1")
            .await
            .map_err(|e| conn_err("MySQL query failed", e))?;
        info!("dump connection established");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DumpConnection for MySqlDumpConnection {
    async fn master_coordinates(&self) -> Result<BinlogCoordinates> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        master_status(&mut conn).await
    }

    async fn begin_snapshot_transaction(&self) -> Result<Box<dyn SnapshotTransaction>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(|e| conn_err("set isolation level", e))?;
        conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT")
            .await
            .map_err(|e| conn_err("start consistent snapshot", e))?;
        debug!("consistent-snapshot transaction opened");
        Ok(Box::new(MySqlSnapshotTransaction {
            conn: Mutex::new(conn),
        }))
    }

    async fn charset_system_variables(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        conn.query(
            "SHOW VARIABLES WHERE Variable_name IN ('character_set_server','collation_server')",
        )
        .await
        .map_err(|e| conn_err("read charset variables", e))
    }

    async fn sql_mode(&self) -> Result<String> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        let mode: Option<String> = conn
            .query_first("SELECT @@global.sql_mode")
            .await
            .map_err(|e| conn_err("read sql_mode", e))?;
        Ok(mode.unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| conn_err("disconnect", e))
    }
}

/// A live consistent-snapshot transaction on a dedicated connection.
pub struct MySqlSnapshotTransaction {
    conn: Mutex<mysql_async::Conn>,
}

#[async_trait]
impl SnapshotTransaction for MySqlSnapshotTransaction {
    async fn master_coordinates(&self) -> Result<BinlogCoordinates> {
        let mut conn = self.conn.lock().await;
        master_status(&mut conn).await
    }

    async fn show_create_table(
        &self,
        schema: &str,
        table: &str,
        drop_if_exists: bool,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_first(format!(
                "SHOW CREATE TABLE {}.{}",
                escape_name(schema),
                escape_name(table)
            ))
            .await
            .map_err(|e| conn_err("SHOW CREATE TABLE", e))?;
        let (_, create) = row.ok_or_else(|| {
            ExtractError::schema(format!("no CREATE TABLE for {schema}.{table}"))
        })?;

        let mut statements = vec![format!("USE {}", escape_name(schema))];
        if drop_if_exists {
            statements.push(format!("DROP TABLE IF EXISTS {}", escape_name(table)));
        }
        statements.push(create);
        Ok(statements)
    }

    async fn read_chunk(
        &self,
        table: &ResolvedTable,
        last_key: Option<String>,
        chunk_size: usize,
    ) -> Result<RowChunk> {
        let key_column = table
            .columns
            .key_column()
            .ok_or_else(|| ExtractError::schema(format!("{} has no columns", table.name)))?;
        let key_idx = table.columns.ordinal_of(key_column).unwrap_or(0);

        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = if let Some(last) = last_key {
            let query = format!(
                "SELECT * FROM {}.{} WHERE ({}) AND {} > ? ORDER BY {} LIMIT {}",
                escape_name(&table.schema),
                escape_name(&table.name),
                table.where_filter,
                escape_name(key_column),
                escape_name(key_column),
                chunk_size
            );
            conn.exec(query, (last,)).await
        } else {
            let query = format!(
                "SELECT * FROM {}.{} WHERE ({}) ORDER BY {} LIMIT {}",
                escape_name(&table.schema),
                escape_name(&table.name),
                table.where_filter,
                escape_name(key_column),
                chunk_size
            );
            conn.query(query).await
        }
        .map_err(|e| conn_err("fetch chunk", e))?;

        let done = rows.len() < chunk_size;
        let last_key = rows.last().and_then(|row| render_value(row, key_idx));
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| render_value(row, i)).collect())
            .collect();
        Ok(RowChunk {
            rows,
            last_key,
            done,
        })
    }

    async fn rollback(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.query_drop("ROLLBACK")
            .await
            .map_err(|e| conn_err("rollback", e))
    }

    async fn commit(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.query_drop("COMMIT")
            .await
            .map_err(|e| conn_err("commit", e))
    }
}

// ============================================================================
// Inspector
// ============================================================================

/// INFORMATION_SCHEMA-backed introspection.
pub struct MySqlInspector {
    pool: Pool,
}

impl MySqlInspector {
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let pool = Pool::new(conn_str);
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| conn_err("inspector connection failed", e))?;
        let _: Option<Row> = conn
            .query_first("SELECT 1")
            .await
            .map_err(|e| conn_err("inspector query failed", e))?;
        info!("inspector connected");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SchemaInspector for MySqlInspector {
    async fn list_schemas(&self) -> Result<Vec<String>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        let schemas: Vec<String> = conn
            .query("SHOW DATABASES")
            .await
            .map_err(|e| conn_err("SHOW DATABASES", e))?;
        Ok(schemas
            .into_iter()
            .filter(|s| !SYSTEM_SCHEMAS.contains(&s.as_str()))
            .collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        conn.exec(
            r"SELECT TABLE_NAME
              FROM INFORMATION_SCHEMA.TABLES
              WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
              ORDER BY TABLE_NAME",
            (schema,),
        )
        .await
        .map_err(|e| conn_err("list tables", e))
    }

    async fn table_columns(&self, schema: &str, table: &str) -> Result<TableColumns> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        let rows: Vec<(String, String, String)> = conn
            .exec(
                r"SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY
                  FROM INFORMATION_SCHEMA.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| conn_err("read columns", e))?;
        if rows.is_empty() {
            return Err(ExtractError::schema(format!(
                "no obtainable column layout for {schema}.{table}"
            )));
        }
        Ok(TableColumns {
            columns: rows
                .into_iter()
                .map(|(name, data_type, key)| ColumnDef {
                    name,
                    data_type,
                    key: key == "PRI",
                })
                .collect(),
        })
    }

    async fn count_rows(&self, schema: &str, table: &str, where_filter: &str) -> Result<i64> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| conn_err("get connection", e))?;
        let count: Option<i64> = conn
            .query_first(format!(
                "SELECT COUNT(*) FROM {}.{} WHERE ({})",
                escape_name(schema),
                escape_name(table),
                where_filter
            ))
            .await
            .map_err(|e| conn_err("count rows", e))?;
        Ok(count.unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| conn_err("disconnect", e))
    }
}
