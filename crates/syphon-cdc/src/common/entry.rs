//! Pipeline payloads and their wire codec
//!
//! Everything that crosses the message bus lives here: snapshot
//! [`DumpEntry`]s, the [`DumpComplete`] marker, streamed [`BinlogEntry`]
//! transactions and the [`BinlogEntries`] batches the aggregator assembles.
//! All payloads are created, transmitted once and discarded; none carries a
//! persisted identity.
//!
//! Wire bodies are bincode-encoded and Snappy-compressed.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::{ExtractError, Result, TransactionCoordinates};

/// One unit of snapshot output.
///
/// The first entry of a dump carries the session setup statements; each
/// table's first entry carries its DDL, and its first row chunk carries the
/// serialized table definition exactly once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpEntry {
    /// `SET <charset system variables>` statement, first entry only
    pub sysvar_sql: Option<String>,
    /// `SET @@session.sql_mode = ...` statement, first entry only
    pub sql_mode: Option<String>,
    /// Schema-creation statement (absent for the reserved system schema)
    pub db_sql: Option<String>,
    /// Table-creation statements, rename-aware
    pub tb_sql: Vec<String>,
    /// Serialized table definition, attached to the first chunk of a table
    pub table_def: Option<Vec<u8>>,
    /// Row values for this chunk, one `Vec` per row, column order as inspected
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows carried by this entry
    pub rows_count: u64,
    /// Running total for the owning table
    pub total_count: u64,
}

/// Snapshot-complete marker, published once on the `_full_complete` subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpComplete {
    pub gtid_set: String,
    pub log_file: String,
    pub log_pos: u32,
}

/// One committed source transaction ("change transaction").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEntry {
    /// Exact position of this transaction in the change stream
    pub coordinates: TransactionCoordinates,
    /// Ordered row changes of the transaction
    pub events: Vec<RowChange>,
    /// Serialized size as reported by the replication source
    pub original_size: usize,
}

/// A single row-level change within a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub op: RowOp,
    /// Previous row state (updates and deletes)
    pub before: Option<serde_json::Value>,
    /// New row state (inserts and updates)
    pub after: Option<serde_json::Value>,
}

/// Row operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// A group of transactions assembled for a single publish call; ephemeral.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinlogEntries {
    pub entries: Vec<BinlogEntry>,
}

impl BinlogEntries {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sequence number of the first transaction, for log correlation.
    pub fn first_gno(&self) -> i64 {
        self.entries.first().map(|e| e.coordinates.gno).unwrap_or(0)
    }
}

/// Encode a payload for the wire: bincode, then Snappy.
pub fn encode<T: Serialize>(payload: &T) -> Result<Bytes> {
    let raw = bincode::serialize(payload)
        .map_err(|e| ExtractError::serialization(format!("encode: {e}")))?;
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(|e| ExtractError::serialization(format!("compress: {e}")))?;
    Ok(Bytes::from(compressed))
}

/// Inverse of [`encode`].
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| ExtractError::serialization(format!("decompress: {e}")))?;
    bincode::deserialize(&raw).map_err(|e| ExtractError::serialization(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_entry(gno: i64) -> BinlogEntry {
        BinlogEntry {
            coordinates: TransactionCoordinates::new(
                "mysql-bin.000003",
                4200,
                Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap(),
                gno,
            ),
            events: vec![RowChange {
                schema: "shop".into(),
                table: "orders".into(),
                op: RowOp::Insert,
                before: None,
                after: Some(serde_json::json!({"id": gno, "total": 12.5})),
            }],
            original_size: 96,
        }
    }

    #[test]
    fn test_dump_entry_wire_roundtrip() {
        let entry = DumpEntry {
            db_sql: Some("CREATE DATABASE IF NOT EXISTS `shop`".into()),
            tb_sql: vec!["CREATE TABLE `orders` (id INT)".into()],
            rows_count: 2,
            total_count: 11,
            rows: vec![
                vec![Some("1".into()), None],
                vec![Some("2".into()), Some("x".into())],
            ],
            ..Default::default()
        };

        let body = encode(&entry).unwrap();
        let back: DumpEntry = decode(&body).unwrap();
        assert_eq!(back.db_sql, entry.db_sql);
        assert_eq!(back.rows.len(), 2);
        assert_eq!(back.total_count, 11);
    }

    #[test]
    fn test_binlog_entries_wire_roundtrip() {
        let batch = BinlogEntries {
            entries: vec![make_entry(7), make_entry(8)],
        };

        let body = encode(&batch).unwrap();
        let back: BinlogEntries = decode(&body).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.first_gno(), 7);
        assert_eq!(back.entries[1].coordinates.gno, 8);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<DumpComplete>(b"definitely not snappy").is_err());
    }
}
