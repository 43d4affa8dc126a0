//! Extraction run configuration
//!
//! Plain immutable value structs. Layered sources (defaults, file, job
//! submission) are combined with the pure [`ExtractorConfig::merge`] — the
//! result is a new value, nothing is mutated in place and nothing lives in
//! package-level state.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::{ExtractError, Result};

/// Reserved system schema: never re-created on the applier side.
pub const RESERVED_SCHEMA: &str = "mysql";

/// Configuration for one extraction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Prior replication-set identifier to resume from ("" = none)
    pub gtid: String,
    /// Capture the server's current coordinate at plan time instead of
    /// copying data
    pub auto_gtid: bool,
    /// Explicit GTID start point; the plan subtracts it from the server's
    /// executed set
    pub gtid_start: String,
    /// Explicit binlog file to start from ("" = none)
    pub binlog_file: String,
    /// Offset within `binlog_file`
    pub binlog_pos: u32,
    /// Relay-mode streaming: positions are tracked externally, the
    /// snapshot-done gate is not awaited before attaching
    pub binlog_relay: bool,
    /// Copy the snapshot only; never attach the replication stream
    pub skip_incremental_copy: bool,
    /// Omit schema/table creation statements from the dump
    pub skip_create_db_table: bool,
    /// Prefix generated DDL with DROP TABLE IF EXISTS
    pub drop_table_if_exists: bool,
    /// Rows per snapshot chunk
    pub chunk_size: usize,
    /// Capacity of the replication queue; also the aggregator's
    /// flush-by-count threshold
    pub repl_chan_buffer_size: usize,
    /// Flush the aggregation buffer once it holds this many bytes
    pub group_max_size: usize,
    /// Idle flush timeout for the aggregation buffer, milliseconds
    pub group_timeout_ms: u64,
    /// Abort the run once this many gigabytes have been transmitted
    /// (0 = unlimited)
    pub traffic_limit_gb: u64,
    /// Request/reply timeout for bus publishes, seconds
    pub connect_timeout_secs: u64,
    /// Interval between coordinate persists to the coordination store,
    /// seconds
    pub coordinate_save_interval_secs: u64,
    /// Schemas/tables to replicate; empty = everything minus the ignore list
    pub replicate_do_db: Vec<SchemaSelector>,
    /// Schemas/tables to skip when `replicate_do_db` is empty
    pub replicate_ignore_db: Vec<SchemaSelector>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            gtid: String::new(),
            auto_gtid: false,
            gtid_start: String::new(),
            binlog_file: String::new(),
            binlog_pos: 0,
            binlog_relay: false,
            skip_incremental_copy: false,
            skip_create_db_table: false,
            drop_table_if_exists: false,
            chunk_size: 2000,
            repl_chan_buffer_size: 32,
            group_max_size: 1_048_576,
            group_timeout_ms: 100,
            traffic_limit_gb: 0,
            connect_timeout_secs: 10,
            coordinate_save_interval_secs: 15,
            replicate_do_db: Vec::new(),
            replicate_ignore_db: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    /// Combine two layers into a new value; `overlay`'s non-default fields
    /// win.
    pub fn merge(&self, overlay: &ExtractorConfig) -> ExtractorConfig {
        let base = ExtractorConfig::default();
        let mut result = self.clone();

        macro_rules! take {
            ($field:ident) => {
                if overlay.$field != base.$field {
                    result.$field = overlay.$field.clone();
                }
            };
        }

        take!(gtid);
        take!(auto_gtid);
        take!(gtid_start);
        take!(binlog_file);
        take!(binlog_pos);
        take!(binlog_relay);
        take!(skip_incremental_copy);
        take!(skip_create_db_table);
        take!(drop_table_if_exists);
        take!(chunk_size);
        take!(repl_chan_buffer_size);
        take!(group_max_size);
        take!(group_timeout_ms);
        take!(traffic_limit_gb);
        take!(connect_timeout_secs);
        take!(coordinate_save_interval_secs);
        take!(replicate_do_db);
        take!(replicate_ignore_db);

        result
    }

    /// Plan-independent sanity checks, run before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ExtractError::config("chunk_size must be positive"));
        }
        if self.repl_chan_buffer_size == 0 {
            return Err(ExtractError::config(
                "repl_chan_buffer_size must be positive",
            ));
        }
        for selector in &self.replicate_do_db {
            selector.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Table selection
// ============================================================================

/// Schema-level replication selector.
///
/// Either an explicit schema name, or a schema regex with an optional
/// rename template expanded per matching schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSelector {
    pub schema: String,
    pub schema_regex: String,
    pub schema_rename: String,
    /// Tables within the schema; empty = all tables
    pub tables: Vec<TableSpec>,
}

impl SchemaSelector {
    pub fn named(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.schema.is_empty() && self.schema_regex.is_empty() {
            return Err(ExtractError::config(
                "schema and schema_regex cannot both be blank",
            ));
        }
        if !self.schema.is_empty() && !self.schema_regex.is_empty() {
            return Err(ExtractError::config(
                "schema and schema_regex are mutually exclusive",
            ));
        }
        for table in &self.tables {
            table.validate()?;
        }
        Ok(())
    }
}

/// Table-level replication selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    pub name: String,
    pub regex: String,
    pub rename: String,
    /// Row filter applied while dumping ("" = all rows)
    pub where_filter: String,
}

impl TableSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() && self.regex.is_empty() {
            return Err(ExtractError::config(
                "table name and regex cannot both be blank",
            ));
        }
        if !self.name.is_empty() && !self.regex.is_empty() {
            return Err(ExtractError::config(
                "table name and regex are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Expand a rename template against a regex match.
///
/// The template uses capture-group references (`$1`, `${name}`); a literal
/// `($)` is accepted once as an escaped `$` for configuration formats where
/// a bare dollar is awkward.
pub fn resolve_rename(pattern: &Regex, template: &str, candidate: &str) -> Option<String> {
    let caps = pattern.captures(candidate)?;
    let template = template.replacen("($)", "$", 1);
    let mut out = String::new();
    caps.expand(&template, &mut out);
    Some(out)
}
