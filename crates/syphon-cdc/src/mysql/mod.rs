//! # MySQL extraction core
//!
//! The extractor proper: the [`Extractor`] coordinator sequencing the run,
//! the [`SnapshotEngine`] producing the consistent copy, the
//! [`StreamAggregator`] batching live transactions, and the collaborator
//! contracts the core drives ([`SchemaInspector`], [`DumpConnection`],
//! [`ReplicationSource`]).
//!
//! ```text
//! JobStore ──▶ Extractor ──▶ SnapshotEngine ──▶ {subject}_full
//!                  │               │
//!                  │        coordinates_ready / snapshot_done
//!                  ▼               ▼
//!          ReplicationSource ──▶ bounded queue ──▶ StreamAggregator
//!                                                      │
//!                                                      ▼
//!                                             {subject}_incr_hete
//! ```

mod aggregator;
mod extractor;
pub mod inspector;
mod replication;
pub mod snapshot;

#[cfg(feature = "mysql")]
pub mod driver;

pub use aggregator::{MemoryPressureGuard, MemoryProbe, StreamAggregator, SysinfoProbe};
pub use extractor::{ExtractPlan, Extractor, ExtractorContext};
pub use inspector::{
    resolve_sources, ColumnDef, ResolvedSource, ResolvedTable, SchemaInspector, TableColumns,
};
pub use replication::{ReplicationSource, ReplicationStream};
pub use snapshot::{
    apply_renames, escape_name, set_statement_for, DumpConnection, RowChunk, SnapshotEngine,
    SnapshotTransaction,
};

#[cfg(feature = "mysql")]
pub use driver::{MySqlDumpConnection, MySqlInspector, MySqlSnapshotTransaction};
