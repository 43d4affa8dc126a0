//! Replication-source contract
//!
//! The low-level binlog decoder is an external collaborator. The core needs
//! exactly this much of it: attach at a starting coordinate, drain an
//! ordered, lazy, infinite sequence of committed transactions into a bounded
//! queue, report the current coordinate, and re-synchronize when the applier
//! rotates to a new file.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::{BinlogCoordinates, BinlogEntry, Result, TransactionCoordinates};
use crate::mysql::ResolvedSource;

/// Factory side: hooks up to the server as a replica.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Attach at `start`, filtered to `sources`. Called only once the
    /// handoff gates have opened.
    async fn attach(
        &self,
        start: BinlogCoordinates,
        sources: Vec<ResolvedSource>,
    ) -> Result<Arc<dyn ReplicationStream>>;
}

/// An attached stream of committed transactions.
#[async_trait]
pub trait ReplicationStream: Send + Sync {
    /// Pump transactions into `out` in commit order until shutdown or a
    /// stream error. Blocking on a full queue is the system's backpressure
    /// point.
    async fn drive(&self, out: mpsc::Sender<BinlogEntry>) -> Result<()>;

    /// Position of the transaction currently being read.
    fn current_coordinates(&self) -> TransactionCoordinates;

    /// GTID set executed up to the current position, for persistence.
    fn executed_gtid_set(&self) -> String;

    /// The applier rotated to `file`: drop state for earlier files.
    fn resync_from(&self, file: &str);

    /// Detach from the server. Idempotent.
    async fn close(&self) -> Result<()>;
}
