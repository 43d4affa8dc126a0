//! # syphon-cdc - consistent snapshot with seamless binlog handoff
//!
//! A change-data-capture extractor for MySQL-compatible sources: it produces
//! a point-in-time consistent snapshot bound to an exact replication
//! coordinate, hands off to continuous binlog streaming with no event gap,
//! and publishes ordered change batches onto a message bus. Just enough
//! coordinate state is persisted in a coordination store for a restarted run
//! to resume where it left off.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   watch addr / resume position   ┌──────────────┐
//! │  JobStore   │◀────────────────────────────────▶│  Extractor   │
//! └─────────────┘                                  └──────┬───────┘
//!                                                         │ decide plan
//!                              ┌──────────────────────────┼─────────────┐
//!                              ▼                          ▼             │
//!                     ┌────────────────┐        ┌──────────────────┐    │
//!                     │ SnapshotEngine │        │ ReplicationSource│    │
//!                     │  (bound view)  │        │  (after gates)   │    │
//!                     └───────┬────────┘        └────────┬─────────┘    │
//!                             │ {subject}_full           │ bounded queue│
//!                             ▼                          ▼              │
//!                     ┌────────────────┐        ┌──────────────────┐    │
//!                     │   MessageBus   │◀───────│ StreamAggregator │◀───┘
//!                     └────────────────┘ batches└──────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> syphon_cdc::Result<()> {
//! use std::sync::Arc;
//! use syphon_cdc::common::{ExtractorConfig, MemoryJobStore, InMemoryBus, InMemoryBusConnector};
//! use syphon_cdc::mysql::{Extractor, ExtractorContext, SysinfoProbe};
//! # use syphon_cdc::common::JobStore;
//! # use syphon_cdc::mysql::{DumpConnection, SchemaInspector, ReplicationSource};
//! # fn collaborators() -> (Arc<dyn DumpConnection>, Arc<dyn SchemaInspector>, Arc<dyn ReplicationSource>) { unimplemented!() }
//!
//! let store = MemoryJobStore::new();
//! store.put_bus_addr("job1", "10.0.0.1:4222").await?;
//!
//! let bus = InMemoryBus::new("10.0.0.1:4222");
//! let (dump, inspector, replication) = collaborators();
//! let extractor = Extractor::new(ExtractorContext {
//!     subject: "job1".into(),
//!     config: ExtractorConfig::default(),
//!     store,
//!     bus_connector: Arc::new(InMemoryBusConnector::new(bus)),
//!     dump_connection: dump,
//!     inspector,
//!     replication,
//!     local_addrs: vec![],
//!     memory_probe: Arc::new(SysinfoProbe::default()),
//! })?;
//!
//! extractor.run().await;
//! let exit = extractor.wait().await?;
//! println!("run ended: {:?}", exit.state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `mysql` - mysql_async-backed dump/inspection adapters
//! - `nats` - async-nats-backed message bus adapter

// Common plumbing - always available
pub mod common;

// The extraction core
pub mod mysql;

// =============================================================================
// Tier 1: the types every host touches
// =============================================================================

pub use common::{
    BinlogCoordinates, ExitResult, ExtractError, ExtractorConfig, Result, TaskState,
    TaskStatistics,
};
pub use mysql::{Extractor, ExtractorContext};

// =============================================================================
// Tier 2: collaborator contracts for custom integrations
// =============================================================================

pub use common::{BusConnector, JobStore, MessageBus, Publisher};
pub use mysql::{
    DumpConnection, MemoryProbe, ReplicationSource, ReplicationStream, SchemaInspector,
    SnapshotTransaction,
};
