//! # Common extraction plumbing
//!
//! Database-agnostic pieces shared by the extractor core:
//!
//! - [`ExtractError`] - one error taxonomy for the whole run
//! - [`GtidSet`] / [`BinlogCoordinates`] - replication coordinate algebra
//! - [`DumpEntry`] / [`BinlogEntry`] / [`BinlogEntries`] - pipeline payloads
//! - [`ExtractorConfig`] - immutable run configuration with pure merge
//! - [`Gate`] / [`Shutdown`] - one-shot handoff and cancellation signals
//! - [`JobStore`] - coordination-store contract for resumable positions
//! - [`MessageBus`] / [`Publisher`] - transport contract and retrying publish
//! - [`Counters`] / [`TaskStatistics`] - progress and backlog reporting

mod bus;
mod config;
mod coordinate;
mod entry;
mod error;
mod gate;
mod stats;
mod store;

pub use bus::*;
pub use config::*;
pub use coordinate::*;
pub use entry::*;
pub use error::*;
pub use gate::*;
pub use stats::*;
pub use store::*;
