//! Error types for the extraction pipeline
//!
//! One taxonomy for the whole run, with classification for metrics and for
//! the coordinator's fatal-vs-transient routing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source database errors (connection, query, protocol)
    Database,
    /// Replication stream errors (binlog, GTID)
    Replication,
    /// Schema-related errors (DDL, column layout)
    Schema,
    /// Configuration errors (invalid or conflicting settings)
    Configuration,
    /// Message bus errors (publish, subscribe)
    Bus,
    /// Network errors (timeout, connection)
    Network,
    /// Serialization errors (wire encoding)
    Serialization,
    /// Resource exhaustion (memory pressure, traffic ceiling)
    Resource,
    /// Other/unknown errors
    Other,
}

/// Extraction errors
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Configuration error, detected before any I/O begins
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database unreachable or query failed
    #[error("Database error: {0}")]
    Database(String),

    /// Replication stream error
    #[error("Replication error: {0}")]
    Replication(String),

    /// Schema inspection error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Message bus error (non-timeout; fatal for the run)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Request/reply timed out (transient, retried by the publisher)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Co-located buffer would exhaust host memory
    #[error("Memory pressure: {0}")]
    MemoryPressure(String),

    /// Cumulative transmitted bytes exceeded the configured ceiling
    #[error("Traffic limit exceeded: {0}")]
    TrafficLimit(String),

    /// Wire encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run's shutdown signal fired while waiting
    #[error("Shutting down")]
    Shutdown,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ExtractError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new bus error
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for transient conditions a caller may retry.
    ///
    /// Only timeouts qualify here; every other failure either aborts the run
    /// or is handled inside the component that detected it.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Database(_) => ErrorCategory::Database,
            Self::Replication(_) => ErrorCategory::Replication,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::Bus(_) => ErrorCategory::Bus,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::MemoryPressure(_) | Self::TrafficLimit(_) => ErrorCategory::Resource,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Shutdown | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Replication(_) => "replication_error",
            Self::Schema(_) => "schema_error",
            Self::Bus(_) => "bus_error",
            Self::Timeout(_) => "timeout",
            Self::MemoryPressure(_) => "memory_pressure",
            Self::TrafficLimit(_) => "traffic_limit",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
            Self::Shutdown => "shutdown",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;
