//! Coordination-store contract
//!
//! The extractor persists just enough coordinate state, keyed by job name,
//! for a restarted run to resume without re-scanning: the executed GTID set,
//! the binlog file/offset, and the advertised bus address. The store itself
//! (Consul, etcd, ...) is an external collaborator; [`JobStore`] is the
//! interface the core needs, [`MemoryJobStore`] the embedded/test
//! implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::common::{
    encode_file_pos, parse_file_pos, FilePosition, Result, Shutdown,
};

/// Root namespace for all job keys: `syphon/<job>/<key>`.
const STORE_NAMESPACE: &str = "syphon";

/// Key/value persistence plus a blocking watch, scoped by job name.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Remove all state for a job. Absence is not an error.
    async fn destroy_job(&self, job: &str) -> Result<()>;

    /// Persist the executed replication-set identifier.
    async fn save_gtid(&self, job: &str, gtid: &str) -> Result<()>;

    /// Load the persisted replication-set identifier; empty when absent.
    async fn load_gtid(&self, job: &str) -> Result<String>;

    /// Persist the binlog file/offset position.
    async fn save_file_pos(&self, job: &str, file: &str, pos: u32) -> Result<()>;

    /// Load the persisted file/offset; the zero value when absent.
    async fn load_file_pos(&self, job: &str) -> Result<FilePosition>;

    /// Advertise the message-bus address for a job.
    async fn put_bus_addr(&self, job: &str, addr: &str) -> Result<()>;

    /// Block until a bus address is observed for the job, or shutdown fires.
    async fn watch_bus_addr(&self, job: &str, shutdown: &Shutdown) -> Result<String>;
}

pub(crate) fn job_key(job: &str, key: &str) -> String {
    format!("{STORE_NAMESPACE}/{job}/{key}")
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory [`JobStore`] for tests and embedded single-process runs.
#[derive(Default)]
pub struct MemoryJobStore {
    entries: parking_lot::Mutex<HashMap<String, String>>,
    changed: Notify,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: String, value: String) {
        self.entries.lock().insert(key, value);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn destroy_job(&self, job: &str) -> Result<()> {
        let prefix = job_key(job, "");
        self.entries.lock().retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn save_gtid(&self, job: &str, gtid: &str) -> Result<()> {
        self.put(job_key(job, "Gtid"), gtid.to_string());
        Ok(())
    }

    async fn load_gtid(&self, job: &str) -> Result<String> {
        Ok(self.get(&job_key(job, "Gtid")).unwrap_or_default())
    }

    async fn save_file_pos(&self, job: &str, file: &str, pos: u32) -> Result<()> {
        self.put(job_key(job, "BinlogFilePos"), encode_file_pos(file, pos));
        Ok(())
    }

    async fn load_file_pos(&self, job: &str) -> Result<FilePosition> {
        match self.get(&job_key(job, "BinlogFilePos")) {
            Some(value) => parse_file_pos(&value),
            None => Ok(FilePosition::default()),
        }
    }

    async fn put_bus_addr(&self, job: &str, addr: &str) -> Result<()> {
        self.put(job_key(job, "NatsAddr"), addr.to_string());
        Ok(())
    }

    async fn watch_bus_addr(&self, job: &str, shutdown: &Shutdown) -> Result<String> {
        let key = job_key(job, "NatsAddr");
        loop {
            let notified = self.changed.notified();
            if let Some(addr) = self.get(&key) {
                return Ok(addr);
            }
            shutdown.guard(notified).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ExtractError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gtid_roundtrip_and_absence() {
        let store = MemoryJobStore::new();
        assert_eq!(store.load_gtid("job1").await.unwrap(), "");

        store.save_gtid("job1", "uuid:1-5").await.unwrap();
        assert_eq!(store.load_gtid("job1").await.unwrap(), "uuid:1-5");
        // Jobs are isolated.
        assert_eq!(store.load_gtid("job2").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_file_pos_roundtrip_and_absence() {
        let store = MemoryJobStore::new();
        assert!(store.load_file_pos("job1").await.unwrap().is_empty());

        store
            .save_file_pos("job1", "mysql-bin.000009", 120)
            .await
            .unwrap();
        let pos = store.load_file_pos("job1").await.unwrap();
        assert_eq!(pos.file, "mysql-bin.000009");
        assert_eq!(pos.pos, 120);
    }

    #[tokio::test]
    async fn test_destroy_job_is_idempotent() {
        let store = MemoryJobStore::new();
        store.save_gtid("job1", "uuid:1").await.unwrap();
        store.put_bus_addr("job1", "10.0.0.1:4222").await.unwrap();

        store.destroy_job("job1").await.unwrap();
        assert_eq!(store.load_gtid("job1").await.unwrap(), "");

        // Destroying an absent job is not an error.
        store.destroy_job("job1").await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_returns_first_observed_value() {
        let store = MemoryJobStore::new();
        let shutdown = Shutdown::new();

        let watcher = {
            let store = store.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { store.watch_bus_addr("job1", &shutdown).await })
        };

        tokio::task::yield_now().await;
        store.put_bus_addr("job1", "10.0.0.1:4222").await.unwrap();

        let addr = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(addr, "10.0.0.1:4222");
    }

    #[tokio::test]
    async fn test_watch_cancels_on_shutdown() {
        let store = MemoryJobStore::new();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let result = store.watch_bus_addr("job1", &shutdown).await;
        assert!(matches!(result, Err(ExtractError::Shutdown)));
    }
}
