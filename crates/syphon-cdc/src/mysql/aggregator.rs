//! Change-stream aggregation
//!
//! Drains the bounded replication queue, groups transactions under
//! size/count/time triggers and publishes each group as one batch. The
//! queue's fixed capacity is the only throttle on the replication source: a
//! full queue blocks the producer, which is the intended flow control.
//!
//! Batches preserve producer order; nothing is reordered across batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::common::{
    encode, BinlogEntries, BinlogEntry, Correlation, Counters, ExtractError, Publisher, Result,
    Stage,
};

/// Available-memory probe, injectable for tests.
pub trait MemoryProbe: Send + Sync {
    fn available_bytes(&self) -> u64;
}

/// Live probe backed by the host's memory accounting.
pub struct SysinfoProbe {
    system: parking_lot::Mutex<sysinfo::System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self {
            system: parking_lot::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Guard against a co-located deployment buffering itself out of memory.
///
/// Deliberately narrow: it fires only on the first transaction of a new
/// buffer, and only when this process shares an address with the bus. It is
/// a heuristic against the one deployment shape that can deadlock the host,
/// not a general backpressure mechanism.
pub struct MemoryPressureGuard {
    co_located: bool,
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryPressureGuard {
    pub fn new(bus_addr: &str, local_addrs: &[String], probe: Arc<dyn MemoryProbe>) -> Self {
        let bus_host = bus_addr.split(':').next().unwrap_or_default();
        Self {
            co_located: local_addrs.iter().any(|a| a == bus_host),
            probe,
        }
    }

    fn check(&self, buffered_bytes: usize) -> Result<()> {
        if !self.co_located {
            return Ok(());
        }
        let available = self.probe.available_bytes();
        if buffered_bytes as u64 > available / 16 {
            return Err(ExtractError::MemoryPressure(format!(
                "buffered {buffered_bytes} bytes with only {available} available on co-located host"
            )));
        }
        Ok(())
    }
}

/// Drains the replication queue and publishes ordered batches.
pub struct StreamAggregator {
    subject: String,
    publisher: Publisher,
    counters: Arc<Counters>,
    group_max_size: usize,
    group_timeout: Duration,
    /// Flush-by-count threshold. This is the replication queue's capacity,
    /// not an independent tunable; see the module tests.
    queue_capacity: usize,
    guard: Option<MemoryPressureGuard>,
}

impl StreamAggregator {
    pub fn new(
        subject: impl Into<String>,
        publisher: Publisher,
        counters: Arc<Counters>,
        group_max_size: usize,
        group_timeout: Duration,
        queue_capacity: usize,
        guard: Option<MemoryPressureGuard>,
    ) -> Self {
        Self {
            subject: format!("{}_incr_hete", subject.into()),
            publisher,
            counters,
            group_max_size,
            group_timeout,
            queue_capacity,
            guard,
        }
    }

    /// Drain `rx` until shutdown or the producer side closes. Errors are
    /// fatal for the run.
    pub async fn run(self, mut rx: mpsc::Receiver<BinlogEntry>) -> Result<()> {
        let shutdown = self.publisher.shutdown().clone();
        let mut entries: Vec<BinlogEntry> = Vec::new();
        let mut entries_size = 0usize;

        let timer = tokio::time::sleep(self.group_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("aggregator exiting on shutdown");
                    return Ok(());
                }
                received = rx.recv() => {
                    let Some(entry) = received else {
                        // Producer gone; push out what is buffered.
                        if !entries.is_empty() {
                            self.flush(&mut entries, &mut entries_size).await?;
                        }
                        return Ok(());
                    };

                    if cfg!(debug_assertions) {
                        if let Some(last) = entries.last() {
                            debug_assert!(
                                entry
                                    .coordinates
                                    .as_current()
                                    .is_ordered_after(&last.coordinates.as_current()),
                                "replication stream delivered out-of-order coordinates"
                            );
                        }
                    }

                    entries_size += entry.original_size;
                    entries.push(entry);

                    if entries.len() == 1 {
                        if let Some(guard) = &self.guard {
                            if let Err(e) = guard.check(entries_size) {
                                error!(error = %e, "memory pressure on co-located host");
                                return Err(e);
                            }
                        }
                    }

                    if entries_size >= self.group_max_size
                        || entries.len() == self.queue_capacity
                    {
                        debug!(
                            size = entries_size,
                            count = entries.len(),
                            "send by group limit"
                        );
                        self.flush(&mut entries, &mut entries_size).await?;
                        self.counters.incr_send_by_size_full();
                        timer.as_mut().reset(Instant::now() + self.group_timeout);
                    }
                }
                _ = &mut timer => {
                    if !entries.is_empty() {
                        debug!(size = entries_size, "send by timeout");
                        self.flush(&mut entries, &mut entries_size).await?;
                        self.counters.incr_send_by_timeout();
                    }
                    timer.as_mut().reset(Instant::now() + self.group_timeout);
                }
            }
        }
    }

    async fn flush(&self, entries: &mut Vec<BinlogEntry>, entries_size: &mut usize) -> Result<()> {
        let batch = BinlogEntries {
            entries: std::mem::take(entries),
        };
        *entries_size = 0;

        let count = batch.len();
        debug!(gno = batch.first_gno(), n = count, "sending batch");
        let body = encode(&batch)?;
        self.publisher
            .publish(&self.subject, body, Some(&Correlation::new()))
            .await?;
        debug!(gno = batch.first_gno(), n = count, "batch acked");

        self.counters.add_delta(count as i64);
        self.counters.set_stage(Stage::StreamingBinlog);
        Ok(())
    }
}
