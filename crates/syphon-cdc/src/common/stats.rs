//! Progress, throughput and backlog reporting
//!
//! Counters are shared across the snapshot, aggregation and reporting tasks,
//! so every one of them is atomic; the pollable [`TaskStatistics`] snapshot
//! is assembled on demand by the coordinator.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::CurrentCoordinates;

/// Lifecycle stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup: nothing counted yet
    #[default]
    Init,
    /// Counting rows for the copy phase
    SearchingRows,
    /// Transmitting snapshot data
    SendingData,
    /// Transmitting live change batches
    StreamingBinlog,
    /// Copy finished and the estimate has been reached
    FullyStreamed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::SearchingRows => "searching rows for copy",
            Stage::SendingData => "sending data",
            Stage::StreamingBinlog => "sending binlog events",
            Stage::FullyStreamed => "fully streamed",
        };
        f.write_str(s)
    }
}

/// Shared counter block.
pub struct Counters {
    rows_copied: AtomicI64,
    rows_estimate: AtomicI64,
    delta_count: AtomicI64,
    send_by_timeout: AtomicU64,
    send_by_size_full: AtomicU64,
    row_copy_complete: AtomicBool,
    stage: parking_lot::Mutex<Stage>,
    row_copy_start: parking_lot::Mutex<Option<Instant>>,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows_copied: AtomicI64::new(0),
            rows_estimate: AtomicI64::new(0),
            delta_count: AtomicI64::new(0),
            send_by_timeout: AtomicU64::new(0),
            send_by_size_full: AtomicU64::new(0),
            row_copy_complete: AtomicBool::new(false),
            stage: parking_lot::Mutex::new(Stage::Init),
            row_copy_start: parking_lot::Mutex::new(None),
        })
    }

    pub fn add_rows_copied(&self, n: i64) {
        self.rows_copied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rows_estimate(&self, n: i64) {
        self.rows_estimate.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_delta(&self, n: i64) {
        self.delta_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_send_by_timeout(&self) {
        self.send_by_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_send_by_size_full(&self) {
        self.send_by_size_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rows_copied(&self) -> i64 {
        self.rows_copied.load(Ordering::Relaxed)
    }

    pub fn rows_estimate(&self) -> i64 {
        self.rows_estimate.load(Ordering::Relaxed)
    }

    pub fn delta_count(&self) -> i64 {
        self.delta_count.load(Ordering::Relaxed)
    }

    pub fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = stage;
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Mark the start of the row-copy phase for ETA extrapolation.
    pub fn mark_row_copy_start(&self) {
        let mut start = self.row_copy_start.lock();
        if start.is_none() {
            *start = Some(Instant::now());
        }
    }

    pub fn mark_row_copy_complete(&self) {
        self.row_copy_complete.store(true, Ordering::Relaxed);
    }

    pub fn row_copy_complete(&self) -> bool {
        self.row_copy_complete.load(Ordering::Relaxed)
    }

    pub fn row_copy_elapsed(&self) -> Duration {
        self.row_copy_start
            .lock()
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }
}

/// Buffer/flush trigger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStat {
    pub send_by_timeout: u64,
    pub send_by_size_full: u64,
}

/// Pollable statistics surface of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub rows_copied: i64,
    pub rows_estimate: i64,
    pub delta_count: i64,
    /// Formatted with one decimal, e.g. `42.0`
    pub progress_pct: String,
    /// `N/A` below 1% progress, `0s` at or above 100%
    pub eta: String,
    /// `pending/capacity` of the replication queue
    pub backlog: String,
    pub stage: Stage,
    pub bytes_out: u64,
    pub current_coordinates: CurrentCoordinates,
    pub buffer_stat: BufferStat,
    /// UTC nanoseconds at snapshot time
    pub timestamp: i64,
}

/// `100 * copied / estimate`, 0 when the estimate is 0.
pub fn progress_pct(copied: i64, estimate: i64) -> f64 {
    if estimate == 0 {
        0.0
    } else {
        100.0 * copied as f64 / estimate as f64
    }
}

/// Linear ETA extrapolation.
///
/// Below 1% progress there is not enough signal and the ETA is unknown; at
/// or above 100% it is zero and the run is fully streamed.
pub fn eta(progress_pct: f64, elapsed: Duration, copied: i64, estimate: i64) -> String {
    if progress_pct >= 100.0 {
        return "0s".to_string();
    }
    if progress_pct < 1.0 || copied <= 0 {
        return "N/A".to_string();
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let total_expected = elapsed_secs * estimate as f64 / copied as f64;
    let eta_secs = total_expected - elapsed_secs;
    if eta_secs <= 0.0 {
        "0s".to_string()
    } else {
        prettify_duration(Duration::from_secs(eta_secs as u64))
    }
}

/// Compact human form: `2h3m` above an hour, `4m10s` above a minute,
/// otherwise seconds.
pub fn prettify_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// True once cumulative output crosses the configured ceiling (gigabytes,
/// 0 = unlimited).
pub fn traffic_exceeded(bytes_out: u64, limit_gb: u64) -> bool {
    limit_gb > 0 && bytes_out / 1024 / 1024 / 1024 >= limit_gb
}

/// Assemble the pollable snapshot.
#[allow(clippy::too_many_arguments)]
pub fn build_statistics(
    counters: &Counters,
    backlog_pending: usize,
    backlog_capacity: usize,
    bytes_out: u64,
    current: CurrentCoordinates,
) -> TaskStatistics {
    let copied = counters.rows_copied();
    // Once the copy is done the copied count is the de-facto total; stop
    // trusting the estimate.
    let estimate = if counters.row_copy_complete() {
        copied
    } else {
        counters.rows_estimate()
    };

    let pct = progress_pct(copied, estimate);
    let eta = eta(pct, counters.row_copy_elapsed(), copied, estimate);
    if pct >= 100.0 {
        counters.set_stage(Stage::FullyStreamed);
    }

    TaskStatistics {
        rows_copied: copied,
        rows_estimate: estimate,
        delta_count: counters.delta_count(),
        progress_pct: format!("{pct:.1}"),
        eta,
        backlog: format!("{backlog_pending}/{backlog_capacity}"),
        stage: counters.stage(),
        bytes_out,
        current_coordinates: current,
        buffer_stat: BufferStat {
            send_by_timeout: counters.send_by_timeout.load(Ordering::Relaxed),
            send_by_size_full: counters.send_by_size_full.load(Ordering::Relaxed),
        },
        timestamp: chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_pct() {
        assert_eq!(progress_pct(0, 1000), 0.0);
        assert_eq!(progress_pct(1000, 1000), 100.0);
        assert_eq!(progress_pct(500, 1000), 50.0);
        // Zero estimate never divides.
        assert_eq!(progress_pct(500, 0), 0.0);
    }

    #[test]
    fn test_eta_unknown_below_one_percent() {
        assert_eq!(eta(0.0, Duration::from_secs(10), 0, 1000), "N/A");
        assert_eq!(eta(0.5, Duration::from_secs(10), 5, 1000), "N/A");
    }

    #[test]
    fn test_eta_zero_at_completion() {
        assert_eq!(eta(100.0, Duration::from_secs(10), 1000, 1000), "0s");
        assert_eq!(eta(150.0, Duration::from_secs(10), 1500, 1000), "0s");
    }

    #[test]
    fn test_eta_linear_extrapolation() {
        // Half done after 10s: about 10s left.
        assert_eq!(eta(50.0, Duration::from_secs(10), 500, 1000), "10s");
        // Quarter done after 30s: 90s left.
        assert_eq!(eta(25.0, Duration::from_secs(30), 250, 1000), "1m30s");
    }

    #[test]
    fn test_prettify_duration() {
        assert_eq!(prettify_duration(Duration::from_secs(0)), "0s");
        assert_eq!(prettify_duration(Duration::from_secs(45)), "45s");
        assert_eq!(prettify_duration(Duration::from_secs(130)), "2m10s");
        assert_eq!(prettify_duration(Duration::from_secs(7380)), "2h3m");
    }

    #[test]
    fn test_traffic_exceeded() {
        assert!(!traffic_exceeded(u64::MAX, 0)); // unlimited
        assert!(!traffic_exceeded(1024 * 1024 * 1024 - 1, 1));
        assert!(traffic_exceeded(1024 * 1024 * 1024, 1));
        assert!(traffic_exceeded(5 * 1024 * 1024 * 1024, 2));
    }

    #[test]
    fn test_build_statistics_estimate_latches_after_copy() {
        let counters = Counters::new();
        counters.add_rows_copied(800);
        counters.add_rows_estimate(1000);

        let stats = build_statistics(&counters, 3, 32, 42, CurrentCoordinates::default());
        assert_eq!(stats.rows_estimate, 1000);
        assert_eq!(stats.progress_pct, "80.0");
        assert_eq!(stats.backlog, "3/32");

        counters.mark_row_copy_complete();
        let stats = build_statistics(&counters, 0, 32, 42, CurrentCoordinates::default());
        assert_eq!(stats.rows_estimate, 800);
        assert_eq!(stats.progress_pct, "100.0");
        assert_eq!(stats.eta, "0s");
        assert_eq!(stats.stage, Stage::FullyStreamed);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::SendingData.to_string(), "sending data");
        assert_eq!(Stage::FullyStreamed.to_string(), "fully streamed");
    }
}
