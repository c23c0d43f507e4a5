//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Records fully processed
    pub records_processed: AtomicU64,

    /// Records that failed
    pub records_failed: AtomicU64,

    /// Stage invocations (one per instance per record)
    pub stage_invocations: AtomicU64,

    /// Board-parallel tasks executed
    pub board_tasks: AtomicU64,

    /// Items consumed across all stage inputs
    pub items_in: AtomicU64,

    /// Items produced across all stage outputs
    pub items_out: AtomicU64,

    /// Dump records written
    pub dump_records: AtomicU64,

    /// Dump bytes written
    pub dump_bytes: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time spent fetching external feeds (microseconds)
    pub feed_fetch_us: AtomicU64,

    /// Time spent inside stage handlers (microseconds)
    pub stage_exec_us: AtomicU64,

    /// Time spent writing dumps (microseconds)
    pub dump_write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_record_failed(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_invocation(&self) {
        self.stage_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_board_task(&self) {
        self.board_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_items_in(&self, count: u64) {
        self.items_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_items_out(&self, count: u64) {
        self.items_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dump_record(&self, bytes: u64) {
        self.dump_records.fetch_add(1, Ordering::Relaxed);
        self.dump_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_feed_fetch_time(&self, duration: Duration) {
        self.feed_fetch_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_stage_exec_time(&self, duration: Duration) {
        self.stage_exec_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_dump_write_time(&self, duration: Duration) {
        self.dump_write_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get records per second.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_processed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            stage_invocations: self.stage_invocations.load(Ordering::Relaxed),
            board_tasks: self.board_tasks.load(Ordering::Relaxed),
            items_in: self.items_in.load(Ordering::Relaxed),
            items_out: self.items_out.load(Ordering::Relaxed),
            dump_records: self.dump_records.load(Ordering::Relaxed),
            dump_bytes: self.dump_bytes.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            records_per_second: self.records_per_second(),
            feed_fetch_secs: self.feed_fetch_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            stage_exec_secs: self.stage_exec_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            dump_write_secs: self.dump_write_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_failed: u64,
    pub stage_invocations: u64,
    pub board_tasks: u64,
    pub items_in: u64,
    pub items_out: u64,
    pub dump_records: u64,
    pub dump_bytes: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub records_per_second: f64,
    /// Total time spent fetching feeds (seconds)
    pub feed_fetch_secs: f64,
    /// Total time spent inside stage handlers (seconds, summed across tasks)
    pub stage_exec_secs: f64,
    /// Total time spent writing dumps (seconds)
    pub dump_write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_component = self.feed_fetch_secs + self.stage_exec_secs + self.dump_write_secs;
        let (feed_pct, exec_pct, dump_pct) = if total_component > 0.0 {
            (
                self.feed_fetch_secs / total_component * 100.0,
                self.stage_exec_secs / total_component * 100.0,
                self.dump_write_secs / total_component * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Records: {} processed, {} failed | Stages: {} ({} board tasks) | \
             Items: {} in, {} out | Dumps: {} records, {:.2} MB | \
             Rate: {:.1} rec/s | Elapsed: {:.1}s | \
             Time: feed {:.0}% | exec {:.0}% | dump {:.0}%",
            self.records_processed,
            self.records_failed,
            self.stage_invocations,
            self.board_tasks,
            self.items_in,
            self.items_out,
            self.dump_records,
            self.dump_bytes as f64 / (1024.0 * 1024.0),
            self.records_per_second,
            self.elapsed.as_secs_f64(),
            feed_pct,
            exec_pct,
            dump_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_records: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_records: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_records,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_records > 0 {
                        (snapshot.records_processed + snapshot.records_failed) as f64
                            / self.total_records as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Records processed: {}", snapshot.records_processed);
        println!("Records failed: {}", snapshot.records_failed);
        println!("Stage invocations: {}", snapshot.stage_invocations);
        println!("Board tasks: {}", snapshot.board_tasks);
        println!("Items in/out: {}/{}", snapshot.items_in, snapshot.items_out);
        println!(
            "Dump output: {} records, {:.2} MB",
            snapshot.dump_records,
            snapshot.dump_bytes as f64 / (1024.0 * 1024.0)
        );
        println!("Rate: {:.1} records/s", snapshot.records_per_second);

        let total_component =
            snapshot.feed_fetch_secs + snapshot.stage_exec_secs + snapshot.dump_write_secs;
        if total_component > 0.0 {
            println!("\n--- Component Time Breakdown ---");
            println!(
                "Feed fetch:  {:>7.1}s ({:>5.1}%)",
                snapshot.feed_fetch_secs,
                snapshot.feed_fetch_secs / total_component * 100.0
            );
            println!(
                "Stage exec:  {:>7.1}s ({:>5.1}%)",
                snapshot.stage_exec_secs,
                snapshot.stage_exec_secs / total_component * 100.0
            );
            println!(
                "Dump write:  {:>7.1}s ({:>5.1}%)",
                snapshot.dump_write_secs,
                snapshot.dump_write_secs / total_component * 100.0
            );
        }
        println!("===================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_items_in(1000);
        metrics.add_items_in(500);

        assert_eq!(metrics.items_in.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_record_processed();
        metrics.add_record_processed();
        metrics.add_record_failed();
        metrics.add_stage_invocation();
        metrics.add_board_task();
        metrics.add_dump_record(128);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.records_processed, 2);
        assert_eq!(snapshot.records_failed, 1);
        assert_eq!(snapshot.stage_invocations, 1);
        assert_eq!(snapshot.board_tasks, 1);
        assert_eq!(snapshot.dump_records, 1);
        assert_eq!(snapshot.dump_bytes, 128);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_feed_fetch_time(Duration::from_millis(100));
        metrics.add_stage_exec_time(Duration::from_millis(50));
        metrics.add_dump_write_time(Duration::from_millis(25));

        let snapshot = metrics.snapshot();

        assert!((snapshot.feed_fetch_secs - 0.1).abs() < 0.001);
        assert!((snapshot.stage_exec_secs - 0.05).abs() < 0.001);
        assert!((snapshot.dump_write_secs - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            records_processed: 100,
            records_failed: 2,
            stage_invocations: 700,
            board_tasks: 300,
            items_in: 5000,
            items_out: 4800,
            dump_records: 100,
            dump_bytes: 1024 * 1024,
            elapsed: Duration::from_secs(10),
            records_per_second: 10.0,
            feed_fetch_secs: 1.0,
            stage_exec_secs: 7.0,
            dump_write_secs: 2.0,
        };

        let display = format!("{}", snapshot);
        assert!(display.contains("100 processed"));
        assert!(display.contains("2 failed"));
        assert!(display.contains("300 board tasks"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_record_processed();

        assert_eq!(metrics.records_per_second(), 0.0);
    }
}
