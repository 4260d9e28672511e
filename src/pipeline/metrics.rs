//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::label::LabelClass;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total bytes of chips written to the tifs directory
    pub bytes_downloaded: AtomicU64,

    /// Chips fetched successfully
    pub chips_fetched: AtomicU64,

    /// Requests for which no chip could be fetched
    pub chips_unavailable: AtomicU64,

    /// Chips classified as the target class
    pub labeled_target: AtomicU64,

    /// Chips classified as the none class
    pub labeled_none: AtomicU64,

    /// Chips whose label derivation or transcode failed
    pub label_failures: AtomicU64,

    /// Requests left unprocessed when the pipeline drained
    pub deferred: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time spent fetching chips (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent deriving labels (microseconds)
    pub label_us: AtomicU64,

    /// Time spent in the transcoder (microseconds)
    pub transcode_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a fetched chip and its size.
    pub fn add_fetched(&self, bytes: u64) {
        self.chips_fetched.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an unavailable chip.
    pub fn add_unavailable(&self) {
        self.chips_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a labeled chip.
    pub fn add_labeled(&self, class: LabelClass) {
        match class {
            LabelClass::Target => self.labeled_target.fetch_add(1, Ordering::Relaxed),
            LabelClass::None => self.labeled_none.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a labeling failure.
    pub fn add_label_failure(&self) {
        self.label_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deferred request.
    pub fn add_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent fetching (in microseconds).
    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent deriving labels (in microseconds).
    pub fn add_label_time(&self, duration: Duration) {
        self.label_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent transcoding (in microseconds).
    pub fn add_transcode_time(&self, duration: Duration) {
        self.transcode_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get download throughput in MB/s.
    pub fn download_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    /// Get labeled chips per second.
    pub fn chips_per_second(&self) -> f64 {
        let labeled = self.labeled_target.load(Ordering::Relaxed) + self.labeled_none.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            labeled as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let fetch_us = self.fetch_us.load(Ordering::Relaxed);
        let label_us = self.label_us.load(Ordering::Relaxed);
        let transcode_us = self.transcode_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            chips_fetched: self.chips_fetched.load(Ordering::Relaxed),
            chips_unavailable: self.chips_unavailable.load(Ordering::Relaxed),
            labeled_target: self.labeled_target.load(Ordering::Relaxed),
            labeled_none: self.labeled_none.load(Ordering::Relaxed),
            label_failures: self.label_failures.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            download_throughput_mbps: self.download_throughput_mbps(),
            chips_per_second: self.chips_per_second(),
            fetch_secs: fetch_us as f64 / 1_000_000.0,
            label_secs: label_us as f64 / 1_000_000.0,
            transcode_secs: transcode_us as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_downloaded: u64,
    pub chips_fetched: u64,
    pub chips_unavailable: u64,
    pub labeled_target: u64,
    pub labeled_none: u64,
    pub label_failures: u64,
    pub deferred: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub download_throughput_mbps: f64,
    pub chips_per_second: f64,
    /// Total time spent fetching (seconds, summed across workers)
    pub fetch_secs: f64,
    /// Total time spent deriving labels (seconds)
    pub label_secs: f64,
    /// Total time spent in the transcoder (seconds)
    pub transcode_secs: f64,
}

impl MetricsSnapshot {
    /// Requests that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.labeled_target + self.labeled_none + self.chips_unavailable + self.label_failures + self.deferred
    }

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
        let total_component_time = self.fetch_secs + self.label_secs + self.transcode_secs;
        let (fetch_pct, label_pct, transcode_pct) = if total_component_time > 0.0 {
            (
                self.fetch_secs / total_component_time * 100.0,
                self.label_secs / total_component_time * 100.0,
                self.transcode_secs / total_component_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Chips: {} fetched, {} unavailable | Labeled: {} target, {} none | \
             Failures: {} | Deferred: {} | \
             Download: {:.1} MB @ {:.2} MB/s | Rate: {:.2} chips/s | Elapsed: {:.1}s | \
             Time: fetch {:.0}% | label {:.0}% | transcode {:.0}%",
            self.chips_fetched,
            self.chips_unavailable,
            self.labeled_target,
            self.labeled_none,
            self.label_failures,
            self.deferred,
            self.bytes_downloaded as f64 / (1024.0 * 1024.0),
            self.download_throughput_mbps,
            self.chips_per_second,
            self.elapsed.as_secs_f64(),
            fetch_pct,
            label_pct,
            transcode_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_requests: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_requests: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_requests,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_requests > 0 {
                        snapshot.settled() as f64 / self.total_requests as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!(
                        "[{:.1}%] {}",
                        progress,
                        snapshot
                    );
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

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Requests: {}", self.total_requests);
        println!("Chips fetched: {}", snapshot.chips_fetched);
        println!("Chips unavailable: {}", snapshot.chips_unavailable);
        println!("Labeled target: {}", snapshot.labeled_target);
        println!("Labeled none: {}", snapshot.labeled_none);
        println!("Label failures: {}", snapshot.label_failures);
        println!("Deferred: {}", snapshot.deferred);
        println!(
            "Data downloaded: {:.2} MB",
            snapshot.bytes_downloaded as f64 / (1024.0 * 1024.0)
        );
        println!("Download throughput: {:.2} MB/s", snapshot.download_throughput_mbps);
        println!("Processing rate: {:.2} chips/s", snapshot.chips_per_second);

        let total_component = snapshot.fetch_secs + snapshot.label_secs + snapshot.transcode_secs;
        if total_component > 0.0 {
            println!("\n--- Component Time Breakdown ---");
            println!("Fetch:       {:>7.1}s ({:>5.1}%)", snapshot.fetch_secs, snapshot.fetch_secs / total_component * 100.0);
            println!("Label:       {:>7.1}s ({:>5.1}%)", snapshot.label_secs, snapshot.label_secs / total_component * 100.0);
            println!("Transcode:   {:>7.1}s ({:>5.1}%)", snapshot.transcode_secs, snapshot.transcode_secs / total_component * 100.0);
        }
        println!("========================\n");
    }
}
