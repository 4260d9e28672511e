//! Pipeline coordinator: two bounded queues, two worker pools, one error sink.
//!
//! ```text
//!                 download queue               label queue
//! ┌────────────┐  (bounded, MPMC)  ┌──────────┐ (bounded) ┌──────────┐
//! │ Coordinator│──────────────────▶│ Download │──────────▶│  Label   │
//! │   (feed)   │                   │ workers  │           │  worker  │
//! └────────────┘                   └──────────┘           └──────────┘
//!                                       │                      │
//!                                       └──── error sink ◀─────┘
//!                                            (unbounded)
//! ```
//!
//! Every worker asks the disk budget gate before taking an item. A full label
//! queue blocks the download workers, so labeling speed bounds download rate.
//!
//! Drain: when the drain token is cancelled (disk exhausted or Ctrl-C) the
//! download queue is closed, workers stop taking items, and every request
//! still queued becomes a `Deferred` record. Each enqueued request ends as
//! exactly one `LabelResult` or one `FailureRecord`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::download::DownloadStage;
use super::error_log::ErrorLog;
use super::labeling::LabelStage;
use super::metrics::Metrics;
use super::types::{FailureKind, FailureRecord, FetchOutcome, FetchRequest, LabelResult, OutputLayout, Stage};
use crate::config::Config;
use crate::disk::DiskBudgetGate;
use crate::fetch::{ChipFetcher, ChipSpec};
use crate::index::PointOfInterest;
use crate::label::{LabelClass, LabelDeriver, Transcoder};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent download workers
    pub download_concurrency: usize,
    /// Capacity of the download queue
    pub download_buffer: usize,
    /// Capacity of the label queue
    pub label_buffer: usize,
    /// Chip size, type and format requested from the fetcher
    pub chip: ChipSpec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 1,
            download_buffer: 64,
            label_buffer: 16,
            chip: ChipSpec::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_concurrency: config.processing.download_concurrency,
            download_buffer: config.processing.download_buffer,
            label_buffer: config.processing.label_buffer,
            chip: ChipSpec::from_config(&config.fetch),
        }
    }
}

/// Pipeline executor.
pub struct Pipeline {
    download: DownloadStage,
    label: Arc<LabelStage>,
    layout: OutputLayout,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline.
    pub fn new(
        fetcher: Arc<dyn ChipFetcher>,
        deriver: Arc<LabelDeriver>,
        transcoder: Arc<dyn Transcoder>,
        gate: Arc<DiskBudgetGate>,
        layout: OutputLayout,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        let download = DownloadStage::new(fetcher, Arc::clone(&gate), config.chip, Arc::clone(&metrics));
        let label = Arc::new(LabelStage::new(
            deriver,
            transcoder,
            gate,
            layout.clone(),
            Arc::clone(&metrics),
        ));

        Self {
            download,
            label,
            layout,
            metrics,
            config,
        }
    }

    /// Run every point of interest through download and labeling.
    ///
    /// Returns once both queues are empty and both logs are written.
    pub async fn run(&self, points: Vec<PointOfInterest>, drain: CancellationToken) -> Result<PipelineReport> {
        let tifs_dir = self.layout.tifs_dir();
        tokio::fs::create_dir_all(&tifs_dir)
            .await
            .with_context(|| format!("Failed to create {}", tifs_dir.display()))?;

        let requests: Vec<FetchRequest> = points
            .into_iter()
            .map(|poi| FetchRequest::new(poi, &tifs_dir, self.config.chip.format))
            .collect();
        let total_requests = requests.len();

        tracing::info!(
            "Processing {} requests with {} download workers",
            total_requests,
            self.config.download_concurrency
        );

        // Create channels between stages
        let (work_tx, work_rx) = async_channel::bounded::<FetchRequest>(self.config.download_buffer.max(1));
        let (label_tx, label_rx) = mpsc::channel::<FetchOutcome>(self.config.label_buffer.max(1));
        let (error_tx, error_rx) = mpsc::unbounded_channel::<FailureRecord>();

        let error_handle = tokio::spawn(ErrorLog::collect(error_rx));

        let label_handle = {
            let stage = Arc::clone(&self.label);
            let error_tx = error_tx.clone();
            let drain = drain.clone();
            tokio::spawn(async move { stage.run(label_rx, error_tx, drain).await })
        };

        let download_handles = self.download.spawn_workers(
            self.config.download_concurrency,
            work_rx.clone(),
            label_tx,
            error_tx.clone(),
            drain.clone(),
        );

        // Closing the queue wakes the feeder if it is blocked on a full queue
        let closer = {
            let work_rx = work_rx.clone();
            let drain = drain.clone();
            tokio::spawn(async move {
                drain.cancelled().await;
                work_rx.close();
            })
        };

        self.feed(requests, work_tx, &error_tx).await;

        for result in futures::future::join_all(download_handles).await {
            if let Err(e) = result {
                tracing::error!("Download worker failed: {}", e);
            }
        }

        work_rx.close();
        let mut leftover = 0usize;
        while let Ok(request) = work_rx.try_recv() {
            self.defer(request, Stage::Download, &error_tx);
            leftover += 1;
        }
        if leftover > 0 {
            tracing::warn!("Deferred {} requests still in the download queue", leftover);
        }

        let results = label_handle.await.context("Label worker failed")?;
        closer.abort();

        drop(error_tx);
        let error_log = error_handle.await.context("Error sink failed")?;
        error_log
            .flush(&self.layout.error_log, &self.layout.label_failure_log)
            .await?;

        let failures = error_log.into_records();
        let stats = PipelineStats::tally(total_requests, &results, &failures);
        if !stats.is_balanced() {
            tracing::error!("Outcome accounting mismatch: {}", stats);
        }

        Ok(PipelineReport {
            stats,
            results,
            failures,
        })
    }

    /// Enqueue every request; once the queue is closed the rest is deferred.
    async fn feed(
        &self,
        requests: Vec<FetchRequest>,
        work_tx: async_channel::Sender<FetchRequest>,
        error_tx: &mpsc::UnboundedSender<FailureRecord>,
    ) {
        let mut pending = requests.into_iter();
        while let Some(request) = pending.next() {
            if let Err(async_channel::SendError(request)) = work_tx.send(request).await {
                tracing::warn!(
                    "Download queue closed, deferring {} requests not yet enqueued",
                    pending.len() + 1
                );
                for request in std::iter::once(request).chain(pending) {
                    self.defer(request, Stage::Download, error_tx);
                }
                break;
            }
        }
        tracing::debug!("Feeder finished");
    }

    fn defer(&self, request: FetchRequest, stage: Stage, error_tx: &mpsc::UnboundedSender<FailureRecord>) {
        self.metrics.add_deferred();
        let _ = error_tx.send(FailureRecord::deferred(request, stage));
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct PipelineReport {
    pub stats: PipelineStats,
    pub results: Vec<LabelResult>,
    pub failures: Vec<FailureRecord>,
}

/// Statistics from pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub total_requests: usize,
    pub labeled_target: usize,
    pub labeled_none: usize,
    pub unavailable: usize,
    pub label_failed: usize,
    pub deferred: usize,
    /// Input rows dropped before any request was built
    pub rejected_rows: usize,
}

impl PipelineStats {
    /// Count terminal outcomes.
    pub fn tally(total_requests: usize, results: &[LabelResult], failures: &[FailureRecord]) -> Self {
        let mut stats = Self {
            total_requests,
            ..Default::default()
        };
        for result in results {
            match result.class {
                LabelClass::Target => stats.labeled_target += 1,
                LabelClass::None => stats.labeled_none += 1,
            }
        }
        for failure in failures {
            match failure.kind {
                FailureKind::Unavailable(_) => stats.unavailable += 1,
                FailureKind::LabelFailed(_) => stats.label_failed += 1,
                FailureKind::Deferred(_) => stats.deferred += 1,
            }
        }
        stats
    }

    pub fn labeled(&self) -> usize {
        self.labeled_target + self.labeled_none
    }

    /// Whether every request has exactly one terminal outcome.
    pub fn is_balanced(&self) -> bool {
        self.labeled() + self.unavailable + self.label_failed + self.deferred == self.total_requests
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Labeled: {} ({} target, {} none), Unavailable: {}, Label failures: {}, Deferred: {}, Total: {}",
            self.labeled(),
            self.labeled_target,
            self.labeled_none,
            self.unavailable,
            self.label_failed,
            self.deferred,
            self.total_requests
        )?;
        if self.rejected_rows > 0 {
            write!(f, ", Rejected rows: {}", self.rejected_rows)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ChipFormat;
    use std::path::{Path, PathBuf};

    fn request(index: usize) -> FetchRequest {
        FetchRequest::new(
            PointOfInterest {
                catalog_id: "cat".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                sequence_index: index,
            },
            Path::new("tifs"),
            ChipFormat::Tif,
        )
    }

    fn result(class: LabelClass) -> LabelResult {
        LabelResult {
            image_path: PathBuf::from("image.png"),
            label_mask_path: PathBuf::from("mask.png"),
            class,
        }
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.download_concurrency, 1);
        assert_eq!(config.download_buffer, 64);
        assert_eq!(config.label_buffer, 16);
        assert_eq!(config.chip, ChipSpec::default());
    }

    #[test]
    fn test_pipeline_config_from_config() {
        let mut config = Config::default();
        config.processing.download_concurrency = 6;
        config.processing.label_buffer = 3;

        let pipeline_config = PipelineConfig::from_config(&config);
        assert_eq!(pipeline_config.download_concurrency, 6);
        assert_eq!(pipeline_config.label_buffer, 3);
    }

    #[test]
    fn test_stats_tally_and_balance() {
        let results = vec![result(LabelClass::Target), result(LabelClass::None), result(LabelClass::None)];
        let failures = vec![
            FailureRecord::unavailable(request(3), "404"),
            FailureRecord::label_failed(request(4), "bad chip"),
            FailureRecord::deferred(request(5), Stage::Download),
        ];

        let stats = PipelineStats::tally(6, &results, &failures);
        assert_eq!(stats.labeled_target, 1);
        assert_eq!(stats.labeled_none, 2);
        assert_eq!(stats.unavailable, 1);
        assert_eq!(stats.label_failed, 1);
        assert_eq!(stats.deferred, 1);
        assert!(stats.is_balanced());

        let short = PipelineStats::tally(7, &results, &failures);
        assert!(!short.is_balanced());
    }

    #[test]
    fn test_stats_display() {
        let stats = PipelineStats {
            total_requests: 10,
            labeled_target: 2,
            labeled_none: 5,
            unavailable: 3,
            ..Default::default()
        };
        let display = stats.to_string();
        assert!(display.contains("Labeled: 7 (2 target, 5 none)"));
        assert!(display.contains("Unavailable: 3"));
        assert!(!display.contains("Rejected"));

        let stats = PipelineStats {
            rejected_rows: 4,
            ..stats
        };
        assert!(stats.to_string().ends_with("Rejected rows: 4"));
    }
}
