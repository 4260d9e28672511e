//! POI Chipper
//!
//! Downloads satellite image chips around points of interest and sorts them
//! into a labeled training set, without ever filling the output disk.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Index**: point-of-interest reader and an R-tree of label geometries
//! - **Fetch**: chip retrieval from the IDAHO chip service
//! - **Label**: mask rasterization, classification and transcoding
//! - **Disk**: free-space admission gate shared by every stage
//! - **Pipeline**: bounded download and label queues with metrics
//!
//! # Usage
//!
//! ```no_run
//! use poi_chipper::{Config, run_pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_pipeline(config, CancellationToken::new()).await?;
//!     println!("{}", report.stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crs;
pub mod disk;
pub mod fetch;
pub mod index;
pub mod label;
pub mod pipeline;

pub use config::Config;
pub use disk::{DiskBudgetGate, SpaceProbe, SystemSpaceProbe};
pub use fetch::{ChipFetcher, ChipSpec, IdahoFetcher};
pub use index::{LabelIndex, PointOfInterest, PoiTable};
pub use label::{GdalTranslate, LabelDeriver, Transcoder};
pub use pipeline::{Metrics, Pipeline, PipelineConfig, PipelineReport, PipelineStats};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pipeline::{MetricsReporter, OutputLayout};

/// Run the full chip pipeline with the given configuration.
///
/// Cancelling `drain` stops intake; everything not yet processed is
/// reported as deferred.
pub async fn run_pipeline(config: Config, drain: CancellationToken) -> Result<PipelineReport> {
    // Validate configuration
    config.validate()?;

    tracing::info!("Starting POI chip pipeline");

    let poi_path = config
        .input
        .poi_path
        .clone()
        .context("No point-of-interest file configured")?;
    let label_path = config
        .label_path()
        .map(Path::to_path_buf)
        .context("No label file configured")?;

    prepare_output_root(&config.output.root)?;

    // Read points and labels once, up front
    let columns = config.input.columns;
    let points = tokio::task::spawn_blocking(move || index::read_points(&poi_path, &columns))
        .await
        .context("Point-of-interest reader panicked")??;

    let fallback_crs = config.labels.crs.clone();
    let labels = tokio::task::spawn_blocking(move || LabelIndex::load(&label_path, &fallback_crs))
        .await
        .context("Label reader panicked")??;

    let fetcher = Arc::new(IdahoFetcher::from_env(&config.fetch)?);
    let transcoder = Arc::new(GdalTranslate::new(config.labels.transcoder.clone()));

    let gate = DiskBudgetGate::new(Arc::new(SystemSpaceProbe), &config.output.root, &config.disk);
    match gate.free_space() {
        Ok(free) => tracing::info!(
            "Free space on output filesystem: {:.1} GB (floor {:.1} GB)",
            free as f64 / 1e9,
            config.disk.min_free_bytes as f64 / 1e9
        ),
        Err(e) => tracing::warn!("Could not probe free space: {:#}", e),
    }

    let deriver = LabelDeriver::new(labels).with_chip_fallback_crs(config.labels.chip_crs.clone());

    run_pipeline_with(&config, points, deriver, fetcher, transcoder, gate, drain).await
}

/// Run the pipeline over already loaded inputs and injected collaborators.
pub async fn run_pipeline_with(
    config: &Config,
    points: PoiTable,
    deriver: LabelDeriver,
    fetcher: Arc<dyn ChipFetcher>,
    transcoder: Arc<dyn Transcoder>,
    gate: DiskBudgetGate,
    drain: CancellationToken,
) -> Result<PipelineReport> {
    let metrics = Metrics::new();
    let total_requests = points.len() as u64;

    // Start metrics reporter if enabled
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            total_requests,
        );
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        None
    };

    let pipeline = Pipeline::new(
        fetcher,
        Arc::new(deriver),
        transcoder,
        Arc::new(gate),
        OutputLayout::from_config(config),
        metrics.clone(),
        PipelineConfig::from_config(config),
    );

    let result = pipeline.run(points.points, drain).await;

    // Stop metrics reporter
    if let Some(handle) = reporter_handle {
        let _ = shutdown_tx.send(()).await;
        let _ = handle.await;
    }

    let mut report = result?;
    report.stats.rejected_rows = points.rejected;

    if config.processing.enable_metrics {
        MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs, total_requests)
            .print_summary();
    }

    if let Some(path) = &config.processing.metrics_output_path {
        metrics.snapshot().save_to_file(path)?;
    }

    tracing::info!("Pipeline complete: {}", report.stats);

    Ok(report)
}

/// Create the output root and make sure it is writable.
fn prepare_output_root(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create output root {}", root.display()))?;

    let probe = root.join(".poi-chipper-write-check");
    std::fs::write(&probe, b"")
        .with_context(|| format!("Output root {} is not writable", root.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
