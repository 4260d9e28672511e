//! Label stage: a single worker deriving masks and transcoding chips.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::metrics::Metrics;
use super::types::{FailureRecord, FetchOutcome, FetchRequest, LabelResult, OutputLayout, Stage};
use crate::disk::{Admission, DiskBudgetGate};
use crate::fetch::partial_path;
use crate::label::{raster, LabelClass, LabelDeriver, Transcoder};

/// Turns fetched chips into classified image/label pairs.
pub struct LabelStage {
    deriver: Arc<LabelDeriver>,
    transcoder: Arc<dyn Transcoder>,
    gate: Arc<DiskBudgetGate>,
    layout: OutputLayout,
    metrics: Arc<Metrics>,
}

impl LabelStage {
    pub fn new(
        deriver: Arc<LabelDeriver>,
        transcoder: Arc<dyn Transcoder>,
        gate: Arc<DiskBudgetGate>,
        layout: OutputLayout,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            deriver,
            transcoder,
            gate,
            layout,
            metrics,
        }
    }

    /// Label one chip: write its mask, then the transcoded image.
    ///
    /// The image is transcoded to a partial file and renamed into place. On
    /// transcoder failure the mask and any older image under the same stem
    /// are removed, so the chip leaves no half pair behind.
    pub async fn process(&self, chip_path: &Path) -> Result<LabelResult> {
        let stem = chip_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("Chip path {} has no file stem", chip_path.display()))?;

        let start = Instant::now();
        let deriver = Arc::clone(&self.deriver);
        let layout = self.layout.clone();
        let chip = chip_path.to_path_buf();
        let mask_stem = stem.clone();
        let (class, mask_path) = tokio::task::spawn_blocking(move || -> Result<(LabelClass, PathBuf)> {
            let label = deriver.derive(&chip)?;

            // A re-run may have sorted this chip into the other class
            let other = label.class.other();
            remove_if_present(&layout.image_path(other, &mask_stem))?;
            remove_if_present(&layout.mask_path(other, &mask_stem))?;

            let label_dir = layout.label_dir(label.class);
            std::fs::create_dir_all(&label_dir)
                .with_context(|| format!("Failed to create {}", label_dir.display()))?;

            let mask_path = layout.mask_path(label.class, &mask_stem);
            raster::write_mask_png(&label.mask, &mask_path)?;
            Ok((label.class, mask_path))
        })
        .await
        .context("Label task panicked")??;
        self.metrics.add_label_time(start.elapsed());

        let data_dir = self.layout.data_dir(class);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let image_path = self.layout.image_path(class, &stem);
        let partial = partial_path(&image_path);
        let start = Instant::now();
        let transcoded = match self.transcoder.transcode(chip_path, &partial).await {
            Ok(()) => tokio::fs::rename(&partial, &image_path)
                .await
                .with_context(|| format!("Failed to move {} into place", partial.display())),
            Err(e) => Err(e),
        };
        self.metrics.add_transcode_time(start.elapsed());

        if let Err(e) = transcoded {
            for path in [&partial, &image_path, &mask_path] {
                if let Err(remove_err) = tokio::fs::remove_file(path).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", path.display(), remove_err);
                    }
                }
            }
            return Err(e.context(format!("Failed to transcode {}", chip_path.display())));
        }

        Ok(LabelResult {
            image_path,
            label_mask_path: mask_path,
            class,
        })
    }

    /// Consume the label queue until it closes or the pipeline drains.
    ///
    /// On drain the queue is closed and everything still buffered becomes a
    /// deferred record.
    pub async fn run(
        &self,
        mut label_rx: mpsc::Receiver<FetchOutcome>,
        error_tx: mpsc::UnboundedSender<FailureRecord>,
        drain: CancellationToken,
    ) -> Vec<LabelResult> {
        let mut results = Vec::new();

        loop {
            if self.gate.admit(&drain).await == Admission::Drained {
                tracing::debug!("Label worker draining");
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                next = label_rx.recv() => match next {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            match outcome {
                FetchOutcome::Fetched { chip_path, request } => match self.process(&chip_path).await {
                    Ok(result) => {
                        self.metrics.add_labeled(result.class);
                        tracing::info!(
                            "Labeled chip {} as {}",
                            request.poi.sequence_index,
                            result.class
                        );
                        results.push(result);
                    }
                    Err(e) => {
                        self.metrics.add_label_failure();
                        tracing::warn!("Labeling failed for {}: {:#}", chip_path.display(), e);
                        let _ = error_tx.send(FailureRecord::label_failed(request, format!("{:#}", e)));
                    }
                },
                FetchOutcome::Unavailable { request, reason } => {
                    let _ = error_tx.send(FailureRecord::unavailable(request, reason));
                }
            }
        }

        label_rx.close();
        while let Some(outcome) = label_rx.recv().await {
            self.defer(outcome.into_request(), &error_tx);
        }

        results
    }

    fn defer(&self, request: FetchRequest, error_tx: &mpsc::UnboundedSender<FailureRecord>) {
        self.metrics.add_deferred();
        let _ = error_tx.send(FailureRecord::deferred(request, Stage::Label));
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
