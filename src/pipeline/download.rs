//! Download stage: N workers pulling requests off the bounded download queue.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::metrics::Metrics;
use super::types::{FailureRecord, FetchOutcome, FetchRequest, Stage};
use crate::disk::{Admission, DiskBudgetGate};
use crate::fetch::{ChipFetcher, ChipSpec};

/// Fetches chips and hands them to the label queue.
#[derive(Clone)]
pub struct DownloadStage {
    fetcher: Arc<dyn ChipFetcher>,
    gate: Arc<DiskBudgetGate>,
    spec: ChipSpec,
    metrics: Arc<Metrics>,
}

impl DownloadStage {
    pub fn new(
        fetcher: Arc<dyn ChipFetcher>,
        gate: Arc<DiskBudgetGate>,
        spec: ChipSpec,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fetcher,
            gate,
            spec,
            metrics,
        }
    }

    /// Fetch one chip. Never retried.
    pub async fn process(&self, request: FetchRequest) -> FetchOutcome {
        let start = Instant::now();
        let result = self
            .fetcher
            .fetch(&request.poi, &self.spec, &request.destination)
            .await;
        self.metrics.add_fetch_time(start.elapsed());

        match result {
            Ok(()) => {
                let bytes = tokio::fs::metadata(&request.destination)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                self.metrics.add_fetched(bytes);
                tracing::info!(
                    "Fetched chip {} for {} ({} bytes)",
                    request.poi.sequence_index,
                    request.poi.catalog_id,
                    bytes
                );
                FetchOutcome::Fetched {
                    chip_path: request.destination.clone(),
                    request,
                }
            }
            Err(e) => {
                self.metrics.add_unavailable();
                tracing::warn!(
                    "No chip for {} at ({}, {}): {}",
                    request.poi.catalog_id,
                    request.poi.latitude,
                    request.poi.longitude,
                    e
                );
                FetchOutcome::Unavailable {
                    request,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Spawn `count` workers sharing one download queue.
    pub fn spawn_workers(
        &self,
        count: usize,
        work_rx: async_channel::Receiver<FetchRequest>,
        label_tx: mpsc::Sender<FetchOutcome>,
        error_tx: mpsc::UnboundedSender<FailureRecord>,
        drain: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker_id| {
                let stage = self.clone();
                let work_rx = work_rx.clone();
                let label_tx = label_tx.clone();
                let error_tx = error_tx.clone();
                let drain = drain.clone();
                tokio::spawn(async move {
                    stage.run_worker(worker_id, work_rx, label_tx, error_tx, drain).await;
                })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        worker_id: usize,
        work_rx: async_channel::Receiver<FetchRequest>,
        label_tx: mpsc::Sender<FetchOutcome>,
        error_tx: mpsc::UnboundedSender<FailureRecord>,
        drain: CancellationToken,
    ) {
        loop {
            if self.gate.admit(&drain).await == Admission::Drained {
                tracing::debug!("Download worker {} draining", worker_id);
                break;
            }

            let request = tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                next = work_rx.recv() => match next {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };

            match self.process(request).await {
                FetchOutcome::Unavailable { request, reason } => {
                    let _ = error_tx.send(FailureRecord::unavailable(request, reason));
                }
                fetched => {
                    // Blocks while the label queue is full
                    if let Err(mpsc::error::SendError(outcome)) = label_tx.send(fetched).await {
                        tracing::debug!("Label queue closed, deferring chip");
                        self.metrics.add_deferred();
                        let _ = error_tx.send(FailureRecord::deferred(outcome.into_request(), Stage::Label));
                    }
                }
            }
        }

        tracing::debug!("Download worker {} finished", worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::disk::SpaceProbe;
    use crate::fetch::FetchError;
    use crate::index::PointOfInterest;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PlentyOfSpace;

    impl SpaceProbe for PlentyOfSpace {
        fn free_space(&self, _path: &Path) -> anyhow::Result<u64> {
            Ok(u64::MAX)
        }
    }

    /// Writes a few bytes, or fails for catalog ids starting with "missing".
    #[derive(Default)]
    struct StubFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChipFetcher for StubFetcher {
        async fn fetch(&self, poi: &PointOfInterest, _spec: &ChipSpec, destination: &Path) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if poi.catalog_id.starts_with("missing") {
                return Err(FetchError::Status { status: 404 });
            }
            crate::fetch::write_atomic(destination, b"chip").await?;
            Ok(())
        }
    }

    fn request(dir: &Path, catalog_id: &str, index: usize) -> FetchRequest {
        FetchRequest::new(
            PointOfInterest {
                catalog_id: catalog_id.to_string(),
                latitude: 10.0,
                longitude: 20.0,
                sequence_index: index,
            },
            dir,
            crate::fetch::ChipFormat::Tif,
        )
    }

    fn stage(fetcher: Arc<StubFetcher>, dir: &Path) -> DownloadStage {
        let gate = DiskBudgetGate::new(Arc::new(PlentyOfSpace), dir, &DiskConfig::default());
        DownloadStage::new(fetcher, Arc::new(gate), ChipSpec::default(), Metrics::new())
    }

    #[tokio::test]
    async fn test_process_fetched_and_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let stage = stage(Arc::new(StubFetcher::default()), dir.path());

        match stage.process(request(dir.path(), "abc", 0)).await {
            FetchOutcome::Fetched { chip_path, .. } => assert!(chip_path.exists()),
            other => panic!("unexpected {:?}", other),
        }
        match stage.process(request(dir.path(), "missing", 1)).await {
            FetchOutcome::Unavailable { reason, .. } => assert!(reason.contains("404")),
            other => panic!("unexpected {:?}", other),
        }

        let snapshot = stage.metrics.snapshot();
        assert_eq!(snapshot.chips_fetched, 1);
        assert_eq!(snapshot.chips_unavailable, 1);
        assert_eq!(snapshot.bytes_downloaded, 4);
    }

    #[tokio::test]
    async fn test_workers_route_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StubFetcher::default());
        let stage = stage(fetcher.clone(), dir.path());

        let (work_tx, work_rx) = async_channel::bounded(4);
        let (label_tx, mut label_rx) = mpsc::channel(8);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();

        let handles = stage.spawn_workers(2, work_rx, label_tx, error_tx, CancellationToken::new());
        for (i, id) in ["a", "missing-b", "c"].iter().enumerate() {
            work_tx.send(request(dir.path(), id, i)).await.unwrap();
        }
        drop(work_tx);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut fetched = Vec::new();
        while let Some(outcome) = label_rx.recv().await {
            fetched.push(outcome.request().poi.catalog_id.clone());
        }
        fetched.sort();
        assert_eq!(fetched, vec!["a", "c"]);

        let failure = error_rx.recv().await.unwrap();
        assert_eq!(failure.request.poi.catalog_id, "missing-b");
        assert!(failure.is_unavailable());
        assert!(error_rx.recv().await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_label_queue_defers() {
        let dir = tempfile::tempdir().unwrap();
        let stage = stage(Arc::new(StubFetcher::default()), dir.path());

        let (work_tx, work_rx) = async_channel::bounded(1);
        let (label_tx, mut label_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        label_rx.close();

        let handles = stage.spawn_workers(1, work_rx, label_tx, error_tx, CancellationToken::new());
        work_tx.send(request(dir.path(), "a", 0)).await.unwrap();
        drop(work_tx);
        for handle in handles {
            handle.await.unwrap();
        }

        let failure = error_rx.recv().await.unwrap();
        assert_eq!(failure.kind, crate::pipeline::FailureKind::Deferred(Stage::Label));
    }

    #[tokio::test]
    async fn test_drained_workers_take_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(StubFetcher::default());
        let stage = stage(fetcher.clone(), dir.path());

        let (work_tx, work_rx) = async_channel::bounded(4);
        let (label_tx, _label_rx) = mpsc::channel(1);
        let (error_tx, _error_rx) = mpsc::unbounded_channel();
        work_tx.send(request(dir.path(), "a", 0)).await.unwrap();

        let drain = CancellationToken::new();
        drain.cancel();
        for handle in stage.spawn_workers(3, work_rx.clone(), label_tx, error_tx, drain) {
            handle.await.unwrap();
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(work_rx.len(), 1);
    }
}
