//! The error sink: failure records collected during a run, flushed once.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::sync::mpsc;

use super::types::FailureRecord;

/// Failure records of one run, split by destination log.
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: Vec<FailureRecord>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    /// Receive every record until all senders are gone.
    pub async fn collect(mut rx: mpsc::UnboundedReceiver<FailureRecord>) -> Self {
        let mut log = Self::new();
        while let Some(record) = rx.recv().await {
            log.push(record);
        }
        log
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FailureRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write unavailable requests to `unavailable_path` and every other
    /// failure to `label_failure_path`, one record per line.
    ///
    /// Both files are truncated. The label failure log only exists when
    /// there is something to report; a log left by an earlier run is removed.
    pub async fn flush(&self, unavailable_path: &Path, label_failure_path: &Path) -> Result<()> {
        let (unavailable, other): (Vec<&FailureRecord>, Vec<&FailureRecord>) =
            self.records.iter().partition(|r| r.is_unavailable());

        write_lines(unavailable_path, &unavailable).await?;
        tracing::info!(
            "Wrote {} unavailable requests to {}",
            unavailable.len(),
            unavailable_path.display()
        );

        if other.is_empty() {
            match tokio::fs::remove_file(label_failure_path).await {
                Ok(()) => tracing::info!("Removed stale {}", label_failure_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", label_failure_path.display()))
                }
            }
            return Ok(());
        }

        write_lines(label_failure_path, &other).await?;
        tracing::info!(
            "Wrote {} labeling failures and deferred requests to {}",
            other.len(),
            label_failure_path.display()
        );
        Ok(())
    }
}

async fn write_lines(path: &Path, records: &[&FailureRecord]) -> Result<()> {
    let mut contents = String::new();
    for record in records {
        contents.push_str(&record.log_line());
        contents.push('\n');
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
