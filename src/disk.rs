//! Disk-space admission control.
//!
//! Every stage asks the [`DiskBudgetGate`] for admission before it takes the
//! next item off its queue. Under budget the gate parks the caller and polls
//! the filesystem at a fixed interval until space frees up or the pipeline
//! is told to drain.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

use crate::config::DiskConfig;

/// Reports free space on the filesystem holding a path.
///
/// Implementations must not cache: space changes as the pipeline writes.
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by the operating system's mounted disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn free_space(&self, path: &Path) -> Result<u64> {
        let path = path
            .canonicalize()
            .with_context(|| format!("Cannot resolve {}", path.display()))?;

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .with_context(|| format!("No mounted filesystem contains {}", path.display()))
    }
}

/// Result of asking the gate for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enough space: take the next item.
    Granted,
    /// The pipeline is draining: take nothing more.
    Drained,
}

/// Blocks intake while the output filesystem is below its free-space floor.
pub struct DiskBudgetGate {
    probe: Arc<dyn SpaceProbe>,
    root: PathBuf,
    min_free_bytes: u64,
    poll_interval: Duration,
    max_wait: Option<Duration>,
}

impl DiskBudgetGate {
    pub fn new(probe: Arc<dyn SpaceProbe>, root: impl Into<PathBuf>, config: &DiskConfig) -> Self {
        Self {
            probe,
            root: root.into(),
            min_free_bytes: config.min_free_bytes,
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait(),
        }
    }

    /// Override the poll interval (tests use milliseconds).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override how long the gate waits under budget before draining.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Current free bytes on the output filesystem.
    pub fn free_space(&self) -> Result<u64> {
        self.probe.free_space(&self.root)
    }

    /// Whether a new unit of work may start right now.
    pub fn has_budget(&self) -> bool {
        match self.free_space() {
            Ok(free) => free > self.min_free_bytes,
            Err(e) => {
                tracing::warn!("Free-space probe failed for {}: {:#}", self.root.display(), e);
                false
            }
        }
    }

    /// Wait until there is budget for one more unit of work.
    ///
    /// Returns [`Admission::Drained`] as soon as `drain` is cancelled. When
    /// `max_wait` is set and the filesystem stays under budget that long,
    /// the gate cancels `drain` itself.
    pub async fn admit(&self, drain: &CancellationToken) -> Admission {
        let mut waiting_since: Option<Instant> = None;

        loop {
            if drain.is_cancelled() {
                return Admission::Drained;
            }

            if self.has_budget() {
                if let Some(since) = waiting_since {
                    tracing::info!(
                        "Disk space recovered after {:.1}s, resuming intake",
                        since.elapsed().as_secs_f64()
                    );
                }
                return Admission::Granted;
            }

            let since = *waiting_since.get_or_insert_with(|| {
                tracing::warn!(
                    "Free space on {} is below {} bytes, pausing intake",
                    self.root.display(),
                    self.min_free_bytes
                );
                Instant::now()
            });

            if let Some(max_wait) = self.max_wait {
                if since.elapsed() >= max_wait {
                    tracing::warn!(
                        "Disk still under budget after {:.1}s, draining pipeline",
                        since.elapsed().as_secs_f64()
                    );
                    drain.cancel();
                    return Admission::Drained;
                }
            }

            tokio::select! {
                _ = drain.cancelled() => return Admission::Drained,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
