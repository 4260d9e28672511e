//! Pipeline orchestration: download queue, label queue and error sink.

mod download;
mod error_log;
mod labeling;
mod metrics;
mod stages;
mod types;


pub use download::DownloadStage;
pub use error_log::ErrorLog;
pub use labeling::LabelStage;
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use stages::{Pipeline, PipelineConfig, PipelineReport, PipelineStats};
pub use types::{FailureKind, FailureRecord, FetchOutcome, FetchRequest, LabelResult, OutputLayout, Stage};
