//! Configuration for the chip pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetch::{ChipFormat, ChipType};

/// Main configuration for the chip pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Point-of-interest source
    #[serde(default)]
    pub input: InputConfig,

    /// Output tree layout
    #[serde(default)]
    pub output: OutputConfig,

    /// Chip retrieval settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Label source and class naming
    #[serde(default)]
    pub labels: LabelConfig,

    /// Worker and queue sizing
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Disk-space admission control
    #[serde(default)]
    pub disk: DiskConfig,
}

/// Point-of-interest input configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// Vector file with one point of interest per feature
    #[serde(default)]
    pub poi_path: Option<PathBuf>,

    /// Positional attribute columns
    #[serde(default)]
    pub columns: PoiColumns,
}

/// Attribute positions (zero-based) of the POI fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoiColumns {
    #[serde(default = "default_latitude_column")]
    pub latitude: usize,

    #[serde(default = "default_longitude_column")]
    pub longitude: usize,

    #[serde(default = "default_catalog_id_column")]
    pub catalog_id: usize,
}

impl Default for PoiColumns {
    fn default() -> Self {
        Self {
            latitude: default_latitude_column(),
            longitude: default_longitude_column(),
            catalog_id: default_catalog_id_column(),
        }
    }
}

/// Output tree configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root of the produced dataset
    #[serde(default = "default_output_root")]
    pub root: PathBuf,

    /// Log of requests for which no imagery was available.
    /// Relative paths are resolved against `root`.
    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,

    /// Log of chips that were fetched but could not be labeled, and of
    /// requests left unprocessed by a drain. Relative to `root`.
    #[serde(default = "default_label_failure_log")]
    pub label_failure_log: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            error_log: default_error_log(),
            label_failure_log: default_label_failure_log(),
        }
    }
}

impl OutputConfig {
    /// Directory holding raw fetched chips.
    pub fn tifs_dir(&self) -> PathBuf {
        self.root.join(TIFS_DIR)
    }

    /// Resolved path of the imagery-not-available log.
    pub fn error_log_path(&self) -> PathBuf {
        self.resolve(&self.error_log)
    }

    /// Resolved path of the labeling failure log.
    pub fn label_failure_log_path(&self) -> PathBuf {
        self.resolve(&self.label_failure_log)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Chip retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Base URL of the chip service
    #[serde(default = "default_chip_base_url")]
    pub base_url: String,

    /// Catalog search endpoint used to resolve catalog ids to image ids
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Chip edge length in pixels (chips are square)
    #[serde(default = "default_chip_size")]
    pub chip_size: u32,

    /// Band composition of the chip
    #[serde(default)]
    pub chip_type: ChipType,

    /// Encoding returned by the chip service
    #[serde(default)]
    pub chip_format: ChipFormat,

    /// Ask the service for dynamic range adjustment
    #[serde(default)]
    pub dra: bool,

    /// HTTP timeout per request in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_chip_base_url(),
            catalog_url: default_catalog_url(),
            token_env: default_token_env(),
            chip_size: default_chip_size(),
            chip_type: ChipType::default(),
            chip_format: ChipFormat::default(),
            dra: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Label source and class configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Vector file with label geometries (defaults to the POI file)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// CRS of the label layer when the file does not declare one
    #[serde(default = "default_label_crs")]
    pub crs: String,

    /// CRS assumed for chips the chip service returns without one
    #[serde(default = "default_label_crs")]
    pub chip_crs: String,

    /// Directory name for chips that intersect a label
    #[serde(default = "default_target_class")]
    pub target_class: String,

    /// Directory name for chips without any label
    #[serde(default = "default_none_class")]
    pub none_class: String,

    /// External transcoder settings
    #[serde(default)]
    pub transcoder: TranscoderConfig,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            path: None,
            crs: default_label_crs(),
            chip_crs: default_label_crs(),
            target_class: default_target_class(),
            none_class: default_none_class(),
            transcoder: TranscoderConfig::default(),
        }
    }
}

/// Arguments for the raster-to-PNG conversion program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Executable name or path
    #[serde(default = "default_transcoder_program")]
    pub program: String,

    /// One-based source bands copied to the output, in order
    #[serde(default = "default_transcoder_bands")]
    pub bands: Vec<usize>,

    /// Rescale source values to the output type range
    #[serde(default = "default_true")]
    pub scale: bool,

    /// Output pixel type
    #[serde(default = "default_output_type")]
    pub output_type: String,

    /// Output driver
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: default_transcoder_program(),
            bands: default_transcoder_bands(),
            scale: true,
            output_type: default_output_type(),
            output_format: default_output_format(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of concurrent download workers
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Capacity of the download queue
    #[serde(default = "default_download_buffer")]
    pub download_buffer: usize,

    /// Capacity of the label queue
    #[serde(default = "default_label_buffer")]
    pub label_buffer: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save the final metrics snapshot as JSON
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            download_concurrency: default_download_concurrency(),
            download_buffer: default_download_buffer(),
            label_buffer: default_label_buffer(),
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Disk-space admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Minimum free bytes on the output filesystem before new work is admitted
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Seconds between free-space polls while under budget
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Give up and drain after this many seconds under budget.
    /// Unset means wait for the operator indefinitely.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: None,
        }
    }
}

impl DiskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Label source path, falling back to the POI file.
    pub fn label_path(&self) -> Option<&Path> {
        self.labels
            .path
            .as_deref()
            .or(self.input.poi_path.as_deref())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.poi_path.is_none() {
            anyhow::bail!("A point-of-interest file must be given (input.poi_path or --poi)");
        }

        let columns = &self.input.columns;
        if columns.latitude == columns.longitude
            || columns.latitude == columns.catalog_id
            || columns.longitude == columns.catalog_id
        {
            anyhow::bail!("POI columns must be three distinct positions");
        }

        if self.processing.download_concurrency == 0 {
            anyhow::bail!("Download concurrency must be > 0");
        }
        if self.processing.download_buffer == 0 || self.processing.label_buffer == 0 {
            anyhow::bail!("Queue capacities must be > 0");
        }
        if self.fetch.chip_size == 0 {
            anyhow::bail!("Chip size must be > 0");
        }
        if self.disk.poll_interval_secs == 0 {
            anyhow::bail!("Disk poll interval must be > 0");
        }

        let labels = &self.labels;
        if labels.target_class.trim().is_empty() || labels.none_class.trim().is_empty() {
            anyhow::bail!("Class directory names must not be empty");
        }
        if labels.target_class == labels.none_class {
            anyhow::bail!("Target and none class directories must differ");
        }
        if labels.transcoder.bands.is_empty() || labels.transcoder.bands.contains(&0) {
            anyhow::bail!("Transcoder bands are one-based and must not be empty");
        }
        Ok(())
    }
}

/// Subdirectory of the output root holding raw chips.
pub const TIFS_DIR: &str = "tifs";
/// Subdirectory of the output root holding transcoded images.
pub const DATA_DIR: &str = "data";
/// Subdirectory of the output root holding label masks.
pub const LABEL_DIR: &str = "labels";

// Default value functions for serde
fn default_latitude_column() -> usize { 0 }
fn default_longitude_column() -> usize { 1 }
fn default_catalog_id_column() -> usize { 2 }
fn default_output_root() -> PathBuf { PathBuf::from(".") }
fn default_error_log() -> PathBuf { PathBuf::from("imagery_not_available_log.txt") }
fn default_label_failure_log() -> PathBuf { PathBuf::from("labeling_failures_log.txt") }
fn default_chip_base_url() -> String { "https://idaho.geobigdata.io/".to_string() }
fn default_catalog_url() -> String { "https://geobigdata.io/catalog/v2/search".to_string() }
fn default_token_env() -> String { "GBDX_ACCESS_TOKEN".to_string() }
fn default_chip_size() -> u32 { 2048 }
fn default_timeout_secs() -> u64 { 120 }
fn default_label_crs() -> String { crate::crs::codes::WGS84.to_string() }
fn default_target_class() -> String { "Powerstations".to_string() }
fn default_none_class() -> String { "None".to_string() }
fn default_transcoder_program() -> String { "gdal_translate".to_string() }
fn default_transcoder_bands() -> Vec<usize> { vec![1, 2, 3] }
fn default_output_type() -> String { "Byte".to_string() }
fn default_output_format() -> String { "PNG".to_string() }
fn default_true() -> bool { true }
fn default_download_concurrency() -> usize { 1 }
fn default_download_buffer() -> usize { 64 }
fn default_label_buffer() -> usize { 16 }
fn default_metrics_interval() -> u64 { 30 }
fn default_min_free_bytes() -> u64 { 25_000_000_000 }
fn default_poll_interval_secs() -> u64 { 30 }
