//! POI Chipper CLI
//!
//! Download image chips around points of interest and sort them into a
//! labeled training set.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use poi_chipper::{build_runtime, run_pipeline, Config, PipelineStats};

#[derive(Parser)]
#[command(name = "poi-chipper")]
#[command(about = "Fetch and label image chips around points of interest", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Point-of-interest vector file
    #[arg(short, long, global = true)]
    poi: Option<PathBuf>,

    /// Label vector file (defaults to the point-of-interest file)
    #[arg(short, long, global = true)]
    labels: Option<PathBuf>,

    /// Output root directory
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Number of concurrent chip downloads
    #[arg(short, long, global = true, visible_alias = "concurrency")]
    threads: Option<usize>,

    /// Tokio worker threads (defaults to the number of CPUs)
    #[arg(long, global = true)]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chip pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(default_value = "config.yaml")]
        path: PathBuf,
    },
}

impl Cli {
    /// Load the config file (if any) and apply command-line overrides.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(poi) = &self.poi {
            config.input.poi_path = Some(poi.clone());
        }
        if let Some(labels) = &self.labels {
            config.labels.path = Some(labels.clone());
        }
        if let Some(output) = &self.output {
            config.output.root = output.clone();
        }
        if let Some(threads) = self.threads {
            config.processing.download_concurrency = threads;
        }
        if let Some(workers) = self.worker_threads {
            config.processing.worker_threads = Some(workers);
        }

        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.load_config()?)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.load_config()?)?;
        }

        Some(Commands::GenerateConfig { path }) => {
            generate_config_command(path)?;
        }
    }

    Ok(())
}

fn run_command(config: Config) -> Result<()> {
    config.validate()?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(async {
        let drain = CancellationToken::new();
        let interrupt = {
            let drain = drain.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, draining pipeline");
                    drain.cancel();
                }
            })
        };

        let report = run_pipeline(config, drain).await;
        interrupt.abort();
        report.map(|r| r.stats)
    })?;

    print_run_summary(&stats);
    Ok(())
}

fn print_run_summary(stats: &PipelineStats) {
    println!("\n=== Run Summary ===");
    println!("Requests: {}", stats.total_requests);
    println!("Labeled target: {}", stats.labeled_target);
    println!("Labeled none: {}", stats.labeled_none);
    println!("Unavailable: {}", stats.unavailable);
    println!("Label failures: {}", stats.label_failed);
    println!("Deferred: {}", stats.deferred);
    println!("Malformed rows: {}", stats.rejected_rows);
    println!("===================\n");
}

fn validate_command(config: Config) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(path: &Path) -> Result<()> {
    let yaml = r#"# POI Chipper Configuration

# === INPUT: Points of interest ===
input:
  # Any OGR vector file (shapefile, GeoJSON, GeoPackage, ...)
  poi_path: "points.shp"

  # Zero-based attribute positions
  columns:
    latitude: 0
    longitude: 1
    catalog_id: 2

# === OUTPUT: Dataset layout ===
# <root>/tifs/<n>.TIF, <root>/data/<class>/<n>.png, <root>/labels/<class>/<n>.png
output:
  root: "./dataset"

  # Relative paths are resolved against root
  error_log: "imagery_not_available_log.txt"
  label_failure_log: "labeling_failures_log.txt"

# === FETCH: Chip service ===
fetch:
  base_url: "https://idaho.geobigdata.io/"
  catalog_url: "https://geobigdata.io/catalog/v2/search"

  # Environment variable holding the bearer token
  token_env: "GBDX_ACCESS_TOKEN"

  # Chip edge in pixels
  chip_size: 2048

  # PAN, MS, PS or PS8
  chip_type: "PS8"

  # TIF or PNG
  chip_format: "TIF"

  # Dynamic range adjustment
  dra: false

  timeout_secs: 120

# === LABELS: Geometries and classes ===
labels:
  # Defaults to input.poi_path
  # path: "labels.shp"

  # CRS used when the label file does not declare one
  crs: "EPSG:4326"

  # CRS assumed for chips returned without one
  chip_crs: "EPSG:4326"

  target_class: "Powerstations"
  none_class: "None"

  transcoder:
    program: "gdal_translate"
    bands: [1, 2, 3]
    scale: true
    output_type: "Byte"
    output_format: "PNG"

# === PROCESSING: Workers and queues ===
processing:
  # Concurrent chip downloads (-t/--threads)
  download_concurrency: 1
  download_buffer: 64
  label_buffer: 16

  # Tokio worker threads (null = num CPUs, or --worker-threads)
  # worker_threads: 8

  enable_metrics: true
  metrics_interval_secs: 30
  # metrics_output_path: "metrics.json"

# === DISK: Free-space admission ===
disk:
  # New work is only taken while more than this many bytes are free
  min_free_bytes: 25000000000

  poll_interval_secs: 30

  # Drain and stop after this long under budget (omit to wait forever)
  # max_wait_secs: 3600
"#;

    std::fs::write(path, yaml)?;
    println!("Generated sample configuration at: {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["poi-chipper"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["poi-chipper", "-c", "other.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("other.yaml")));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["poi-chipper", "validate", "-c", "test.json"]);
        assert!(matches!(cli.unwrap().command, Some(Commands::Validate)));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "poi-chipper", "run", "-p", "points.geojson", "-o", "/tmp/out", "--worker-threads", "4",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();

        assert_eq!(config.input.poi_path, Some(PathBuf::from("points.geojson")));
        assert_eq!(config.output.root, PathBuf::from("/tmp/out"));
        assert_eq!(config.processing.worker_threads, Some(4));
        assert_eq!(config.processing.download_concurrency, 1);
        assert_eq!(config.label_path(), Some(Path::new("points.geojson")));
    }

    #[test]
    fn test_threads_sets_download_concurrency() {
        let cli = Cli::try_parse_from(["poi-chipper", "-t", "8", "-p", "pois.shp"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.processing.download_concurrency, 8);
        assert_eq!(config.processing.worker_threads, None);

        let cli = Cli::try_parse_from(["poi-chipper", "--concurrency", "3"]).unwrap();
        assert_eq!(cli.load_config().unwrap().processing.download_concurrency, 3);
    }

    #[test]
    fn test_generated_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.labels.target_class, "Powerstations");
        assert_eq!(config.disk.min_free_bytes, 25_000_000_000);
    }
}
