//! Conversion of raw chips into a viewable image format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::config::TranscoderConfig;

/// Converts a raw chip into a viewable copy.
///
/// A failure is final for that chip; callers do not retry.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, source: &Path, destination: &Path) -> Result<()>;
}

/// Transcoder running `gdal_translate` as a child process.
pub struct GdalTranslate {
    config: TranscoderConfig,
}

impl GdalTranslate {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the program, sources and destination last.
    pub fn args(&self, source: &Path, destination: &Path) -> Vec<String> {
        let mut args = vec!["-ot".to_string(), self.config.output_type.clone()];
        if self.config.scale {
            args.push("-scale".to_string());
        }
        for band in &self.config.bands {
            args.push("-b".to_string());
            args.push(band.to_string());
        }
        args.push("-of".to_string());
        args.push(self.config.output_format.clone());
        args.push(source.display().to_string());
        args.push(destination.display().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for GdalTranslate {
    async fn transcode(&self, source: &Path, destination: &Path) -> Result<()> {
        let args = self.args(source, destination);
        tracing::debug!("{} {}", self.config.program, args.join(" "));

        let output = Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to start {}", self.config.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {} for {}: {}",
                self.config.program,
                output.status,
                source.display(),
                stderr.trim()
            );
        }
        Ok(())
    }
}
