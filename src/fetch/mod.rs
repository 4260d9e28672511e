//! Chip retrieval.
//!
//! The download stage only sees the [`ChipFetcher`] trait. Each imagery
//! provider implements it; [`idaho::IdahoFetcher`] talks to the IDAHO chip
//! service.

pub mod idaho;

pub use idaho::IdahoFetcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::FetchConfig;
use crate::index::PointOfInterest;

/// Band composition of a chip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChipType {
    /// Panchromatic, single band
    Pan,
    /// Multispectral, 4 or 8 bands depending on the sensor
    Ms,
    /// Pansharpened RGB
    Ps,
    /// Pansharpened, all 8 bands
    #[default]
    Ps8,
}

impl ChipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChipType::Pan => "PAN",
            ChipType::Ms => "MS",
            ChipType::Ps => "PS",
            ChipType::Ps8 => "PS8",
        }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding requested from the chip service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChipFormat {
    #[default]
    Tif,
    Png,
}

impl ChipFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChipFormat::Tif => "TIF",
            ChipFormat::Png => "PNG",
        }
    }

    /// File extension of raw chips in this format.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ChipFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the chip to retrieve around a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipSpec {
    /// Edge length in pixels; chips are square
    pub size: u32,
    pub chip_type: ChipType,
    pub format: ChipFormat,
}

impl Default for ChipSpec {
    fn default() -> Self {
        Self {
            size: 2048,
            chip_type: ChipType::default(),
            format: ChipFormat::default(),
        }
    }
}

impl ChipSpec {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            size: config.chip_size,
            chip_type: config.chip_type,
            format: config.chip_format,
        }
    }
}

/// Reasons a chip could not be retrieved.
///
/// Every variant means the imagery is unavailable for this request; the
/// download stage routes all of them to the error sink.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no {band} image id for a {chip_type} chip")]
    MissingBand {
        chip_type: ChipType,
        band: &'static str,
    },

    #[error("catalog has no imagery for {catalog_id}")]
    NoImagery { catalog_id: String },

    #[error("chip service returned HTTP {status}")]
    Status { status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to write chip: {0}")]
    Io(#[from] std::io::Error),
}

/// Retrieves one chip for a point of interest.
///
/// Implementations write `destination` only when the whole chip was
/// received, and never retry.
#[async_trait]
pub trait ChipFetcher: Send + Sync {
    async fn fetch(
        &self,
        poi: &PointOfInterest,
        spec: &ChipSpec,
        destination: &Path,
    ) -> Result<(), FetchError>;
}

/// Temporary sibling path used while a chip is being written.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Write `bytes` to `destination` through a temporary file and a rename, so
/// readers never observe a partially written chip.
pub async fn write_atomic(destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let partial = partial_path(destination);

    if let Err(e) = tokio::fs::write(&partial, bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&partial, destination).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_type_names() {
        assert_eq!(ChipType::Pan.to_string(), "PAN");
        assert_eq!(ChipType::Ps8.to_string(), "PS8");
        let parsed: ChipType = serde_yaml::from_str("MS").unwrap();
        assert_eq!(parsed, ChipType::Ms);
    }

    #[test]
    fn test_chip_spec_defaults() {
        let spec = ChipSpec::default();
        assert_eq!(spec.size, 2048);
        assert_eq!(spec.chip_type, ChipType::Ps8);
        assert_eq!(spec.format, ChipFormat::Tif);
        assert_eq!(ChipSpec::from_config(&FetchConfig::default()), spec);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/out/tifs/3.TIF")),
            PathBuf::from("/out/tifs/3.TIF.part")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.TIF");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!partial_path(&path).exists());
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_nothing_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("0.TIF");

        assert!(write_atomic(&path, b"bytes").await.is_err());
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn test_fetch_error_messages() {
        let err = FetchError::MissingBand {
            chip_type: ChipType::Ps,
            band: "multispectral",
        };
        assert_eq!(err.to_string(), "no multispectral image id for a PS chip");
        assert_eq!(
            FetchError::Status { status: 404 }.to_string(),
            "chip service returned HTTP 404"
        );
    }
}
