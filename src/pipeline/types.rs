//! Items flowing between pipeline stages.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{Config, DATA_DIR, LABEL_DIR, TIFS_DIR};
use crate::fetch::ChipFormat;
use crate::index::PointOfInterest;
use crate::label::{ClassNames, LabelClass};

/// A chip to download for one point of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub poi: PointOfInterest,
    pub destination: PathBuf,
}

impl FetchRequest {
    /// Request whose raw chip lands at `<tifs_dir>/<sequence_index>.<EXT>`.
    pub fn new(poi: PointOfInterest, tifs_dir: &Path, format: ChipFormat) -> Self {
        let destination = tifs_dir.join(format!("{}.{}", poi.sequence_index, format.extension()));
        Self { poi, destination }
    }

    /// `['<catalog_id>', <lat>, <lon>, '<destination>']`
    pub fn record(&self) -> String {
        format!(
            "['{}', {}, {}, '{}']",
            self.poi.catalog_id,
            self.poi.latitude,
            self.poi.longitude,
            self.destination.display()
        )
    }
}

/// Result of one download attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched {
        chip_path: PathBuf,
        request: FetchRequest,
    },
    Unavailable {
        request: FetchRequest,
        reason: String,
    },
}

impl FetchOutcome {
    pub fn request(&self) -> &FetchRequest {
        match self {
            FetchOutcome::Fetched { request, .. } | FetchOutcome::Unavailable { request, .. } => request,
        }
    }

    pub fn into_request(self) -> FetchRequest {
        match self {
            FetchOutcome::Fetched { request, .. } | FetchOutcome::Unavailable { request, .. } => request,
        }
    }
}

/// A classified image/label pair on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelResult {
    pub image_path: PathBuf,
    pub label_mask_path: PathBuf,
    pub class: LabelClass,
}

/// Stage that was holding a request when the pipeline drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Label,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => f.write_str("download"),
            Stage::Label => f.write_str("label"),
        }
    }
}

/// Why a request did not produce a labeled pair.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// The chip could not be fetched
    Unavailable(String),
    /// The chip was fetched but labeling or transcoding failed
    LabelFailed(String),
    /// The pipeline drained before the request was processed
    Deferred(Stage),
}

/// Element of the error sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub request: FetchRequest,
    pub kind: FailureKind,
}

impl FailureRecord {
    pub fn unavailable(request: FetchRequest, reason: impl Into<String>) -> Self {
        Self {
            request,
            kind: FailureKind::Unavailable(reason.into()),
        }
    }

    pub fn label_failed(request: FetchRequest, reason: impl Into<String>) -> Self {
        Self {
            request,
            kind: FailureKind::LabelFailed(reason.into()),
        }
    }

    pub fn deferred(request: FetchRequest, stage: Stage) -> Self {
        Self {
            request,
            kind: FailureKind::Deferred(stage),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.kind, FailureKind::Unavailable(_))
    }

    /// One line of the matching log file.
    pub fn log_line(&self) -> String {
        match &self.kind {
            FailureKind::Unavailable(_) => format!("{},", self.request.record()),
            FailureKind::LabelFailed(reason) => {
                format!("{}, {},", self.request.record(), single_line(reason))
            }
            FailureKind::Deferred(stage) => {
                format!("{}, deferred at {} stage,", self.request.record(), stage)
            }
        }
    }
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Paths of everything the pipeline writes.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub classes: ClassNames,
    pub error_log: PathBuf,
    pub label_failure_log: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, classes: ClassNames) -> Self {
        let root = root.into();
        Self {
            error_log: root.join("imagery_not_available_log.txt"),
            label_failure_log: root.join("labeling_failures_log.txt"),
            root,
            classes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.output.root.clone(),
            classes: ClassNames::new(&config.labels.target_class, &config.labels.none_class),
            error_log: config.output.error_log_path(),
            label_failure_log: config.output.label_failure_log_path(),
        }
    }

    pub fn tifs_dir(&self) -> PathBuf {
        self.root.join(TIFS_DIR)
    }

    pub fn data_dir(&self, class: LabelClass) -> PathBuf {
        self.root.join(DATA_DIR).join(self.classes.dir_name(class))
    }

    pub fn label_dir(&self, class: LabelClass) -> PathBuf {
        self.root.join(LABEL_DIR).join(self.classes.dir_name(class))
    }

    /// Transcoded image path for a chip stem.
    pub fn image_path(&self, class: LabelClass, stem: &str) -> PathBuf {
        self.data_dir(class).join(format!("{}.png", stem))
    }

    /// Label mask path for a chip stem.
    pub fn mask_path(&self, class: LabelClass, stem: &str) -> PathBuf {
        self.label_dir(class).join(format!("{}.png", stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poi() -> PointOfInterest {
        PointOfInterest {
            catalog_id: "1030010012345600".to_string(),
            latitude: 37.5,
            longitude: -122.25,
            sequence_index: 7,
        }
    }

    #[test]
    fn test_request_destination() {
        let request = FetchRequest::new(poi(), Path::new("/out/tifs"), ChipFormat::Tif);
        assert_eq!(request.destination, PathBuf::from("/out/tifs/7.TIF"));
    }

    #[test]
    fn test_log_lines() {
        let request = FetchRequest::new(poi(), Path::new("/out/tifs"), ChipFormat::Tif);

        let unavailable = FailureRecord::unavailable(request.clone(), "HTTP 404");
        assert_eq!(
            unavailable.log_line(),
            "['1030010012345600', 37.5, -122.25, '/out/tifs/7.TIF'],"
        );
        assert!(unavailable.is_unavailable());

        let failed = FailureRecord::label_failed(request.clone(), "gdal_translate\nexited 1");
        assert_eq!(
            failed.log_line(),
            "['1030010012345600', 37.5, -122.25, '/out/tifs/7.TIF'], gdal_translate exited 1,"
        );

        let deferred = FailureRecord::deferred(request, Stage::Download);
        assert!(deferred.log_line().ends_with("deferred at download stage,"));
        assert!(!deferred.is_unavailable());
    }

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::new("/out", ClassNames::default());
        assert_eq!(layout.tifs_dir(), PathBuf::from("/out/tifs"));
        assert_eq!(
            layout.image_path(LabelClass::Target, "3"),
            PathBuf::from("/out/data/Powerstations/3.png")
        );
        assert_eq!(
            layout.mask_path(LabelClass::None, "3"),
            PathBuf::from("/out/labels/None/3.png")
        );
        assert_eq!(
            layout.error_log,
            PathBuf::from("/out/imagery_not_available_log.txt")
        );
    }

    #[test]
    fn test_layout_from_config() {
        let mut config = Config::default();
        config.output.root = PathBuf::from("/data");
        config.labels.target_class = "Substations".to_string();

        let layout = OutputLayout::from_config(&config);
        assert_eq!(layout.data_dir(LabelClass::Target), PathBuf::from("/data/data/Substations"));
        assert_eq!(layout.label_failure_log, PathBuf::from("/data/labeling_failures_log.txt"));
    }
}
