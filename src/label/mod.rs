//! Label derivation: rasterize label geometries onto a chip and classify it.

pub mod raster;
pub mod transcode;

pub use raster::{ChipFootprint, GeoTransform};
pub use transcode::{GdalTranslate, Transcoder};

use anyhow::{Context, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::crs::{self, ProjCache};
use crate::index::{LabelIndex, LabelShape, ShapePart};
use raster::PixelPart;

/// Binary classification of a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelClass {
    /// At least one label pixel
    Target,
    /// Empty mask
    None,
}

impl LabelClass {
    /// The opposite class.
    pub fn other(self) -> Self {
        match self {
            LabelClass::Target => LabelClass::None,
            LabelClass::None => LabelClass::Target,
        }
    }
}

impl fmt::Display for LabelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelClass::Target => f.write_str("target"),
            LabelClass::None => f.write_str("none"),
        }
    }
}

/// Directory names of the two classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames {
    pub target: String,
    pub none: String,
}

impl ClassNames {
    pub fn new(target: impl Into<String>, none: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            none: none.into(),
        }
    }

    pub fn dir_name(&self, class: LabelClass) -> &str {
        match class {
            LabelClass::Target => &self.target,
            LabelClass::None => &self.none,
        }
    }
}

impl Default for ClassNames {
    fn default() -> Self {
        Self::new("Powerstations", "None")
    }
}

/// Classify a mask: `None` when every pixel is zero, `Target` otherwise.
pub fn classify(mask: &Array2<u8>) -> LabelClass {
    if mask.iter().all(|&v| v == 0) {
        LabelClass::None
    } else {
        LabelClass::Target
    }
}

/// A mask aligned to a chip together with its class.
#[derive(Debug, Clone)]
pub struct DerivedLabel {
    pub mask: Array2<u8>,
    pub class: LabelClass,
    /// Label shapes that intersected the chip envelope
    pub shapes: usize,
}

/// Builds label masks for chips from an in-memory label index.
pub struct LabelDeriver {
    index: LabelIndex,
    proj: ProjCache,
    chip_fallback_crs: String,
}

impl LabelDeriver {
    pub fn new(index: LabelIndex) -> Self {
        Self {
            index,
            proj: ProjCache::new(),
            chip_fallback_crs: crs::codes::WGS84.to_string(),
        }
    }

    /// CRS assumed for chips that do not declare one.
    pub fn with_chip_fallback_crs(mut self, crs: impl Into<String>) -> Self {
        self.chip_fallback_crs = crs.into();
        self
    }

    /// Read the chip footprint and derive its label.
    pub fn derive(&self, chip_path: &Path) -> Result<DerivedLabel> {
        let footprint = ChipFootprint::read(chip_path, &self.chip_fallback_crs)?;
        self.derive_for(&footprint)
            .with_context(|| format!("Failed to derive label for {}", chip_path.display()))
    }

    /// Derive the label for a known footprint.
    pub fn derive_for(&self, footprint: &ChipFootprint) -> Result<DerivedLabel> {
        let chip_bounds = footprint.bounds();
        let query = crs::transform_bounds(&chip_bounds, &footprint.crs, self.index.crs(), &self.proj)?;

        let mut parts = Vec::new();
        let mut shapes = 0usize;
        for shape in self.index.query(&query) {
            let chip_parts = self.to_chip_crs(shape, &footprint.crs)?;
            let points: Vec<(f64, f64)> = chip_parts.iter().flat_map(ShapePart::points).collect();
            let intersects = crs::points_bounds(&points)
                .map(|b| touches(&b, &chip_bounds))
                .unwrap_or(false);
            if !intersects {
                continue;
            }

            shapes += 1;
            parts.extend(
                chip_parts
                    .iter()
                    .filter_map(|part| PixelPart::from_world(part, &footprint.transform)),
            );
        }

        let mask = raster::rasterize(&parts, footprint.width, footprint.height);
        let class = classify(&mask);

        tracing::debug!(
            "{} label shapes, {} foreground pixels, class {}",
            shapes,
            raster::foreground_count(&mask),
            class
        );

        Ok(DerivedLabel { mask, class, shapes })
    }

    fn to_chip_crs(&self, shape: &LabelShape, chip_crs: &str) -> Result<Vec<ShapePart>> {
        let from = self.index.crs();
        shape
            .parts
            .iter()
            .map(|part| {
                Ok(match part {
                    ShapePart::Polygon(rings) => ShapePart::Polygon(
                        rings
                            .iter()
                            .map(|ring| crs::transform_points(ring, from, chip_crs, &self.proj))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                    ShapePart::LineString(points) => {
                        ShapePart::LineString(crs::transform_points(points, from, chip_crs, &self.proj)?)
                    }
                    ShapePart::Point((x, y)) => {
                        ShapePart::Point(crs::transform_point(*x, *y, from, chip_crs, &self.proj)?)
                    }
                })
            })
            .collect()
    }
}

/// Closed-interval overlap, so shapes on the chip edge and zero-area
/// envelopes still count.
fn touches(a: &crs::Bounds, b: &crs::Bounds) -> bool {
    a[0] <= b[2] && b[0] <= a[2] && a[1] <= b[3] && b[1] <= a[3]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footprint() -> ChipFootprint {
        // 10x10 pixels of 0.1 degrees, upper-left at (0, 1)
        ChipFootprint {
            width: 10,
            height: 10,
            transform: GeoTransform::from_gdal(&[0.0, 0.1, 0.0, 1.0, 0.0, -0.1]),
            crs: crs::codes::WGS84.to_string(),
        }
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> LabelShape {
        let ring = vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)];
        LabelShape::new(vec![ShapePart::Polygon(vec![ring])]).unwrap()
    }

    #[test]
    fn test_classify() {
        let mut mask = Array2::<u8>::zeros((4, 4));
        assert_eq!(classify(&mask), LabelClass::None);
        mask[[3, 0]] = 1;
        assert_eq!(classify(&mask), LabelClass::Target);
        assert_eq!(LabelClass::Target.other(), LabelClass::None);
        assert_eq!(LabelClass::None.other(), LabelClass::Target);
    }

    #[test]
    fn test_class_names() {
        let names = ClassNames::default();
        assert_eq!(names.dir_name(LabelClass::Target), "Powerstations");
        assert_eq!(names.dir_name(LabelClass::None), "None");
    }

    #[test]
    fn test_derive_intersecting_label() {
        let index = LabelIndex::from_shapes(vec![square(0.2, 0.2, 0.5, 0.5)], crs::codes::WGS84);
        let deriver = LabelDeriver::new(index);

        let label = deriver.derive_for(&footprint()).unwrap();
        assert_eq!(label.class, LabelClass::Target);
        assert_eq!(label.shapes, 1);
        assert_eq!(label.mask.dim(), (10, 10));
        // y = 0.35 is row 6, x = 0.35 is column 3
        assert_eq!(label.mask[[6, 3]], raster::FOREGROUND);
        assert_eq!(label.mask[[0, 9]], 0);
    }

    #[test]
    fn test_derive_without_labels_is_none() {
        let index = LabelIndex::from_shapes(vec![square(5.0, 5.0, 6.0, 6.0)], crs::codes::WGS84);
        let deriver = LabelDeriver::new(index);

        let label = deriver.derive_for(&footprint()).unwrap();
        assert_eq!(label.class, LabelClass::None);
        assert_eq!(label.shapes, 0);
        assert_eq!(raster::foreground_count(&label.mask), 0);
    }

    #[test]
    fn test_derive_reprojects_labels() {
        // Same square as above, stored in Web Mercator
        let cache = ProjCache::new();
        let ring: Vec<(f64, f64)> = [(0.2, 0.2), (0.5, 0.2), (0.5, 0.5), (0.2, 0.5), (0.2, 0.2)]
            .iter()
            .map(|&(x, y)| crs::transform_point(x, y, crs::codes::WGS84, "EPSG:3857", &cache).unwrap())
            .collect();
        let shape = LabelShape::new(vec![ShapePart::Polygon(vec![ring])]).unwrap();
        let deriver = LabelDeriver::new(LabelIndex::from_shapes(vec![shape], "EPSG:3857"));

        let label = deriver.derive_for(&footprint()).unwrap();
        assert_eq!(label.class, LabelClass::Target);
        assert_eq!(label.mask[[6, 3]], raster::FOREGROUND);
    }

    #[test]
    fn test_touches_degenerate_envelope() {
        assert!(touches(&[0.5, 0.5, 0.5, 0.5], &[0.0, 0.0, 1.0, 1.0]));
        assert!(!touches(&[2.0, 2.0, 2.0, 2.0], &[0.0, 0.0, 1.0, 1.0]));
    }

    #[test]
    fn test_chip_without_crs_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chip.tif");

        // Same grid as `footprint()`, but no spatial reference
        let driver = gdal::DriverManager::get_driver_by_name("GTiff").unwrap();
        let mut dataset = driver.create_with_band_type::<u8, _>(&path, 10, 10, 1).unwrap();
        dataset
            .set_geo_transform(&[0.0, 0.1, 0.0, 1.0, 0.0, -0.1])
            .unwrap();
        drop(dataset);

        let index = || LabelIndex::from_shapes(vec![square(0.2, 0.2, 0.5, 0.5)], crs::codes::WGS84);

        let label = LabelDeriver::new(index()).derive(&path).unwrap();
        assert_eq!(label.class, LabelClass::Target);

        // Read as Web Mercator the chip is a metre-sized square at the origin
        let label = LabelDeriver::new(index())
            .with_chip_fallback_crs("EPSG:3857")
            .derive(&path)
            .unwrap();
        assert_eq!(label.class, LabelClass::None);
    }
}
