//! Coordinate Reference System utilities.
//!
//! ## CRS used in this pipeline:
//!
//! - **WGS84 (EPSG:4326)**: Geographic coordinates (lon, lat in degrees).
//!   Used for: point-of-interest locations, chip service requests, and the
//!   default label layer CRS.
//!
//! - **Chip native CRS**: whatever the chip service returns (usually WGS84,
//!   sometimes UTM). Used for: the chip pixel grid the label mask is aligned to.
//!
//! - **Label layer CRS**: the CRS of the label vector file. Used for: the
//!   R-tree of label shapes.
//!
//! ## Coordinate order convention:
//!
//! - Bounds arrays: `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`
//! - Points are `(x, y)`; for WGS84 that is `(lon, lat)`.

/// Common CRS codes used throughout the pipeline.
pub mod codes {
    /// WGS84 geographic coordinate system (lon/lat in degrees).
    pub const WGS84: &str = "EPSG:4326";
}

use anyhow::{Context, Result};
use proj::Proj;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bounds in a specific CRS: [min_x, min_y, max_x, max_y]
pub type Bounds = [f64; 4];

/// Number of samples per edge when transforming bounds.
const EDGE_SAMPLES: usize = 8;

/// Thread-safe cache for Proj transformations.
///
/// Creating Proj objects is expensive, so we cache them by (source, target) CRS pair.
/// `Proj` is not `Sync`, so each transformation runs under the cache lock.
#[derive(Default)]
pub struct ProjCache {
    cache: Mutex<HashMap<(String, String), Proj>>,
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with the (cached) transformation between two CRS.
    pub fn with_proj<R>(
        &self,
        from_crs: &str,
        to_crs: &str,
        f: impl FnOnce(&Proj) -> Result<R>,
    ) -> Result<R> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());

        let proj = match cache.entry((from_crs.to_string(), to_crs.to_string())) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let proj = Proj::new_known_crs(from_crs, to_crs, None).with_context(|| {
                    format!("Failed to create projection from {} to {}", from_crs, to_crs)
                })?;
                entry.insert(proj)
            }
        };

        f(proj)
    }
}

/// Transform a single point between CRS.
pub fn transform_point(
    x: f64,
    y: f64,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
) -> Result<(f64, f64)> {
    if from_crs == to_crs {
        return Ok((x, y));
    }

    cache.with_proj(from_crs, to_crs, |proj| {
        proj.convert((x, y))
            .with_context(|| format!("Failed to transform point ({}, {}) from {} to {}", x, y, from_crs, to_crs))
    })
}

/// Transform a sequence of points between CRS.
pub fn transform_points(
    points: &[(f64, f64)],
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
) -> Result<Vec<(f64, f64)>> {
    if from_crs == to_crs {
        return Ok(points.to_vec());
    }

    cache.with_proj(from_crs, to_crs, |proj| {
        points
            .iter()
            .map(|&(x, y)| {
                proj.convert((x, y))
                    .with_context(|| format!("Failed to transform point ({}, {}) from {} to {}", x, y, from_crs, to_crs))
            })
            .collect()
    })
}

/// Transform bounds between CRS.
///
/// Samples points along all four edges and returns the bounding box of the
/// result, so curved edges in the target CRS are covered.
pub fn transform_bounds(
    bounds: &Bounds,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
) -> Result<Bounds> {
    if from_crs == to_crs {
        return Ok(*bounds);
    }

    cache.with_proj(from_crs, to_crs, |proj| {
        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;
        let mut converted = 0usize;

        for i in 0..=EDGE_SAMPLES {
            let t = i as f64 / EDGE_SAMPLES as f64;
            let x = bounds[0] + t * (bounds[2] - bounds[0]);
            let y = bounds[1] + t * (bounds[3] - bounds[1]);

            let samples = [(x, bounds[1]), (x, bounds[3]), (bounds[0], y), (bounds[2], y)];
            for sample in samples {
                if let Ok((tx, ty)) = proj.convert(sample) {
                    min_x = min_x.min(tx);
                    min_y = min_y.min(ty);
                    max_x = max_x.max(tx);
                    max_y = max_y.max(ty);
                    converted += 1;
                }
            }
        }

        if converted == 0 {
            anyhow::bail!("Failed to transform bounds {:?} from {} to {}", bounds, from_crs, to_crs);
        }

        Ok([min_x, min_y, max_x, max_y])
    })
}

/// `AUTHORITY:CODE` string for a GDAL spatial reference, when it has one.
pub fn authority_code(srs: &gdal::spatial_ref::SpatialRef) -> Option<String> {
    let name = srs.auth_name().ok()?;
    let code = srs.auth_code().ok()?;
    Some(format!("{}:{}", name, code))
}

/// Bounding box of a set of points. None for an empty slice.
pub fn points_bounds(points: &[(f64, f64)]) -> Option<Bounds> {
    let (first, rest) = points.split_first()?;
    let mut bounds = [first.0, first.1, first.0, first.1];
    for &(x, y) in rest {
        bounds[0] = bounds[0].min(x);
        bounds[1] = bounds[1].min(y);
        bounds[2] = bounds[2].max(x);
        bounds[3] = bounds[3].max(y);
    }
    Some(bounds)
}
