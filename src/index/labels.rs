//! Label geometries and the R-tree used to find those intersecting a chip.

use anyhow::{Context, Result};
use gdal::vector::{Geometry, LayerAccess};
use gdal::Dataset;
use rstar::{RTree, RTreeObject, AABB};
use std::path::Path;

use crate::crs::{self, Bounds};

/// One piece of a label geometry, in the label layer's CRS.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapePart {
    /// Exterior ring followed by holes
    Polygon(Vec<Vec<(f64, f64)>>),
    LineString(Vec<(f64, f64)>),
    Point((f64, f64)),
}

impl ShapePart {
    /// Every coordinate of the part, rings flattened.
    pub fn points(&self) -> Vec<(f64, f64)> {
        match self {
            ShapePart::Polygon(rings) => rings.iter().flatten().copied().collect(),
            ShapePart::LineString(points) => points.clone(),
            ShapePart::Point(point) => vec![*point],
        }
    }
}

/// A label feature flattened into plain coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelShape {
    pub parts: Vec<ShapePart>,

    /// Envelope in the label CRS [min_x, min_y, max_x, max_y]
    pub bounds: Bounds,
}

impl LabelShape {
    /// Build a shape from its parts. None when the parts hold no coordinates.
    pub fn new(parts: Vec<ShapePart>) -> Option<Self> {
        let points: Vec<(f64, f64)> = parts.iter().flat_map(ShapePart::points).collect();
        let bounds = crs::points_bounds(&points)?;
        Some(Self { parts, bounds })
    }
}

impl RTreeObject for LabelShape {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds[0], self.bounds[1]],
            [self.bounds[2], self.bounds[3]],
        )
    }
}

fn ring_points(geometry: &Geometry) -> Vec<(f64, f64)> {
    geometry
        .get_point_vec()
        .into_iter()
        .map(|(x, y, _)| (x, y))
        .collect()
}

/// Flatten an OGR geometry of any type into shape parts.
fn collect_parts(geometry: &Geometry, parts: &mut Vec<ShapePart>) {
    let name = geometry.geometry_name().to_ascii_uppercase();
    match name.as_str() {
        "POINT" => {
            if let Some(&(x, y, _)) = geometry.get_point_vec().first() {
                parts.push(ShapePart::Point((x, y)));
            }
        }
        "LINESTRING" | "LINEARRING" => {
            let points = ring_points(geometry);
            if !points.is_empty() {
                parts.push(ShapePart::LineString(points));
            }
        }
        "POLYGON" => {
            let rings: Vec<Vec<(f64, f64)>> = (0..geometry.geometry_count())
                .map(|i| ring_points(&geometry.get_geometry(i)))
                .filter(|ring| ring.len() >= 3)
                .collect();
            if !rings.is_empty() {
                parts.push(ShapePart::Polygon(rings));
            }
        }
        _ => {
            // Multi* and collections
            for i in 0..geometry.geometry_count() {
                collect_parts(&geometry.get_geometry(i), parts);
            }
        }
    }
}

/// Spatial index over label shapes.
pub struct LabelIndex {
    rtree: RTree<LabelShape>,

    /// CRS of the stored coordinates
    crs: String,
}

impl LabelIndex {
    /// Index already flattened shapes.
    pub fn from_shapes(shapes: Vec<LabelShape>, crs: impl Into<String>) -> Self {
        Self {
            rtree: RTree::bulk_load(shapes),
            crs: crs.into(),
        }
    }

    /// Load every geometry of the first layer of `path`.
    ///
    /// The layer's declared CRS is used when it has an authority code,
    /// otherwise `fallback_crs`.
    pub fn load(path: &Path, fallback_crs: &str) -> Result<Self> {
        let dataset = Dataset::open(path)
            .with_context(|| format!("Failed to open label source {}", path.display()))?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("{} has no vector layer", path.display()))?;

        let crs = layer
            .spatial_ref()
            .as_ref()
            .and_then(crs::authority_code)
            .unwrap_or_else(|| fallback_crs.to_string());

        let mut shapes = Vec::new();
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            let mut parts = Vec::new();
            collect_parts(geometry, &mut parts);
            if let Some(shape) = LabelShape::new(parts) {
                shapes.push(shape);
            }
        }

        tracing::info!(
            "Loaded {} label shapes from {} ({})",
            shapes.len(),
            path.display(),
            crs
        );

        Ok(Self::from_shapes(shapes, crs))
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.rtree.size() == 0
    }

    /// Shapes whose envelope intersects `bounds` (label CRS).
    pub fn query(&self, bounds: &Bounds) -> Vec<&LabelShape> {
        let envelope = AABB::from_corners([bounds[0], bounds[1]], [bounds[2], bounds[3]]);
        self.rtree
            .locate_in_envelope_intersecting(&envelope)
            .collect()
    }
}
