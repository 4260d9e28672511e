//! Chip footprints and label mask rasterization.

use anyhow::{Context, Result};
use gdal::Dataset;
use image::{GrayImage, ImageFormat};
use ndarray::Array2;
use std::path::Path;

use crate::crs::{self, Bounds};
use crate::index::ShapePart;

/// Mask value for pixels covered by a label.
pub const FOREGROUND: u8 = 255;

/// Affine transform from pixel to world coordinates.
///
/// `x = a * col + b * row + c`, `y = d * col + e * row + f`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// Pixel width (x scale)
    pub a: f64,
    /// Row rotation (typically 0)
    pub b: f64,
    /// X origin (upper-left x coordinate)
    pub c: f64,
    /// Column rotation (typically 0)
    pub d: f64,
    /// Pixel height (y scale, negative for north-up)
    pub e: f64,
    /// Y origin (upper-left y coordinate)
    pub f: f64,
}

impl GeoTransform {
    /// From GDAL's `[origin_x, pixel_w, row_rot, origin_y, col_rot, pixel_h]`.
    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            a: gt[1],
            b: gt[2],
            c: gt[0],
            d: gt[4],
            e: gt[5],
            f: gt[3],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.c, self.a, self.b, self.f, self.d, self.e]
    }

    /// Convert pixel coordinates to world coordinates.
    #[inline]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.a * col + self.b * row + self.c;
        let y = self.d * col + self.e * row + self.f;
        (x, y)
    }

    /// Convert world coordinates to fractional (column, row).
    ///
    /// None for a degenerate transform.
    #[inline]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.a * self.e - self.b * self.d;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.c;
        let dy = y - self.f;
        let col = (self.e * dx - self.b * dy) / det;
        let row = (self.a * dy - self.d * dx) / det;
        Some((col, row))
    }
}

/// Pixel grid and georeferencing of a fetched chip.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipFootprint {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: String,
}

impl ChipFootprint {
    /// Read the footprint of a raster file.
    ///
    /// Chips without a declared CRS are taken to be in `fallback_crs`.
    pub fn read(path: &Path, fallback_crs: &str) -> Result<Self> {
        let dataset = Dataset::open(path)
            .with_context(|| format!("Failed to open chip {}", path.display()))?;

        let gt = dataset
            .geo_transform()
            .with_context(|| format!("Chip {} has no geotransform", path.display()))?;
        let (width, height) = dataset.raster_size();

        let crs = dataset
            .spatial_ref()
            .ok()
            .as_ref()
            .and_then(crs::authority_code)
            .unwrap_or_else(|| fallback_crs.to_string());

        if width == 0 || height == 0 {
            anyhow::bail!("Chip {} is empty ({}x{})", path.display(), width, height);
        }

        Ok(Self {
            width,
            height,
            transform: GeoTransform::from_gdal(&gt),
            crs,
        })
    }

    /// Envelope of the chip in its own CRS.
    pub fn bounds(&self) -> Bounds {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [
            self.transform.pixel_to_world(0.0, 0.0),
            self.transform.pixel_to_world(w, 0.0),
            self.transform.pixel_to_world(0.0, h),
            self.transform.pixel_to_world(w, h),
        ];
        // Four corners are never empty
        crs::points_bounds(&corners).unwrap_or([0.0; 4])
    }
}

/// A shape part already converted to fractional pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelPart {
    Polygon(Vec<Vec<(f64, f64)>>),
    LineString(Vec<(f64, f64)>),
    Point((f64, f64)),
}

impl PixelPart {
    /// Convert a part in the chip CRS to pixel space.
    pub fn from_world(part: &ShapePart, transform: &GeoTransform) -> Option<Self> {
        let to_pixels = |points: &[(f64, f64)]| -> Option<Vec<(f64, f64)>> {
            points
                .iter()
                .map(|&(x, y)| transform.world_to_pixel(x, y))
                .collect()
        };

        Some(match part {
            ShapePart::Polygon(rings) => PixelPart::Polygon(
                rings
                    .iter()
                    .map(|ring| to_pixels(ring))
                    .collect::<Option<Vec<_>>>()?,
            ),
            ShapePart::LineString(points) => PixelPart::LineString(to_pixels(points)?),
            ShapePart::Point((x, y)) => PixelPart::Point(transform.world_to_pixel(*x, *y)?),
        })
    }
}

fn burn(mask: &mut Array2<u8>, col: f64, row: f64) {
    let (height, width) = mask.dim();
    if col < 0.0 || row < 0.0 {
        return;
    }
    let (c, r) = (col.floor() as usize, row.floor() as usize);
    if c < width && r < height {
        mask[[r, c]] = FOREGROUND;
    }
}

/// Burn every pixel a segment passes through.
fn burn_segment(mask: &mut Array2<u8>, from: (f64, f64), to: (f64, f64)) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let steps = ((dx.abs().max(dy.abs()) * 2.0).ceil() as usize).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        burn(mask, from.0 + t * dx, from.1 + t * dy);
    }
}

fn burn_path(mask: &mut Array2<u8>, points: &[(f64, f64)]) {
    match points {
        [] => {}
        [only] => burn(mask, only.0, only.1),
        _ => {
            for pair in points.windows(2) {
                burn_segment(mask, pair[0], pair[1]);
            }
        }
    }
}

/// Even-odd scanline fill over pixel centres. Rings are closed implicitly.
fn fill_polygon(mask: &mut Array2<u8>, rings: &[Vec<(f64, f64)>]) {
    let (height, width) = mask.dim();

    let Some(bounds) = crs::points_bounds(&rings.iter().flatten().copied().collect::<Vec<_>>()) else {
        return;
    };
    let first_row = (bounds[1] - 0.5).ceil().max(0.0) as usize;
    let last_row = ((bounds[3] - 0.5).floor().min(height as f64 - 1.0)).max(-1.0);
    if last_row < 0.0 {
        return;
    }
    let last_row = last_row as usize;

    let mut crossings = Vec::new();
    for row in first_row..=last_row {
        let y = row as f64 + 0.5;
        crossings.clear();

        for ring in rings {
            let n = ring.len();
            for i in 0..n {
                let (x0, y0) = ring[i];
                let (x1, y1) = ring[(i + 1) % n];
                if (y0 <= y) != (y1 <= y) {
                    crossings.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
                }
            }
        }

        crossings.sort_by(|a, b| a.total_cmp(b));
        for span in crossings.chunks_exact(2) {
            let start = (span[0] - 0.5).ceil().max(0.0);
            let end = ((span[1] - 0.5).ceil()).min(width as f64);
            if end <= start {
                continue;
            }
            for col in start as usize..end as usize {
                mask[[row, col]] = FOREGROUND;
            }
        }
    }
}

/// Rasterize pixel-space parts onto a `height x width` mask.
///
/// Polygon interiors are filled where they cover a pixel centre and their
/// outlines burn every pixel they touch, so labels smaller than a pixel
/// still mark the chip. Lines and points burn the pixels they touch.
pub fn rasterize(parts: &[PixelPart], width: usize, height: usize) -> Array2<u8> {
    let mut mask = Array2::<u8>::zeros((height, width));

    for part in parts {
        match part {
            PixelPart::Polygon(rings) => {
                fill_polygon(&mut mask, rings);
                for ring in rings {
                    burn_path(&mut mask, ring);
                    if let (Some(&first), Some(&last)) = (ring.first(), ring.last()) {
                        burn_segment(&mut mask, last, first);
                    }
                }
            }
            PixelPart::LineString(points) => burn_path(&mut mask, points),
            PixelPart::Point((col, row)) => burn(&mut mask, *col, *row),
        }
    }

    mask
}

/// Number of foreground pixels in a mask.
pub fn foreground_count(mask: &Array2<u8>) -> usize {
    mask.iter().filter(|&&v| v != 0).count()
}

/// Write a mask as an 8-bit grayscale PNG.
pub fn write_mask_png(mask: &Array2<u8>, path: &Path) -> Result<()> {
    let (height, width) = mask.dim();
    let raw: Vec<u8> = mask.iter().copied().collect();

    let image = GrayImage::from_raw(width as u32, height as u32, raw)
        .context("Mask buffer does not match its dimensions")?;
    image
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write label mask {}", path.display()))?;
    Ok(())
}
