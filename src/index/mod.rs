//! Vector sources: points of interest and label geometries.

mod labels;
mod poi;

pub use labels::{LabelIndex, LabelShape, ShapePart};
pub use poi::{read_points, PointOfInterest, PoiTable};
