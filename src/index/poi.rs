//! Read points of interest from an OGR vector source.

use anyhow::{Context, Result};
use gdal::vector::{FieldValue, LayerAccess};
use gdal::Dataset;
use std::path::Path;

use crate::config::PoiColumns;

/// A location to fetch a chip for.
#[derive(Debug, Clone, PartialEq)]
pub struct PointOfInterest {
    /// Image catalog identifier
    pub catalog_id: String,

    /// Decimal degrees, WGS84
    pub latitude: f64,

    /// Decimal degrees, WGS84
    pub longitude: f64,

    /// Position of the row in the source; names the raw chip file
    pub sequence_index: usize,
}

/// Points read from a source, plus the number of rows that were skipped.
#[derive(Debug, Clone, Default)]
pub struct PoiTable {
    pub points: Vec<PointOfInterest>,
    pub rejected: usize,
}

impl PoiTable {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn field_as_f64(value: &FieldValue) -> Option<f64> {
    let v = match value {
        FieldValue::RealValue(v) => *v,
        FieldValue::IntegerValue(v) => f64::from(*v),
        FieldValue::Integer64Value(v) => *v as f64,
        FieldValue::StringValue(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn field_as_string(value: &FieldValue) -> Option<String> {
    let s = match value {
        FieldValue::StringValue(s) => s.trim().to_string(),
        FieldValue::IntegerValue(v) => v.to_string(),
        FieldValue::Integer64Value(v) => v.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Build a point from positional attribute values.
fn parse_row(
    values: &[Option<FieldValue>],
    columns: &PoiColumns,
    sequence_index: usize,
) -> std::result::Result<PointOfInterest, String> {
    let column = |index: usize, name: &str| {
        values
            .get(index)
            .and_then(|v| v.as_ref())
            .ok_or_else(|| format!("missing {} (column {})", name, index))
    };

    let latitude = field_as_f64(column(columns.latitude, "latitude")?)
        .filter(|lat| (-90.0..=90.0).contains(lat))
        .ok_or("latitude is not a valid coordinate")?;
    let longitude = field_as_f64(column(columns.longitude, "longitude")?)
        .filter(|lon| (-180.0..=180.0).contains(lon))
        .ok_or("longitude is not a valid coordinate")?;
    let catalog_id = field_as_string(column(columns.catalog_id, "catalog id")?)
        .ok_or("catalog id is empty")?;

    Ok(PointOfInterest {
        catalog_id,
        latitude,
        longitude,
        sequence_index,
    })
}

/// Read every feature of the first layer of `path` as a point of interest.
///
/// Attributes are taken by position. Rows with unparsable coordinates or
/// an empty catalog id are logged and skipped.
pub fn read_points(path: &Path, columns: &PoiColumns) -> Result<PoiTable> {
    let dataset = Dataset::open(path)
        .with_context(|| format!("Failed to open point-of-interest source {}", path.display()))?;
    let mut layer = dataset
        .layer(0)
        .with_context(|| format!("{} has no vector layer", path.display()))?;

    let mut table = PoiTable::default();
    for (row, feature) in layer.features().enumerate() {
        let values: Vec<Option<FieldValue>> = feature.fields().map(|(_, value)| value).collect();
        match parse_row(&values, columns, row) {
            Ok(poi) => table.points.push(poi),
            Err(reason) => {
                tracing::warn!("Skipping row {} of {}: {}", row, path.display(), reason);
                table.rejected += 1;
            }
        }
    }

    tracing::info!(
        "Read {} points of interest from {} ({} rejected)",
        table.len(),
        path.display(),
        table.rejected
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(lat: FieldValue, lon: FieldValue, id: FieldValue) -> Vec<Option<FieldValue>> {
        vec![Some(lat), Some(lon), Some(id)]
    }

    #[test]
    fn test_parse_row_mixed_types() {
        let values = row(
            FieldValue::StringValue(" 37.25 ".to_string()),
            FieldValue::IntegerValue(-122),
            FieldValue::Integer64Value(103001000),
        );
        let poi = parse_row(&values, &PoiColumns::default(), 4).unwrap();
        assert_eq!(poi.latitude, 37.25);
        assert_eq!(poi.longitude, -122.0);
        assert_eq!(poi.catalog_id, "103001000");
        assert_eq!(poi.sequence_index, 4);
    }

    #[test]
    fn test_parse_row_custom_columns() {
        let columns = PoiColumns {
            latitude: 1,
            longitude: 0,
            catalog_id: 2,
        };
        let values = row(
            FieldValue::RealValue(10.0),
            FieldValue::RealValue(20.0),
            FieldValue::StringValue("abc".to_string()),
        );
        let poi = parse_row(&values, &columns, 0).unwrap();
        assert_eq!((poi.latitude, poi.longitude), (20.0, 10.0));
    }

    #[test]
    fn test_parse_row_rejects_malformed() {
        let columns = PoiColumns::default();

        let bad_lat = row(
            FieldValue::StringValue("north".to_string()),
            FieldValue::RealValue(1.0),
            FieldValue::StringValue("id".to_string()),
        );
        assert!(parse_row(&bad_lat, &columns, 0).is_err());

        let out_of_range = row(
            FieldValue::RealValue(91.0),
            FieldValue::RealValue(1.0),
            FieldValue::StringValue("id".to_string()),
        );
        assert!(parse_row(&out_of_range, &columns, 0).is_err());

        let empty_id = row(
            FieldValue::RealValue(1.0),
            FieldValue::RealValue(1.0),
            FieldValue::StringValue("  ".to_string()),
        );
        assert!(parse_row(&empty_id, &columns, 0).is_err());

        let short = vec![Some(FieldValue::RealValue(1.0)), None];
        assert!(parse_row(&short, &columns, 0).is_err());
    }

    #[test]
    fn test_read_points_from_geojson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.geojson");
        std::fs::write(
            &path,
            r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"lat": 1.5, "lon": 2.5, "catid": "A"}, "geometry": {"type": "Point", "coordinates": [2.5, 1.5]}},
    {"type": "Feature", "properties": {"lat": "bad", "lon": 0.0, "catid": "B"}, "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}},
    {"type": "Feature", "properties": {"lat": -3.0, "lon": 4.0, "catid": "C"}, "geometry": {"type": "Point", "coordinates": [4.0, -3.0]}}
  ]
}"#,
        )
        .unwrap();

        let table = read_points(&path, &PoiColumns::default()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rejected, 1);
        assert_eq!(table.points[0].catalog_id, "A");
        assert_eq!(table.points[1].catalog_id, "C");
        // Rejected rows keep their position so raw chip names stay stable
        assert_eq!(table.points[1].sequence_index, 2);
    }

    #[test]
    fn test_read_points_missing_file() {
        let result = read_points(Path::new("/nonexistent/points.shp"), &PoiColumns::default());
        assert!(result.is_err());
    }
}
