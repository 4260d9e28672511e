//! IDAHO chip service provider.
//!
//! A chip is retrieved in two calls: a catalog search that resolves the
//! catalog id to the panchromatic and multispectral image ids covering the
//! point, and a chip request that composes bands from those ids around a
//! centroid or inside a bounding box.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::{write_atomic, ChipFetcher, ChipSpec, ChipType, FetchError};
use crate::config::FetchConfig;
use crate::crs::Bounds;
use crate::index::PointOfInterest;

const CENTROID_ENDPOINT: &str = "v1/chip/centroid/idaho-images/";
const BBOX_ENDPOINT: &str = "v1/chip/bbox/idaho-images/";

const PAN_INTERPRETATION: &str = "PAN";
const EIGHT_BAND_INTERPRETATION: &str = "WORLDVIEW_8_BAND";
const FOUR_BAND_INTERPRETATION: &str = "RGBN";

/// Image ids available for one catalog id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageIds {
    pub pan_id: Option<String>,
    pub ms_id: Option<String>,
    /// Band count of the multispectral image (4 or 8), 0 when absent
    pub ms_bands: u8,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    results: Vec<CatalogRecord>,
}

#[derive(Debug, Deserialize)]
struct CatalogRecord {
    identifier: String,
    #[serde(default)]
    properties: CatalogProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogProperties {
    #[serde(default)]
    color_interpretation: Option<String>,
    #[serde(default)]
    vendor_dataset_identifier: Option<String>,
}

/// Part number of an image, taken from the last three characters after the
/// colon of its vendor dataset identifier (`...:P001`).
fn part_number(vendor_id: Option<&str>) -> u32 {
    vendor_id
        .and_then(|id| id.split(':').nth(1))
        .and_then(|part| part.get(part.len().saturating_sub(3)..))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

impl ImageIds {
    /// Collect image ids from catalog search records, grouped by image part.
    fn from_records(records: &[CatalogRecord]) -> Self {
        let mut parts: BTreeMap<u32, BTreeMap<&str, &str>> = BTreeMap::new();
        for record in records {
            let Some(color) = record.properties.color_interpretation.as_deref() else {
                continue;
            };
            let part = part_number(record.properties.vendor_dataset_identifier.as_deref());
            parts
                .entry(part)
                .or_default()
                .insert(color, record.identifier.as_str());
        }

        let mut ids = ImageIds::default();
        for images in parts.values() {
            if let Some(id) = images.get(PAN_INTERPRETATION) {
                ids.pan_id = Some(id.to_string());
            }
            if let Some(id) = images.get(EIGHT_BAND_INTERPRETATION) {
                ids.ms_id = Some(id.to_string());
                ids.ms_bands = 8;
            } else if let Some(id) = images.get(FOUR_BAND_INTERPRETATION) {
                ids.ms_id = Some(id.to_string());
                ids.ms_bands = 4;
            }
        }
        ids
    }
}

/// Band selection prefix of a chip URL for the requested chip type.
pub fn band_composition(ids: &ImageIds, chip_type: ChipType) -> Result<String, FetchError> {
    let missing = |band| FetchError::MissingBand { chip_type, band };

    match chip_type {
        ChipType::Pan => {
            let pan = ids.pan_id.as_deref().ok_or_else(|| missing("panchromatic"))?;
            Ok(format!("{}?bands=0", pan))
        }
        ChipType::Ms => {
            let ms = ids.ms_id.as_deref().ok_or_else(|| missing("multispectral"))?;
            Ok(format!("{}?", ms))
        }
        ChipType::Ps | ChipType::Ps8 => {
            let ms = ids.ms_id.as_deref().ok_or_else(|| missing("multispectral"))?;
            let pan = ids.pan_id.as_deref().ok_or_else(|| missing("panchromatic"))?;
            let bands = match (ids.ms_bands, chip_type) {
                (8, ChipType::Ps8) => "4,2,1,0,3,5,6,7",
                (8, _) => "4,2,1",
                (bands, _) => {
                    if chip_type == ChipType::Ps8 {
                        tracing::debug!("PS8 requested but {} has {} bands, using bands=0,1,2", ms, bands);
                    }
                    "0,1,2"
                }
            };
            Ok(format!("{}?bands={}&panId={}", ms, bands, pan))
        }
    }
}

/// Degenerate polygon at a point, used as the catalog search area.
pub fn point_aoi_wkt(latitude: f64, longitude: f64) -> String {
    let point = format!("{} {}", longitude, latitude);
    format!("POLYGON (({p}, {p}, {p}, {p}, {p}))", p = point)
}

/// Rectangle polygon for WGS84 bounds.
pub fn bounds_aoi_wkt(bounds: &Bounds) -> String {
    let [w, s, e, n] = *bounds;
    format!(
        "POLYGON (({w} {s}, {e} {s}, {e} {n}, {w} {n}, {w} {s}))",
        w = w,
        s = s,
        e = e,
        n = n
    )
}

/// Chip fetcher backed by the IDAHO chip service and the catalog search API.
pub struct IdahoFetcher {
    client: reqwest::Client,
    base_url: String,
    catalog_url: String,
    token: String,
    dra: bool,
}

impl IdahoFetcher {
    /// Create a fetcher with an explicit access token.
    pub fn new(config: &FetchConfig, token: impl Into<String>) -> anyhow::Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            anyhow::bail!("Chip service access token is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            catalog_url: config.catalog_url.clone(),
            token,
            dra: config.dra,
        })
    }

    /// Create a fetcher reading the token from `config.token_env`.
    pub fn from_env(config: &FetchConfig) -> anyhow::Result<Self> {
        let token = std::env::var(&config.token_env).with_context(|| {
            format!("Access token environment variable {} is not set", config.token_env)
        })?;
        Self::new(config, token)
    }

    /// Resolve a catalog id to image ids inside an area of interest.
    pub async fn lookup_images(&self, catalog_id: &str, aoi_wkt: &str) -> Result<ImageIds, FetchError> {
        let body = serde_json::json!({
            "searchAreaWkt": aoi_wkt,
            "filters": [format!("catalogID = '{}'", catalog_id)],
            "types": ["IDAHOImage"],
        });

        let response = self
            .client
            .post(&self.catalog_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
            });
        }

        let catalog: CatalogResponse = response.json().await?;
        if catalog.results.is_empty() {
            return Err(FetchError::NoImagery {
                catalog_id: catalog_id.to_string(),
            });
        }

        let ids = ImageIds::from_records(&catalog.results);
        tracing::debug!(
            "Catalog {}: pan={:?} ms={:?} ({} bands)",
            catalog_id,
            ids.pan_id,
            ids.ms_id,
            ids.ms_bands
        );
        Ok(ids)
    }

    /// URL of a chip centred on a point.
    pub fn centroid_url(&self, bands: &str, latitude: f64, longitude: f64, spec: &ChipSpec) -> String {
        format!(
            "{}{}{}&lat={}&long={}{}",
            self.base_url,
            CENTROID_ENDPOINT,
            bands,
            latitude,
            longitude,
            self.image_params(spec)
        )
    }

    /// URL of a chip covering WGS84 bounds.
    pub fn bbox_url(&self, bands: &str, bounds: &Bounds, spec: &ChipSpec) -> String {
        let [w, s, e, n] = *bounds;
        format!(
            "{}{}{}&upperLeft={},{}&lowerRight={},{}{}",
            self.base_url,
            BBOX_ENDPOINT,
            bands,
            w,
            n,
            e,
            s,
            self.image_params(spec)
        )
    }

    fn image_params(&self, spec: &ChipSpec) -> String {
        let dra = if self.dra { "&doDRA" } else { "" };
        format!(
            "&width={}&height={}&format={}{}&token={}",
            spec.size, spec.size, spec.format, dra, self.token
        )
    }

    /// Fetch a chip covering WGS84 bounds rather than centred on a point.
    pub async fn fetch_bbox(
        &self,
        catalog_id: &str,
        bounds: &Bounds,
        spec: &ChipSpec,
        destination: &Path,
    ) -> Result<(), FetchError> {
        let ids = self.lookup_images(catalog_id, &bounds_aoi_wkt(bounds)).await?;
        let bands = band_composition(&ids, spec.chip_type)?;
        self.download(&self.bbox_url(&bands, bounds, spec), destination).await
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        tracing::debug!("Requesting chip {}", url.split("&token=").next().unwrap_or(url));

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        write_atomic(destination, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ChipFetcher for IdahoFetcher {
    async fn fetch(
        &self,
        poi: &PointOfInterest,
        spec: &ChipSpec,
        destination: &Path,
    ) -> Result<(), FetchError> {
        let aoi = point_aoi_wkt(poi.latitude, poi.longitude);
        let ids = self.lookup_images(&poi.catalog_id, &aoi).await?;
        let bands = band_composition(&ids, spec.chip_type)?;
        let url = self.centroid_url(&bands, poi.latitude, poi.longitude, spec);
        self.download(&url, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ChipFormat;

    fn ids(pan: Option<&str>, ms: Option<&str>, ms_bands: u8) -> ImageIds {
        ImageIds {
            pan_id: pan.map(String::from),
            ms_id: ms.map(String::from),
            ms_bands,
        }
    }

    fn fetcher(dra: bool) -> IdahoFetcher {
        let config = FetchConfig {
            base_url: "https://chips.example.com".to_string(),
            dra,
            ..FetchConfig::default()
        };
        IdahoFetcher::new(&config, "secret").unwrap()
    }

    #[test]
    fn test_band_composition_eight_band() {
        let ids = ids(Some("pan"), Some("ms"), 8);
        assert_eq!(
            band_composition(&ids, ChipType::Ps8).unwrap(),
            "ms?bands=4,2,1,0,3,5,6,7&panId=pan"
        );
        assert_eq!(band_composition(&ids, ChipType::Ps).unwrap(), "ms?bands=4,2,1&panId=pan");
        assert_eq!(band_composition(&ids, ChipType::Pan).unwrap(), "pan?bands=0");
        assert_eq!(band_composition(&ids, ChipType::Ms).unwrap(), "ms?");
    }

    #[test]
    fn test_band_composition_four_band() {
        let ids = ids(Some("pan"), Some("ms"), 4);
        assert_eq!(band_composition(&ids, ChipType::Ps).unwrap(), "ms?bands=0,1,2&panId=pan");
        assert_eq!(band_composition(&ids, ChipType::Ps8).unwrap(), "ms?bands=0,1,2&panId=pan");
    }

    #[test]
    fn test_band_composition_missing_ids() {
        let pan_only = ids(Some("pan"), None, 0);
        assert!(matches!(
            band_composition(&pan_only, ChipType::Ps8),
            Err(FetchError::MissingBand { band: "multispectral", .. })
        ));
        assert!(matches!(
            band_composition(&pan_only, ChipType::Ms),
            Err(FetchError::MissingBand { .. })
        ));

        let ms_only = ids(None, Some("ms"), 8);
        assert!(matches!(
            band_composition(&ms_only, ChipType::Ps),
            Err(FetchError::MissingBand { band: "panchromatic", .. })
        ));
        assert!(band_composition(&ms_only, ChipType::Ms).is_ok());
    }

    #[test]
    fn test_image_ids_from_catalog_response() {
        let json = r#"{
            "results": [
                {"identifier": "p1-pan", "properties": {"colorInterpretation": "PAN", "vendorDatasetIdentifier": "LV1B:P001"}},
                {"identifier": "p1-ms", "properties": {"colorInterpretation": "WORLDVIEW_8_BAND", "vendorDatasetIdentifier": "LV1B:P001"}},
                {"identifier": "p2-pan", "properties": {"colorInterpretation": "PAN", "vendorDatasetIdentifier": "LV1B:P002"}},
                {"identifier": "odd", "properties": {}}
            ]
        }"#;
        let response: CatalogResponse = serde_json::from_str(json).unwrap();
        let ids = ImageIds::from_records(&response.results);

        assert_eq!(ids.pan_id.as_deref(), Some("p2-pan"));
        assert_eq!(ids.ms_id.as_deref(), Some("p1-ms"));
        assert_eq!(ids.ms_bands, 8);
    }

    #[test]
    fn test_image_ids_four_band() {
        let json = r#"{"results": [
            {"identifier": "rgbn", "properties": {"colorInterpretation": "RGBN", "vendorDatasetIdentifier": "X:P001"}}
        ]}"#;
        let response: CatalogResponse = serde_json::from_str(json).unwrap();
        let ids = ImageIds::from_records(&response.results);
        assert_eq!(ids.ms_id.as_deref(), Some("rgbn"));
        assert_eq!(ids.ms_bands, 4);
        assert_eq!(ids.pan_id, None);
    }

    #[test]
    fn test_part_number() {
        assert_eq!(part_number(Some("LV1B:P003")), 3);
        assert_eq!(part_number(Some("no-colon")), 0);
        assert_eq!(part_number(None), 0);
    }

    #[test]
    fn test_centroid_url() {
        let spec = ChipSpec {
            size: 512,
            chip_type: ChipType::Ps,
            format: ChipFormat::Tif,
        };
        let url = fetcher(false).centroid_url("ms?bands=4,2,1&panId=pan", 37.5, -122.25, &spec);
        assert_eq!(
            url,
            "https://chips.example.com/v1/chip/centroid/idaho-images/ms?bands=4,2,1&panId=pan\
             &lat=37.5&long=-122.25&width=512&height=512&format=TIF&token=secret"
        );
    }

    #[test]
    fn test_bbox_url_with_dra() {
        let spec = ChipSpec {
            size: 256,
            chip_type: ChipType::Pan,
            format: ChipFormat::Png,
        };
        let url = fetcher(true).bbox_url("pan?bands=0", &[1.0, 2.0, 3.0, 4.0], &spec);
        assert_eq!(
            url,
            "https://chips.example.com/v1/chip/bbox/idaho-images/pan?bands=0\
             &upperLeft=1,4&lowerRight=3,2&width=256&height=256&format=PNG&doDRA&token=secret"
        );
    }

    #[test]
    fn test_aoi_wkt() {
        assert_eq!(
            point_aoi_wkt(10.5, -3.0),
            "POLYGON ((-3 10.5, -3 10.5, -3 10.5, -3 10.5, -3 10.5))"
        );
        assert_eq!(
            bounds_aoi_wkt(&[0.0, 1.0, 2.0, 3.0]),
            "POLYGON ((0 1, 2 1, 2 3, 0 3, 0 1))"
        );
    }

    #[test]
    fn test_new_rejects_empty_token() {
        assert!(IdahoFetcher::new(&FetchConfig::default(), "  ").is_err());
    }

    #[test]
    fn test_from_env_requires_variable() {
        let config = FetchConfig {
            token_env: "POI_CHIPPER_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
            ..FetchConfig::default()
        };
        assert!(IdahoFetcher::from_env(&config).is_err());
    }
}
