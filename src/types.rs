use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Geospatial bounding box in decimal degrees (WGS84)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Build a bounding box from the north/south/east/west convention used in the
    /// configuration file
    pub fn from_nsew(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            min_lon: west,
            max_lon: east,
            min_lat: south,
            max_lat: north,
        }
    }

    /// True if `other` lies completely inside this box
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.min_lon
            && self.max_lon >= other.max_lon
            && self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
    }

    /// Overlapping part of both boxes, if any
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_lon = self.min_lon.max(other.min_lon);
        let max_lon = self.max_lon.min(other.max_lon);
        let min_lat = self.min_lat.max(other.min_lat);
        let max_lat = self.max_lat.min(other.max_lat);

        if min_lon < max_lon && min_lat < max_lat {
            Some(BoundingBox { min_lon, max_lon, min_lat, max_lat })
        } else {
            None
        }
    }

    /// Smallest box enclosing all given (lon, lat) points
    pub fn enclosing<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<BoundingBox> {
        let mut bbox: Option<BoundingBox> = None;
        for (lon, lat) in points {
            bbox = Some(match bbox {
                None => BoundingBox { min_lon: lon, max_lon: lon, min_lat: lat, max_lat: lat },
                Some(b) => BoundingBox {
                    min_lon: b.min_lon.min(lon),
                    max_lon: b.max_lon.max(lon),
                    min_lat: b.min_lat.min(lat),
                    max_lat: b.max_lat.max(lat),
                },
            });
        }
        bbox
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lon [{:.4}, {:.4}], lat [{:.4}, {:.4}]",
            self.min_lon, self.max_lon, self.min_lat, self.max_lat
        )
    }
}

/// Supported optical sensor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorFamily {
    /// Sentinel-2 MSI level-1C (SAFE products)
    Sentinel2,
    /// Landsat 8/9 OLI(-TIRS) collection 2 level-1
    Landsat,
}

impl SensorFamily {
    pub const ALL: [SensorFamily; 2] = [SensorFamily::Sentinel2, SensorFamily::Landsat];

    /// Product type name understood by the acquisition provider
    pub fn product_type(&self) -> &'static str {
        match self {
            SensorFamily::Sentinel2 => "S2_MSI_L1C",
            SensorFamily::Landsat => "LANDSAT_C2L1",
        }
    }

    /// Scene identifier prefixes of this family
    pub fn scene_prefixes(&self) -> &'static [&'static str] {
        match self {
            SensorFamily::Sentinel2 => &["S2A", "S2B", "S2C"],
            SensorFamily::Landsat => &["LC08", "LC09", "LO08", "LO09"],
        }
    }

    /// Determine the sensor family from a scene identifier or file name
    pub fn from_scene_id(id: &str) -> Option<SensorFamily> {
        Self::ALL
            .into_iter()
            .find(|family| family.scene_prefixes().iter().any(|p| id.starts_with(p)))
    }

    /// Name of the extracted scene directory expected by FORCE
    pub fn scene_dir_name(&self, scene_id: &str) -> String {
        let base = strip_archive_suffix(scene_id);
        match self {
            SensorFamily::Sentinel2 => {
                if base.ends_with(".SAFE") {
                    base.to_string()
                } else {
                    format!("{}.SAFE", base)
                }
            }
            SensorFamily::Landsat => base.to_string(),
        }
    }

    /// Archive file names a provider may deliver for this scene
    pub fn archive_names(&self, scene_id: &str) -> Vec<String> {
        let base = strip_archive_suffix(scene_id).trim_end_matches(".SAFE");
        match self {
            SensorFamily::Sentinel2 => vec![format!("{}.SAFE.zip", base), format!("{}.zip", base)],
            SensorFamily::Landsat => vec![format!("{}.tar.gz", base), format!("{}.tar", base)],
        }
    }
}

impl std::fmt::Display for SensorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorFamily::Sentinel2 => write!(f, "Sentinel-2"),
            SensorFamily::Landsat => write!(f, "Landsat"),
        }
    }
}

/// Remove known archive extensions from a file name
pub fn strip_archive_suffix(name: &str) -> &str {
    for suffix in [".SAFE.zip", ".tar.gz", ".zip", ".tar"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return if suffix == ".SAFE.zip" {
                // keep the SAFE marker, it is part of the product name
                &name[..stripped.len() + 5]
            } else {
                stripped
            };
        }
    }
    name
}

/// Area, time window and quality filter of a run. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpatialTemporalFilter {
    aoi: BoundingBox,
    start: NaiveDate,
    end: NaiveDate,
    max_cloud_cover: u8,
}

impl SpatialTemporalFilter {
    /// Validate and build a filter
    pub fn new(
        aoi: BoundingBox,
        start: NaiveDate,
        end: NaiveDate,
        max_cloud_cover: u8,
    ) -> PipelineResult<Self> {
        if !(aoi.max_lat > aoi.min_lat) {
            return Err(PipelineError::config(
                "north",
                format!("north ({}) must be greater than south ({})", aoi.max_lat, aoi.min_lat),
            ));
        }
        if !(aoi.max_lon > aoi.min_lon) {
            return Err(PipelineError::config(
                "east",
                format!("east ({}) must be greater than west ({})", aoi.max_lon, aoi.min_lon),
            ));
        }
        if aoi.min_lat < -90.0 || aoi.max_lat > 90.0 {
            return Err(PipelineError::config("north", "latitudes must lie within [-90, 90]"));
        }
        if aoi.min_lon < -180.0 || aoi.max_lon > 180.0 {
            return Err(PipelineError::config("east", "longitudes must lie within [-180, 180]"));
        }
        if start > end {
            return Err(PipelineError::config(
                "start",
                format!("start date {} is after end date {}", start, end),
            ));
        }
        if max_cloud_cover > 100 {
            return Err(PipelineError::config(
                "cloud_cover",
                format!("{} is not a percentage (0-100)", max_cloud_cover),
            ));
        }

        Ok(Self { aoi, start, end, max_cloud_cover })
    }

    pub fn aoi(&self) -> &BoundingBox {
        &self.aoi
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn max_cloud_cover(&self) -> u8 {
        self.max_cloud_cover
    }

    /// True if the date lies in the inclusive [start, end] window
    pub fn includes_date(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Stage selection of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Acquisition, correction, postprocessing, indices, cleanup
    Full,
    /// Acquisition only
    DownloadOnly,
    /// Correction and postprocessing on a pre-populated download directory
    CorrectionOnly,
    /// Spectral indices over existing clear-sky mosaics
    IndicesOnly,
}

impl RunMode {
    /// Resolve the mode flags of the configuration file. At most one may be set.
    pub fn from_flags(
        download_only: bool,
        force_only: bool,
        indices_only: bool,
    ) -> PipelineResult<Self> {
        match (download_only, force_only, indices_only) {
            (false, false, false) => Ok(RunMode::Full),
            (true, false, false) => Ok(RunMode::DownloadOnly),
            (false, true, false) => Ok(RunMode::CorrectionOnly),
            (false, false, true) => Ok(RunMode::IndicesOnly),
            (true, true, _) => Err(PipelineError::config(
                "force_only",
                "download_only and force_only are both true, nothing to do",
            )),
            _ => Err(PipelineError::config(
                "indices_only",
                "indices_only cannot be combined with download_only or force_only",
            )),
        }
    }

    pub fn runs_acquisition(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::DownloadOnly)
    }

    pub fn runs_correction(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::CorrectionOnly)
    }

    pub fn runs_indices(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::IndicesOnly)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full run"),
            RunMode::DownloadOnly => write!(f, "download only"),
            RunMode::CorrectionOnly => write!(f, "correction and postprocessing only"),
            RunMode::IndicesOnly => write!(f, "indices only"),
        }
    }
}

/// Error types for the mosaic pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error in `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("acquisition provider error: {0}")]
    FatalAcquisition(String),

    #[error("correction engine failed ({status}), see logs in {}", log_dir.display())]
    CorrectionEngine { status: String, log_dir: PathBuf },

    #[error("postprocessing of {group} failed: {reason}")]
    Postprocessing { group: String, reason: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("raster error: {0}")]
    Raster(String),

    #[error("{program} failed: {reason}")]
    Process { program: String, reason: String },

    #[error("{program} could not be started: {reason}")]
    Launch { program: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl PipelineError {
    /// Shorthand for a configuration error pointing at a field
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors are reported before any stage runs
    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::Config { .. })
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_filter_rejects_inverted_latitudes() {
        let bbox = BoundingBox::from_nsew(45.0, 46.0, 11.97, 10.44);
        let err = SpatialTemporalFilter::new(bbox, date("2023-08-01"), date("2023-08-15"), 50)
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("`north`"));
    }

    #[test]
    fn test_filter_rejects_inverted_longitudes() {
        let bbox = BoundingBox::from_nsew(46.6, 45.67, 10.0, 10.44);
        let err = SpatialTemporalFilter::new(bbox, date("2023-08-01"), date("2023-08-15"), 50)
            .unwrap_err();
        assert!(err.to_string().contains("`east`"));
    }

    #[test]
    fn test_filter_rejects_nan_and_reversed_dates() {
        let nan_box = BoundingBox::from_nsew(f64::NAN, 45.67, 11.97, 10.44);
        assert!(
            SpatialTemporalFilter::new(nan_box, date("2023-08-01"), date("2023-08-15"), 50).is_err()
        );

        let bbox = BoundingBox::from_nsew(46.6, 45.67, 11.97, 10.44);
        assert!(
            SpatialTemporalFilter::new(bbox, date("2023-08-16"), date("2023-08-15"), 50).is_err()
        );
        assert!(
            SpatialTemporalFilter::new(bbox, date("2023-08-01"), date("2023-08-15"), 101).is_err()
        );
    }

    #[test]
    fn test_filter_date_window_is_inclusive() {
        let bbox = BoundingBox::from_nsew(46.6, 45.67, 11.97, 10.44);
        let filter =
            SpatialTemporalFilter::new(bbox, date("2023-08-01"), date("2023-08-15"), 100).unwrap();
        assert!(filter.includes_date(date("2023-08-01")));
        assert!(filter.includes_date(date("2023-08-15")));
        assert!(!filter.includes_date(date("2023-08-16")));
    }

    #[test]
    fn test_bbox_containment_and_intersection() {
        let outer = BoundingBox::from_nsew(47.0, 45.0, 12.0, 10.0);
        let inner = BoundingBox::from_nsew(46.6, 45.67, 11.97, 10.44);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert_eq!(outer.intersection(&inner), Some(inner));

        let disjoint = BoundingBox::from_nsew(10.0, 9.0, 1.0, 0.0);
        assert!(outer.intersection(&disjoint).is_none());
    }

    #[test]
    fn test_sensor_family_naming() {
        let s2 = "S2A_MSIL1C_20230801T101031_N0509_R022_T32TPS_20230801T140013";
        assert_eq!(SensorFamily::from_scene_id(s2), Some(SensorFamily::Sentinel2));
        assert_eq!(SensorFamily::Sentinel2.scene_dir_name(s2), format!("{}.SAFE", s2));
        assert_eq!(
            SensorFamily::Sentinel2.scene_dir_name(&format!("{}.SAFE.zip", s2)),
            format!("{}.SAFE", s2)
        );

        let lc = "LC09_L1TP_192028_20230801_20230801_02_T1";
        assert_eq!(SensorFamily::from_scene_id(lc), Some(SensorFamily::Landsat));
        assert_eq!(SensorFamily::Landsat.scene_dir_name(&format!("{}.tar.gz", lc)), lc);
        assert_eq!(SensorFamily::from_scene_id("queue.txt"), None);
    }

    #[test]
    fn test_mode_flags_are_mutually_exclusive() {
        assert_eq!(RunMode::from_flags(false, false, false).unwrap(), RunMode::Full);
        assert_eq!(RunMode::from_flags(true, false, false).unwrap(), RunMode::DownloadOnly);
        assert_eq!(RunMode::from_flags(false, true, false).unwrap(), RunMode::CorrectionOnly);
        assert!(RunMode::from_flags(true, true, false).unwrap_err().is_configuration());
        assert!(RunMode::from_flags(false, true, true).is_err());
    }
}
