//! Scene search and download capability.
//!
//! [`SceneProvider`] is what the acquisition coordinator consumes. The only
//! bundled implementation, [`EodagProvider`], is an adapter over the `eodag`
//! command line tool.

use crate::io::{files, process};
use crate::types::{BoundingBox, PipelineError, SensorFamily, SpatialTemporalFilter};
use chrono::{Duration, NaiveDate};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Provider failure classes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    /// Network hiccups, timeouts, server errors: worth another attempt
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Credential or provider misconfiguration: retrying cannot help
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

/// A scene as reported by a provider search
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescriptor {
    pub id: String,
    pub sensor: SensorFamily,
    pub acquisition_date: NaiveDate,
    pub footprint: BoundingBox,
    pub cloud_cover: f64,
    /// Name of the backend that reported the scene
    pub provider: String,
    /// Provider specific search record, handed back on download
    pub payload: Option<Value>,
}

/// Search and download capability of an acquisition backend
pub trait SceneProvider {
    fn name(&self) -> &str;

    /// Higher values are asked first
    fn priority(&self) -> i32 {
        0
    }

    fn search(
        &self,
        filter: &SpatialTemporalFilter,
        sensor: SensorFamily,
    ) -> Result<Vec<SceneDescriptor>, AcquisitionError>;

    /// Download a scene into `target_dir` and return the local path
    /// (an archive, or a directory if the backend already extracted it)
    fn download(
        &self,
        scene: &SceneDescriptor,
        target_dir: &Path,
    ) -> Result<PathBuf, AcquisitionError>;
}

/// Adapter over the `eodag` command line tool
#[derive(Debug, Clone)]
pub struct EodagProvider {
    program: String,
    /// Backend priorities forwarded to eodag (higher is preferred)
    priorities: Vec<(String, i32)>,
}

impl Default for EodagProvider {
    fn default() -> Self {
        Self {
            program: "eodag".to_string(),
            priorities: Vec::new(),
        }
    }
}

impl EodagProvider {
    pub fn new(priorities: Vec<(String, i32)>) -> Self {
        Self {
            priorities,
            ..Self::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn env_key(provider: &str, setting: &str) -> String {
        format!("EODAG__{}__{}", provider.to_uppercase().replace('-', "_"), setting)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        for (provider, priority) in &self.priorities {
            cmd.env(Self::env_key(provider, "PRIORITY"), priority.to_string());
        }
        cmd
    }

    fn run(&self, cmd: &mut Command) -> Result<(), AcquisitionError> {
        match process::run_captured(cmd) {
            Ok(_) => Ok(()),
            // a missing or broken installation does not heal on retry
            Err(e @ PipelineError::Launch { .. }) => {
                Err(AcquisitionError::Fatal(e.to_string()))
            }
            Err(e) => Err(classify_failure(&e.to_string())),
        }
    }
}

impl SceneProvider for EodagProvider {
    fn name(&self) -> &str {
        "eodag"
    }

    fn search(
        &self,
        filter: &SpatialTemporalFilter,
        sensor: SensorFamily,
    ) -> Result<Vec<SceneDescriptor>, AcquisitionError> {
        let scratch = tempfile::tempdir().map_err(|e| AcquisitionError::Transient(e.to_string()))?;
        let storage = scratch.path().join("search_results.geojson");
        let aoi = filter.aoi();
        // eodag treats the end date as exclusive
        let end = filter.end() + Duration::days(1);

        let mut cmd = self.command();
        cmd.arg("search")
            .args(["--productType", sensor.product_type()])
            .arg("--box")
            .arg(aoi.min_lon.to_string())
            .arg(aoi.min_lat.to_string())
            .arg(aoi.max_lon.to_string())
            .arg(aoi.max_lat.to_string())
            .arg("--start")
            .arg(filter.start().format("%Y-%m-%d").to_string())
            .arg("--end")
            .arg(end.format("%Y-%m-%d").to_string())
            .arg("--cloudCover")
            .arg(filter.max_cloud_cover().to_string())
            .arg("--all")
            .arg("--storage")
            .arg(&storage);
        self.run(&mut cmd)?;

        let text = fs::read_to_string(&storage)
            .map_err(|e| AcquisitionError::Transient(format!("no search results written: {}", e)))?;
        let collection: Value = serde_json::from_str(&text)
            .map_err(|e| AcquisitionError::Transient(format!("unreadable search results: {}", e)))?;

        let scenes: Vec<SceneDescriptor> = parse_feature_collection(&collection, sensor)
            .into_iter()
            .filter(|scene| filter.includes_date(scene.acquisition_date))
            .collect();

        log::info!("Found {} matching scenes of type {}", scenes.len(), sensor.product_type());
        Ok(scenes)
    }

    fn download(
        &self,
        scene: &SceneDescriptor,
        target_dir: &Path,
    ) -> Result<PathBuf, AcquisitionError> {
        let feature = scene.payload.clone().ok_or_else(|| {
            AcquisitionError::Fatal(format!("scene {} carries no eodag search record", scene.id))
        })?;
        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": [feature],
        });

        let scratch = tempfile::tempdir().map_err(|e| AcquisitionError::Transient(e.to_string()))?;
        let results = scratch.path().join("scene.geojson");
        fs::write(&results, collection.to_string())
            .map_err(|e| AcquisitionError::Transient(e.to_string()))?;

        let mut cmd = self.command();
        cmd.env(Self::env_key(&scene.provider, "DOWNLOAD__OUTPUTS_PREFIX"), target_dir)
            .env(Self::env_key(&scene.provider, "DOWNLOAD__EXTRACT"), "False")
            .arg("download")
            .arg("--search-results")
            .arg(&results);
        self.run(&mut cmd)?;

        locate_download(target_dir, &scene.id).ok_or_else(|| {
            AcquisitionError::Transient(format!(
                "download of {} finished but nothing was written to {}",
                scene.id,
                target_dir.display()
            ))
        })
    }
}

/// Map an error message of the provider tool to the retry class
pub fn classify_failure(message: &str) -> AcquisitionError {
    let lower = message.to_lowercase();
    let fatal = ["authenticat", "credential", "misconfigured", "unauthorized", "forbidden"];

    if fatal.iter().any(|needle| lower.contains(needle)) {
        AcquisitionError::Fatal(message.to_string())
    } else {
        AcquisitionError::Transient(message.to_string())
    }
}

/// Path of the archive or directory a download produced for `scene_id`.
///
/// Archive files win over directories; an empty directory is a leftover of
/// an earlier attempt, not a download.
pub fn locate_download(dir: &Path, scene_id: &str) -> Option<PathBuf> {
    let base = scene_id.trim_end_matches(".SAFE");
    let candidates: Vec<PathBuf> = files::sorted_entries(dir)
        .ok()?
        .into_iter()
        .filter(|path| files::file_name(path).starts_with(base))
        .collect();

    candidates
        .iter()
        .find(|path| path.is_file())
        .or_else(|| {
            candidates.iter().find(|path| {
                fs::read_dir(path).map_or(false, |mut entries| entries.next().is_some())
            })
        })
        .cloned()
}

/// Build descriptors from an eodag GeoJSON FeatureCollection
pub fn parse_feature_collection(collection: &Value, sensor: SensorFamily) -> Vec<SceneDescriptor> {
    let features = match collection.get("features").and_then(|f| f.as_array()) {
        Some(features) => features,
        None => return Vec::new(),
    };

    features
        .iter()
        .filter_map(|feature| match parse_feature(feature, sensor) {
            Some(scene) => Some(scene),
            None => {
                log::warn!("Skipping unreadable search result: {}", feature);
                None
            }
        })
        .collect()
}

fn parse_feature(feature: &Value, sensor: SensorFamily) -> Option<SceneDescriptor> {
    let properties = feature.get("properties")?;
    let id = properties
        .get("title")
        .or_else(|| properties.get("id"))
        .and_then(|v| v.as_str())?
        .to_string();

    let start = properties.get("startTimeFromAscendingNode")?.as_str()?;
    let acquisition_date = NaiveDate::parse_from_str(start.get(..10)?, "%Y-%m-%d").ok()?;

    let mut points = Vec::new();
    collect_positions(feature.get("geometry")?.get("coordinates")?, &mut points);
    let footprint = BoundingBox::enclosing(points)?;

    Some(SceneDescriptor {
        sensor: SensorFamily::from_scene_id(&id).unwrap_or(sensor),
        id,
        acquisition_date,
        footprint,
        cloud_cover: properties.get("cloudCover").and_then(|v| v.as_f64()).unwrap_or(0.0),
        provider: properties
            .get("eodag_provider")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        payload: Some(feature.clone()),
    })
}

fn collect_positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    if let Some(items) = value.as_array() {
        match (items.first().and_then(|v| v.as_f64()), items.get(1).and_then(|v| v.as_f64())) {
            (Some(lon), Some(lat)) => out.push((lon, lat)),
            _ => items.iter().for_each(|item| collect_positions(item, out)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> Value {
        serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[10.3, 45.9], [11.7, 45.9], [11.7, 46.9], [10.3, 46.9], [10.3, 45.9]]]
                    },
                    "properties": {
                        "title": "S2A_MSIL1C_20230806T101031_N0509_R022_T32TPS_20230806T140013",
                        "startTimeFromAscendingNode": "2023-08-06T10:10:31.024Z",
                        "cloudCover": 12.5,
                        "eodag_provider": "cop_dataspace"
                    }
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [[[[9.8, 45.1], [12.1, 45.1], [12.1, 47.2], [9.8, 45.1]]]]
                    },
                    "properties": {
                        "id": "LC09_L1TP_192028_20230806_20230806_02_T1",
                        "startTimeFromAscendingNode": "2023-08-06T09:58:00Z",
                        "eodag_provider": "usgs"
                    }
                },
                { "type": "Feature", "properties": {} }
            ]
        })
    }

    #[test]
    fn test_parse_feature_collection() {
        let scenes = parse_feature_collection(&collection(), SensorFamily::Sentinel2);
        assert_eq!(scenes.len(), 2);

        let s2 = &scenes[0];
        assert_eq!(s2.sensor, SensorFamily::Sentinel2);
        assert_eq!(s2.acquisition_date, NaiveDate::from_ymd_opt(2023, 8, 6).unwrap());
        assert_eq!(s2.footprint, BoundingBox::from_nsew(46.9, 45.9, 11.7, 10.3));
        assert_eq!(s2.provider, "cop_dataspace");

        // sensor is taken from the scene id, not from the query
        let landsat = &scenes[1];
        assert_eq!(landsat.sensor, SensorFamily::Landsat);
        assert_eq!(landsat.footprint.max_lat, 47.2);
        assert_eq!(landsat.cloud_cover, 0.0);
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_failure("eodag failed: HTTP 401 Unauthorized"),
            AcquisitionError::Fatal(_)
        ));
        assert!(matches!(
            classify_failure("MisconfiguredError: missing credentials for usgs"),
            AcquisitionError::Fatal(_)
        ));
        assert!(matches!(
            classify_failure("ReadTimeout: connection timed out"),
            AcquisitionError::Transient(_)
        ));
    }

    #[test]
    fn test_missing_eodag_installation_is_fatal() {
        let filter = SpatialTemporalFilter::new(
            BoundingBox::from_nsew(46.6, 45.67, 11.97, 10.44),
            NaiveDate::from_ymd_opt(2023, 8, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 8, 15).unwrap(),
            80,
        )
        .unwrap();
        let provider = EodagProvider::new(vec![]).with_program("sadasadam-no-such-eodag");

        let err = provider.search(&filter, SensorFamily::Sentinel2).unwrap_err();

        assert!(matches!(err, AcquisitionError::Fatal(_)), "{:?}", err);
        assert!(err.to_string().contains("could not be started"));
    }

    #[test]
    fn test_locate_download() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("other.zip"), b"").unwrap();
        fs::write(tmp.path().join("S2B_MSIL1C_X.SAFE.zip"), b"").unwrap();

        assert_eq!(
            locate_download(tmp.path(), "S2B_MSIL1C_X"),
            Some(tmp.path().join("S2B_MSIL1C_X.SAFE.zip"))
        );
        assert_eq!(locate_download(tmp.path(), "LC08_NONE"), None);
    }

    #[test]
    fn test_locate_download_skips_empty_leftover_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("S2B_MSIL1C_X.SAFE")).unwrap();
        assert_eq!(locate_download(tmp.path(), "S2B_MSIL1C_X"), None);

        fs::write(tmp.path().join("S2B_MSIL1C_X.SAFE.zip"), b"").unwrap();
        assert_eq!(
            locate_download(tmp.path(), "S2B_MSIL1C_X"),
            Some(tmp.path().join("S2B_MSIL1C_X.SAFE.zip"))
        );

        // an extracted download without archive is still found
        fs::remove_file(tmp.path().join("S2B_MSIL1C_X.SAFE.zip")).unwrap();
        fs::write(tmp.path().join("S2B_MSIL1C_X.SAFE").join("MTD_MSIL1C.xml"), b"").unwrap();
        assert_eq!(
            locate_download(tmp.path(), "S2B_MSIL1C_X"),
            Some(tmp.path().join("S2B_MSIL1C_X.SAFE"))
        );
    }
}
