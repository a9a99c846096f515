//! Test doubles for the external collaborators of the pipeline

#![allow(dead_code)]

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use sadasadam::core::correction::{CorrectionEngine, EngineExit};
use sadasadam::io::provider::{AcquisitionError, SceneDescriptor, SceneProvider};
use sadasadam::io::raster::RasterOps;
use sadasadam::io::wvdb::{self, WvdbFetcher};
use sadasadam::{BoundingBox, PipelineResult, SensorFamily, SpatialTemporalFilter};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const S2_SCENE: &str = "S2A_MSIL1C_20230806T101031_N0509_R022_T32TPS_20230806T122302";
pub const LANDSAT_SCENE: &str = "LC09_L1TP_192028_20230806_20230806_02_T1";

/// Log output for failing tests, `RUST_LOG=debug cargo test`
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bounding box of the test area around Bolzano
pub fn aoi() -> BoundingBox {
    BoundingBox::from_nsew(46.6, 45.67, 11.97, 10.44)
}

pub fn filter() -> SpatialTemporalFilter {
    SpatialTemporalFilter::new(
        aoi(),
        NaiveDate::from_ymd_opt(2023, 8, 1).unwrap(),
        NaiveDate::from_ymd_opt(2023, 8, 15).unwrap(),
        80,
    )
    .unwrap()
}

pub fn descriptor(id: &str, provider: &str) -> SceneDescriptor {
    SceneDescriptor {
        id: id.to_string(),
        sensor: SensorFamily::from_scene_id(id).unwrap(),
        acquisition_date: NaiveDate::from_ymd_opt(2023, 8, 6).unwrap(),
        footprint: BoundingBox::from_nsew(46.9, 45.9, 12.4, 10.9),
        cloud_cover: 12.5,
        provider: provider.to_string(),
        payload: None,
    }
}

/// Write a readable archive for a scene the way a provider ships it
pub fn write_scene_archive(sensor: SensorFamily, id: &str, path: &Path) {
    match sensor {
        SensorFamily::Sentinel2 => {
            let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
            zip.start_file(
                format!("{}.SAFE/MTD_MSIL1C.xml", id),
                zip::write::FileOptions::default(),
            )
            .unwrap();
            zip.write_all(b"<metadata/>").unwrap();
            zip.finish().unwrap();
        }
        SensorFamily::Landsat => {
            let gz = GzEncoder::new(File::create(path).unwrap(), Compression::default());
            let mut tar = tar::Builder::new(gz);
            let data = b"GROUP = LANDSAT_METADATA_FILE\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, format!("{}_MTL.txt", id), &data[..])
                .unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }
    }
}

/// How a fake provider answers downloads
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadBehavior {
    Valid,
    /// Every delivered archive is truncated
    Corrupt,
    /// The first `n` downloads fail transiently
    FlakyThenValid(usize),
    Fail(AcquisitionError),
    /// Reports an archive below a regular file, which can be neither read
    /// nor removed
    Unremovable,
}

pub struct FakeProvider {
    pub name: String,
    pub priority: i32,
    pub scenes: Vec<SceneDescriptor>,
    pub search_error: Option<AcquisitionError>,
    pub behavior: DownloadBehavior,
    pub searches: Arc<AtomicUsize>,
    pub downloads: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new(name: &str, ids: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            priority: 0,
            scenes: ids.iter().map(|id| descriptor(id, name)).collect(),
            search_error: None,
            behavior: DownloadBehavior::Valid,
            searches: Arc::new(AtomicUsize::new(0)),
            downloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_behavior(mut self, behavior: DownloadBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_search_error(mut self, error: AcquisitionError) -> Self {
        self.search_error = Some(error);
        self
    }
}

impl SceneProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn search(
        &self,
        _filter: &SpatialTemporalFilter,
        sensor: SensorFamily,
    ) -> Result<Vec<SceneDescriptor>, AcquisitionError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.search_error {
            return Err(err.clone());
        }
        Ok(self
            .scenes
            .iter()
            .filter(|s| s.sensor == sensor)
            .cloned()
            .collect())
    }

    fn download(
        &self,
        scene: &SceneDescriptor,
        target_dir: &Path,
    ) -> Result<PathBuf, AcquisitionError> {
        let attempt = self.downloads.fetch_add(1, Ordering::SeqCst);
        let path = target_dir.join(&scene.sensor.archive_names(&scene.id)[0]);

        match &self.behavior {
            DownloadBehavior::Valid => write_scene_archive(scene.sensor, &scene.id, &path),
            DownloadBehavior::Corrupt => fs::write(&path, b"PK\x03\x04 truncated").unwrap(),
            DownloadBehavior::FlakyThenValid(n) if attempt < *n => {
                return Err(AcquisitionError::Transient("connection reset".to_string()))
            }
            DownloadBehavior::FlakyThenValid(_) => {
                write_scene_archive(scene.sensor, &scene.id, &path)
            }
            DownloadBehavior::Fail(err) => return Err(err.clone()),
            DownloadBehavior::Unremovable => {
                let blocker = target_dir.join("blocker");
                fs::write(&blocker, b"").unwrap();
                return Ok(blocker.join(&scene.sensor.archive_names(&scene.id)[0]));
            }
        }
        Ok(path)
    }
}

fn force_sensor(scene_dir_name: &str) -> &'static str {
    if scene_dir_name.starts_with("S2A") {
        "SEN2A"
    } else if scene_dir_name.starts_with("S2B") {
        "SEN2B"
    } else if scene_dir_name.starts_with("LC08") {
        "LND08"
    } else {
        "LND09"
    }
}

/// Stands in for force-level2 and force-mosaic: writes one log per queued
/// scene and one BOA/QAI mosaic pair per queued sensor
#[derive(Default)]
pub struct FakeEngine {
    pub fail_level2: bool,
    pub level2_calls: Arc<AtomicUsize>,
    pub mosaic_calls: Arc<AtomicUsize>,
    /// Parameter file text seen by the last level-2 call
    pub seen_params: Arc<Mutex<Option<String>>>,
    pub sensors: Mutex<Vec<&'static str>>,
}

impl CorrectionEngine for FakeEngine {
    fn level2(&self, param_file: &Path) -> PipelineResult<EngineExit> {
        self.level2_calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_params.lock().unwrap() = Some(fs::read_to_string(param_file)?);

        let root = param_file.parent().unwrap().parent().unwrap();
        let queue = fs::read_to_string(root.join("level1").join("queue.txt"))?;
        for line in queue.lines() {
            let dir = Path::new(line.split_whitespace().next().unwrap());
            let name = dir.file_name().unwrap().to_string_lossy().to_string();
            let scene = name.trim_end_matches(".SAFE");
            fs::write(
                root.join("log").join(format!("{}.log", scene)),
                format!(
                    "{}: dc: 42.00%. wc: 3.10%. Success! Processing time: 04 mins 12 secs\n",
                    scene
                ),
            )?;
            self.sensors.lock().unwrap().push(force_sensor(&name));
        }

        if self.fail_level2 {
            return Ok(EngineExit::Failed("exit status: 1".to_string()));
        }
        Ok(EngineExit::Success)
    }

    fn mosaic(&self, level2_dir: &Path, mosaic_name: &str) -> PipelineResult<EngineExit> {
        self.mosaic_calls.fetch_add(1, Ordering::SeqCst);
        let dir = level2_dir.join(mosaic_name);
        fs::create_dir_all(&dir)?;
        for sensor in self.sensors.lock().unwrap().iter() {
            for layer in ["BOA", "QAI"] {
                let name = format!("20230806_LEVEL2_{}_{}.vrt", sensor, layer);
                fs::write(dir.join(name), b"<VRTDataset/>")?;
            }
        }
        Ok(EngineExit::Success)
    }
}

/// File-level raster backend: every operation writes its output file and
/// records its name
pub struct FakeRaster {
    pub dem_extent: BoundingBox,
    /// Mosaic keys whose mask has no clear pixel
    pub cloudy: Vec<String>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRaster {
    pub fn new(dem_extent: BoundingBox) -> Self {
        Self {
            dem_extent,
            cloudy: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, op: &str, path: &Path) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", op, path.file_name().unwrap().to_string_lossy()));
    }
}

impl RasterOps for FakeRaster {
    fn extent_wgs84(&self, path: &Path) -> PipelineResult<BoundingBox> {
        self.record("extent", path);
        Ok(self.dem_extent)
    }

    fn wkt_from_epsg(&self, epsg: u32) -> PipelineResult<String> {
        Ok(format!("PROJCS[\"ETRS89 / UTM zone 32N\",AUTHORITY[\"EPSG\",\"{}\"]]", epsg))
    }

    fn clip(
        &self,
        src: &Path,
        dst: &Path,
        _aoi: &BoundingBox,
        _target_epsg: u32,
    ) -> PipelineResult<()> {
        self.record("clip", src);
        fs::copy(src, dst)?;
        Ok(())
    }

    fn clear_sky_mask(&self, qai: &Path, dst: &Path) -> PipelineResult<()> {
        self.record("mask", qai);
        fs::write(dst, b"mask")?;
        Ok(())
    }

    fn has_valid_pixels(&self, mask: &Path) -> PipelineResult<bool> {
        let name = mask.file_name().unwrap().to_string_lossy().to_string();
        Ok(!self.cloudy.iter().any(|key| name.starts_with(key.as_str())))
    }

    fn apply_mask(&self, boa: &Path, _mask: &Path, dst: &Path) -> PipelineResult<()> {
        self.record("apply", boa);
        fs::write(dst, b"boa")?;
        Ok(())
    }

    fn to_geotiff(&self, src: &Path, dst: &Path) -> PipelineResult<()> {
        self.record("translate", src);
        fs::copy(src, dst)?;
        Ok(())
    }

    fn normalized_difference(
        &self,
        src: &Path,
        a_band: usize,
        b_band: usize,
        dst: &Path,
    ) -> PipelineResult<()> {
        self.record(&format!("nd {} {}", a_band, b_band), src);
        fs::write(dst, b"index")?;
        Ok(())
    }
}

/// Writes the monthly climatology files instead of downloading them
#[derive(Default)]
pub struct FakeFetcher {
    pub fetches: Arc<AtomicUsize>,
}

impl WvdbFetcher for FakeFetcher {
    fn fetch(&self, target_dir: &Path) -> PipelineResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(target_dir)?;
        for name in wvdb::required_files() {
            fs::write(target_dir.join(name), b"0 0 0\n")?;
        }
        Ok(())
    }
}
