//! Spectral indices over the clear-sky reflectance mosaics.

use crate::core::postprocess::family_of_force_sensor;
use crate::io::files;
use crate::io::raster::RasterOps;
use crate::types::{PipelineError, PipelineResult, SensorFamily};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CLEARSKY_SUFFIX: &str = "_BOA_clearsky.tif";

/// Supported normalized difference indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectralIndex {
    /// Normalized Difference Vegetation Index
    Ndvi,
    /// Normalized Difference Snow Index
    Ndsi,
    /// Normalized Difference Moisture Index
    Ndmi,
}

impl SpectralIndex {
    /// (A, B) band positions in the FORCE BOA product, index = (A - B) / (A + B).
    ///
    /// FORCE Sentinel-2 band order: BLUE GREEN RED RE1 RE2 RE3 BNIR NIR SWIR1 SWIR2.
    /// FORCE Landsat band order: BLUE GREEN RED NIR SWIR1 SWIR2.
    pub fn bands(&self, family: SensorFamily) -> (usize, usize) {
        match (self, family) {
            (SpectralIndex::Ndvi, SensorFamily::Sentinel2) => (8, 3),
            (SpectralIndex::Ndsi, SensorFamily::Sentinel2) => (2, 9),
            (SpectralIndex::Ndmi, SensorFamily::Sentinel2) => (8, 9),
            (SpectralIndex::Ndvi, SensorFamily::Landsat) => (4, 3),
            (SpectralIndex::Ndsi, SensorFamily::Landsat) => (2, 5),
            (SpectralIndex::Ndmi, SensorFamily::Landsat) => (4, 5),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "NDVI",
            SpectralIndex::Ndsi => "NDSI",
            SpectralIndex::Ndmi => "NDMI",
        }
    }
}

impl fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SpectralIndex {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NDVI" => Ok(SpectralIndex::Ndvi),
            "NDSI" => Ok(SpectralIndex::Ndsi),
            "NDMI" => Ok(SpectralIndex::Ndmi),
            other => Err(PipelineError::config(
                "indices_list",
                format!("unsupported index {} (supported: NDVI, NDSI, NDMI)", other),
            )),
        }
    }
}

/// One index raster to compute
#[derive(Debug, Clone, PartialEq)]
pub struct IndexJob {
    pub index: SpectralIndex,
    pub source: PathBuf,
    pub family: SensorFamily,
    pub output: PathBuf,
}

/// Plan index jobs for every clear-sky mosaic in `input_dir`
pub fn plan_jobs(
    input_dir: &Path,
    output_dir: &Path,
    indices: &[SpectralIndex],
) -> PipelineResult<Vec<IndexJob>> {
    let mut jobs = Vec::new();
    if !input_dir.is_dir() {
        return Ok(jobs);
    }

    for path in files::sorted_entries(input_dir)? {
        let name = files::file_name(&path);
        let Some(key) = name.strip_suffix(CLEARSKY_SUFFIX) else {
            continue;
        };
        // <date>_LEVEL2_<sensor>
        let Some(family) = key.rsplit('_').next().and_then(family_of_force_sensor) else {
            log::warn!("Cannot tell the sensor of {}, no indices computed", name);
            continue;
        };

        for index in indices {
            jobs.push(IndexJob {
                index: *index,
                source: path.clone(),
                family,
                output: output_dir.join(format!("{}_{}.tif", key, index)),
            });
        }
    }

    Ok(jobs)
}

pub struct IndexCalculator<'a> {
    raster: &'a dyn RasterOps,
    workers: usize,
}

impl<'a> IndexCalculator<'a> {
    pub fn new(raster: &'a dyn RasterOps, workers: usize) -> Self {
        Self { raster, workers }
    }

    /// Compute all requested indices; returns written rasters and failures
    pub fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        indices: &[SpectralIndex],
    ) -> PipelineResult<(Vec<PathBuf>, Vec<(PathBuf, String)>)> {
        let jobs = plan_jobs(input_dir, output_dir, indices)?;
        if jobs.is_empty() {
            log::info!("No clear-sky mosaics in {}, no indices to compute", input_dir.display());
            return Ok((Vec::new(), Vec::new()));
        }
        files::ensure_dir(output_dir)?;
        log::info!("Computing {} index rasters", jobs.len());

        let results = self.execute(&jobs)?;

        let mut written = Vec::new();
        let mut failed = Vec::new();
        for (job, result) in jobs.into_iter().zip(results) {
            match result {
                Ok(()) => written.push(job.output),
                Err(e) => {
                    log::error!("{} of {} failed: {}", job.index, job.source.display(), e);
                    failed.push((job.output, e.to_string()));
                }
            }
        }
        Ok((written, failed))
    }

    fn compute(&self, job: &IndexJob) -> PipelineResult<()> {
        let (a, b) = job.index.bands(job.family);
        log::debug!(
            "{} = (b{} - b{}) / (b{} + b{}) -> {}",
            job.index,
            a,
            b,
            a,
            b,
            job.output.display()
        );
        self.raster.normalized_difference(&job.source, a, b, &job.output)
    }

    #[cfg(feature = "parallel")]
    fn execute(&self, jobs: &[IndexJob]) -> PipelineResult<Vec<PipelineResult<()>>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.max(1))
            .build()
            .map_err(|e| PipelineError::Raster(format!("failed to start worker pool: {}", e)))?;
        Ok(pool.install(|| jobs.par_iter().map(|job| self.compute(job)).collect()))
    }

    #[cfg(not(feature = "parallel"))]
    fn execute(&self, jobs: &[IndexJob]) -> PipelineResult<Vec<PipelineResult<()>>> {
        Ok(jobs.iter().map(|job| self.compute(job)).collect())
    }
}
