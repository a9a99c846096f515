//! Postprocessing of the FORCE same-day mosaics into clear-sky products.
//!
//! Every [`MosaicGroup`] (one date, one sensor) is handled independently:
//! clip both layers to the area of interest in the target projection, derive
//! the clear-sky mask from the QAI layer, mask the reflectance bands and move
//! the finished artifacts into the output directory. Intermediate files stay
//! in the workspace.

use crate::io::files;
use crate::io::raster::RasterOps;
use crate::types::{BoundingBox, PipelineError, PipelineResult, SensorFamily};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Reflectance and quality mosaic of one acquisition date and sensor
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicGroup {
    pub date: NaiveDate,
    /// FORCE sensor code, e.g. `SEN2A` or `LND09`
    pub sensor: String,
    pub family: SensorFamily,
    pub boa: PathBuf,
    pub qai: PathBuf,
}

impl MosaicGroup {
    /// `<date>_LEVEL2_<sensor>`, the common prefix of all artifacts
    pub fn key(&self) -> String {
        format!("{}_LEVEL2_{}", self.date.format("%Y%m%d"), self.sensor)
    }

    pub fn boa_clearsky_name(&self) -> String {
        format!("{}_BOA_clearsky.tif", self.key())
    }

    pub fn mask_name(&self) -> String {
        format!("{}_clearsky.tif", self.key())
    }

    pub fn qai_clipped_name(&self) -> String {
        format!("{}_QAI_clipped.tif", self.key())
    }
}

/// Sensor family of a FORCE sensor code
pub fn family_of_force_sensor(sensor: &str) -> Option<SensorFamily> {
    if sensor.starts_with("SEN2") {
        Some(SensorFamily::Sentinel2)
    } else if sensor.starts_with("LND") {
        Some(SensorFamily::Landsat)
    } else {
        None
    }
}

/// Pair the BOA and QAI mosaics written by force-mosaic
pub fn discover_groups(mosaic_dir: &Path) -> PipelineResult<Vec<MosaicGroup>> {
    let pattern = Regex::new(r"^(\d{8})_LEVEL2_([A-Z0-9]+)_(BOA|QAI)\.vrt$")
        .map_err(|e| PipelineError::Raster(e.to_string()))?;

    let mut layers: BTreeMap<(String, String), (Option<PathBuf>, Option<PathBuf>)> =
        BTreeMap::new();
    if mosaic_dir.is_dir() {
        for path in files::sorted_entries(mosaic_dir)? {
            let name = files::file_name(&path);
            let Some(caps) = pattern.captures(&name) else {
                continue;
            };
            let entry = layers.entry((caps[1].to_string(), caps[2].to_string())).or_default();
            if &caps[3] == "BOA" {
                entry.0 = Some(path);
            } else {
                entry.1 = Some(path);
            }
        }
    }

    let mut groups = Vec::new();
    for ((date, sensor), pair) in layers {
        let (Some(boa), Some(qai)) = pair else {
            log::warn!("Mosaic {}_LEVEL2_{} lacks its BOA or QAI layer, skipping", date, sensor);
            continue;
        };
        let Some(family) = family_of_force_sensor(&sensor) else {
            log::warn!("Unknown FORCE sensor {}, skipping", sensor);
            continue;
        };
        let date = NaiveDate::parse_from_str(&date, "%Y%m%d")
            .map_err(|e| PipelineError::Raster(format!("bad mosaic date {}: {}", date, e)))?;
        groups.push(MosaicGroup { date, sensor, family, boa, qai });
    }

    Ok(groups)
}

#[derive(Debug, Clone)]
pub struct PostprocessOptions {
    pub aoi: BoundingBox,
    pub target_epsg: u32,
    pub save_qai: bool,
    /// Number of groups processed concurrently
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    Written(Vec<PathBuf>),
    /// The mask has no clear pixel, e.g. the group lies outside the AOI
    NoClearSky,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct GroupResult {
    pub group: MosaicGroup,
    pub outcome: GroupOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct PostprocessReport {
    pub groups: Vec<GroupResult>,
}

impl PostprocessReport {
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.groups
            .iter()
            .filter_map(|g| match &g.outcome {
                GroupOutcome::Written(paths) => Some(paths.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &GroupResult> {
        self.groups
            .iter()
            .filter(|g| matches!(g.outcome, GroupOutcome::Failed(_)))
    }
}

pub struct Postprocessor<'a> {
    raster: &'a dyn RasterOps,
    options: PostprocessOptions,
}

impl<'a> Postprocessor<'a> {
    pub fn new(raster: &'a dyn RasterOps, options: PostprocessOptions) -> Self {
        Self { raster, options }
    }

    /// Process all mosaics of `mosaic_dir`. Per-group failures are reported,
    /// not propagated.
    pub fn run(
        &self,
        mosaic_dir: &Path,
        scratch_dir: &Path,
        output_dir: &Path,
    ) -> PipelineResult<PostprocessReport> {
        let groups = discover_groups(mosaic_dir)?;
        if groups.is_empty() {
            log::warn!(
                "No mosaics found in {}, FORCE produced no output for the area",
                mosaic_dir.display()
            );
            return Ok(PostprocessReport::default());
        }

        files::ensure_dir(output_dir)?;
        log::info!("Postprocessing {} mosaic groups", groups.len());

        let results = self.process_all(groups, scratch_dir, output_dir)?;
        for result in &results {
            match &result.outcome {
                GroupOutcome::Written(_) => {
                    log::info!("Created clear-sky mosaic {}", result.group.boa_clearsky_name())
                }
                GroupOutcome::NoClearSky => {
                    log::info!("{} has no clear-sky pixels in the AOI, skipped", result.group.key())
                }
                GroupOutcome::Failed(reason) => {
                    log::error!("{} failed: {}", result.group.key(), reason)
                }
            }
        }

        Ok(PostprocessReport { groups: results })
    }

    #[cfg(feature = "parallel")]
    fn process_all(
        &self,
        groups: Vec<MosaicGroup>,
        scratch: &Path,
        output: &Path,
    ) -> PipelineResult<Vec<GroupResult>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build()
            .map_err(|e| PipelineError::Postprocessing {
                group: "all".to_string(),
                reason: format!("failed to start worker pool: {}", e),
            })?;

        Ok(pool.install(|| {
            groups
                .into_par_iter()
                .map(|group| self.process_one(group, scratch, output))
                .collect()
        }))
    }

    #[cfg(not(feature = "parallel"))]
    fn process_all(
        &self,
        groups: Vec<MosaicGroup>,
        scratch: &Path,
        output: &Path,
    ) -> PipelineResult<Vec<GroupResult>> {
        Ok(groups
            .into_iter()
            .map(|group| self.process_one(group, scratch, output))
            .collect())
    }

    fn process_one(&self, group: MosaicGroup, scratch: &Path, output: &Path) -> GroupResult {
        let outcome = match self.process_group(&group, scratch, output) {
            Ok(outcome) => outcome,
            Err(e) => GroupOutcome::Failed(e.to_string()),
        };
        GroupResult { group, outcome }
    }

    fn process_group(
        &self,
        group: &MosaicGroup,
        scratch: &Path,
        output: &Path,
    ) -> PipelineResult<GroupOutcome> {
        let key = group.key();
        let work = files::ensure_dir(scratch.join(&key))?;
        let aoi = &self.options.aoi;
        let epsg = self.options.target_epsg;

        let boa_clipped = work.join(format!("{}_BOA_clipped.vrt", key));
        let qai_clipped = work.join(format!("{}_QAI_clipped.vrt", key));
        self.raster.clip(&group.boa, &boa_clipped, aoi, epsg)?;
        self.raster.clip(&group.qai, &qai_clipped, aoi, epsg)?;

        let mask = work.join(group.mask_name());
        self.raster.clear_sky_mask(&qai_clipped, &mask)?;
        if !self.raster.has_valid_pixels(&mask)? {
            remove_stale_artifacts(group, output)?;
            return Ok(GroupOutcome::NoClearSky);
        }

        let masked = work.join(group.boa_clearsky_name());
        self.raster.apply_mask(&boa_clipped, &mask, &masked)?;

        let mut finished = vec![masked, mask];
        if self.options.save_qai {
            let qai_tif = work.join(group.qai_clipped_name());
            self.raster.to_geotiff(&qai_clipped, &qai_tif)?;
            finished.push(qai_tif);
        }

        let mut written = Vec::with_capacity(finished.len());
        for file in finished {
            let target = output.join(files::file_name(&file));
            files::move_replacing(&file, &target)?;
            written.push(target);
        }

        Ok(GroupOutcome::Written(written))
    }
}

/// Drop artifacts an earlier run wrote for a group that now has no clear sky
fn remove_stale_artifacts(group: &MosaicGroup, output: &Path) -> PipelineResult<()> {
    for name in [
        group.boa_clearsky_name(),
        group.mask_name(),
        group.qai_clipped_name(),
    ] {
        let stale = output.join(name);
        if stale.exists() {
            log::info!("Removing outdated {}", stale.display());
            files::remove_path(&stale)?;
        }
    }
    Ok(())
}

/// Move the FORCE log files into the output directory
pub fn relocate_logs(log_dir: &Path, output_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !log_dir.is_dir() {
        return Ok(Vec::new());
    }
    files::ensure_dir(output_dir)?;

    let mut moved = Vec::new();
    for path in files::sorted_entries(log_dir)? {
        if !path.is_file() {
            continue;
        }
        let target = output_dir.join(files::file_name(&path));
        files::move_replacing(&path, &target)?;
        moved.push(target);
    }

    log::info!("Moved {} FORCE log files to {}", moved.len(), output_dir.display());
    Ok(moved)
}
