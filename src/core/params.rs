//! FORCE level-2 parameter files.
//!
//! A parameter file is plain `KEY = value` text between the
//! `++PARAM_LEVEL2_START++` and `++PARAM_LEVEL2_END++` markers. Both ways of
//! producing one go through [`set_keys`], which rewrites matching lines in place
//! and leaves every other line untouched.

use crate::types::{PipelineError, PipelineResult};
use std::fs;
use std::path::{Path, PathBuf};

pub const LEVEL2_HEADER: &str = "++PARAM_LEVEL2_START++";

/// Default level-2 parameters, overridden by the run specific keys
pub const DEFAULT_LEVEL2: &str = "\
++PARAM_LEVEL2_START++

# INPUT/OUTPUT DIRECTORIES
FILE_QUEUE = NULL
DIR_LEVEL2 = NULL
DIR_LOG = NULL
DIR_PROVENANCE = NULL
DIR_TEMP = NULL

# DIGITAL ELEVATION MODEL
FILE_DEM = NULL
DEM_NODATA = -32767

# DATA CUBES
DO_REPROJ = TRUE
DO_TILE = TRUE
FILE_TILE = NULL
TILE_SIZE = 30000
BLOCK_SIZE = 3000
RESOLUTION_LANDSAT = 30
RESOLUTION_SENTINEL2 = 10
ORIGIN_LON = -25
ORIGIN_LAT = 60
PROJECTION = NULL
RESAMPLING = CC

# RADIOMETRIC CORRECTION OPTIONS
DO_ATMO = TRUE
DO_TOPO = TRUE
DO_BRDF = TRUE
ADJACENCY_EFFECT = TRUE
MULTI_SCATTERING = TRUE

# WATER VAPOR CORRECTION OPTIONS
DIR_WVPLUT = NULL
WATER_VAPOR = NULL

# AEROSOL OPTICAL DEPTH OPTIONS
DO_AOD = TRUE
DIR_AOD = NULL

# CLOUD DETECTION OPTIONS
MAX_CLOUD_COVER_FRAME = 75
MAX_CLOUD_COVER_TILE = 75
CLOUD_BUFFER = 300
SHADOW_BUFFER = 90
SNOW_BUFFER = 30
CLOUD_THRESHOLD = 0.225
SHADOW_THRESHOLD = 0.02

# RESOLUTION MERGING
RES_MERGE = IMPROPHE

# CO-REGISTRATION OPTIONS
DIR_COREG_BASE = NULL
COREG_BASE_NODATA = -9999

# MISCELLANEOUS OPTIONS
IMPULSE_NOISE = TRUE
BUFFER_NODATA = FALSE

# TIER LEVEL
TIER = 1

# PARALLEL PROCESSING
NPROC = 1
NTHREAD = 2
PARALLEL_READS = FALSE
DELAY = 3
TIMEOUT_ZIP = 30

# OUTPUT OPTIONS
OUTPUT_FORMAT = GTiff
OUTPUT_DST = FALSE
OUTPUT_AOD = FALSE
OUTPUT_WVP = FALSE
OUTPUT_VZN = FALSE
OUTPUT_HOT = FALSE
OUTPUT_OVV = TRUE

++PARAM_LEVEL2_END++
";

/// The small set of user knobs a parameter file is synthesized from
#[derive(Debug, Clone, PartialEq)]
pub struct ForceKnobs {
    pub dem_path: PathBuf,
    pub n_procs: u32,
    pub n_threads: u32,
    pub cloud_buffer: u32,
}

/// Where the parameters of a run come from
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSource {
    /// Defaults merged with the user knobs
    Synthesized(ForceKnobs),
    /// Complete user file, only the directory block is rewritten
    UserFile(PathBuf),
}

/// Workspace locations referenced by the input/output directory block
#[derive(Debug, Clone)]
pub struct DirectoryBlock {
    pub queue_file: PathBuf,
    pub level2: PathBuf,
    pub log: PathBuf,
    pub provenance: PathBuf,
    pub temp: PathBuf,
    pub wvdb: PathBuf,
}

impl DirectoryBlock {
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("FILE_QUEUE", self.queue_file.display().to_string()),
            ("DIR_LEVEL2", self.level2.display().to_string()),
            ("DIR_LOG", self.log.display().to_string()),
            ("DIR_PROVENANCE", self.provenance.display().to_string()),
            ("DIR_TEMP", self.temp.display().to_string()),
            ("DIR_WVPLUT", self.wvdb.display().to_string()),
        ]
    }
}

/// The rendered parameter file of one run
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    text: String,
}

impl ParameterSet {
    /// Defaults plus user knobs plus directory block
    pub fn synthesize(knobs: &ForceKnobs, dirs: &DirectoryBlock, projection_wkt: &str) -> Self {
        let mut entries = dirs.entries();
        entries.extend([
            ("FILE_DEM", knobs.dem_path.display().to_string()),
            ("PROJECTION", projection_wkt.to_string()),
            ("RESAMPLING", "BL".to_string()),
            // cloud cover was already limited at search time; keep every frame and tile
            ("MAX_CLOUD_COVER_FRAME", "100".to_string()),
            ("MAX_CLOUD_COVER_TILE", "100".to_string()),
            ("CLOUD_BUFFER", knobs.cloud_buffer.to_string()),
            ("NPROC", knobs.n_procs.to_string()),
            ("NTHREAD", knobs.n_threads.to_string()),
        ]);

        Self {
            text: set_keys(DEFAULT_LEVEL2, &entries),
        }
    }

    /// Point a user supplied parameter file at the current workspace
    pub fn adapt(user_text: &str, dirs: &DirectoryBlock) -> Self {
        Self {
            text: set_keys(user_text, &dirs.entries()),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Value of a key, `None` if absent
    pub fn value(&self, key: &str) -> Option<&str> {
        lookup(&self.text, key)
    }

    /// Write the file and make it read-only
    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        fs::write(path, &self.text)?;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
        log::info!("FORCE parameter file written to {}", path.display());
        Ok(())
    }
}

/// Key of a `KEY = value` line, `None` for comments, markers and blank lines
pub fn parse_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("++") {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

/// Value of `key` in parameter file text
pub fn lookup<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .find(|line| parse_key(line) == Some(key))
        .and_then(|line| line.split_once('='))
        .map(|(_, value)| value.trim())
}

/// Read a user parameter file
pub fn read_user_file(path: &Path) -> PipelineResult<String> {
    fs::read_to_string(path).map_err(|e| {
        PipelineError::config(
            "force_param_file",
            format!("cannot read {}: {}", path.display(), e),
        )
    })
}

/// DEM referenced by a parameter file, if any
pub fn dem_of(text: &str) -> Option<PathBuf> {
    lookup(text, "FILE_DEM")
        .filter(|v| !v.is_empty() && *v != "NULL")
        .map(PathBuf::from)
}

/// Replace the lines of the given keys, injecting absent keys right after the
/// level-2 header (or at the top if there is none). All other lines, including
/// their line endings, are kept byte for byte.
pub fn set_keys(text: &str, entries: &[(&str, String)]) -> String {
    let mut seen = vec![false; entries.len()];
    let mut lines: Vec<String> = Vec::new();

    for line in text.split_inclusive('\n') {
        let position = parse_key(line).and_then(|key| entries.iter().position(|(k, _)| *k == key));
        match position {
            Some(i) => {
                seen[i] = true;
                let ending = if line.ends_with("\r\n") {
                    "\r\n"
                } else if line.ends_with('\n') {
                    "\n"
                } else {
                    ""
                };
                lines.push(format!("{} = {}{}", entries[i].0, entries[i].1, ending));
            }
            None => lines.push(line.to_string()),
        }
    }

    let missing: Vec<String> = entries
        .iter()
        .zip(&seen)
        .filter(|(_, seen)| !**seen)
        .map(|((key, value), _)| format!("{} = {}\n", key, value))
        .collect();

    if !missing.is_empty() {
        log::debug!("Injecting {} missing parameter keys", missing.len());
        match lines.iter().position(|l| l.trim() == LEVEL2_HEADER) {
            Some(header) => {
                if !lines[header].ends_with('\n') {
                    lines[header].push('\n');
                }
                for (offset, line) in missing.into_iter().enumerate() {
                    lines.insert(header + 1 + offset, line);
                }
            }
            None => lines = missing.into_iter().chain(lines).collect(),
        }
    }

    lines.concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> DirectoryBlock {
        let ws = PathBuf::from("/tmp/force_dir_20230816_120000");
        DirectoryBlock {
            queue_file: ws.join("level1/queue.txt"),
            level2: ws.join("level2"),
            log: ws.join("log"),
            provenance: ws.join("provenance"),
            temp: ws.join("temp"),
            wvdb: PathBuf::from("/cache/wvdb"),
        }
    }

    #[test]
    fn test_synthesized_file_carries_knobs() {
        let knobs = ForceKnobs {
            dem_path: PathBuf::from("/data/dem.tif"),
            n_procs: 4,
            n_threads: 3,
            cloud_buffer: 150,
        };
        let params = ParameterSet::synthesize(&knobs, &dirs(), "PROJCS[\"ETRS89 / UTM zone 32N\"]");

        assert_eq!(params.value("FILE_DEM"), Some("/data/dem.tif"));
        assert_eq!(params.value("NPROC"), Some("4"));
        assert_eq!(params.value("NTHREAD"), Some("3"));
        assert_eq!(params.value("CLOUD_BUFFER"), Some("150"));
        assert_eq!(params.value("RESAMPLING"), Some("BL"));
        assert_eq!(params.value("MAX_CLOUD_COVER_TILE"), Some("100"));
        assert_eq!(params.value("PROJECTION"), Some("PROJCS[\"ETRS89 / UTM zone 32N\"]"));
        assert_eq!(params.value("DIR_LEVEL2"), Some("/tmp/force_dir_20230816_120000/level2"));
        assert_eq!(params.value("DIR_WVPLUT"), Some("/cache/wvdb"));
        // untouched defaults survive
        assert_eq!(params.value("DO_TOPO"), Some("TRUE"));
        assert!(params.text().starts_with(LEVEL2_HEADER));
        assert!(params.text().trim_end().ends_with("++PARAM_LEVEL2_END++"));
    }

    #[test]
    fn test_adapt_rewrites_only_directory_block() {
        let user = "++PARAM_LEVEL2_START++\r\nFILE_QUEUE = /old/queue\r\n# keep me\r\nNPROC = 12\r\nDIR_TEMP=/old/tmp\r\n++PARAM_LEVEL2_END++";
        let params = ParameterSet::adapt(user, &dirs());

        assert_eq!(
            params.value("FILE_QUEUE"),
            Some("/tmp/force_dir_20230816_120000/level1/queue.txt")
        );
        assert_eq!(params.value("DIR_TEMP"), Some("/tmp/force_dir_20230816_120000/temp"));
        assert_eq!(params.value("NPROC"), Some("12"));
        assert!(params.text().contains("# keep me\r\nNPROC = 12\r\n"));
        assert!(params.text().ends_with("++PARAM_LEVEL2_END++"));
    }

    #[test]
    fn test_missing_keys_are_injected_after_header() {
        let user = "++PARAM_LEVEL2_START++\nNPROC = 2\n++PARAM_LEVEL2_END++\n";
        let text = set_keys(user, &[("DIR_LOG", "/ws/log".to_string())]);
        assert_eq!(
            text,
            "++PARAM_LEVEL2_START++\nDIR_LOG = /ws/log\nNPROC = 2\n++PARAM_LEVEL2_END++\n"
        );

        let headerless = set_keys("NPROC = 2\n", &[("DIR_LOG", "/ws/log".to_string())]);
        assert_eq!(headerless, "DIR_LOG = /ws/log\nNPROC = 2\n");
    }

    #[test]
    fn test_dem_lookup() {
        assert_eq!(dem_of("FILE_DEM = /data/dem.tif\n"), Some(PathBuf::from("/data/dem.tif")));
        assert_eq!(dem_of("FILE_DEM = NULL\n"), None);
        assert_eq!(dem_of("# FILE_DEM = /x\n"), None);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("  NPROC = 3"), Some("NPROC"));
        assert_eq!(parse_key("# NPROC = 3"), None);
        assert_eq!(parse_key("++PARAM_LEVEL2_END++"), None);
        assert_eq!(parse_key(""), None);
    }
}
