//! Configuration file model.
//!
//! [`Config`] mirrors the YAML document key by key; [`Config::validate`] turns
//! it into resolved [`Settings`] or a configuration error naming the offending
//! key. Nothing is touched on disk before validation succeeds.

use crate::core::acquisition::AcquisitionOptions;
use crate::core::indices::SpectralIndex;
use crate::core::params::{ForceKnobs, ParameterSource};
use crate::io::wvdb::WaterVaporCache;
use crate::types::{BoundingBox, PipelineError, PipelineResult, RunMode, SpatialTemporalFilter};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Value of `force_param_file` that means "no parameter file"
pub const NO_PARAM_FILE: &str = "None";

/// Raw configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Area of interest in decimal degrees
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,

    /// Inclusive date range, `YYYY-MM-DD`
    pub start: Option<String>,
    pub end: Option<String>,

    /// Maximum scene cloud cover in percent
    pub cloud_cover: Option<i64>,

    pub output_dir: Option<PathBuf>,

    /// Default: `<output_dir>/download`
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Parent of the per-run FORCE workspaces. Default: `<output_dir>/temp`
    #[serde(default)]
    pub temp_force_dir: Option<PathBuf>,

    /// Persistent water vapor database. Default: user cache directory
    #[serde(default)]
    pub wvdb_dir: Option<PathBuf>,

    #[serde(default)]
    pub dem_path: Option<PathBuf>,

    #[serde(default = "default_target_proj_epsg")]
    pub target_proj_epsg: u32,

    /// Complete FORCE level-2 parameter file, or `None`
    #[serde(default)]
    pub force_param_file: Option<String>,

    #[serde(default)]
    pub n_procs_force: Option<u32>,
    #[serde(default)]
    pub n_threads_force: Option<u32>,
    #[serde(default)]
    pub cloud_buffer: Option<u32>,

    #[serde(default = "default_n_procs_postprocessing")]
    pub n_procs_postprocessing: usize,

    #[serde(default)]
    pub save_qai: bool,
    #[serde(default)]
    pub remove_force_data: bool,
    #[serde(default)]
    pub clear_download: bool,
    #[serde(default)]
    pub download_only: bool,
    #[serde(default)]
    pub force_only: bool,
    #[serde(default)]
    pub indices_only: bool,

    /// Default: `<output_dir>/indices`
    #[serde(default)]
    pub indices_dir: Option<PathBuf>,
    #[serde(default)]
    pub indices_list: Vec<String>,

    #[serde(default = "default_max_download_retries")]
    pub max_download_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Acquisition backend priorities, higher is preferred
    #[serde(default)]
    pub providers: Vec<ProviderPriority>,

    /// Directory holding the FORCE executables, default: search path
    #[serde(default)]
    pub force_bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPriority {
    pub name: String,
    pub priority: i32,
}

fn default_target_proj_epsg() -> u32 {
    25832
}

fn default_n_procs_postprocessing() -> usize {
    1
}

fn default_max_download_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    2
}

/// Validated, fully resolved run settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub filter: SpatialTemporalFilter,
    pub mode: RunMode,
    pub output_dir: PathBuf,
    pub download_dir: PathBuf,
    pub temp_force_dir: PathBuf,
    pub wvdb_dir: PathBuf,
    pub target_epsg: u32,
    /// Present whenever the mode runs the correction stage
    pub parameters: Option<ParameterSource>,
    pub n_procs_postprocessing: usize,
    pub save_qai: bool,
    pub remove_force_data: bool,
    pub clear_download: bool,
    pub indices_dir: PathBuf,
    pub indices: Vec<SpectralIndex>,
    pub acquisition: AcquisitionOptions,
    pub providers: Vec<(String, i32)>,
    pub force_bin_dir: Option<PathBuf>,
}

fn required<T: Clone>(value: &Option<T>, field: &str) -> PipelineResult<T> {
    value
        .clone()
        .ok_or_else(|| PipelineError::config(field, "required value is missing"))
}

fn parse_date(value: &Option<String>, field: &str) -> PipelineResult<NaiveDate> {
    let text = required(value, field)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| {
            PipelineError::config(field, format!("`{}` is not a YYYY-MM-DD date: {}", text, e))
        })
}

impl Config {
    /// Load a configuration file. Unreadable or malformed files are
    /// configuration errors.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::config("config", e.to_string()))
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load and validate in one go
    pub fn load(path: &Path) -> PipelineResult<Settings> {
        Self::from_file(path)?.validate()
    }

    /// Validate and resolve defaults
    pub fn validate(&self) -> PipelineResult<Settings> {
        // contradictory modes are reported before anything else
        let mode = RunMode::from_flags(self.download_only, self.force_only, self.indices_only)?;

        let aoi = BoundingBox::from_nsew(
            required(&self.north, "north")?,
            required(&self.south, "south")?,
            required(&self.east, "east")?,
            required(&self.west, "west")?,
        );
        let start = parse_date(&self.start, "start")?;
        let end = parse_date(&self.end, "end")?;

        let cloud_cover = required(&self.cloud_cover, "cloud_cover")?;
        if !(0..=100).contains(&cloud_cover) {
            return Err(PipelineError::config(
                "cloud_cover",
                format!("{} is not a percentage (0-100)", cloud_cover),
            ));
        }
        let filter = SpatialTemporalFilter::new(aoi, start, end, cloud_cover as u8)?;

        let output_dir = required(&self.output_dir, "output_dir")?;
        let download_dir = self.download_dir.clone().unwrap_or_else(|| output_dir.join("download"));
        let temp_force_dir = self.temp_force_dir.clone().unwrap_or_else(|| output_dir.join("temp"));
        let indices_dir = self.indices_dir.clone().unwrap_or_else(|| output_dir.join("indices"));
        let wvdb_dir = self.wvdb_dir.clone().unwrap_or_else(WaterVaporCache::default_dir);

        if self.n_procs_postprocessing == 0 {
            return Err(PipelineError::config("n_procs_postprocessing", "must be at least 1"));
        }

        let parameters = if mode.runs_correction() {
            Some(self.parameter_source()?)
        } else {
            None
        };

        let indices = self
            .indices_list
            .iter()
            .map(|name| name.parse::<SpectralIndex>())
            .collect::<PipelineResult<Vec<_>>>()?;
        if mode == RunMode::IndicesOnly && indices.is_empty() {
            return Err(PipelineError::config(
                "indices_list",
                "indices_only is set but no index is listed",
            ));
        }

        if let Some(bad) = self.providers.iter().find(|p| p.name.trim().is_empty()) {
            return Err(PipelineError::config(
                "providers",
                format!("provider with priority {} has no name", bad.priority),
            ));
        }

        Ok(Settings {
            filter,
            mode,
            output_dir,
            download_dir,
            temp_force_dir,
            wvdb_dir,
            target_epsg: self.target_proj_epsg,
            parameters,
            n_procs_postprocessing: self.n_procs_postprocessing,
            save_qai: self.save_qai,
            remove_force_data: self.remove_force_data,
            clear_download: self.clear_download,
            indices_dir,
            indices,
            acquisition: AcquisitionOptions {
                max_retries: self.max_download_retries,
                retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            },
            providers: self
                .providers
                .iter()
                .map(|p| (p.name.clone(), p.priority))
                .collect(),
            force_bin_dir: self.force_bin_dir.clone(),
        })
    }

    /// User parameter file if one is given and exists, otherwise the knobs
    fn parameter_source(&self) -> PipelineResult<ParameterSource> {
        match self.force_param_file.as_deref().map(str::trim) {
            None | Some("") | Some(NO_PARAM_FILE) => {}
            Some(file) => {
                let path = PathBuf::from(file);
                if path.is_file() {
                    return Ok(ParameterSource::UserFile(path));
                }
                log::warn!(
                    "FORCE parameter file {} not found, using the parameters of the configuration file",
                    path.display()
                );
            }
        }

        let knobs = ForceKnobs {
            dem_path: required(&self.dem_path, "dem_path")?,
            n_procs: required(&self.n_procs_force, "n_procs_force")?,
            n_threads: required(&self.n_threads_force, "n_threads_force")?,
            cloud_buffer: required(&self.cloud_buffer, "cloud_buffer")?,
        };
        if knobs.n_procs == 0 {
            return Err(PipelineError::config("n_procs_force", "must be at least 1"));
        }
        if knobs.n_threads == 0 {
            return Err(PipelineError::config("n_threads_force", "must be at least 1"));
        }
        Ok(ParameterSource::Synthesized(knobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
north: 46.6
south: 45.67
east: 11.97
west: 10.44
start: 2023-08-01
end: 2023-08-15
cloud_cover: 100
output_dir: /data/out
dem_path: /data/dem.tif
n_procs_force: 4
n_threads_force: 2
cloud_buffer: 300
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let settings = Config::from_yaml(MINIMAL).unwrap().validate().unwrap();

        assert_eq!(settings.mode, RunMode::Full);
        assert_eq!(settings.download_dir, PathBuf::from("/data/out/download"));
        assert_eq!(settings.temp_force_dir, PathBuf::from("/data/out/temp"));
        assert_eq!(settings.indices_dir, PathBuf::from("/data/out/indices"));
        assert_eq!(settings.target_epsg, 25832);
        assert_eq!(settings.n_procs_postprocessing, 1);
        assert_eq!(settings.acquisition.max_retries, 3);
        assert!(!settings.save_qai && !settings.remove_force_data && !settings.clear_download);
        assert!(matches!(settings.parameters, Some(ParameterSource::Synthesized(_))));
    }

    #[test]
    fn test_missing_knob_names_field() {
        let yaml = MINIMAL.replace("n_threads_force: 2\n", "");
        let err = Config::from_yaml(&yaml).unwrap().validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("`n_threads_force`"));
    }

    #[test]
    fn test_none_sentinel_means_synthesize() {
        let yaml = format!("{}force_param_file: None\n", MINIMAL);
        let settings = Config::from_yaml(&yaml).unwrap().validate().unwrap();
        assert!(matches!(settings.parameters, Some(ParameterSource::Synthesized(_))));
    }

    #[test]
    fn test_download_only_needs_no_knobs() {
        let yaml = MINIMAL.replace("dem_path: /data/dem.tif\n", "") + "download_only: true\n";
        let settings = Config::from_yaml(&yaml).unwrap().validate().unwrap();
        assert_eq!(settings.mode, RunMode::DownloadOnly);
        assert!(settings.parameters.is_none());
    }

    #[test]
    fn test_cloud_cover_range() {
        let yaml = MINIMAL.replace("cloud_cover: 100", "cloud_cover: 120");
        let err = Config::from_yaml(&yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("`cloud_cover`"));
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = Config::from_yaml("north: [unclosed").unwrap_err();
        assert!(err.is_configuration());
    }
}
