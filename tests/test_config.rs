use sadasadam::core::params::ParameterSource;
use sadasadam::core::SpectralIndex;
use sadasadam::{Config, RunMode};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const BASE: &str = "\
north: 46.6
south: 45.67
east: 11.97
west: 10.44
start: 2023-08-01
end: 2023-08-15
cloud_cover: 80
output_dir: /data/out
dem_path: /data/dem.tif
n_procs_force: 4
n_threads_force: 2
cloud_buffer: 300
";

fn validate(yaml: &str) -> sadasadam::PipelineResult<sadasadam::Settings> {
    Config::from_yaml(yaml)?.validate()
}

#[test]
fn test_load_from_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("config.yaml");
    fs::write(
        &path,
        format!(
            "{}target_proj_epsg: 3035\nindices_list: [ndvi, NDMI]\nproviders:\n  - name: cop_dataspace\n    priority: 2\n  - name: usgs\n    priority: 1\n",
            BASE
        ),
    )
    .unwrap();

    let settings = Config::load(&path).unwrap();

    assert_eq!(settings.target_epsg, 3035);
    assert_eq!(settings.indices, vec![SpectralIndex::Ndvi, SpectralIndex::Ndmi]);
    assert_eq!(
        settings.providers,
        vec![("cop_dataspace".to_string(), 2), ("usgs".to_string(), 1)]
    );
    assert_eq!(settings.filter.max_cloud_cover(), 80);
}

#[test]
fn test_missing_file_is_configuration_error() {
    let err = Config::load(&PathBuf::from("/nonexistent/config.yaml")).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_conflicting_modes() {
    let err = validate(&format!("{}download_only: true\nforce_only: true\n", BASE)).unwrap_err();
    assert!(err.is_configuration());

    let err = validate(&format!("{}indices_only: true\nforce_only: true\n", BASE)).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_indices_only_requires_an_index() {
    let err = validate(&format!("{}indices_only: true\n", BASE)).unwrap_err();
    assert!(err.to_string().contains("indices_list"));

    let settings =
        validate(&format!("{}indices_only: true\nindices_list: [NDSI]\n", BASE)).unwrap();
    assert_eq!(settings.mode, RunMode::IndicesOnly);
    assert!(settings.parameters.is_none());
}

#[test]
fn test_unknown_index_is_rejected() {
    let err = validate(&format!("{}indices_list: [EVI]\n", BASE)).unwrap_err();
    assert!(err.to_string().contains("indices_list"));
}

#[test]
fn test_inverted_dates_and_box() {
    let err = validate(&BASE.replace("end: 2023-08-15", "end: 2023-07-15")).unwrap_err();
    assert!(err.is_configuration());

    let err = validate(&BASE.replace("start: 2023-08-01", "start: 01.08.2023")).unwrap_err();
    assert!(err.to_string().contains("`start`"));

    let err = validate(&BASE.replace("south: 45.67", "south: 47.0")).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_existing_param_file_wins_over_knobs() {
    let tmp = TempDir::new().unwrap();
    let prm = tmp.path().join("l2ps.prm");
    fs::write(&prm, "++PARAM_LEVEL2_START++\nFILE_DEM = /data/dem.tif\n").unwrap();

    // knobs are not needed with a parameter file
    let yaml = BASE.replace("n_procs_force: 4\n", "")
        + &format!("force_param_file: {}\n", prm.display());
    let settings = validate(&yaml).unwrap();

    assert_eq!(settings.parameters, Some(ParameterSource::UserFile(prm)));
}

#[test]
fn test_missing_param_file_falls_back_to_knobs() {
    let yaml = format!("{}force_param_file: /nonexistent/l2ps.prm\n", BASE);
    let settings = validate(&yaml).unwrap();
    assert!(matches!(settings.parameters, Some(ParameterSource::Synthesized(_))));

    // the fallback needs the knobs
    let err = validate(&yaml.replace("cloud_buffer: 300\n", "")).unwrap_err();
    assert!(err.to_string().contains("cloud_buffer"));
}

#[test]
fn test_yaml_round_trip_keeps_settings() {
    let config = Config::from_yaml(BASE).unwrap();
    let again = Config::from_yaml(&config.to_yaml().unwrap()).unwrap();
    assert_eq!(
        again.validate().unwrap().output_dir,
        config.validate().unwrap().output_dir
    );
}
