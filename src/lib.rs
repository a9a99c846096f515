//! sadasadam: same-day satellite mosaics
//!
//! Downloads Sentinel-2 and Landsat scenes for an area and date range, runs
//! FORCE atmospheric correction on them, mosaics acquisitions of the same day
//! and sensor, and writes cloud-masked clear-sky products clipped to the area
//! of interest, optionally followed by spectral indices.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, PipelineError, PipelineResult, RunMode, SensorFamily, SpatialTemporalFilter,
};

pub use config::{Config, Settings};
pub use core::{Pipeline, RunSummary};
pub use io::{DemReader, RasterOps, SceneProvider};
