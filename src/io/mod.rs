//! I/O modules: acquisition providers, archives, ancillary data, raster tools
//! and external processes

pub mod archive;
pub mod dem;
pub mod files;
pub mod process;
pub mod provider;
pub mod raster;
pub mod wvdb;

pub use archive::{ArchiveHealth, ArchiveKind};
pub use dem::DemReader;
pub use provider::{AcquisitionError, EodagProvider, SceneDescriptor, SceneProvider};
pub use raster::{CommandRaster, RasterOps};
pub use wvdb::{HttpWvdbFetcher, WaterVaporCache, WvdbFetcher};

#[cfg(feature = "gdal")]
pub use raster::GdalRaster;
