use crate::io::raster::RasterOps;
use crate::types::{BoundingBox, PipelineError, PipelineResult};
use std::path::Path;

/// Digital Elevation Model checks performed before any correction work
pub struct DemReader;

impl DemReader {
    /// Geographic extent (WGS84) of a DEM file
    pub fn extent(dem_path: &Path, raster: &dyn RasterOps) -> PipelineResult<BoundingBox> {
        log::info!("Reading DEM extent from: {}", dem_path.display());

        if !dem_path.exists() {
            return Err(PipelineError::config(
                "dem_path",
                format!("DEM file {} does not exist", dem_path.display()),
            ));
        }

        raster.extent_wgs84(dem_path)
    }

    /// Validate DEM coverage for the area to be processed
    pub fn validate_dem_coverage(
        dem_bbox: &BoundingBox,
        required_bbox: &BoundingBox,
        buffer_degrees: f64,
    ) -> bool {
        log::debug!("DEM bbox: {:?}", dem_bbox);
        log::debug!("Required bbox: {:?}", required_bbox);
        log::debug!("Buffer: {:.3} degrees", buffer_degrees);

        let required = BoundingBox {
            min_lat: required_bbox.min_lat - buffer_degrees,
            max_lat: required_bbox.max_lat + buffer_degrees,
            min_lon: required_bbox.min_lon - buffer_degrees,
            max_lon: required_bbox.max_lon + buffer_degrees,
        };

        let coverage_ok = dem_bbox.contains(&required);

        if coverage_ok {
            log::info!("DEM provides adequate coverage for the processing extent");
        } else {
            log::warn!("DEM coverage insufficient for the processing extent");
            log::warn!(
                "Required: lat [{:.3}, {:.3}], lon [{:.3}, {:.3}]",
                required.min_lat, required.max_lat, required.min_lon, required.max_lon
            );
            log::warn!(
                "Available: lat [{:.3}, {:.3}], lon [{:.3}, {:.3}]",
                dem_bbox.min_lat, dem_bbox.max_lat, dem_bbox.min_lon, dem_bbox.max_lon
            );
        }

        coverage_ok
    }

    /// Fail with a configuration error unless the DEM covers every extent given
    pub fn require_coverage(
        dem_path: &Path,
        extents: &[BoundingBox],
        raster: &dyn RasterOps,
    ) -> PipelineResult<()> {
        let dem_bbox = Self::extent(dem_path, raster)?;

        for extent in extents {
            if !Self::validate_dem_coverage(&dem_bbox, extent, 0.0) {
                return Err(PipelineError::config(
                    "dem_path",
                    format!(
                        "DEM {} covers {} but {} is required",
                        dem_path.display(),
                        dem_bbox,
                        extent
                    ),
                ));
            }
        }

        Ok(())
    }
}
