use super::{
    apply_clear_sky, clear_sky_mask, normalized_difference, CommandRaster, RasterOps, BOA_NODATA,
    CREATION_OPTIONS, INDEX_NODATA, MASK_CLEAR, MASK_NODATA,
};
use crate::types::{BoundingBox, PipelineError, PipelineResult};
use gdal::raster::{Buffer, GdalType, RasterCreationOption};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{Array2, Array3};
use std::path::Path;

/// In-process GDAL backend.
///
/// Pixel work (mask derivation, masking, indices) runs through the ndarray
/// kernels; reprojection and format conversion are delegated to the command
/// line tools.
#[derive(Debug, Clone, Default)]
pub struct GdalRaster {
    commands: CommandRaster,
}

impl GdalRaster {
    pub fn new(commands: CommandRaster) -> Self {
        Self { commands }
    }

    fn read_band<T: GdalType + Copy>(dataset: &Dataset, index: isize) -> PipelineResult<Array2<T>> {
        let (width, height) = dataset.raster_size();
        let band = dataset.rasterband(index)?;
        let data = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;

        Array2::from_shape_vec((height, width), data.data)
            .map_err(|e| PipelineError::Raster(format!("failed to reshape band {}: {}", index, e)))
    }

    /// Create a GeoTIFF on the grid of `template`
    fn create_like<T: GdalType>(
        template: &Dataset,
        path: &Path,
        bands: isize,
        predictor: bool,
    ) -> PipelineResult<Dataset> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (width, height) = template.raster_size();

        let options: Vec<RasterCreationOption> = CREATION_OPTIONS
            .iter()
            .filter(|&&(key, _)| predictor || key != "PREDICTOR")
            .map(|&(key, value)| RasterCreationOption { key, value })
            .collect();

        let mut dataset = driver.create_with_band_type_with_options::<T, _>(
            path,
            width as isize,
            height as isize,
            bands,
            &options,
        )?;
        dataset.set_geo_transform(&template.geo_transform()?)?;
        dataset.set_projection(&template.projection())?;
        Ok(dataset)
    }

    fn write_band<T: GdalType + Copy>(
        dataset: &Dataset,
        index: isize,
        data: &Array2<T>,
        nodata: f64,
        description: Option<&str>,
    ) -> PipelineResult<()> {
        let (height, width) = data.dim();
        let mut band = dataset.rasterband(index)?;
        let buffer = Buffer::new((width, height), data.iter().copied().collect());
        band.write((0, 0), (width, height), &buffer)?;
        band.set_no_data_value(Some(nodata))?;
        if let Some(description) = description {
            band.set_description(description)?;
        }
        Ok(())
    }
}

impl RasterOps for GdalRaster {
    fn extent_wgs84(&self, path: &Path) -> PipelineResult<BoundingBox> {
        let dataset = Dataset::open(path)?;
        let gt = dataset.geo_transform()?;
        let (width, height) = dataset.raster_size();

        let mut xs = Vec::with_capacity(4);
        let mut ys = Vec::with_capacity(4);
        let (w, h) = (width as f64, height as f64);
        for (col, row) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
            xs.push(gt[0] + col * gt[1] + row * gt[2]);
            ys.push(gt[3] + col * gt[4] + row * gt[5]);
        }

        let source = SpatialRef::from_wkt(&dataset.projection())?;
        let target = SpatialRef::from_epsg(4326)?;
        // lon/lat order regardless of the authority definition
        let gis_order = gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER;
        source.set_axis_mapping_strategy(gis_order);
        target.set_axis_mapping_strategy(gis_order);

        let transform = CoordTransform::new(&source, &target)?;
        let mut zs = vec![0.0; xs.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

        BoundingBox::enclosing(xs.into_iter().zip(ys))
            .ok_or_else(|| PipelineError::Raster(format!("{} has no extent", path.display())))
    }

    fn wkt_from_epsg(&self, epsg: u32) -> PipelineResult<String> {
        let srs = SpatialRef::from_epsg(epsg).map_err(|e| {
            PipelineError::config("target_proj_epsg", format!("EPSG:{}: {}", epsg, e))
        })?;
        Ok(srs.to_wkt()?)
    }

    fn clip(
        &self,
        src: &Path,
        dst: &Path,
        aoi: &BoundingBox,
        target_epsg: u32,
    ) -> PipelineResult<()> {
        self.commands.clip(src, dst, aoi, target_epsg)
    }

    fn clear_sky_mask(&self, qai: &Path, dst: &Path) -> PipelineResult<()> {
        let source = Dataset::open(qai)?;
        let qai_data = Self::read_band::<i16>(&source, 1)?;
        let mask = clear_sky_mask(&qai_data.view());

        let output = Self::create_like::<u8>(&source, dst, 1, false)?;
        Self::write_band(&output, 1, &mask, MASK_NODATA as f64, Some("clear sky"))
    }

    fn has_valid_pixels(&self, mask: &Path) -> PipelineResult<bool> {
        let dataset = Dataset::open(mask)?;
        let data = Self::read_band::<u8>(&dataset, 1)?;
        Ok(data.iter().any(|&v| v == MASK_CLEAR))
    }

    fn apply_mask(&self, boa: &Path, mask: &Path, dst: &Path) -> PipelineResult<()> {
        let source = Dataset::open(boa)?;
        let mask_data = Self::read_band::<u8>(&Dataset::open(mask)?, 1)?;
        let bands = source.raster_count();
        let (width, height) = source.raster_size();

        let mut cube = Array3::<i16>::zeros((bands as usize, height, width));
        let mut descriptions = Vec::with_capacity(bands as usize);
        for index in 1..=bands {
            let band = Self::read_band::<i16>(&source, index)?;
            cube.index_axis_mut(ndarray::Axis(0), (index - 1) as usize).assign(&band);
            descriptions.push(source.rasterband(index)?.description().unwrap_or_default());
        }

        apply_clear_sky(&mut cube, &mask_data.view())?;

        let output = Self::create_like::<i16>(&source, dst, bands, true)?;
        for (i, band) in cube.outer_iter().enumerate() {
            Self::write_band(
                &output,
                i as isize + 1,
                &band.to_owned(),
                BOA_NODATA as f64,
                Some(descriptions[i].as_str()).filter(|d| !d.is_empty()),
            )?;
        }
        Ok(())
    }

    fn to_geotiff(&self, src: &Path, dst: &Path) -> PipelineResult<()> {
        self.commands.to_geotiff(src, dst)
    }

    fn normalized_difference(
        &self,
        src: &Path,
        a_band: usize,
        b_band: usize,
        dst: &Path,
    ) -> PipelineResult<()> {
        let source = Dataset::open(src)?;
        let a = Self::read_band::<i16>(&source, a_band as isize)?;
        let b = Self::read_band::<i16>(&source, b_band as isize)?;
        let index = normalized_difference(&a.view(), &b.view())?;

        let output = Self::create_like::<f32>(&source, dst, 1, false)?;
        Self::write_band(&output, 1, &index, INDEX_NODATA as f64, None)
    }
}
