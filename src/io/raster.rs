//! Raster primitives used by the pipeline.
//!
//! The coordination code only talks to [`RasterOps`]. [`CommandRaster`] drives
//! the GDAL command line utilities; with the `gdal` feature, `GdalRaster` does
//! the pixel work in-process using the ndarray kernels defined here.

use crate::io::{files, process};
use crate::types::{BoundingBox, PipelineError, PipelineResult};
use ndarray::{Array2, Array3, ArrayView2, Zip};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::process::Command;

#[cfg(feature = "gdal")]
mod gdal_backend;
#[cfg(feature = "gdal")]
pub use gdal_backend::GdalRaster;

/// No-data value of FORCE bottom-of-atmosphere reflectance
pub const BOA_NODATA: i16 = -9999;

/// Clear-sky mask value for clear pixels
pub const MASK_CLEAR: u8 = 1;

/// Clear-sky mask no-data value (everything that is not clear)
pub const MASK_NODATA: u8 = 0;

/// No-data value of spectral index rasters
pub const INDEX_NODATA: f32 = -9999.0;

/// GeoTIFF creation options shared by all written artifacts
pub const CREATION_OPTIONS: [(&str, &str); 4] = [
    ("COMPRESS", "ZSTD"),
    ("TILED", "YES"),
    ("PREDICTOR", "2"),
    ("BIGTIFF", "YES"),
];

/// Raster operations the pipeline needs from a GIS backend
pub trait RasterOps: Send + Sync {
    /// Extent of a raster in WGS84 longitude/latitude
    fn extent_wgs84(&self, path: &Path) -> PipelineResult<BoundingBox>;

    /// WKT representation of an EPSG code
    fn wkt_from_epsg(&self, epsg: u32) -> PipelineResult<String>;

    /// Reproject `src` to `target_epsg` and clip it to the AOI (given in WGS84)
    fn clip(
        &self,
        src: &Path,
        dst: &Path,
        aoi: &BoundingBox,
        target_epsg: u32,
    ) -> PipelineResult<()>;

    /// Derive the binary clear-sky mask (1 / no-data) from a FORCE QAI layer
    fn clear_sky_mask(&self, qai: &Path, dst: &Path) -> PipelineResult<()>;

    /// True if the mask contains at least one clear pixel
    fn has_valid_pixels(&self, mask: &Path) -> PipelineResult<bool>;

    /// Set every non-clear pixel of every reflectance band to no-data,
    /// keeping the band descriptions of `boa`
    fn apply_mask(&self, boa: &Path, mask: &Path, dst: &Path) -> PipelineResult<()>;

    /// Materialize a (virtual) raster as compressed GeoTIFF
    fn to_geotiff(&self, src: &Path, dst: &Path) -> PipelineResult<()>;

    /// (A - B) / (A + B) over two bands of the same raster, as Float32
    fn normalized_difference(
        &self,
        src: &Path,
        a_band: usize,
        b_band: usize,
        dst: &Path,
    ) -> PipelineResult<()>;
}

/// FORCE QAI clear-sky test.
///
/// Bit 0 flags no-data, bits 1-2 hold the cloud state
/// (00 clear, 01 less confident cloud, 10 confident cloud, 11 cloud shadow).
pub fn is_clear(qai: i16) -> bool {
    qai & 1 == 0 && (qai >> 1) & 3 == 0
}

/// Clear-sky mask from a QAI band. Contains only [`MASK_CLEAR`] and [`MASK_NODATA`].
pub fn clear_sky_mask(qai: &ArrayView2<i16>) -> Array2<u8> {
    qai.mapv(|q| if is_clear(q) { MASK_CLEAR } else { MASK_NODATA })
}

/// Apply a clear-sky mask to every band of a (band, row, col) reflectance cube
pub fn apply_clear_sky(boa: &mut Array3<i16>, mask: &ArrayView2<u8>) -> PipelineResult<()> {
    let (_, rows, cols) = boa.dim();
    if mask.dim() != (rows, cols) {
        return Err(PipelineError::Raster(format!(
            "mask shape {:?} does not match reflectance shape {:?}",
            mask.dim(),
            (rows, cols)
        )));
    }

    for mut band in boa.outer_iter_mut() {
        Zip::from(&mut band).and(mask).par_for_each(|value, &m| {
            if m != MASK_CLEAR {
                *value = BOA_NODATA;
            }
        });
    }

    Ok(())
}

/// Normalized difference of two reflectance bands. No-data in either input or
/// a zero denominator yields [`INDEX_NODATA`].
pub fn normalized_difference(
    a: &ArrayView2<i16>,
    b: &ArrayView2<i16>,
) -> PipelineResult<Array2<f32>> {
    if a.dim() != b.dim() {
        return Err(PipelineError::Raster(format!(
            "band shapes differ: {:?} vs {:?}",
            a.dim(),
            b.dim()
        )));
    }

    Ok(Zip::from(a).and(b).par_map_collect(|&a, &b| {
        if a == BOA_NODATA || b == BOA_NODATA {
            return INDEX_NODATA;
        }
        let sum = a as f32 + b as f32;
        if sum == 0.0 {
            INDEX_NODATA
        } else {
            (a as f32 - b as f32) / sum
        }
    }))
}

/// Raster backend built on the GDAL command line utilities
#[derive(Debug, Clone)]
pub struct CommandRaster {
    gdal_calc: String,
    gdalinfo: String,
    gdal_translate: String,
}

impl Default for CommandRaster {
    fn default() -> Self {
        Self {
            gdal_calc: "gdal_calc.py".to_string(),
            gdalinfo: "gdalinfo".to_string(),
            gdal_translate: "gdal_translate".to_string(),
        }
    }
}

impl CommandRaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different gdal_calc executable (e.g. `gdal_calc` without `.py`)
    pub fn with_gdal_calc(mut self, program: impl Into<String>) -> Self {
        self.gdal_calc = program.into();
        self
    }

    pub fn with_gdalinfo(mut self, program: impl Into<String>) -> Self {
        self.gdalinfo = program.into();
        self
    }

    pub fn with_gdal_translate(mut self, program: impl Into<String>) -> Self {
        self.gdal_translate = program.into();
        self
    }

    fn creation_args(command: &mut Command, flag: &str) {
        for (key, value) in CREATION_OPTIONS {
            command.arg(format!("{}{}={}", flag, key, value));
        }
    }

    fn gdalinfo_json(&self, path: &Path, extra: &[&str]) -> PipelineResult<serde_json::Value> {
        let mut cmd = Command::new(&self.gdalinfo);
        cmd.arg("-json").args(extra).arg(path);
        let output = process::run_exit_checked(&mut cmd)?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn calc(&self) -> Command {
        let mut cmd = Command::new(&self.gdal_calc);
        cmd.arg("--overwrite").arg("--quiet");
        cmd
    }

    /// gdal_calc drops band descriptions. Route its output through a VRT
    /// carrying the descriptions of `reference` and translate that to `dst`.
    fn copy_band_descriptions(
        &self,
        reference: &Path,
        calc_out: &Path,
        dst: &Path,
    ) -> PipelineResult<()> {
        let descriptions = band_descriptions(&self.gdalinfo_json(reference, &[])?);
        if descriptions.iter().all(|d| d.is_empty()) {
            return files::move_replacing(calc_out, dst);
        }

        let vrt = calc_out.with_extension("vrt");
        let mut cmd = Command::new(&self.gdal_translate);
        cmd.args(["-of", "VRT"]).arg(calc_out).arg(&vrt);
        process::run_captured(&mut cmd)?;

        let xml = fs::read_to_string(&vrt)?;
        fs::write(&vrt, with_band_descriptions(&xml, &descriptions))?;
        self.to_geotiff(&vrt, dst)?;

        files::remove_path(&vrt)?;
        files::remove_path(calc_out)
    }
}

/// Extract the WGS84 extent from `gdalinfo -json` output
pub fn extent_from_gdalinfo(info: &serde_json::Value) -> PipelineResult<BoundingBox> {
    let points: Vec<(f64, f64)> = if let Some(ring) = info
        .pointer("/wgs84Extent/coordinates/0")
        .and_then(|r| r.as_array())
    {
        ring.iter()
            .filter_map(|p| Some((p.get(0)?.as_f64()?, p.get(1)?.as_f64()?)))
            .collect()
    } else if let Some(corners) = info.get("cornerCoordinates").and_then(|c| c.as_object()) {
        // raster without a usable SRS, assume geographic coordinates
        corners
            .values()
            .filter_map(|p| Some((p.get(0)?.as_f64()?, p.get(1)?.as_f64()?)))
            .collect()
    } else {
        Vec::new()
    };

    BoundingBox::enclosing(points)
        .ok_or_else(|| PipelineError::Raster("gdalinfo reported no extent".to_string()))
}

/// Band descriptions from `gdalinfo -json` output, in band order
pub fn band_descriptions(info: &serde_json::Value) -> Vec<String> {
    let Some(bands) = info.get("bands").and_then(|b| b.as_array()) else {
        return Vec::new();
    };

    bands
        .iter()
        .map(|band| {
            band.get("description")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Insert a `<Description>` into every `VRTRasterBand` of a VRT document.
/// Band `n` gets `descriptions[n - 1]`; empty descriptions are left out.
pub fn with_band_descriptions(vrt: &str, descriptions: &[String]) -> String {
    let Ok(band_tag) = Regex::new(r#"<VRTRasterBand\b[^>]*\bband="(\d+)"[^>]*>"#) else {
        return vrt.to_string();
    };

    band_tag
        .replace_all(vrt, |caps: &regex::Captures| {
            let description = caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| descriptions.get(i))
                .filter(|d| !d.is_empty());
            match description {
                Some(d) => format!(
                    "{}\n    <Description>{}</Description>",
                    &caps[0],
                    escape_xml(d)
                ),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Collapse pretty-printed WKT into the single line FORCE parameter files need
pub fn single_line_wkt(raw: &str) -> String {
    raw.lines()
        .map(|l| l.trim())
        .collect::<String>()
        .trim_matches('\'')
        .to_string()
}

impl RasterOps for CommandRaster {
    fn extent_wgs84(&self, path: &Path) -> PipelineResult<BoundingBox> {
        let info = self.gdalinfo_json(path, &[])?;
        extent_from_gdalinfo(&info)
    }

    fn wkt_from_epsg(&self, epsg: u32) -> PipelineResult<String> {
        let mut cmd = Command::new("gdalsrsinfo");
        cmd.arg("-o").arg("wkt1").arg(format!("EPSG:{}", epsg));
        let output = process::run_captured(&mut cmd)?;
        let wkt = single_line_wkt(&String::from_utf8_lossy(&output.stdout));
        if wkt.is_empty() {
            return Err(PipelineError::config(
                "target_proj_epsg",
                format!("EPSG:{} is not a known projection", epsg),
            ));
        }
        Ok(wkt)
    }

    fn clip(
        &self,
        src: &Path,
        dst: &Path,
        aoi: &BoundingBox,
        target_epsg: u32,
    ) -> PipelineResult<()> {
        let mut cmd = Command::new("gdalwarp");
        cmd.arg("-overwrite")
            .args(["-of", "VRT"])
            .args(["-r", "near"])
            .arg("-t_srs")
            .arg(format!("EPSG:{}", target_epsg))
            .args(["-te_srs", "EPSG:4326", "-te"])
            .arg(aoi.min_lon.to_string())
            .arg(aoi.min_lat.to_string())
            .arg(aoi.max_lon.to_string())
            .arg(aoi.max_lat.to_string())
            .arg(src)
            .arg(dst);
        process::run_captured(&mut cmd)?;
        Ok(())
    }

    fn clear_sky_mask(&self, qai: &Path, dst: &Path) -> PipelineResult<()> {
        let mut cmd = self.calc();
        cmd.arg("-A")
            .arg(qai)
            .arg(format!("--outfile={}", dst.display()))
            .arg(
                "--calc=logical_and(bitwise_and(A, 1) == 0, \
                 bitwise_and(right_shift(A, 1), 3) == 0)",
            )
            .arg(format!("--NoDataValue={}", MASK_NODATA))
            .arg("--type=Byte");
        Self::creation_args(&mut cmd, "--co=");
        process::run_captured(&mut cmd)?;
        Ok(())
    }

    fn has_valid_pixels(&self, mask: &Path) -> PipelineResult<bool> {
        // clear pixels are 1 and the rest 0, so only an empty mask sums to 0
        let info = self.gdalinfo_json(mask, &["-checksum"])?;
        let checksum = info
            .pointer("/bands/0/checksum")
            .and_then(|c| c.as_i64())
            .ok_or_else(|| {
                PipelineError::Raster(format!(
                    "gdalinfo reported no checksum for {}",
                    mask.display()
                ))
            })?;
        Ok(checksum != 0)
    }

    fn apply_mask(&self, boa: &Path, mask: &Path, dst: &Path) -> PipelineResult<()> {
        let calc_out = dst.with_extension("calc.tif");
        let mut cmd = self.calc();
        cmd.arg("-A")
            .arg(boa)
            .arg("-B")
            .arg(mask)
            .arg("--allBands=A")
            .arg(format!("--outfile={}", calc_out.display()))
            .arg(format!("--calc=where(B == {}, A, {})", MASK_CLEAR, BOA_NODATA))
            .arg(format!("--NoDataValue={}", BOA_NODATA))
            .arg("--type=Int16");
        Self::creation_args(&mut cmd, "--co=");
        process::run_captured(&mut cmd)?;

        self.copy_band_descriptions(boa, &calc_out, dst)
    }

    fn to_geotiff(&self, src: &Path, dst: &Path) -> PipelineResult<()> {
        let mut cmd = Command::new(&self.gdal_translate);
        cmd.args(["-of", "GTiff"]);
        for (key, value) in CREATION_OPTIONS {
            cmd.arg("-co").arg(format!("{}={}", key, value));
        }
        cmd.arg(src).arg(dst);
        process::run_captured(&mut cmd)?;
        Ok(())
    }

    fn normalized_difference(
        &self,
        src: &Path,
        a_band: usize,
        b_band: usize,
        dst: &Path,
    ) -> PipelineResult<()> {
        let mut cmd = self.calc();
        cmd.arg("-A")
            .arg(src)
            .arg(format!("--A_band={}", a_band))
            .arg("-B")
            .arg(src)
            .arg(format!("--B_band={}", b_band))
            .arg(format!("--outfile={}", dst.display()))
            .arg("--calc=(A.astype(float) - B) / (A.astype(float) + B)")
            .arg(format!("--NoDataValue={}", INDEX_NODATA))
            .arg("--type=Float32");
        cmd.arg("--co=COMPRESS=ZSTD")
            .arg("--co=TILED=YES")
            .arg("--co=BIGTIFF=YES");
        process::run_captured(&mut cmd)?;
        Ok(())
    }
}
