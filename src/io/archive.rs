use crate::io::files;
use crate::types::{PipelineError, PipelineResult, SensorFamily};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Container formats delivered by the acquisition providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    /// Detect the archive kind from the file name
    pub fn from_path(path: &Path) -> Option<ArchiveKind> {
        let name = files::file_name(path);
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Outcome of an integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveHealth {
    Valid,
    Corrupt(String),
}

impl ArchiveHealth {
    pub fn is_valid(&self) -> bool {
        matches!(self, ArchiveHealth::Valid)
    }
}

/// Verify an archive by reading every entry to its end.
///
/// Anything that cannot be read completely (truncated download, bad CRC,
/// broken gzip stream, unknown container) is classified as corrupt.
pub fn verify(path: &Path) -> ArchiveHealth {
    let result = match ArchiveKind::from_path(path) {
        Some(ArchiveKind::Zip) => verify_zip(path),
        Some(ArchiveKind::TarGz) => File::open(path)
            .map_err(|e| e.to_string())
            .and_then(|f| verify_tar(GzDecoder::new(BufReader::new(f)))),
        Some(ArchiveKind::Tar) => File::open(path)
            .map_err(|e| e.to_string())
            .and_then(|f| verify_tar(BufReader::new(f))),
        None => Err(format!("unknown archive format: {}", path.display())),
    };

    match result {
        Ok(0) => ArchiveHealth::Corrupt("archive contains no entries".to_string()),
        Ok(entries) => {
            log::debug!("Archive {} is valid ({} entries)", path.display(), entries);
            ArchiveHealth::Valid
        }
        Err(reason) => {
            log::warn!("Archive {} is corrupt: {}", path.display(), reason);
            ArchiveHealth::Corrupt(reason)
        }
    }
}

fn verify_zip(path: &Path) -> Result<usize, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("entry {}: {}", i, e))?;
        // reading to the end triggers the CRC32 check
        io::copy(&mut entry, &mut io::sink()).map_err(|e| format!("{}: {}", entry.name(), e))?;
    }

    Ok(archive.len())
}

fn verify_tar<R: Read>(reader: R) -> Result<usize, String> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        io::copy(&mut entry, &mut io::sink()).map_err(|e| e.to_string())?;
        count += 1;
    }

    Ok(count)
}

/// Unpack an archive into `target_dir`
pub fn unpack(path: &Path, target_dir: &Path) -> PipelineResult<()> {
    fs::create_dir_all(target_dir)?;

    match ArchiveKind::from_path(path) {
        Some(ArchiveKind::Zip) => {
            let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))
                .map_err(|e| PipelineError::Archive(format!("{}: {}", path.display(), e)))?;
            archive
                .extract(target_dir)
                .map_err(|e| PipelineError::Archive(format!("{}: {}", path.display(), e)))?;
        }
        Some(ArchiveKind::TarGz) => {
            let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(path)?)));
            archive.unpack(target_dir)?;
        }
        Some(ArchiveKind::Tar) => {
            let mut archive = tar::Archive::new(BufReader::new(File::open(path)?));
            archive.unpack(target_dir)?;
        }
        None => {
            return Err(PipelineError::Archive(format!(
                "unknown archive format: {}",
                path.display()
            )))
        }
    }

    Ok(())
}

/// Extract a scene archive into the download directory using the layout FORCE
/// expects for the sensor family, then delete the archive.
///
/// Sentinel-2 archives carry their `<id>.SAFE` directory and are unpacked as is;
/// Landsat archives are flat and get their own `<id>` directory. Unpacking goes
/// through a staging directory so an interrupted extraction never leaves a
/// half-filled scene directory behind.
pub fn extract_scene(
    sensor: SensorFamily,
    archive: &Path,
    scene_id: &str,
    download_dir: &Path,
) -> PipelineResult<PathBuf> {
    let scene_dir = download_dir.join(sensor.scene_dir_name(scene_id));
    let staging = download_dir.join(format!(".extract_{}", sensor.scene_dir_name(scene_id)));

    files::remove_path(&staging)?;
    log::info!("Extracting {} into {}", archive.display(), download_dir.display());

    if let Err(e) = unpack(archive, &staging) {
        files::remove_path(&staging)?;
        return Err(e);
    }

    files::remove_path(&scene_dir)?;
    match sensor {
        SensorFamily::Sentinel2 => {
            let expected = staging.join(sensor.scene_dir_name(scene_id));
            if expected.is_dir() {
                fs::rename(&expected, &scene_dir)?;
            } else {
                // some providers ship the SAFE content without the top-level folder
                let safe_dirs: Vec<PathBuf> = files::sorted_entries(&staging)?
                    .into_iter()
                    .filter(|p| p.is_dir() && files::file_name(p).ends_with(".SAFE"))
                    .collect();
                match safe_dirs.as_slice() {
                    [single] => fs::rename(single, &scene_dir)?,
                    _ => fs::rename(&staging, &scene_dir)?,
                }
            }
            files::remove_path(&staging)?;
        }
        SensorFamily::Landsat => {
            fs::rename(&staging, &scene_dir)?;
        }
    }

    fs::remove_file(archive)?;
    log::info!("Scene extracted to {}", scene_dir.display());
    Ok(scene_dir)
}
