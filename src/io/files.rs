use crate::types::PipelineResult;
use std::fs;
use std::path::{Path, PathBuf};

/// Create a directory tree, logging when it already exists
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> PipelineResult<PathBuf> {
    let dir = dir.as_ref();
    if dir.is_dir() {
        log::debug!("Directory {} already exists", dir.display());
    } else {
        fs::create_dir_all(dir)?;
    }
    Ok(dir.to_path_buf())
}

/// Move a file, replacing any existing file at the destination.
///
/// Falls back to copy + remove when source and destination live on different
/// filesystems.
pub fn move_replacing(src: &Path, dst: &Path) -> PipelineResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    // rename(2) does not cross devices
    let tmp = dst.with_extension("partial");
    fs::copy(src, &tmp)?;
    fs::rename(&tmp, dst)?;
    fs::remove_file(src)?;
    Ok(())
}

/// Remove a file or directory tree if it exists
pub fn remove_path(path: &Path) -> PipelineResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Sorted entries of a directory
pub fn sorted_entries(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

/// File name as UTF-8 string (lossy)
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_replacing_overwrites() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.tif");
        let dst = tmp.path().join("out").join("a.tif");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(&dst, b"old").unwrap();
        fs::write(&src, b"new").unwrap();

        move_replacing(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_remove_path_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(remove_path(&tmp.path().join("nope")).is_ok());

        let nested = tmp.path().join("d").join("e");
        fs::create_dir_all(&nested).unwrap();
        remove_path(&tmp.path().join("d")).unwrap();
        assert!(!tmp.path().join("d").exists());
    }
}
