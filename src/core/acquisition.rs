//! Scene acquisition: search, deduplicated download, integrity check with
//! bounded redownload, and extraction into the download directory.

use crate::io::archive::{self, ArchiveHealth};
use crate::io::files;
use crate::io::provider::{AcquisitionError, SceneDescriptor, SceneProvider};
use crate::types::{PipelineError, PipelineResult, SensorFamily, SpatialTemporalFilter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lifecycle state of a scene download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Downloaded,
    Extracted,
    Corrupt,
    Failed,
}

/// One scene on its way from the provider to an extracted directory
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub scene: SceneDescriptor,
    archive: Option<PathBuf>,
    scene_dir: Option<PathBuf>,
    status: DownloadStatus,
    corrupt_attempts: u32,
    failure: Option<String>,
    /// Index of the provider that reported the scene
    origin: usize,
}

impl DownloadRecord {
    pub fn new(scene: SceneDescriptor) -> Self {
        Self {
            scene,
            archive: None,
            scene_dir: None,
            status: DownloadStatus::Pending,
            corrupt_attempts: 0,
            failure: None,
            origin: 0,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn archive(&self) -> Option<&Path> {
        self.archive.as_deref()
    }

    pub fn scene_dir(&self) -> Option<&Path> {
        self.scene_dir.as_deref()
    }

    /// Number of times a downloaded archive turned out to be corrupt
    pub fn corrupt_attempts(&self) -> u32 {
        self.corrupt_attempts
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Extracted and failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DownloadStatus::Extracted | DownloadStatus::Failed)
    }

    pub fn mark_downloaded(&mut self, archive: PathBuf) {
        self.archive = Some(archive);
        self.status = DownloadStatus::Downloaded;
    }

    pub fn mark_extracted(&mut self, scene_dir: PathBuf) {
        self.archive = None;
        self.scene_dir = Some(scene_dir);
        self.status = DownloadStatus::Extracted;
    }

    pub fn mark_corrupt(&mut self) {
        self.archive = None;
        self.corrupt_attempts += 1;
        self.status = DownloadStatus::Corrupt;
    }

    /// Corrupt archives go back to pending for another download
    pub fn requeue(&mut self) {
        if self.status == DownloadStatus::Corrupt {
            self.status = DownloadStatus::Pending;
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.status = DownloadStatus::Failed;
    }
}

/// Retry policy of the acquisition stage
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// Redownloads of a corrupt archive, and retries of a transient failure
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Outcome of the acquisition stage
#[derive(Debug, Default)]
pub struct AcquisitionReport {
    pub records: Vec<DownloadRecord>,
    /// Provider searches that failed without aborting the run
    pub search_failures: Vec<String>,
}

impl AcquisitionReport {
    /// Extracted scene directories, the input of the correction stage
    pub fn scene_dirs(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .filter_map(|r| r.scene_dir().map(Path::to_path_buf))
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DownloadRecord> {
        self.records
            .iter()
            .filter(|r| r.status() == DownloadStatus::Failed)
    }
}

/// Drives the providers for one filter and one download directory
pub struct AcquisitionCoordinator<'a> {
    providers: Vec<&'a dyn SceneProvider>,
    options: AcquisitionOptions,
}

impl<'a> AcquisitionCoordinator<'a> {
    /// Providers are consulted in descending priority order
    pub fn new(providers: &'a [Box<dyn SceneProvider>], options: AcquisitionOptions) -> Self {
        let mut providers: Vec<&'a dyn SceneProvider> =
            providers.iter().map(|p| p.as_ref()).collect();
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        Self { providers, options }
    }

    pub fn run(
        &self,
        filter: &SpatialTemporalFilter,
        download_dir: &Path,
    ) -> PipelineResult<AcquisitionReport> {
        files::ensure_dir(download_dir)?;

        let mut report = AcquisitionReport::default();
        let planned = self.discover(filter, &mut report.search_failures)?;
        log::info!("{} unique scenes to acquire", planned.len());

        for mut record in planned {
            self.acquire(&mut record, download_dir)?;
            report.records.push(record);
        }

        let extracted = report.scene_dirs().len();
        let failed = report.failed().count();
        log::info!("Acquisition finished: {} scenes ready, {} failed", extracted, failed);
        for record in report.failed() {
            log::warn!(
                "Scene {} failed: {}",
                record.scene.id,
                record.failure().unwrap_or("unknown reason")
            );
        }

        Ok(report)
    }

    /// Search all providers for all sensor families and deduplicate by scene id.
    /// The first (highest priority) provider reporting a scene keeps it.
    fn discover(
        &self,
        filter: &SpatialTemporalFilter,
        search_failures: &mut Vec<String>,
    ) -> PipelineResult<Vec<DownloadRecord>> {
        let mut unique: BTreeMap<String, DownloadRecord> = BTreeMap::new();

        for sensor in SensorFamily::ALL {
            for (index, provider) in self.providers.iter().enumerate() {
                let scenes = match self.search_with_retry(*provider, filter, sensor) {
                    Ok(scenes) => scenes,
                    Err(AcquisitionError::Fatal(msg)) => {
                        return Err(PipelineError::FatalAcquisition(format!(
                            "{}: {}",
                            provider.name(),
                            msg
                        )))
                    }
                    Err(AcquisitionError::Transient(msg)) => {
                        log::warn!("Search on {} for {} failed: {}", provider.name(), sensor, msg);
                        search_failures.push(format!("{} ({}): {}", provider.name(), sensor, msg));
                        continue;
                    }
                };

                for scene in scenes {
                    let key = scene.id.trim_end_matches(".SAFE").to_string();
                    if unique.contains_key(&key) {
                        log::debug!("Scene {} already reported by another provider", key);
                        continue;
                    }
                    let mut record = DownloadRecord::new(scene);
                    record.origin = index;
                    unique.insert(key, record);
                }
            }
        }

        let mut records: Vec<DownloadRecord> = unique.into_values().collect();
        records.sort_by(|a, b| {
            (a.scene.acquisition_date, a.scene.sensor, &a.scene.id)
                .cmp(&(b.scene.acquisition_date, b.scene.sensor, &b.scene.id))
        });
        Ok(records)
    }

    fn search_with_retry(
        &self,
        provider: &dyn SceneProvider,
        filter: &SpatialTemporalFilter,
        sensor: SensorFamily,
    ) -> Result<Vec<SceneDescriptor>, AcquisitionError> {
        let mut attempt = 0;
        loop {
            match provider.search(filter, sensor) {
                Err(AcquisitionError::Transient(msg)) if attempt < self.options.max_retries => {
                    attempt += 1;
                    log::warn!("Search attempt {} failed ({}), retrying...", attempt, msg);
                    std::thread::sleep(self.options.retry_backoff);
                }
                result => return result,
            }
        }
    }

    /// Bring one record to a terminal state. Only fatal provider errors escape.
    fn acquire(&self, record: &mut DownloadRecord, download_dir: &Path) -> PipelineResult<()> {
        let sensor = record.scene.sensor;
        let scene_dir = download_dir.join(sensor.scene_dir_name(&record.scene.id));

        if is_populated_dir(&scene_dir) {
            log::info!("Scene {} already extracted, skipping download", record.scene.id);
            record.mark_extracted(scene_dir);
            return Ok(());
        }

        if let Some(existing) = sensor
            .archive_names(&record.scene.id)
            .into_iter()
            .map(|name| download_dir.join(name))
            .find(|path| path.is_file())
        {
            log::info!("Found earlier download {}", existing.display());
            record.mark_downloaded(existing);
        }

        let provider = self.providers[record.origin];
        let mut transient_failures = 0;

        while !record.is_terminal() {
            match record.status() {
                DownloadStatus::Pending => {
                    log::info!("Downloading {} from {}", record.scene.id, provider.name());
                    match provider.download(&record.scene, download_dir) {
                        Ok(path) if path.is_dir() => record.mark_extracted(path),
                        Ok(path) => record.mark_downloaded(path),
                        Err(AcquisitionError::Fatal(msg)) => {
                            return Err(PipelineError::FatalAcquisition(format!(
                                "{}: {}",
                                provider.name(),
                                msg
                            )))
                        }
                        Err(AcquisitionError::Transient(msg)) => {
                            transient_failures += 1;
                            log::warn!("Download of {} failed: {}", record.scene.id, msg);
                            if transient_failures > self.options.max_retries {
                                record.mark_failed(format!(
                                    "download failed {} times, last error: {}",
                                    transient_failures, msg
                                ));
                            } else {
                                std::thread::sleep(self.options.retry_backoff);
                            }
                        }
                    }
                }
                DownloadStatus::Downloaded => {
                    let Some(archive_path) = record.archive().map(Path::to_path_buf) else {
                        record.mark_failed("downloaded record without archive");
                        continue;
                    };
                    match archive::verify(&archive_path) {
                        ArchiveHealth::Valid => {
                            let id = &record.scene.id;
                            match archive::extract_scene(sensor, &archive_path, id, download_dir) {
                                Ok(dir) => record.mark_extracted(dir),
                                Err(e) => record.mark_failed(format!("extraction failed: {}", e)),
                            }
                        }
                        ArchiveHealth::Corrupt(reason) => {
                            if let Err(e) = files::remove_path(&archive_path) {
                                record.mark_failed(format!(
                                    "corrupt archive {} could not be removed: {}",
                                    archive_path.display(),
                                    e
                                ));
                                continue;
                            }
                            record.mark_corrupt();
                            if record.corrupt_attempts() > self.options.max_retries {
                                record.mark_failed(format!(
                                    "archive corrupt after {} downloads: {}",
                                    record.corrupt_attempts(),
                                    reason
                                ));
                            } else {
                                log::warn!(
                                    "Archive of {} is corrupt ({}), downloading again",
                                    record.scene.id,
                                    reason
                                );
                                record.requeue();
                            }
                        }
                    }
                }
                DownloadStatus::Corrupt => record.requeue(),
                DownloadStatus::Extracted | DownloadStatus::Failed => {}
            }
        }

        Ok(())
    }
}

fn is_populated_dir(dir: &Path) -> bool {
    dir.is_dir()
        && std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
}

/// Extracted scene directories already present in a download directory
pub fn existing_scene_dirs(download_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !download_dir.is_dir() {
        return Err(PipelineError::config(
            "download_dir",
            format!("{} does not exist", download_dir.display()),
        ));
    }

    Ok(files::sorted_entries(download_dir)?
        .into_iter()
        .filter(|path| {
            let name = files::file_name(path);
            match SensorFamily::from_scene_id(&name) {
                Some(SensorFamily::Sentinel2) => name.ends_with(".SAFE") && path.is_dir(),
                Some(SensorFamily::Landsat) => path.is_dir(),
                None => false,
            }
        })
        .collect())
}

/// Remove scene data from a download directory: scene directories, archives,
/// staging leftovers, queue files and the eodag download marker. Other entries
/// are left alone.
pub fn clear_download_dir(download_dir: &Path) -> PipelineResult<usize> {
    if !download_dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for path in files::sorted_entries(download_dir)? {
        let name = files::file_name(&path);
        let recognized = SensorFamily::from_scene_id(&name).is_some()
            || name.starts_with(".extract_")
            || name.starts_with("queue")
            || name == ".downloaded";

        if recognized {
            files::remove_path(&path)?;
            removed += 1;
        } else {
            log::debug!("Keeping {} in download directory", path.display());
        }
    }

    log::info!("Cleared {} entries from {}", removed, download_dir.display());
    Ok(removed)
}
