//! Water vapor database (WVDB) cache for the Landsat atmospheric correction.
//!
//! The database lives outside the per-run workspace so it is downloaded once
//! and reused by later runs.

use crate::io::{archive, files};
use crate::types::{PipelineError, PipelineResult};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Public archive of the global water vapor database 2000-2020
pub const WVDB_URL: &str = "https://zenodo.org/records/4468701/files/wvp-global.tar.gz?download=1";

/// File name prefixes the database archive unpacks to
const DATABASE_PREFIXES: [&str; 3] = ["wrs-2-land", "WVP_", "wvp-global"];

/// Monthly climatology files, the minimum FORCE needs
pub fn required_files() -> Vec<String> {
    (1..=12).map(|month| format!("WVP_0000-{:02}-00.txt", month)).collect()
}

/// Something that can populate a WVDB directory
pub trait WvdbFetcher {
    fn fetch(&self, target_dir: &Path) -> PipelineResult<()>;
}

/// Downloads the database archive over HTTP and unpacks it into the cache
#[derive(Debug, Clone)]
pub struct HttpWvdbFetcher {
    url: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Default for HttpWvdbFetcher {
    fn default() -> Self {
        Self {
            url: WVDB_URL.to_string(),
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl HttpWvdbFetcher {
    pub fn new(url: impl Into<String>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            url: url.into(),
            max_retries,
            retry_backoff,
        }
    }

    fn try_download_once(
        &self,
        client: &reqwest::blocking::Client,
        target: &Path,
    ) -> PipelineResult<()> {
        let mut response = client
            .get(&self.url)
            .send()
            .map_err(|e| PipelineError::Http(format!("request to {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Http(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                self.url
            )));
        }

        let mut writer = BufWriter::new(File::create(target)?);
        let bytes = response
            .copy_to(&mut writer)
            .map_err(|e| PipelineError::Http(format!("failed to read response body: {}", e)))?;
        log::debug!("Downloaded {} bytes", bytes);
        Ok(())
    }
}

impl WvdbFetcher for HttpWvdbFetcher {
    fn fetch(&self, target_dir: &Path) -> PipelineResult<()> {
        log::info!("Downloading water vapor database from {}", self.url);
        files::ensure_dir(target_dir)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(3600))
            .user_agent(concat!("sadasadam/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Http(format!("failed to create HTTP client: {}", e)))?;

        // the archive name carries a database prefix so an interrupted run is cleaned up next time
        let download = tempfile::Builder::new()
            .prefix("wvp-global")
            .suffix(".tar.gz")
            .tempfile_in(target_dir)?;

        let mut last_error = None;
        for attempt in 1..=self.max_retries + 1 {
            log::debug!("Download attempt {} of {}", attempt, self.max_retries + 1);
            match self.try_download_once(&client, download.path()) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    log::warn!("Water vapor database download attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt <= self.max_retries {
                        std::thread::sleep(self.retry_backoff);
                    }
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        log::info!("Extracting water vapor database...");
        archive::unpack(download.path(), target_dir)?;
        download.close()?;
        Ok(())
    }
}

/// Persistent WVDB directory
#[derive(Debug, Clone)]
pub struct WaterVaporCache {
    dir: PathBuf,
}

impl WaterVaporCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Default location below the user cache directory
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sadasadam")
            .join("wvdb")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if all twelve monthly files are present
    pub fn is_populated(&self) -> bool {
        required_files().iter().all(|f| self.dir.join(f).is_file())
    }

    /// Make sure the cache is complete, downloading the database when needed.
    ///
    /// A partially filled cache is cleaned before the download. Files that do not
    /// belong to the database are never deleted; they make this fail instead.
    pub fn ensure(&self, fetcher: &dyn WvdbFetcher) -> PipelineResult<()> {
        if self.is_populated() {
            log::info!(
                "Water vapor database already present in {}, skipping download",
                self.dir.display()
            );
            return Ok(());
        }

        if self.dir.is_dir() {
            log::warn!(
                "Water vapor database in {} is incomplete, cleaning up and downloading again",
                self.dir.display()
            );
            self.clean()?;
        }

        fetcher.fetch(&self.dir)?;

        if !self.is_populated() {
            let missing: Vec<String> = required_files()
                .into_iter()
                .filter(|f| !self.dir.join(f).is_file())
                .collect();
            return Err(PipelineError::Archive(format!(
                "water vapor database in {} is still missing {}",
                self.dir.display(),
                missing.join(", ")
            )));
        }

        log::info!("Water vapor database ready in {}", self.dir.display());
        Ok(())
    }

    fn clean(&self) -> PipelineResult<()> {
        let entries = files::sorted_entries(&self.dir)?;

        if let Some(unexpected) = entries.iter().find(|path| {
            let name = files::file_name(path);
            !DATABASE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        }) {
            return Err(PipelineError::config(
                "wvdb_dir",
                format!(
                    "unexpected file {} in the water vapor database directory; it will not be removed, please use a dedicated directory",
                    unexpected.display()
                ),
            ));
        }

        for path in entries {
            files::remove_path(&path)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}
