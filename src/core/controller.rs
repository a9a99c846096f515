//! Run controller: sequences the stages for the selected mode and cleans up.

use crate::config::Settings;
use crate::core::acquisition::{self, AcquisitionCoordinator, AcquisitionReport};
use crate::core::correction::{CorrectionDriver, CorrectionEngine, CorrectionReport, ForceEngine};
use crate::core::indices::IndexCalculator;
use crate::core::postprocess::{self, PostprocessOptions, PostprocessReport, Postprocessor};
use crate::core::workspace::WorkspaceManager;
use crate::io::dem::DemReader;
use crate::io::provider::{EodagProvider, SceneProvider};
use crate::io::raster::RasterOps;
use crate::io::wvdb::{HttpWvdbFetcher, WaterVaporCache, WvdbFetcher};
use crate::types::{PipelineResult, RunMode};
use std::fmt;
use std::path::PathBuf;

/// Everything a run produced, for the end-of-run report
#[derive(Debug)]
pub struct RunSummary {
    pub mode: RunMode,
    pub acquisition: Option<AcquisitionReport>,
    pub correction: Option<CorrectionReport>,
    pub postprocess: Option<PostprocessReport>,
    pub logs: Vec<PathBuf>,
    pub indices: Vec<PathBuf>,
    pub index_failures: Vec<(PathBuf, String)>,
    /// Workspace left on disk (`remove_force_data` unset)
    pub retained_workspace: Option<PathBuf>,
    pub cleared_download: bool,
}

impl RunSummary {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            acquisition: None,
            correction: None,
            postprocess: None,
            logs: Vec::new(),
            indices: Vec::new(),
            index_failures: Vec::new(),
            retained_workspace: None,
            cleared_download: false,
        }
    }

    /// Output artifacts written to the output directory
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.postprocess
            .as_ref()
            .map(|p| p.artifacts())
            .unwrap_or_default()
    }

    /// True if any search, scene, group or index failed without stopping the run
    pub fn has_failures(&self) -> bool {
        self.acquisition
            .as_ref()
            .map_or(false, |a| a.failed().next().is_some() || !a.search_failures.is_empty())
            || self.correction.as_ref().map_or(false, |c| c.failed().next().is_some())
            || self.postprocess.as_ref().map_or(false, |p| p.failed().next().is_some())
            || !self.index_failures.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run summary ({})", self.mode)?;

        if let Some(acq) = &self.acquisition {
            writeln!(f, "  scenes ready: {}", acq.scene_dirs().len())?;
            for record in acq.failed() {
                writeln!(
                    f,
                    "  scene failed: {} ({})",
                    record.scene.id,
                    record.failure().unwrap_or("unknown reason")
                )?;
            }
            for failure in &acq.search_failures {
                writeln!(f, "  search failed: {}", failure)?;
            }
        }

        if let Some(correction) = &self.correction {
            for (scene, outcome) in correction.failed() {
                writeln!(
                    f,
                    "  correction failed: {} ({:?}), log: {}",
                    scene,
                    outcome,
                    correction.log_dir.join(format!("{}.log", scene)).display()
                )?;
            }
        }

        if let Some(post) = &self.postprocess {
            for group in &post.groups {
                match &group.outcome {
                    postprocess::GroupOutcome::Written(paths) => {
                        for path in paths {
                            writeln!(f, "  written: {}", path.display())?;
                        }
                    }
                    postprocess::GroupOutcome::NoClearSky => {
                        writeln!(f, "  skipped: {} (no clear-sky pixels)", group.group.key())?
                    }
                    postprocess::GroupOutcome::Failed(reason) => {
                        writeln!(f, "  group failed: {} ({})", group.group.key(), reason)?
                    }
                }
            }
        }

        for path in &self.indices {
            writeln!(f, "  index: {}", path.display())?;
        }
        for (path, reason) in &self.index_failures {
            writeln!(f, "  index failed: {} ({})", path.display(), reason)?;
        }
        if let Some(ws) = &self.retained_workspace {
            writeln!(f, "  FORCE workspace kept at {}", ws.display())?;
        }
        Ok(())
    }
}

/// Raster backend of this build
pub fn default_raster() -> Box<dyn RasterOps> {
    #[cfg(feature = "gdal")]
    {
        Box::new(crate::io::raster::GdalRaster::default())
    }
    #[cfg(not(feature = "gdal"))]
    {
        Box::new(crate::io::raster::CommandRaster::new())
    }
}

/// One configured pipeline with its external collaborators
pub struct Pipeline {
    settings: Settings,
    providers: Vec<Box<dyn SceneProvider>>,
    engine: Box<dyn CorrectionEngine>,
    raster: Box<dyn RasterOps>,
    fetcher: Box<dyn WvdbFetcher>,
}

impl Pipeline {
    /// Pipeline with the production collaborators: eodag, FORCE, GDAL and the
    /// Zenodo water vapor database
    pub fn new(settings: Settings) -> Self {
        let providers: Vec<Box<dyn SceneProvider>> =
            vec![Box::new(EodagProvider::new(settings.providers.clone()))];
        let engine = Box::new(ForceEngine::new(settings.force_bin_dir.clone()));
        let fetcher = Box::new(HttpWvdbFetcher::new(
            crate::io::wvdb::WVDB_URL,
            settings.acquisition.max_retries,
            settings.acquisition.retry_backoff,
        ));

        Self {
            settings,
            providers,
            engine,
            raster: default_raster(),
            fetcher,
        }
    }

    pub fn with_providers(mut self, providers: Vec<Box<dyn SceneProvider>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_engine(mut self, engine: Box<dyn CorrectionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_raster(mut self, raster: Box<dyn RasterOps>) -> Self {
        self.raster = raster;
        self
    }

    pub fn with_wvdb_fetcher(mut self, fetcher: Box<dyn WvdbFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run all stages of the configured mode in order.
    ///
    /// Scene, group and index failures end up in the summary; configuration
    /// errors, fatal provider errors and a failing correction engine abort.
    pub fn run(&self) -> PipelineResult<RunSummary> {
        let settings = &self.settings;
        let mode = settings.mode;
        log::info!("Starting {}", mode);
        let mut summary = RunSummary::new(mode);

        if mode.runs_correction() {
            self.preflight_dem()?;
        }

        if mode.runs_acquisition() {
            let coordinator =
                AcquisitionCoordinator::new(&self.providers, settings.acquisition.clone());
            summary.acquisition = Some(coordinator.run(&settings.filter, &settings.download_dir)?);
        }

        if mode.runs_correction() {
            self.correct_and_postprocess(&mut summary)?;
        }

        if mode.runs_indices() && !settings.indices.is_empty() {
            let calculator =
                IndexCalculator::new(self.raster.as_ref(), settings.n_procs_postprocessing);
            let (written, failed) =
                calculator.run(&settings.output_dir, &settings.indices_dir, &settings.indices)?;
            summary.indices = written;
            summary.index_failures = failed;
        }

        log::info!("Finished {}", mode);
        Ok(summary)
    }

    /// The DEM must cover the area of interest before anything is downloaded
    fn preflight_dem(&self) -> PipelineResult<()> {
        let Some(source) = &self.settings.parameters else {
            return Ok(());
        };
        match WorkspaceManager::dem_of(source)? {
            Some(dem) => DemReader::require_coverage(
                &dem,
                &[*self.settings.filter.aoi()],
                self.raster.as_ref(),
            ),
            None => {
                log::warn!("No DEM configured, FORCE will assume flat terrain");
                Ok(())
            }
        }
    }

    fn correct_and_postprocess(&self, summary: &mut RunSummary) -> PipelineResult<()> {
        let settings = &self.settings;
        let Some(source) = &settings.parameters else {
            return Ok(());
        };

        let scene_dirs = match &summary.acquisition {
            Some(report) => report.scene_dirs(),
            None => acquisition::existing_scene_dirs(&settings.download_dir)?,
        };
        if scene_dirs.is_empty() {
            log::warn!("No scenes available for correction, nothing to process");
            return Ok(());
        }

        let cache = WaterVaporCache::new(&settings.wvdb_dir);
        let manager = WorkspaceManager::new(self.raster.as_ref(), &cache, self.fetcher.as_ref());
        let prepared = manager.prepare(
            &settings.temp_force_dir,
            &scene_dirs,
            source,
            settings.target_epsg,
        )?;
        let workspace = prepared.workspace;

        // a failing engine leaves the workspace in place for inspection
        summary.correction = Some(CorrectionDriver::new(self.engine.as_ref()).run(&workspace)?);

        let postprocessor = Postprocessor::new(
            self.raster.as_ref(),
            PostprocessOptions {
                aoi: *settings.filter.aoi(),
                target_epsg: settings.target_epsg,
                save_qai: settings.save_qai,
                workers: settings.n_procs_postprocessing,
            },
        );
        summary.postprocess = Some(postprocessor.run(
            &workspace.mosaic(),
            &workspace.misc(),
            &settings.output_dir,
        )?);
        summary.logs = postprocess::relocate_logs(&workspace.log(), &settings.output_dir)?;
        if let Some(correction) = summary.correction.as_mut() {
            correction.log_dir = settings.output_dir.clone();
        }

        if settings.remove_force_data {
            workspace.remove()?;
        } else {
            log::info!("FORCE workspace kept at {}", workspace.root().display());
            summary.retained_workspace = Some(workspace.root().to_path_buf());
        }

        if settings.clear_download {
            acquisition::clear_download_dir(&settings.download_dir)?;
            summary.cleared_download = true;
        }

        Ok(())
    }
}
