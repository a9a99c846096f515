//! Per-run FORCE processing workspace and its preparation.

use crate::core::params::{self, DirectoryBlock, ParameterSet, ParameterSource};
use crate::io::dem::DemReader;
use crate::io::files;
use crate::io::raster::RasterOps;
use crate::io::wvdb::{WaterVaporCache, WvdbFetcher};
use crate::types::{BoundingBox, PipelineResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sub-directories FORCE expects below the workspace root
const LAYOUT: [&str; 8] = [
    "level1",
    "level2",
    "level2/mosaic",
    "log",
    "misc",
    "param",
    "provenance",
    "temp",
];

/// A timestamped directory tree owned by exactly one run
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace below `temp_root`. An existing directory is
    /// never reused; a name collision gets a numeric suffix.
    pub fn create(temp_root: &Path) -> PipelineResult<Self> {
        files::ensure_dir(temp_root)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let mut suffix = 0;
        let root = loop {
            let name = if suffix == 0 {
                format!("force_dir_{}", stamp)
            } else {
                format!("force_dir_{}_{}", stamp, suffix)
            };
            let candidate = temp_root.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        };

        for sub in LAYOUT {
            fs::create_dir_all(root.join(sub))?;
        }

        log::info!("Created processing workspace {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn level1(&self) -> PathBuf {
        self.root.join("level1")
    }

    pub fn level2(&self) -> PathBuf {
        self.root.join("level2")
    }

    /// Name of the mosaic directory relative to level2, as force-mosaic wants it
    pub fn mosaic_name(&self) -> &'static str {
        "mosaic"
    }

    pub fn mosaic(&self) -> PathBuf {
        self.level2().join(self.mosaic_name())
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn misc(&self) -> PathBuf {
        self.root.join("misc")
    }

    pub fn param(&self) -> PathBuf {
        self.root.join("param")
    }

    pub fn provenance(&self) -> PathBuf {
        self.root.join("provenance")
    }

    pub fn temp(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.level1().join("queue.txt")
    }

    pub fn param_file(&self) -> PathBuf {
        self.param().join("l2ps.prm")
    }

    pub fn directory_block(&self, wvdb: &Path) -> DirectoryBlock {
        DirectoryBlock {
            queue_file: self.queue_file(),
            level2: self.level2(),
            log: self.log(),
            provenance: self.provenance(),
            temp: self.temp(),
            wvdb: wvdb.to_path_buf(),
        }
    }

    /// Write the FORCE queue, one `<scene dir> QUEUED` line per scene
    pub fn write_queue(&self, scene_dirs: &[PathBuf]) -> PipelineResult<PathBuf> {
        let path = self.queue_file();
        let mut file = fs::File::create(&path)?;
        for dir in scene_dirs {
            let absolute = fs::canonicalize(dir)?;
            writeln!(file, "{} QUEUED", absolute.display())?;
        }
        log::info!("Queued {} scenes in {}", scene_dirs.len(), path.display());
        Ok(path)
    }

    /// Delete the whole workspace tree
    pub fn remove(self) -> PipelineResult<()> {
        log::info!("Removing processing workspace {}", self.root.display());
        // the parameter file is read-only, which does not stop unlinking on unix
        files::remove_path(&self.root)
    }
}

/// A prepared workspace: queue and parameter file in place
#[derive(Debug)]
pub struct PreparedWorkspace {
    pub workspace: Workspace,
    pub params: ParameterSet,
}

/// Builds workspaces and everything FORCE needs inside them
pub struct WorkspaceManager<'a> {
    raster: &'a dyn RasterOps,
    wvdb: &'a WaterVaporCache,
    fetcher: &'a dyn WvdbFetcher,
}

impl<'a> WorkspaceManager<'a> {
    pub fn new(
        raster: &'a dyn RasterOps,
        wvdb: &'a WaterVaporCache,
        fetcher: &'a dyn WvdbFetcher,
    ) -> Self {
        Self { raster, wvdb, fetcher }
    }

    /// The DEM must cover every extent that will be processed
    pub fn verify_dem(&self, dem_path: &Path, extents: &[BoundingBox]) -> PipelineResult<()> {
        DemReader::require_coverage(dem_path, extents, self.raster)
    }

    /// DEM named by a parameter source, if it names one
    pub fn dem_of(source: &ParameterSource) -> PipelineResult<Option<PathBuf>> {
        match source {
            ParameterSource::Synthesized(knobs) => Ok(Some(knobs.dem_path.clone())),
            ParameterSource::UserFile(path) => Ok(params::dem_of(&params::read_user_file(path)?)),
        }
    }

    /// Fetch the water vapor database if needed, create a new workspace, queue
    /// the scenes and write the parameter file
    pub fn prepare(
        &self,
        temp_root: &Path,
        scene_dirs: &[PathBuf],
        source: &ParameterSource,
        target_epsg: u32,
    ) -> PipelineResult<PreparedWorkspace> {
        self.wvdb.ensure(self.fetcher)?;

        let workspace = Workspace::create(temp_root)?;
        workspace.write_queue(scene_dirs)?;

        let dirs = workspace.directory_block(self.wvdb.dir());
        let params = match source {
            ParameterSource::Synthesized(knobs) => {
                let wkt = self.raster.wkt_from_epsg(target_epsg)?;
                ParameterSet::synthesize(knobs, &dirs, &wkt)
            }
            ParameterSource::UserFile(path) => {
                log::info!("Adapting user parameter file {}", path.display());
                ParameterSet::adapt(&params::read_user_file(path)?, &dirs)
            }
        };
        params.write(&workspace.param_file())?;

        Ok(PreparedWorkspace { workspace, params })
    }
}
