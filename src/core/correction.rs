//! Correction run driver: FORCE level-2 processing and same-day mosaicking.

use crate::core::workspace::Workspace;
use crate::io::{files, process};
use crate::types::{PipelineError, PipelineResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Aggregate exit of an engine batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Success,
    Failed(String),
}

/// External atmospheric correction engine
pub trait CorrectionEngine {
    /// Process every queued scene. Blocks until the batch is done.
    fn level2(&self, param_file: &Path) -> PipelineResult<EngineExit>;

    /// Build one mosaic per date and sensor in `<level2_dir>/<mosaic_name>`
    fn mosaic(&self, level2_dir: &Path, mosaic_name: &str) -> PipelineResult<EngineExit>;
}

/// FORCE command line tools
#[derive(Debug, Clone, Default)]
pub struct ForceEngine {
    bin_dir: Option<PathBuf>,
}

impl ForceEngine {
    /// `bin_dir` holds the FORCE executables; `None` uses the search path
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn command(&self, program: &str) -> Command {
        match &self.bin_dir {
            Some(dir) => Command::new(dir.join(program)),
            None => Command::new(program),
        }
    }

    fn exit(status: std::process::ExitStatus) -> EngineExit {
        if status.success() {
            EngineExit::Success
        } else {
            EngineExit::Failed(status.to_string())
        }
    }
}

impl CorrectionEngine for ForceEngine {
    fn level2(&self, param_file: &Path) -> PipelineResult<EngineExit> {
        // inherited output keeps the FORCE progress visible
        let mut cmd = self.command("force-level2");
        cmd.arg(param_file);
        Ok(Self::exit(process::run_inherited(&mut cmd)?))
    }

    fn mosaic(&self, level2_dir: &Path, mosaic_name: &str) -> PipelineResult<EngineExit> {
        let mut cmd = self.command("force-mosaic");
        cmd.arg("-m").arg(mosaic_name).arg(level2_dir);
        Ok(Self::exit(process::run_inherited(&mut cmd)?))
    }
}

/// Per-scene result as reported in the FORCE log directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneOutcome {
    Success,
    /// Nothing to do for the scene, e.g. fully outside the data cube
    Skipped,
    Failed(String),
}

impl SceneOutcome {
    /// Classify the content of a scene log
    pub fn from_log(text: &str) -> Self {
        if text.contains("Success") {
            SceneOutcome::Success
        } else if text.contains("Skip") {
            SceneOutcome::Skipped
        } else {
            let last = text
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("empty log");
            SceneOutcome::Failed(last.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrectionReport {
    pub scenes: BTreeMap<String, SceneOutcome>,
    pub log_dir: PathBuf,
}

impl CorrectionReport {
    pub fn failed(&self) -> impl Iterator<Item = (&String, &SceneOutcome)> {
        self.scenes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, SceneOutcome::Failed(_)))
    }

    pub fn count(&self, wanted: fn(&SceneOutcome) -> bool) -> usize {
        self.scenes.values().filter(|o| wanted(o)).count()
    }
}

/// Read every `<scene>.log` in a FORCE log directory
pub fn read_scene_logs(log_dir: &Path) -> PipelineResult<BTreeMap<String, SceneOutcome>> {
    let mut outcomes = BTreeMap::new();
    if !log_dir.is_dir() {
        return Ok(outcomes);
    }

    for path in files::sorted_entries(log_dir)? {
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let scene = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let text = fs::read_to_string(&path)?;
        outcomes.insert(scene, SceneOutcome::from_log(&text));
    }

    Ok(outcomes)
}

/// Invokes the engine on a prepared workspace and interprets the results
pub struct CorrectionDriver<'a> {
    engine: &'a dyn CorrectionEngine,
}

impl<'a> CorrectionDriver<'a> {
    pub fn new(engine: &'a dyn CorrectionEngine) -> Self {
        Self { engine }
    }

    /// Level-2 processing followed by mosaicking.
    ///
    /// A non-zero batch exit fails the run; whatever the engine wrote stays in
    /// the workspace for inspection.
    pub fn run(&self, workspace: &Workspace) -> PipelineResult<CorrectionReport> {
        log::info!("Running FORCE level-2 processing, this may take a while...");
        let exit = self.engine.level2(&workspace.param_file())?;

        let report = CorrectionReport {
            scenes: read_scene_logs(&workspace.log())?,
            log_dir: workspace.log(),
        };

        for (scene, outcome) in &report.scenes {
            match outcome {
                SceneOutcome::Success => log::debug!("{}: success", scene),
                SceneOutcome::Skipped => log::info!("{}: skipped by FORCE", scene),
                SceneOutcome::Failed(reason) => log::warn!("{}: failed ({})", scene, reason),
            }
        }

        if let EngineExit::Failed(status) = exit {
            return Err(PipelineError::CorrectionEngine {
                status: format!("force-level2 {}", status),
                log_dir: report.log_dir,
            });
        }

        log::info!("Creating same-day mosaics...");
        let mosaic_exit = self
            .engine
            .mosaic(&workspace.level2(), workspace.mosaic_name())?;
        if let EngineExit::Failed(status) = mosaic_exit {
            return Err(PipelineError::CorrectionEngine {
                status: format!("force-mosaic {}", status),
                log_dir: report.log_dir,
            });
        }

        log::info!(
            "Correction finished: {} scenes succeeded, {} skipped, {} failed",
            report.count(|o| *o == SceneOutcome::Success),
            report.count(|o| *o == SceneOutcome::Skipped),
            report.failed().count()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct ScriptedEngine {
        level2: EngineExit,
        calls: RefCell<Vec<&'static str>>,
    }

    impl CorrectionEngine for ScriptedEngine {
        fn level2(&self, param_file: &Path) -> PipelineResult<EngineExit> {
            self.calls.borrow_mut().push("level2");
            let log_dir = param_file.parent().unwrap().parent().unwrap().join("log");
            fs::write(
                log_dir.join("S2A_X.log"),
                "S2A_X: dc: 50%. Success! Processing time: 1 min\n",
            )?;
            fs::write(log_dir.join("LC09_Y.log"), "LC09_Y: error reading metadata\n")?;
            Ok(self.level2.clone())
        }

        fn mosaic(&self, _level2_dir: &Path, _mosaic_name: &str) -> PipelineResult<EngineExit> {
            self.calls.borrow_mut().push("mosaic");
            Ok(EngineExit::Success)
        }
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(SceneOutcome::from_log("x: Success! Processing time"), SceneOutcome::Success);
        assert_eq!(SceneOutcome::from_log("x: Skip. Processing time"), SceneOutcome::Skipped);
        assert_eq!(
            SceneOutcome::from_log("start\nunable to open DEM\n\n"),
            SceneOutcome::Failed("unable to open DEM".to_string())
        );
    }

    #[test]
    fn test_driver_collects_outcomes_and_mosaics() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path()).unwrap();
        let engine = ScriptedEngine {
            level2: EngineExit::Success,
            calls: RefCell::new(Vec::new()),
        };

        let report = CorrectionDriver::new(&engine).run(&ws).unwrap();

        assert_eq!(*engine.calls.borrow(), vec!["level2", "mosaic"]);
        assert_eq!(report.scenes["S2A_X"], SceneOutcome::Success);
        assert_eq!(report.failed().count(), 1);
    }

    #[test]
    fn test_engine_failure_stops_before_mosaic() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path()).unwrap();
        let engine = ScriptedEngine {
            level2: EngineExit::Failed("exit status: 1".to_string()),
            calls: RefCell::new(Vec::new()),
        };

        let err = CorrectionDriver::new(&engine).run(&ws).unwrap_err();

        assert!(matches!(err, PipelineError::CorrectionEngine { .. }));
        assert_eq!(*engine.calls.borrow(), vec!["level2"]);
        // partial output is kept
        assert!(ws.log().join("S2A_X.log").exists());
    }
}
