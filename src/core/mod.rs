//! Pipeline stages

pub mod acquisition;
pub mod params;
pub mod workspace;
pub mod correction;
pub mod postprocess;
pub mod indices;
pub mod controller;

// Re-export main types
pub use acquisition::{
    AcquisitionCoordinator, AcquisitionOptions, AcquisitionReport, DownloadRecord, DownloadStatus,
};
pub use params::{DirectoryBlock, ForceKnobs, ParameterSet, ParameterSource};
pub use workspace::{PreparedWorkspace, Workspace, WorkspaceManager};
pub use correction::{
    CorrectionDriver, CorrectionEngine, CorrectionReport, EngineExit, ForceEngine, SceneOutcome,
};
pub use postprocess::{
    GroupOutcome, MosaicGroup, PostprocessOptions, PostprocessReport, Postprocessor,
};
pub use indices::{IndexCalculator, SpectralIndex};
pub use controller::{Pipeline, RunSummary};
