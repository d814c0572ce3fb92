//! tunesweep-core: hyperparameter sweep orchestration for fine-tuning image
//! classifiers from stored checkpoints.
//!
//! A [`SweepDocument`] is validated once, then a [`SweepController`] walks the
//! datasets × models × checkpoint selections × samples plan. Every trial is
//! resolved into a [`RunConfig`], given a [`FreezeSpec`] and run by a
//! [`TrainingJobRunner`] on a leased device.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod persistence;
pub mod resolver;
pub mod setup;
pub mod sweep;
pub mod training;

pub use config::{TuneSweepConfig, load_config};
pub use controller::{
    ControllerOptions, Device, DevicePool, SweepController, SweepSummary, TrialKey, TrialResult,
    TrialStatus, TrialStream,
};
pub use error::{CheckpointError, ConfigError, ResourceError, SweepError, TrainingError, TrialError};
pub use export::{ExportReport, SweepManifest, export_sweeps};
pub use resolver::{DatasetSelection, Hyperparameters, Mode, Precision, RunConfig, resolve};
pub use setup::{CheckpointPolicy, CheckpointRef, SetupConfig, SweepDocument, TrackerIdentity};
pub use sweep::{ParameterSampler, SampledParams, SharedSampler, SweepSpec};
pub use training::{
    Checkpoint, CheckpointInventory, CommandRunner, ExperimentTracker, FreezeSpec, GraphCatalog,
    LayerSelector, LedgerTracker, TrainingJob, TrainingJobRunner, TrainingOutcome,
};
