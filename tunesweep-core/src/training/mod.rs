//! Training-side collaborators: checkpoints, layer graphs, freezing, job
//! runners, experiment tracking and reproducibility.

pub mod checkpoint;
pub mod freeze;
pub mod graphs;
pub mod reproducibility;
pub mod runner;
pub mod tracker;

pub use checkpoint::{Checkpoint, CheckpointInventory};
pub use freeze::{FreezeSpec, LayerSelector, ModelGraph, ParameterId, compute_frozen_set};
pub use graphs::GraphCatalog;
pub use reproducibility::{EnvironmentSnapshot, SeedManager};
pub use runner::{CommandRunner, TrainingJob, TrainingJobRunner, TrainingOutcome};
pub use tracker::{ExperimentTracker, LedgerTracker, SweepInfo, SweepLedger, TrialStart};
