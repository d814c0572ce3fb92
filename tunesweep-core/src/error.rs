//! Error types for the tunesweep-core crate.
//!
//! Per-trial failures (`ConfigError`, `ResourceError`, `TrainingError`) are
//! collected into [`TrialError`] and never abort a sweep. Only [`SweepError`]
//! is fatal, and it is raised before the first trial is dispatched.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from resolving and validating a run configuration.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },

    #[error("Mode '{mode}' cannot restore checkpoints; use a fine-tuning mode")]
    IncompatibleMode { mode: String },

    #[error("Sampled parameter '{key}' collides with a setup field")]
    KeyCollision { key: String },

    #[error("Freeze selector '{selector}' matches no layer of {model}")]
    UnknownSelector { selector: String, model: String },

    #[error("Unknown dataset: {dataset}")]
    UnknownDataset { dataset: String },

    #[error("No layer graph available for model: {model}")]
    UnknownModel { model: String },

    #[error("Invalid layer graph for {model}: {message}")]
    InvalidGraph { model: String, message: String },

    #[error("Invalid sweep definition: {message}")]
    InvalidSweep { message: String },
}

impl ConfigError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn out_of_range(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OutOfRange {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_sweep(message: impl Into<String>) -> Self {
        Self::InvalidSweep {
            message: message.into(),
        }
    }
}

/// Errors from acquiring the resources a trial needs.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceError {
    #[error("No accelerator became available after {attempts} attempt(s)")]
    DeviceUnavailable { attempts: u32 },

    #[error("Checkpoint not found: {model} trained on {dataset} (version {version})")]
    CheckpointNotFound {
        model: String,
        dataset: String,
        version: u32,
    },
}

/// Errors reported by a training job runner.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TrainingError {
    #[error("Failed to launch training job: {0}")]
    Launch(String),

    #[error("Training job exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Training job produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Training job timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Training job reported failure: {0}")]
    Reported(String),
}

/// Checkpoint inventory errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {model}/{dataset}/version_{version}")]
    NotFound {
        model: String,
        dataset: String,
        version: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The terminal cause of a failed or skipped trial, preserved for the tracker.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "scope", content = "error", rename_all = "snake_case")]
pub enum TrialError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Resource(#[from] ResourceError),

    #[error("{0}")]
    Training(#[from] TrainingError),

    #[error("Checkpoint inventory error: {0}")]
    Inventory(String),
}

/// Sweep-fatal errors, reported to the operator before any trial starts.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read sweep document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse sweep document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Checkpoint inventory error: {0}")]
    Inventory(#[from] CheckpointError),

    #[error("Tracker error: {0}")]
    Tracker(String),
}

impl SweepError {
    pub fn tracker(msg: impl Into<String>) -> Self {
        Self::Tracker(msg.into())
    }
}
