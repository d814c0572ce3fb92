//! Run configuration resolution.
//!
//! [`resolve`] merges the static setup block, one sampled assignment, a model
//! identifier and a dataset selection into a fully concrete [`RunConfig`].
//! Resolution is pure: the same inputs always produce an equal config, and
//! every error is scoped to the trial being resolved.

use crate::catalog;
use crate::error::ConfigError;
use crate::setup::{CheckpointRef, SetupConfig, is_setup_field};
use crate::sweep::{ParamValue, SampledParams};
use crate::training::freeze::LayerSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use crate::setup::{Mode, Precision};

/// Hyperparameters every trial must receive from the sampler.
pub const REQUIRED_HYPERPARAMETERS: &[&str] = &[
    "learning_rate",
    "optimizer",
    "batch_size",
    "scheduler",
    "max_epochs",
    "weight_decay",
];

/// Target dataset of a trial, optionally restored from a prior checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSelection {
    Scratch { dataset: String },
    FineTune {
        dataset: String,
        checkpoint: CheckpointRef,
    },
}

impl DatasetSelection {
    pub fn scratch(dataset: &str) -> Self {
        DatasetSelection::Scratch {
            dataset: dataset.to_string(),
        }
    }

    pub fn fine_tune(dataset: &str, checkpoint: CheckpointRef) -> Self {
        DatasetSelection::FineTune {
            dataset: dataset.to_string(),
            checkpoint,
        }
    }

    pub fn dataset(&self) -> &str {
        match self {
            DatasetSelection::Scratch { dataset } | DatasetSelection::FineTune { dataset, .. } => {
                dataset
            }
        }
    }

    pub fn checkpoint(&self) -> Option<&CheckpointRef> {
        match self {
            DatasetSelection::Scratch { .. } => None,
            DatasetSelection::FineTune { checkpoint, .. } => Some(checkpoint),
        }
    }
}

impl fmt::Display for DatasetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetSelection::Scratch { dataset } => write!(f, "{dataset}"),
            DatasetSelection::FineTune {
                dataset,
                checkpoint,
            } => write!(f, "{dataset}<-{checkpoint}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    pub optimizer: String,
    pub batch_size: u32,
    pub scheduler: Option<String>,
    pub max_epochs: u32,
    pub weight_decay: f64,
}

impl Hyperparameters {
    pub fn from_sampled(sampled: &SampledParams) -> Result<Self, ConfigError> {
        let learning_rate = number(sampled, "learning_rate")?;
        if learning_rate <= 0.0 {
            return Err(ConfigError::out_of_range(
                "learning_rate",
                format!("{learning_rate} must be positive"),
            ));
        }
        let weight_decay = number(sampled, "weight_decay")?;
        if weight_decay < 0.0 {
            return Err(ConfigError::out_of_range(
                "weight_decay",
                format!("{weight_decay} must be non-negative"),
            ));
        }

        let optimizer = match required(sampled, "optimizer")? {
            ParamValue::Text(s) if !s.trim().is_empty() => s.clone(),
            other => {
                return Err(ConfigError::out_of_range(
                    "optimizer",
                    format!("expected an optimizer name, got {other}"),
                ));
            }
        };

        let scheduler = match required(sampled, "scheduler")? {
            v if v.is_absent() => None,
            v => Some(v.to_string()),
        };

        Ok(Self {
            learning_rate,
            optimizer,
            batch_size: positive_int(sampled, "batch_size")?,
            scheduler,
            max_epochs: positive_int(sampled, "max_epochs")?,
            weight_decay,
        })
    }
}

fn required<'a>(sampled: &'a SampledParams, key: &str) -> Result<&'a ParamValue, ConfigError> {
    sampled.get(key).ok_or_else(|| ConfigError::missing(key))
}

fn number(sampled: &SampledParams, key: &str) -> Result<f64, ConfigError> {
    let value = required(sampled, key)?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConfigError::out_of_range(key, format!("expected a number, got {value}")))
}

fn positive_int(sampled: &SampledParams, key: &str) -> Result<u32, ConfigError> {
    let value = required(sampled, key)?;
    value
        .as_i64()
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            ConfigError::out_of_range(key, format!("expected a positive integer, got {value}"))
        })
}

/// A fully resolved training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: String,
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointRef>,
    pub mode: Mode,
    pub data_dir: PathBuf,
    /// Run-specific output directory.
    pub output_dir: PathBuf,
    pub dataset_percentage: u32,
    pub precision: Precision,
    pub num_workers: u32,
    pub deterministic: bool,
    pub gpu_id: Option<u32>,
    pub momentum: f64,
    pub freeze: LayerSelector,
    pub reset_head: bool,
    pub replace_fc: bool,
    pub cutmix_prob: f64,
    pub seed: u64,
    pub profiler: Option<String>,
    pub num_classes: u32,
    pub in_channels: u32,
    pub hyperparameters: Hyperparameters,
    /// Sampled keys beyond the required hyperparameters, passed through verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, ParamValue>,
}

impl RunConfig {
    pub fn dataset_trained_on(&self) -> Option<&str> {
        self.checkpoint.as_ref().map(|c| c.dataset_trained_on.as_str())
    }

    pub fn is_fine_tune(&self) -> bool {
        self.checkpoint.is_some()
    }
}

/// `output_dir/<dataset>/<model>[_<postfix>]`.
pub fn run_output_dir(output_dir: &Path, dataset: &str, model: &str, postfix: Option<&str>) -> PathBuf {
    let leaf = match postfix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(postfix) => format!("{model}_{postfix}"),
        None => model.to_string(),
    };
    output_dir.join(dataset).join(leaf)
}

/// Resolve one trial's run configuration.
pub fn resolve(
    setup: &SetupConfig,
    sampled: &SampledParams,
    model: &str,
    selection: &DatasetSelection,
) -> Result<RunConfig, ConfigError> {
    let fixed = setup.validated()?;

    if model.trim().is_empty() {
        return Err(ConfigError::missing("model"));
    }
    let restores = selection.checkpoint().is_some() || !setup.checkpoint_inputs.is_empty();
    if restores && !fixed.mode.is_finetune_compatible() {
        return Err(ConfigError::IncompatibleMode {
            mode: fixed.mode.to_string(),
        });
    }

    let dataset = selection.dataset();
    let info = catalog::dataset_info(dataset).ok_or_else(|| ConfigError::UnknownDataset {
        dataset: dataset.to_string(),
    })?;

    if let Some(key) = sampled.keys().find(|k| is_setup_field(k)) {
        return Err(ConfigError::KeyCollision {
            key: key.to_string(),
        });
    }
    let hyperparameters = Hyperparameters::from_sampled(sampled)?;
    let extra = sampled
        .iter()
        .filter(|(k, _)| !REQUIRED_HYPERPARAMETERS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let profiler = setup
        .profiler
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("none"))
        .map(str::to_string);

    Ok(RunConfig {
        model: model.to_string(),
        dataset: dataset.to_string(),
        checkpoint: selection.checkpoint().cloned(),
        mode: fixed.mode,
        data_dir: fixed.data_dir,
        output_dir: run_output_dir(&fixed.output_dir, dataset, model, setup.postfix.as_deref()),
        dataset_percentage: fixed.dataset_percentage,
        precision: fixed.precision,
        num_workers: setup.num_workers,
        deterministic: setup.deterministic,
        gpu_id: setup.gpu_id,
        momentum: setup.momentum,
        freeze: setup
            .freeze
            .as_deref()
            .map(LayerSelector::parse)
            .unwrap_or_default(),
        reset_head: setup.reset_head,
        replace_fc: setup.replace_fc,
        cutmix_prob: setup.cutmix_prob,
        seed: fixed.seed,
        profiler,
        num_classes: info.num_classes,
        in_channels: info.in_channels,
        hyperparameters,
        extra,
    })
}
