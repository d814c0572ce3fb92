//! Sweep export.
//!
//! Splits a sweep document into one single-combination manifest per
//! (target dataset, model, checkpoint input) and records the command that
//! starts an agent for each manifest.

use crate::controller::TrialPlan;
use crate::error::SweepError;
use crate::persistence::{append_line, atomic_write_json};
use crate::setup::{CheckpointPolicy, CheckpointRef, SweepDocument};
use crate::training::checkpoint::CheckpointInventory;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A self-contained sweep for one combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepManifest {
    pub sweep_id: String,
    pub project: String,
    pub sweep_name: String,
    /// Flattened per-combination defaults for the training program.
    pub defaults: BTreeMap<String, Value>,
    pub document: SweepDocument,
}

impl SweepManifest {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let content = std::fs::read_to_string(path).map_err(|source| SweepError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// A combination left out because its checkpoint does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingCheckpoint {
    pub model: String,
    pub dataset: String,
    pub checkpoint: CheckpointRef,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub manifests: Vec<PathBuf>,
    pub command_files: Vec<PathBuf>,
    pub missing: Vec<MissingCheckpoint>,
}

/// Agent command file name for the given local time.
pub fn commands_file_name(now: &NaiveDateTime) -> String {
    format!("sweep_agent_commands{}.txt", now.format("%d_%m_%Y_%H"))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Write one manifest per combination and append its agent command.
///
/// Combinations come from the trial plan with one sample each, so exported
/// sweeps follow the order in which `run` dispatches trials.
pub fn export_sweeps(
    doc: &SweepDocument,
    inventory: &CheckpointInventory,
    now: &NaiveDateTime,
) -> Result<ExportReport, SweepError> {
    doc.validate()?;
    let sweep_dir = absolute(&doc.wandb.sweep_dir);
    let data_dir = doc.setup.data_dir.as_deref().map(absolute);
    let output_dir = doc.setup.output_dir.as_deref().map(absolute);

    let mut base_defaults = match serde_json::to_value(&doc.setup)? {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    for key in ["models", "datasets", "checkpoint_inputs"] {
        base_defaults.remove(key);
    }

    let mut report = ExportReport::default();
    for planned in TrialPlan::new(&doc.setup, 1, inventory.clone()) {
        let model = planned.model();
        let dataset = planned.selection.dataset();
        let input = planned.selection.checkpoint();
        let project = doc.project_name(dataset);
        let project_dir = sweep_dir.join(&project);
        let commands_file = project_dir.join(commands_file_name(now));

        let load_checkpoint = match input {
            None => None,
            Some(reference) => match inventory.lookup(model, reference) {
                Ok(ckpt) => Some(absolute(&ckpt.path)),
                Err(e) => {
                    warn!(model = %model, dataset = %dataset, checkpoint = %reference, error = %e, "Checkpoint missing; combination not exported");
                    report.missing.push(MissingCheckpoint {
                        model: model.to_string(),
                        dataset: dataset.to_string(),
                        checkpoint: reference.clone(),
                    });
                    continue;
                }
            },
        };

        let sweep_name = match input {
            Some(reference) => format!("{model}{}", reference.dataset_trained_on),
            None => model.to_string(),
        };

        let mut narrowed = doc.clone();
        narrowed.setup.models = vec![model.to_string()];
        narrowed.setup.datasets = vec![dataset.to_string()];
        narrowed.setup.checkpoint_inputs = input.into_iter().cloned().collect();
        narrowed.setup.checkpoints = if input.is_some() {
            CheckpointPolicy::All
        } else {
            CheckpointPolicy::None
        };
        narrowed.setup.data_dir = data_dir.clone();
        narrowed.setup.output_dir = output_dir.clone();
        narrowed.hyperparameters.name = Some(sweep_name.clone());

        let mut defaults: BTreeMap<String, Value> = base_defaults.clone().into_iter().collect();
        defaults.insert("classifier".into(), Value::from(model));
        defaults.insert("dataset".into(), Value::from(dataset));
        defaults.insert(
            "load_checkpoint".into(),
            load_checkpoint
                .map(|p| Value::from(p.to_string_lossy().to_string()))
                .unwrap_or(Value::Null),
        );
        if let Some(dir) = &data_dir {
            defaults.insert("data_dir".into(), Value::from(dir.to_string_lossy().to_string()));
        }
        if let Some(dir) = &output_dir {
            defaults.insert("output_dir".into(), Value::from(dir.to_string_lossy().to_string()));
        }
        defaults.insert("wandb".into(), Value::from(project.as_str()));

        let manifest = SweepManifest {
            sweep_id: narrowed.sweep_id()?,
            project: project.clone(),
            sweep_name: sweep_name.clone(),
            defaults,
            document: narrowed,
        };
        let path = project_dir.join(model).join(format!("{sweep_name}.json"));
        atomic_write_json(&path, &manifest)?;
        append_line(&commands_file, &format!("tunesweep agent {}", path.display()))?;
        info!(project = %project, sweep = %sweep_name, path = %path.display(), "Exported sweep");

        report.manifests.push(path);
        if !report.command_files.contains(&commands_file) {
            report.command_files.push(commands_file);
        }
    }
    Ok(report)
}
