//! The sweep document: tracker identity, static setup, and the search space.
//!
//! A document is loaded once, validated eagerly, and shared read-only with the
//! sweep controller. Required scalar fields are kept optional here so that a
//! missing field surfaces as `ConfigError::MissingField` rather than a parse
//! failure.

use crate::catalog;
use crate::error::{ConfigError, SweepError};
use crate::sweep::SweepSpec;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Keys owned by the setup block (or derived from it) that sampled
/// parameters must not overwrite.
pub const SETUP_FIELDS: &[&str] = &[
    "mode",
    "data_dir",
    "dataset_percentage",
    "checkpoints",
    "reset_head",
    "replace_fc",
    "output_dir",
    "postfix",
    "precision",
    "num_workers",
    "deterministic",
    "gpu_id",
    "momentum",
    "freeze",
    "cutmix_prob",
    "seed",
    "profiler",
    "models",
    "datasets",
    "checkpoint_inputs",
    "classifier",
    "dataset",
    "load_checkpoint",
    "wandb",
];

pub fn is_setup_field(key: &str) -> bool {
    SETUP_FIELDS.contains(&key)
}

/// Training mode requested by the setup block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Train from randomly initialized weights.
    Train,
    /// Continue training from a restored checkpoint.
    Finetune,
    /// Evaluate a restored checkpoint without updates.
    Test,
}

impl Mode {
    pub fn is_finetune_compatible(self) -> bool {
        matches!(self, Mode::Finetune | Mode::Test)
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" | "scratch" => Ok(Mode::Train),
            "finetune" | "fine_tune" | "fine-tune" => Ok(Mode::Finetune),
            "test" | "eval" => Ok(Mode::Test),
            other => Err(ConfigError::out_of_range(
                "mode",
                format!("unknown mode '{other}'; expected train, finetune or test"),
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Train => "train",
            Mode::Finetune => "finetune",
            Mode::Test => "test",
        };
        f.write_str(s)
    }
}

/// Numeric precision of a training run, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Precision {
    Half,
    Single,
    Double,
}

impl Precision {
    pub fn bits(self) -> u32 {
        match self {
            Precision::Half => 16,
            Precision::Single => 32,
            Precision::Double => 64,
        }
    }
}

impl TryFrom<u32> for Precision {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Precision::Half),
            32 => Ok(Precision::Single),
            64 => Ok(Precision::Double),
            other => Err(format!("unsupported precision {other}; expected 16, 32 or 64")),
        }
    }
}

impl From<Precision> for u32 {
    fn from(p: Precision) -> Self {
        p.bits()
    }
}

/// How `checkpoint_inputs` feed the trial enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPolicy {
    /// Train from scratch on every dataset.
    #[default]
    #[serde(alias = "None")]
    None,
    /// One trial per listed checkpoint reference.
    #[serde(alias = "All")]
    All,
    /// The newest stored version per listed `dataset_trained_on`.
    #[serde(alias = "Latest")]
    Latest,
}

/// Reference to a prior checkpoint: the dataset it was trained on and its version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub dataset_trained_on: String,
    pub version: u32,
}

impl CheckpointRef {
    pub fn new(dataset_trained_on: &str, version: u32) -> Self {
        Self {
            dataset_trained_on: dataset_trained_on.to_string(),
            version,
        }
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.dataset_trained_on, self.version)
    }
}

/// Identity fields for the experiment tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerIdentity {
    pub username: String,
    #[serde(default = "default_sweep_dir")]
    pub sweep_dir: PathBuf,
    /// Project naming template; `{dataset}` is replaced by the target dataset.
    pub project_format_string: String,
}

fn default_sweep_dir() -> PathBuf {
    PathBuf::from("sweeps")
}

/// Static configuration shared by every trial of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub dataset_percentage: Option<i64>,
    #[serde(default)]
    pub checkpoints: CheckpointPolicy,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub reset_head: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub replace_fc: bool,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postfix: Option<String>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub num_workers: u32,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub deterministic: bool,
    #[serde(default)]
    pub gpu_id: Option<u32>,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Layer-type selector, or "none".
    #[serde(default)]
    pub freeze: Option<String>,
    #[serde(default)]
    pub cutmix_prob: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiler: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub checkpoint_inputs: Vec<CheckpointRef>,
}

fn default_momentum() -> f64 {
    0.9
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            mode: None,
            data_dir: None,
            dataset_percentage: None,
            checkpoints: CheckpointPolicy::None,
            reset_head: false,
            replace_fc: false,
            output_dir: None,
            postfix: None,
            precision: None,
            num_workers: 0,
            deterministic: false,
            gpu_id: None,
            momentum: default_momentum(),
            freeze: None,
            cutmix_prob: 0.0,
            seed: None,
            profiler: None,
            models: Vec::new(),
            datasets: Vec::new(),
            checkpoint_inputs: Vec::new(),
        }
    }
}

/// The required scalar setup fields after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSetup {
    pub mode: Mode,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dataset_percentage: u32,
    pub precision: Precision,
    pub seed: u64,
}

impl SetupConfig {
    /// Validate required scalar fields and their ranges.
    pub fn validated(&self) -> Result<ValidatedSetup, ConfigError> {
        let mode = self
            .mode
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ConfigError::missing("mode"))?
            .parse::<Mode>()?;
        let data_dir = required_path(&self.data_dir, "data_dir")?;
        let output_dir = required_path(&self.output_dir, "output_dir")?;

        let pct = self
            .dataset_percentage
            .ok_or_else(|| ConfigError::missing("dataset_percentage"))?;
        if !(1..=100).contains(&pct) {
            return Err(ConfigError::out_of_range(
                "dataset_percentage",
                format!("{pct} is not in (0, 100]"),
            ));
        }

        let precision = self
            .precision
            .ok_or_else(|| ConfigError::missing("precision"))
            .and_then(|bits| {
                Precision::try_from(bits).map_err(|msg| ConfigError::out_of_range("precision", msg))
            })?;

        let seed = self.seed.ok_or_else(|| ConfigError::missing("seed"))?;
        let seed = u64::try_from(seed).map_err(|_| {
            ConfigError::out_of_range("seed", format!("{seed} is negative"))
        })?;

        if !(0.0..=1.0).contains(&self.cutmix_prob) {
            return Err(ConfigError::out_of_range(
                "cutmix_prob",
                format!("{} is not in [0, 1]", self.cutmix_prob),
            ));
        }
        if !self.momentum.is_finite() || self.momentum < 0.0 {
            return Err(ConfigError::out_of_range(
                "momentum",
                format!("{} must be a non-negative number", self.momentum),
            ));
        }

        // Repeated entries would plan trials with identical keys.
        if let Some(model) = first_duplicate(&self.models) {
            return Err(ConfigError::out_of_range("models", format!("'{model}' is listed twice")));
        }
        if let Some(dataset) = first_duplicate(&self.datasets) {
            return Err(ConfigError::out_of_range(
                "datasets",
                format!("'{dataset}' is listed twice"),
            ));
        }
        if let Some(reference) = first_duplicate(&self.checkpoint_inputs) {
            return Err(ConfigError::out_of_range(
                "checkpoint_inputs",
                format!("{reference} is listed twice"),
            ));
        }

        Ok(ValidatedSetup {
            mode,
            data_dir,
            output_dir,
            dataset_percentage: pct as u32,
            precision,
            seed,
        })
    }
}

fn required_path(value: &Option<PathBuf>, field: &str) -> Result<PathBuf, ConfigError> {
    value
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::missing(field))
}

/// Parse the boolean spellings accepted on the command line and in documents.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "t" | "y" | "1" => Some(true),
        "no" | "false" | "f" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Int(0) => Ok(false),
        Raw::Int(1) => Ok(true),
        Raw::Int(other) => Err(serde::de::Error::custom(format!(
            "boolean value expected, got {other}"
        ))),
        Raw::Text(s) => parse_bool(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("boolean value expected, got '{s}'"))
        }),
    }
}

fn first_duplicate<T: Ord>(items: &[T]) -> Option<&T> {
    let mut seen = std::collections::BTreeSet::new();
    items.iter().find(|item| !seen.insert(*item))
}

/// A complete sweep document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepDocument {
    /// Tracker identity (kept under the `wandb` key for compatibility with existing documents).
    pub wandb: TrackerIdentity,
    pub setup: SetupConfig,
    pub hyperparameters: SweepSpec,
}

impl SweepDocument {
    pub fn from_yaml_str(content: &str) -> Result<Self, SweepError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load a document from YAML (JSON documents parse as well).
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let content = std::fs::read_to_string(path).map_err(|source| SweepError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Eager validation; any error here aborts the sweep before a trial starts.
    pub fn validate(&self) -> Result<ValidatedSetup, ConfigError> {
        self.hyperparameters.validate()?;
        let fixed = self.setup.validated()?;

        if self.wandb.project_format_string.trim().is_empty() {
            return Err(ConfigError::missing("wandb.project_format_string"));
        }
        if self.setup.models.is_empty() {
            return Err(ConfigError::missing("setup.models"));
        }
        if self.setup.datasets.is_empty() {
            return Err(ConfigError::missing("setup.datasets"));
        }
        if let Some(unknown) = self
            .setup
            .datasets
            .iter()
            .find(|d| catalog::dataset_info(d).is_none())
        {
            return Err(ConfigError::UnknownDataset {
                dataset: unknown.clone(),
            });
        }
        if self.setup.checkpoints != CheckpointPolicy::None && self.setup.checkpoint_inputs.is_empty()
        {
            return Err(ConfigError::missing("setup.checkpoint_inputs"));
        }
        if !self.setup.checkpoint_inputs.is_empty() && !fixed.mode.is_finetune_compatible() {
            return Err(ConfigError::IncompatibleMode {
                mode: fixed.mode.to_string(),
            });
        }
        if let Some(key) = self
            .hyperparameters
            .parameter_space
            .keys()
            .find(|k| is_setup_field(k))
        {
            return Err(ConfigError::KeyCollision { key: key.clone() });
        }
        Ok(fixed)
    }

    /// Stable identity of this sweep: identical documents share an id, which
    /// lets a new controller resume from the tracker.
    pub fn sweep_id(&self) -> Result<String, SweepError> {
        let canonical = serde_json::to_vec(&(&self.wandb, &self.setup, &self.hyperparameters))?;
        Ok(short_digest(&[&canonical]))
    }

    /// Create `data_dir`, `output_dir` and `sweep_dir` when missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        let dirs = [
            self.setup.data_dir.as_ref(),
            self.setup.output_dir.as_ref(),
            Some(&self.wandb.sweep_dir),
        ];
        for dir in dirs.into_iter().flatten() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Tracker project for a target dataset.
    pub fn project_name(&self, dataset: &str) -> String {
        self.wandb.project_format_string.replace("{dataset}", dataset)
    }
}

/// First 16 hex characters of the SHA-256 over `parts`.
pub fn short_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
