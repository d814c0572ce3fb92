//! Operator configuration for tunesweep.
//!
//! Settings are layered with figment, later sources overriding earlier ones:
//! built-in defaults, `~/.config/tunesweep/config.toml`,
//! `<workspace>/.tunesweep/config.toml`, `TUNESWEEP_*` environment variables
//! (`__` separates nested keys, e.g. `TUNESWEEP_CONTROLLER__MAX_PARALLEL=4`),
//! and finally an explicitly named file.

use crate::controller::ControllerOptions;
use crate::error::ConfigError;
use crate::training::graphs::GraphCatalog;
use crate::training::runner::CommandRunner;
use crate::training::tracker::{ExperimentTracker, LedgerTracker};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory holding workspace-level state and configuration.
pub const WORKSPACE_DIR: &str = ".tunesweep";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneSweepConfig {
    pub controller: ControllerOptions,
    pub runner: RunnerConfig,
    pub tracker: TrackerConfig,
    pub models: ModelsConfig,
    pub checkpoints: CheckpointsConfig,
}

/// External training program launched once per trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            working_dir: None,
            timeout_secs: 24 * 3600,
            env: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Build the subprocess runner; `metric_name` selects the reported metric.
    pub fn build(&self, metric_name: &str) -> Result<CommandRunner, ConfigError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| ConfigError::missing("runner.program"))?;
        let mut runner = CommandRunner::new(program, metric_name)
            .args(self.args.iter().cloned())
            .timeout(Duration::from_secs(self.timeout_secs));
        if let Some(dir) = &self.working_dir {
            runner = runner.working_dir(dir);
        }
        for (key, value) in &self.env {
            runner = runner.env(key, value);
        }
        Ok(runner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Keep ledgers on disk so interrupted sweeps can resume.
    pub persist: bool,
    /// Ledger directory; defaults to `<workspace>/.tunesweep/ledgers`.
    pub dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            persist: true,
            dir: None,
        }
    }
}

impl TrackerConfig {
    pub fn ledger_dir(&self, workspace: &Path) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| workspace.join(WORKSPACE_DIR).join("ledgers"))
    }

    pub fn build(&self, workspace: &Path) -> Arc<dyn ExperimentTracker> {
        if self.persist {
            Arc::new(LedgerTracker::persistent(self.ledger_dir(workspace)))
        } else {
            Arc::new(LedgerTracker::in_memory())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory of `<model>.json` layer graphs.
    pub graph_dir: Option<PathBuf>,
}

impl ModelsConfig {
    pub fn catalog(&self) -> GraphCatalog {
        match &self.graph_dir {
            Some(dir) => GraphCatalog::with_dir(dir),
            None => GraphCatalog::builtin(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointsConfig {
    /// Checkpoint root; defaults to the sweep's `setup.output_dir`.
    pub root: Option<PathBuf>,
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tunesweep", "tunesweep")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load the layered configuration.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<TuneSweepConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TuneSweepConfig::default()));

    if let Some(user_config) = user_config_path().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_DIR).join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("TUNESWEEP_").split("__"));

    if let Some(path) = explicit {
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(WORKSPACE_DIR).join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Device;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = TuneSweepConfig::default();
        assert_eq!(config.controller.max_parallel, 1);
        assert!(config.tracker.persist);
        assert_eq!(config.runner.timeout_secs, 86_400);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(WORKSPACE_DIR);
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[controller]
max_parallel = 2
devices = ["cuda:0", "cuda:1"]
resource_backoff = 100

[runner]
program = "python3"
args = ["train.py"]
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.controller.max_parallel, 2);
        assert_eq!(config.controller.devices, vec![Device::Gpu(0), Device::Gpu(1)]);
        assert_eq!(config.controller.resource_backoff, Duration::from_millis(100));
        assert_eq!(config.runner.args, vec!["train.py".to_string()]);
        assert!(config.tracker.persist);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(WORKSPACE_DIR);
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(ws_dir.join("config.toml"), "[controller]\nmax_parallel = 2\n").unwrap();
        let explicit = dir.path().join("ci.json");
        std::fs::write(&explicit, r#"{"controller": {"max_parallel": 8}, "tracker": {"persist": false}}"#).unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.controller.max_parallel, 8);
        assert!(!config.tracker.persist);
    }

    #[test]
    fn test_runner_requires_program() {
        assert_eq!(
            RunnerConfig::default().build("acc").unwrap_err(),
            ConfigError::missing("runner.program")
        );
        let runner = RunnerConfig {
            program: Some("python3".into()),
            timeout_secs: 60,
            ..RunnerConfig::default()
        }
        .build("acc")
        .unwrap();
        assert_eq!(runner.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_ledger_dir_default() {
        let tracker = TrackerConfig::default();
        assert_eq!(
            tracker.ledger_dir(Path::new("/work")),
            PathBuf::from("/work/.tunesweep/ledgers")
        );
    }
}
