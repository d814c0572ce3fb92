//! Training job runners.
//!
//! The controller hands each resolved trial to a [`TrainingJobRunner`]. The
//! reference [`CommandRunner`] launches an external training program, writes
//! the job to its stdin as JSON and reads the result from the last line of
//! its stdout.

use super::checkpoint::Checkpoint;
use super::freeze::FreezeSpec;
use crate::controller::device::Device;
use crate::error::TrainingError;
use crate::resolver::RunConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Everything a runner needs to execute one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub trial: String,
    pub config: RunConfig,
    pub freeze: FreezeSpec,
    pub checkpoint: Option<Checkpoint>,
    pub device: Device,
    /// Seed derived for this trial from the setup seed.
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    /// Value of the sweep's target metric.
    pub metric: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub duration_secs: f64,
}

#[async_trait]
pub trait TrainingJobRunner: Send + Sync {
    /// Execute a job to completion. Dropping the returned future must stop the job.
    async fn run(&self, job: TrainingJob) -> Result<TrainingOutcome, TrainingError>;

    fn name(&self) -> &str {
        "runner"
    }
}

/// Runs each job as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    metric_name: String,
    /// Maximum duration before a job is killed.
    pub timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, metric_name: &str) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            metric_name: metric_name.to_string(),
            timeout: Duration::from_secs(24 * 3600),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn execute(&self, job: &TrainingJob) -> Result<TrainingOutcome, TrainingError> {
        let started = Instant::now();
        let input = serde_json::to_vec(job)
            .map_err(|e| TrainingError::Launch(format!("cannot serialize job: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .env("CUDA_VISIBLE_DEVICES", job.device.visible_devices())
            .env("TUNESWEEP_TRIAL", &job.trial)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TrainingError::Launch(format!("{}: {e}", self.program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                // The job may exit without reading its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(TrainingError::Launch(format!(
                        "cannot write job to stdin: {e}"
                    )));
                }
                _ => {}
            }
            // Dropping stdin closes the pipe so the job sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TrainingError::Launch(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TrainingError::Exited {
                status: output.status.to_string(),
                stderr: tail(&stderr, 20),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut outcome = parse_result_line(&stdout, &self.metric_name)?;
        outcome.duration_secs = started.elapsed().as_secs_f64();
        Ok(outcome)
    }
}

#[async_trait]
impl TrainingJobRunner for CommandRunner {
    async fn run(&self, job: TrainingJob) -> Result<TrainingOutcome, TrainingError> {
        debug!(trial = %job.trial, program = %self.program.display(), "Launching training job");

        match tokio::time::timeout(self.timeout, self.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(TrainingError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}

#[derive(Deserialize)]
struct ResultLine {
    metric: Option<f64>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    error: Option<String>,
}

/// Parse the job result from the last non-empty stdout line.
///
/// Accepted forms: `{"metric": 0.91}`, `{"metrics": {"acc_max/val": 0.91}}`
/// (looked up by the sweep's metric name) and `{"error": "..."}`.
pub fn parse_result_line(stdout: &str, metric_name: &str) -> Result<TrainingOutcome, TrainingError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| TrainingError::InvalidOutput("job produced no output".into()))?;

    let parsed: ResultLine = serde_json::from_str(line)
        .map_err(|e| TrainingError::InvalidOutput(format!("{e}: {line}")))?;

    if let Some(error) = parsed.error {
        return Err(TrainingError::Reported(error));
    }
    let metric = parsed
        .metric
        .or_else(|| parsed.metrics.get(metric_name).copied())
        .filter(|m| m.is_finite())
        .ok_or_else(|| {
            TrainingError::InvalidOutput(format!("no finite value for metric '{metric_name}'"))
        })?;

    Ok(TrainingOutcome {
        metric,
        metrics: parsed.metrics,
        duration_secs: 0.0,
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_metric_line() {
        let out = "epoch 1\nepoch 2\n{\"metric\": 0.91}\n\n";
        let outcome = parse_result_line(out, "acc_max/val").unwrap();
        assert_eq!(outcome.metric, 0.91);
    }

    #[test]
    fn test_parse_named_metric() {
        let out = r#"{"metrics": {"acc_max/val": 0.87, "loss/val": 0.4}}"#;
        let outcome = parse_result_line(out, "acc_max/val").unwrap();
        assert_eq!(outcome.metric, 0.87);
        assert_eq!(outcome.metrics.len(), 2);
    }

    #[test]
    fn test_parse_reported_error() {
        let err = parse_result_line(r#"{"error": "CUDA out of memory"}"#, "m").unwrap_err();
        assert_eq!(err, TrainingError::Reported("CUDA out of memory".into()));
    }

    #[test]
    fn test_parse_invalid_output() {
        assert!(matches!(
            parse_result_line("", "m"),
            Err(TrainingError::InvalidOutput(_))
        ));
        assert!(matches!(
            parse_result_line("done", "m"),
            Err(TrainingError::InvalidOutput(_))
        ));
        assert!(matches!(
            parse_result_line(r#"{"metrics": {"other": 1.0}}"#, "m"),
            Err(TrainingError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::resolver::{DatasetSelection, resolve};
        use crate::setup::SetupConfig;
        use crate::sweep::SampledParams;

        fn job() -> TrainingJob {
            let setup = SetupConfig {
                mode: Some("train".into()),
                data_dir: Some("data".into()),
                output_dir: Some("output".into()),
                dataset_percentage: Some(10),
                precision: Some(16),
                seed: Some(3),
                ..SetupConfig::default()
            };
            let sampled = SampledParams::new()
                .with("learning_rate", 0.1)
                .with("optimizer", "sgd")
                .with("batch_size", 32)
                .with("scheduler", "None")
                .with("max_epochs", 1)
                .with("weight_decay", 0.0);
            let config =
                resolve(&setup, &sampled, "lowres_resnet9", &DatasetSelection::scratch("mnist")).unwrap();
            TrainingJob {
                trial: "lowres_resnet9/mnist/scratch/0".into(),
                freeze: FreezeSpec::none(config.num_classes),
                config,
                checkpoint: None,
                device: Device::Cpu,
                seed: 3,
            }
        }

        #[tokio::test]
        async fn test_command_runner_reads_metric() {
            let runner = CommandRunner::new("sh", "acc")
                .args(["-c", "cat > /dev/null; echo \"{\\\"metric\\\": 0.5}\""]);
            let outcome = runner.run(job()).await.unwrap();
            assert_eq!(outcome.metric, 0.5);
        }

        #[tokio::test]
        async fn test_command_runner_receives_job_on_stdin() {
            let runner = CommandRunner::new("sh", "acc").args([
                "-c",
                "grep -q lowres_resnet9 && echo '{\"metric\": 1.0}' || echo '{\"error\": \"no job\"}'",
            ]);
            let outcome = runner.run(job()).await.unwrap();
            assert_eq!(outcome.metric, 1.0);
        }

        #[tokio::test]
        async fn test_command_runner_nonzero_exit() {
            let runner = CommandRunner::new("sh", "acc").args(["-c", "cat > /dev/null; echo boom >&2; exit 3"]);
            let err = runner.run(job()).await.unwrap_err();
            match err {
                TrainingError::Exited { stderr, .. } => assert_eq!(stderr, "boom"),
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_command_runner_timeout() {
            let runner = CommandRunner::new("sh", "acc")
                .args(["-c", "sleep 5"])
                .timeout(Duration::from_millis(100));
            assert_eq!(
                runner.run(job()).await.unwrap_err(),
                TrainingError::Timeout { secs: 0 }
            );
        }

        #[tokio::test]
        async fn test_missing_program() {
            let runner = CommandRunner::new("/nonexistent/tunesweep-train", "acc");
            assert!(matches!(
                runner.run(job()).await,
                Err(TrainingError::Launch(_))
            ));
        }
    }
}
