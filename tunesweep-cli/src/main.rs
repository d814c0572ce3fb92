//! tunesweep CLI: validate, plan, run and export hyperparameter sweeps.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tunesweep_core::Device;

/// Hyperparameter sweeps for fine-tuning image classifiers from checkpoints
#[derive(Parser, Debug)]
#[command(name = "tunesweep", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Parse and validate a sweep document
    Validate {
        /// Sweep document (YAML)
        document: PathBuf,
    },
    /// List the trials a sweep document expands to
    Plan {
        /// Sweep document (YAML)
        document: PathBuf,
    },
    /// Run a sweep; Ctrl-C cancels outstanding trials
    Run {
        /// Sweep document (YAML)
        document: PathBuf,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Run the single-combination sweep stored in an exported manifest
    Agent {
        /// Manifest written by `tunesweep export`
        manifest: PathBuf,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Write one sweep manifest per combination and append agent commands
    Export {
        /// Sweep document (YAML)
        document: PathBuf,
    },
    /// List stored checkpoints under the sweep's output directory
    Checkpoints {
        /// Sweep document (YAML)
        document: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunOverrides {
    /// Maximum number of concurrently running trials
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Devices to lease, e.g. `cuda:0,cuda:1` or `cpu`
    #[arg(long, value_delimiter = ',')]
    devices: Vec<Device>,

    /// Re-run trials the tracker already recorded as succeeded
    #[arg(long)]
    no_resume: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // Structured JSON log per day, kept next to other user data
    let log_dir = directories::ProjectDirs::from("dev", "tunesweep", "tunesweep")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tunesweep.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "tunesweep",
            "-vv",
            "run",
            "sweep.yaml",
            "--max-parallel",
            "4",
            "--devices",
            "cuda:0,cuda:1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                document,
                overrides,
            } => {
                assert_eq!(document, PathBuf::from("sweep.yaml"));
                assert_eq!(overrides.max_parallel, Some(4));
                assert_eq!(overrides.devices, vec![Device::Gpu(0), Device::Gpu(1)]);
                assert!(!overrides.no_resume);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_device_is_rejected() {
        let result = Cli::try_parse_from(["tunesweep", "run", "sweep.yaml", "--devices", "tpu"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::try_parse_from(["tunesweep", "--workspace", "/tmp", "config", "show"]).unwrap();
        assert_eq!(cli.workspace, PathBuf::from("/tmp"));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }
}
