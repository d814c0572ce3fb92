//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, RunOverrides};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tunesweep_core::config::{TuneSweepConfig, WORKSPACE_DIR, load_config};
use tunesweep_core::controller::TrialPlan;
use tunesweep_core::{
    CheckpointInventory, SweepController, SweepDocument, SweepManifest, SweepSummary, TrialResult,
    TrialStatus, export_sweeps,
};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Validate { document } => handle_validate(&document),
        Commands::Plan { document } => handle_plan(&document, workspace, config_path),
        Commands::Run {
            document,
            overrides,
        } => {
            let doc = SweepDocument::load(&document)?;
            run_sweep(doc, overrides, workspace, config_path).await
        }
        Commands::Agent {
            manifest,
            overrides,
        } => {
            let manifest = SweepManifest::load(&manifest)?;
            println!(
                "Agent for sweep '{}' in project '{}'",
                manifest.sweep_name, manifest.project
            );
            run_sweep(manifest.document, overrides, workspace, config_path).await
        }
        Commands::Export { document } => handle_export(&document, workspace, config_path),
        Commands::Checkpoints { document } => handle_checkpoints(&document, workspace, config_path),
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<TuneSweepConfig> {
    load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn inventory(config: &TuneSweepConfig, doc: &SweepDocument) -> CheckpointInventory {
    let root = config
        .checkpoints
        .root
        .clone()
        .or_else(|| doc.setup.output_dir.clone())
        .unwrap_or_else(|| ".".into());
    CheckpointInventory::new(root)
}

fn handle_validate(document: &Path) -> anyhow::Result<()> {
    let doc = SweepDocument::load(document)?;
    let fixed = doc.validate()?;
    let total = TrialPlan::new(
        &doc.setup,
        doc.hyperparameters.samples_per_combination(),
        CheckpointInventory::new("."),
    )
    .total();

    println!("Sweep document is valid: {}", document.display());
    println!("  Sweep id:   {}", doc.sweep_id()?);
    println!("  Mode:       {}", fixed.mode);
    println!("  Precision:  {}", fixed.precision.bits());
    println!("  Method:     {:?}", doc.hyperparameters.method);
    println!(
        "  Metric:     {} ({:?})",
        doc.hyperparameters.metric.name, doc.hyperparameters.metric.goal
    );
    println!("  Trials:     {}", total);
    Ok(())
}

fn handle_plan(
    document: &Path,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let doc = SweepDocument::load(document)?;
    doc.validate()?;
    let config = load(workspace, config_path)?;
    let inventory = inventory(&config, &doc);

    let plan = TrialPlan::new(
        &doc.setup,
        doc.hyperparameters.samples_per_combination(),
        inventory.clone(),
    );
    println!("{} trial(s):", plan.total());
    let mut missing = 0usize;
    for trial in plan {
        let absent = trial
            .selection
            .checkpoint()
            .is_some_and(|reference| !inventory.exists(trial.model(), reference));
        if absent {
            missing += 1;
            println!("  {}  (checkpoint missing, will be skipped)", trial.key);
        } else {
            println!("  {}", trial.key);
        }
    }
    if missing > 0 {
        println!("{} trial(s) have no stored checkpoint.", missing);
    }
    Ok(())
}

async fn run_sweep(
    doc: SweepDocument,
    overrides: RunOverrides,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    doc.validate()?;
    doc.ensure_directories()?;

    let config = load(workspace, config_path)?;
    let mut options = config.controller.clone();
    if let Some(max_parallel) = overrides.max_parallel {
        options.max_parallel = max_parallel;
    }
    if !overrides.devices.is_empty() {
        options.devices = overrides.devices;
    }
    if overrides.no_resume {
        options.resume = false;
    }

    let runner = config.runner.build(&doc.hyperparameters.metric.name)?;
    let inventory = inventory(&config, &doc);
    let goal = doc.hyperparameters.metric.goal;
    let controller = SweepController::new(doc, Arc::new(runner))
        .with_options(options)
        .with_tracker(config.tracker.build(workspace))
        .with_inventory(inventory)
        .with_graphs(config.models.catalog());

    let cancel = controller.cancellation_token();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; cancelling sweep");
                eprintln!("\nCancelling sweep; waiting for running trials to stop...");
                cancel.cancel();
            }
        }
    });

    let mut stream = controller.run().await?;
    info!(sweep = %stream.sweep_id(), total = stream.total(), "Sweep started from CLI");
    println!("Sweep {} ({} trials)", stream.sweep_id(), stream.total());

    let mut summary = SweepSummary::default();
    while let Some(result) = stream.next().await {
        println!("{}", format_result(&result));
        summary.record(&result, goal);
    }
    print_summary(&summary);
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "Sweep finished"
    );

    if cancel.is_cancelled() {
        warn!("Sweep cancelled before all trials finished");
        anyhow::bail!("Sweep cancelled");
    }
    Ok(())
}

fn format_result(result: &TrialResult) -> String {
    let mut line = format!("[{:>9}] {}", result.status.to_string(), result.key);
    if let Some(metric) = result.metric {
        line.push_str(&format!("  metric={metric:.4}"));
    }
    if result.status == TrialStatus::Succeeded || result.status == TrialStatus::Failed {
        line.push_str(&format!("  {:.1}s", result.duration_secs()));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!("  ({error})"));
    }
    line
}

fn print_summary(summary: &SweepSummary) {
    println!(
        "\n{} trial(s): {} succeeded, {} failed, {} skipped, {} cancelled",
        summary.total, summary.succeeded, summary.failed, summary.skipped, summary.cancelled
    );
    if let Some((key, metric)) = &summary.best {
        println!("Best: {} ({:.4})", key, metric);
    }
}

fn handle_export(
    document: &Path,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let doc = SweepDocument::load(document)?;
    doc.validate()?;
    doc.ensure_directories()?;
    let config = load(workspace, config_path)?;
    let now = chrono::Local::now().naive_local();

    let report = export_sweeps(&doc, &inventory(&config, &doc), &now)?;
    info!(
        manifests = report.manifests.len(),
        missing = report.missing.len(),
        "Sweep export finished"
    );
    for path in &report.manifests {
        println!("Wrote {}", path.display());
    }
    for missing in &report.missing {
        println!(
            "Skipped {} on {}: checkpoint {} not found",
            missing.model, missing.dataset, missing.checkpoint
        );
    }
    for file in &report.command_files {
        println!("Agent commands appended to {}", file.display());
    }
    Ok(())
}

fn handle_checkpoints(
    document: &Path,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let doc = SweepDocument::load(document)?;
    let config = load(workspace, config_path)?;
    let inventory = inventory(&config, &doc);

    let checkpoints = inventory.scan()?;
    if checkpoints.is_empty() {
        println!("No checkpoints under {}", inventory.root().display());
        return Ok(());
    }
    println!("Checkpoints under {}:", inventory.root().display());
    for ckpt in &checkpoints {
        let modified = ckpt
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<20} {:<16} v{:<4} {:>10} B  {}  {}",
            ckpt.model,
            ckpt.dataset_trained_on,
            ckpt.version,
            ckpt.size_bytes,
            modified,
            ckpt.path.display()
        );
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(WORKSPACE_DIR);
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&TuneSweepConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
