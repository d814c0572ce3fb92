//! The sweep controller.
//!
//! [`SweepController::run`] validates the sweep document, then spawns a
//! dispatcher that walks the trial plan in order and hands each trial to a
//! bounded set of tokio tasks. Finished trials are delivered through a
//! [`TrialStream`] in completion order.

use super::device::{Device, DeviceLease, DevicePool};
use super::plan::{PlannedTrial, TrialPlan};
use super::trial::{SweepSummary, TrialResult, TrialState, TrialStatus};
use crate::error::{CheckpointError, ConfigError, ResourceError, SweepError, TrialError};
use crate::resolver::{RunConfig, resolve};
use crate::setup::SweepDocument;
use crate::sweep::{Goal, SampledParams, SharedSampler};
use crate::training::checkpoint::{Checkpoint, CheckpointInventory};
use crate::training::freeze::FreezeSpec;
use crate::training::graphs::GraphCatalog;
use crate::training::reproducibility::{EnvironmentSnapshot, SeedManager};
use crate::training::runner::{TrainingJob, TrainingJobRunner};
use crate::training::tracker::{ExperimentTracker, LedgerTracker, SweepInfo, TrialStart};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Operator-tunable dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOptions {
    /// Upper bound on concurrently running trials.
    pub max_parallel: usize,
    /// Devices to lease to trials. Empty means `cuda:<gpu_id>` when the setup
    /// names a GPU, otherwise `max_parallel` CPU slots.
    pub devices: Vec<Device>,
    pub max_resource_attempts: u32,
    #[serde(with = "duration_millis")]
    pub resource_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Extra attempts after a training failure.
    pub training_retries: u32,
    /// Skip trials the tracker already recorded as succeeded.
    pub resume: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            devices: Vec::new(),
            max_resource_attempts: 5,
            resource_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            training_retries: 0,
            resume: true,
        }
    }
}

impl ControllerOptions {
    /// Delay before resource attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.resource_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub struct SweepController {
    document: SweepDocument,
    options: ControllerOptions,
    runner: Arc<dyn TrainingJobRunner>,
    tracker: Arc<dyn ExperimentTracker>,
    inventory: CheckpointInventory,
    graphs: GraphCatalog,
    sampler: Option<SharedSampler>,
    cancel: CancellationToken,
}

impl SweepController {
    /// A controller with an in-memory tracker, the built-in model graphs and
    /// a checkpoint inventory rooted at the setup's `output_dir`.
    pub fn new(document: SweepDocument, runner: Arc<dyn TrainingJobRunner>) -> Self {
        let root = document
            .setup
            .output_dir
            .clone()
            .unwrap_or_else(|| ".".into());
        Self {
            document,
            options: ControllerOptions::default(),
            runner,
            tracker: Arc::new(LedgerTracker::in_memory()),
            inventory: CheckpointInventory::new(root),
            graphs: GraphCatalog::builtin(),
            sampler: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExperimentTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_inventory(mut self, inventory: CheckpointInventory) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_graphs(mut self, graphs: GraphCatalog) -> Self {
        self.graphs = graphs;
        self
    }

    /// Replace the sampler derived from the document's search method.
    pub fn with_sampler(mut self, sampler: SharedSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Token that cancels the sweep. Running jobs are killed and every
    /// undispatched trial ends as cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn device_pool(&self) -> DevicePool {
        if !self.options.devices.is_empty() {
            return DevicePool::new(self.options.devices.clone());
        }
        match self.document.setup.gpu_id {
            Some(id) => DevicePool::new(vec![Device::Gpu(id)]),
            None => DevicePool::cpu(self.options.max_parallel),
        }
    }

    /// Validate the document and start dispatching.
    ///
    /// Errors returned here are sweep-fatal and happen before any trial
    /// starts. Per-trial failures arrive as results on the stream.
    pub async fn run(self) -> Result<TrialStream, SweepError> {
        let fixed = self.document.validate()?;
        let spec = &self.document.hyperparameters;
        let sweep_id = self.document.sweep_id()?;

        let sampler = match self.sampler.clone() {
            Some(sampler) => sampler,
            None => SharedSampler::from_spec(spec, fixed.seed)?,
        };
        let plan = TrialPlan::new(
            &self.document.setup,
            spec.samples_per_combination(),
            self.inventory.clone(),
        );
        let total = plan.total();

        self.tracker
            .begin_sweep(&SweepInfo {
                sweep_id: sweep_id.clone(),
                name: spec.name.clone().unwrap_or_else(|| sweep_id.clone()),
                username: self.document.wandb.username.clone(),
                total_trials: total,
                environment: EnvironmentSnapshot::capture(),
            })
            .await?;
        let completed = if self.options.resume {
            self.tracker.completed_trials(&sweep_id).await?
        } else {
            BTreeSet::new()
        };

        let pool = self.device_pool();
        let parallel = self.options.max_parallel.max(1).min(pool.capacity().max(1));
        let sampler_name = sampler.name().await;
        info!(
            sweep = %sweep_id,
            total,
            resumed = completed.len(),
            parallel,
            sampler = sampler_name,
            "Starting sweep"
        );

        let goal = spec.metric.goal;
        let ctx = Arc::new(SweepContext {
            sweep_id: sweep_id.clone(),
            document: self.document,
            options: self.options,
            runner: self.runner,
            tracker: self.tracker,
            inventory: self.inventory,
            graphs: self.graphs,
            sampler,
            devices: pool,
            seeds: SeedManager::new(fixed.seed),
            cancel: self.cancel.clone(),
        });

        let (tx, rx) = mpsc::channel(parallel.max(16));
        tokio::spawn(dispatch(ctx, plan, completed, parallel, tx));

        Ok(TrialStream {
            inner: ReceiverStream::new(rx),
            sweep_id,
            total,
            goal,
            cancel: self.cancel,
            finished: false,
        })
    }
}

/// Terminal trial results in completion order. Finite; ends once every
/// dispatched trial has finished. Dropping the stream before it ends cancels
/// the sweep, killing running jobs.
pub struct TrialStream {
    inner: ReceiverStream<TrialResult>,
    sweep_id: String,
    total: usize,
    goal: Goal,
    cancel: CancellationToken,
    finished: bool,
}

impl TrialStream {
    pub fn sweep_id(&self) -> &str {
        &self.sweep_id
    }

    /// Trials in the plan, including any skipped on resume.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Drain the stream into a summary.
    pub async fn summarize(mut self) -> SweepSummary {
        use tokio_stream::StreamExt;

        let goal = self.goal;
        let mut summary = SweepSummary::default();
        while let Some(result) = self.next().await {
            summary.record(&result, goal);
        }
        summary
    }
}

impl Stream for TrialStream {
    type Item = TrialResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = next {
            self.finished = true;
        }
        next
    }
}

impl Drop for TrialStream {
    fn drop(&mut self) {
        if !self.finished && !self.cancel.is_cancelled() {
            info!(sweep = %self.sweep_id, "Result stream dropped; cancelling sweep");
            self.cancel.cancel();
        }
    }
}

struct SweepContext {
    sweep_id: String,
    document: SweepDocument,
    options: ControllerOptions,
    runner: Arc<dyn TrainingJobRunner>,
    tracker: Arc<dyn ExperimentTracker>,
    inventory: CheckpointInventory,
    graphs: GraphCatalog,
    sampler: SharedSampler,
    devices: DevicePool,
    seeds: SeedManager,
    cancel: CancellationToken,
}

impl SweepContext {
    fn project(&self, planned: &PlannedTrial) -> String {
        self.document.project_name(&planned.key.dataset)
    }

    /// Record a terminal trial, feed the sampler and publish the result.
    async fn finish(&self, result: TrialResult, tx: &mpsc::Sender<TrialResult>) {
        match result.status {
            TrialStatus::Succeeded => {
                info!(trial = %result.key, metric = ?result.metric, "Trial succeeded")
            }
            TrialStatus::Failed => warn!(
                trial = %result.key,
                error = %result.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "Trial failed"
            ),
            TrialStatus::Skipped => warn!(
                trial = %result.key,
                reason = %result.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "Trial skipped"
            ),
            status => debug!(trial = %result.key, %status, "Trial finished"),
        }

        // Trials that never left Pending leave no trace outside the stream.
        if result.params.is_some() || result.status == TrialStatus::Skipped {
            if let Err(e) = self.tracker.record_result(&self.sweep_id, &result).await {
                warn!(trial = %result.key, error = %e, "Tracker rejected trial result");
            }
        }
        if let (Some(params), TrialStatus::Succeeded | TrialStatus::Failed) =
            (&result.params, result.status)
        {
            self.sampler.observe(params, result.metric).await;
        }

        if tx.send(result).await.is_err() && !self.cancel.is_cancelled() {
            info!(sweep = %self.sweep_id, "Result stream dropped; cancelling sweep");
            self.cancel.cancel();
        }
    }

    async fn close(
        &self,
        mut state: TrialState,
        status: TrialStatus,
        error: Option<TrialError>,
        tx: &mpsc::Sender<TrialResult>,
    ) {
        enter(&mut state, status);
        let project = self.document.project_name(&state.key().dataset);
        self.finish(state.into_result(project, None, error), tx).await;
    }

    /// Lease a device, retrying with exponential backoff. `Ok(None)` means
    /// the sweep was cancelled while waiting.
    async fn acquire_device(&self) -> Result<Option<DeviceLease>, ResourceError> {
        let attempts = self.options.max_resource_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(lease) = self.devices.try_acquire() {
                return Ok(Some(lease));
            }
            if attempt == attempts {
                break;
            }
            let delay = self.options.backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "No device free; backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(None),
            }
        }
        Err(ResourceError::DeviceUnavailable { attempts })
    }
}

fn enter(state: &mut TrialState, next: TrialStatus) {
    if let Err(e) = state.advance(next) {
        error!(trial = %state.key(), error = %e, "Rejected trial transition");
    }
}

/// Freeze decision for a resolved run. Models without freezing or head
/// replacement need no layer graph.
pub fn derive_freeze(config: &RunConfig, graphs: &GraphCatalog) -> Result<FreezeSpec, ConfigError> {
    if config.freeze.is_none() && !config.replace_fc {
        return Ok(FreezeSpec::none(config.num_classes));
    }
    let graph = graphs.get(&config.model)?;
    FreezeSpec::derive(
        &config.freeze,
        &graph,
        config.reset_head,
        config.replace_fc,
        config.num_classes,
    )
}

async fn dispatch(
    ctx: Arc<SweepContext>,
    plan: TrialPlan,
    completed: BTreeSet<String>,
    parallel: usize,
    tx: mpsc::Sender<TrialResult>,
) {
    let limit = Arc::new(Semaphore::new(parallel));
    let mut tasks = JoinSet::new();
    let mut skipped = 0usize;

    for planned in plan {
        while let Some(joined) = tasks.try_join_next() {
            report_join(joined);
        }

        let key = planned.key.to_string();
        if completed.contains(&key) {
            debug!(trial = %key, "Already completed; not dispatching again");
            continue;
        }

        let state = TrialState::new(planned.key.clone());
        if ctx.cancel.is_cancelled() {
            ctx.close(state, TrialStatus::Cancelled, None, &tx).await;
            continue;
        }

        // Pending: the checkpoint must exist before anything is sampled.
        let checkpoint = match planned.selection.checkpoint() {
            None => None,
            Some(reference) => match ctx.inventory.lookup(planned.model(), reference) {
                Ok(checkpoint) => Some(checkpoint),
                Err(CheckpointError::NotFound { model, dataset, version }) => {
                    skipped += 1;
                    let cause = ResourceError::CheckpointNotFound { model, dataset, version };
                    ctx.close(state, TrialStatus::Skipped, Some(cause.into()), &tx).await;
                    continue;
                }
                Err(e) => {
                    let cause = TrialError::Inventory(e.to_string());
                    ctx.close(state, TrialStatus::Failed, Some(cause), &tx).await;
                    continue;
                }
            },
        };

        let permit = tokio::select! {
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = ctx.cancel.cancelled() => {
                ctx.close(state, TrialStatus::Cancelled, None, &tx).await;
                continue;
            }
        };

        // Sampling happens here, in plan order, so grid and seeded random
        // assignments do not depend on task scheduling.
        let mut state = state;
        enter(&mut state, TrialStatus::Sampling);
        let params = match ctx.sampler.suggest(planned.sample()).await {
            Ok(params) => params,
            Err(e) => {
                ctx.close(state, TrialStatus::Failed, Some(e.into()), &tx).await;
                continue;
            }
        };
        if let Err(e) = params.validate_against(&ctx.document.hyperparameters.parameter_space) {
            state.params = Some(params);
            ctx.close(state, TrialStatus::Failed, Some(e.into()), &tx).await;
            continue;
        }

        tasks.spawn(run_trial(
            Arc::clone(&ctx),
            state,
            planned,
            params,
            checkpoint,
            permit,
            tx.clone(),
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        report_join(joined);
    }
    if skipped > 0 {
        warn!(sweep = %ctx.sweep_id, skipped, "Trials skipped because their checkpoint is missing");
    }
    info!(sweep = %ctx.sweep_id, "Sweep dispatch finished");
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Trial task aborted");
    }
}

async fn run_trial(
    ctx: Arc<SweepContext>,
    mut state: TrialState,
    planned: PlannedTrial,
    params: SampledParams,
    checkpoint: Option<Checkpoint>,
    _permit: OwnedSemaphorePermit,
    tx: mpsc::Sender<TrialResult>,
) {
    let project = ctx.project(&planned);
    let key = planned.key.to_string();
    state.params = Some(params.clone());

    enter(&mut state, TrialStatus::Resolving);
    let config = match resolve(&ctx.document.setup, &params, planned.model(), &planned.selection) {
        Ok(config) => config,
        Err(e) => return ctx.close(state, TrialStatus::Failed, Some(e.into()), &tx).await,
    };
    let seed = ctx.seeds.seed_for(&key);
    state.config = Some(config.clone());
    state.seed = Some(seed);

    let start = TrialStart {
        key: planned.key.clone(),
        run_id: Uuid::new_v4(),
        project: project.clone(),
        params,
        config: config.clone(),
        seed,
    };
    if let Err(e) = ctx.tracker.record_start(&ctx.sweep_id, &start).await {
        warn!(trial = %key, error = %e, "Tracker rejected trial start");
    }

    let freeze = match derive_freeze(&config, &ctx.graphs) {
        Ok(freeze) => freeze,
        Err(e) => return ctx.close(state, TrialStatus::Failed, Some(e.into()), &tx).await,
    };

    let lease = match ctx.acquire_device().await {
        Ok(Some(lease)) => lease,
        Ok(None) => return ctx.close(state, TrialStatus::Cancelled, None, &tx).await,
        Err(e) => return ctx.close(state, TrialStatus::Failed, Some(e.into()), &tx).await,
    };
    state.device = Some(lease.device());

    enter(&mut state, TrialStatus::Running);
    if let Err(e) = ctx
        .tracker
        .record_status(&ctx.sweep_id, state.key(), TrialStatus::Running)
        .await
    {
        warn!(trial = %key, error = %e, "Tracker rejected status change");
    }
    info!(
        trial = %key,
        run = %start.run_id,
        model = %config.model,
        dataset = %config.dataset,
        device = %lease.device(),
        "Trial running"
    );

    let retries = ctx.options.training_retries;
    let mut outcome = None;
    let mut failure = None;
    for attempt in 0..=retries {
        state.attempts = attempt + 1;
        let job = TrainingJob {
            trial: key.clone(),
            config: config.clone(),
            freeze: freeze.clone(),
            checkpoint: checkpoint.clone(),
            device: lease.device(),
            seed,
        };
        let result = tokio::select! {
            result = ctx.runner.run(job) => result,
            _ = ctx.cancel.cancelled() => {
                drop(lease);
                return ctx.close(state, TrialStatus::Cancelled, None, &tx).await;
            }
        };
        match result {
            Ok(done) => {
                outcome = Some(done);
                break;
            }
            Err(e) if attempt < retries => {
                warn!(trial = %key, attempt = attempt + 1, error = %e, "Training failed; retrying");
            }
            Err(e) => failure = Some(e),
        }
    }
    drop(lease);

    match (outcome, failure) {
        (Some(done), _) => {
            enter(&mut state, TrialStatus::Succeeded);
            let result = state.into_result(project, Some(done.metric), None);
            ctx.finish(result, &tx).await;
        }
        (None, failure) => {
            let cause = failure.map(TrialError::from);
            ctx.close(state, TrialStatus::Failed, cause, &tx).await;
        }
    }
}
