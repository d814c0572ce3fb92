//! Experiment tracking.
//!
//! The tracker receives each trial's resolved configuration, its status
//! transitions and its final result, and answers which trials of a sweep have
//! already completed so a restarted controller can resume.

use super::reproducibility::EnvironmentSnapshot;
use crate::controller::trial::{TrialKey, TrialResult, TrialStatus};
use crate::error::{SweepError, TrialError};
use crate::persistence::{atomic_write_json, load_json};
use crate::resolver::RunConfig;
use crate::sweep::SampledParams;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sweep-level identity handed to the tracker before any trial starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepInfo {
    pub sweep_id: String,
    pub name: String,
    pub username: String,
    pub total_trials: usize,
    pub environment: EnvironmentSnapshot,
}

/// A trial that passed resolution and is about to acquire a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialStart {
    pub key: TrialKey,
    /// Fresh for every launch of the trial, including relaunches on resume.
    pub run_id: Uuid,
    pub project: String,
    pub params: SampledParams,
    pub config: RunConfig,
    pub seed: u64,
}

#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn begin_sweep(&self, info: &SweepInfo) -> Result<(), SweepError>;

    /// String keys of trials that already succeeded in this sweep.
    async fn completed_trials(&self, sweep_id: &str) -> Result<BTreeSet<String>, SweepError>;

    async fn record_start(&self, sweep_id: &str, start: &TrialStart) -> Result<(), SweepError>;

    async fn record_status(
        &self,
        sweep_id: &str,
        key: &TrialKey,
        status: TrialStatus,
    ) -> Result<(), SweepError>;

    async fn record_result(&self, sweep_id: &str, result: &TrialResult) -> Result<(), SweepError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TrialStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub key: TrialKey,
    /// Run id of the most recent launch.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub project: Option<String>,
    pub status: TrialStatus,
    pub params: Option<SampledParams>,
    pub config: Option<RunConfig>,
    pub seed: Option<u64>,
    pub metric: Option<f64>,
    pub error: Option<TrialError>,
    pub history: Vec<StatusChange>,
    pub updated_at: DateTime<Utc>,
}

impl TrialRecord {
    fn new(key: TrialKey) -> Self {
        Self {
            key,
            run_id: None,
            project: None,
            status: TrialStatus::Pending,
            params: None,
            config: None,
            seed: None,
            metric: None,
            error: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn push_status(&mut self, status: TrialStatus) {
        let now = Utc::now();
        self.status = status;
        self.history.push(StatusChange { status, at: now });
        self.updated_at = now;
    }
}

/// Everything recorded about one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepLedger {
    pub sweep_id: String,
    pub name: String,
    pub username: String,
    pub environment: Option<EnvironmentSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by the trial key's string form.
    pub trials: BTreeMap<String, TrialRecord>,
}

impl SweepLedger {
    fn new(sweep_id: &str) -> Self {
        let now = Utc::now();
        Self {
            sweep_id: sweep_id.to_string(),
            name: String::new(),
            username: String::new(),
            environment: None,
            created_at: now,
            updated_at: now,
            trials: BTreeMap::new(),
        }
    }

    fn trial_mut(&mut self, key: &TrialKey) -> &mut TrialRecord {
        self.updated_at = Utc::now();
        self.trials
            .entry(key.to_string())
            .or_insert_with(|| TrialRecord::new(key.clone()))
    }

    pub fn completed(&self) -> BTreeSet<String> {
        self.trials
            .iter()
            .filter(|(_, r)| r.status == TrialStatus::Succeeded)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn count_by_status(&self, status: TrialStatus) -> usize {
        self.trials.values().filter(|r| r.status == status).count()
    }
}

/// Tracker backed by one JSON ledger per sweep, or by memory only.
#[derive(Debug)]
pub struct LedgerTracker {
    dir: Option<PathBuf>,
    ledgers: Mutex<BTreeMap<String, SweepLedger>>,
}

impl LedgerTracker {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            ledgers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ledgers live at `<dir>/<sweep_id>.json`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ledgers: Mutex::new(BTreeMap::new()),
        }
    }

    fn ledger_path(&self, sweep_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{sweep_id}.json")))
    }

    /// A copy of the ledger for `sweep_id`, loading it from disk when needed.
    pub async fn ledger(&self, sweep_id: &str) -> Result<SweepLedger, SweepError> {
        let mut ledgers = self.ledgers.lock().await;
        Ok(self.entry(&mut ledgers, sweep_id)?.clone())
    }

    fn entry<'a>(
        &self,
        ledgers: &'a mut BTreeMap<String, SweepLedger>,
        sweep_id: &str,
    ) -> Result<&'a mut SweepLedger, SweepError> {
        if !ledgers.contains_key(sweep_id) {
            let loaded = match self.ledger_path(sweep_id) {
                Some(path) => load_json::<SweepLedger>(&path)?,
                None => None,
            };
            ledgers.insert(
                sweep_id.to_string(),
                loaded.unwrap_or_else(|| SweepLedger::new(sweep_id)),
            );
        }
        ledgers
            .get_mut(sweep_id)
            .ok_or_else(|| SweepError::tracker(format!("ledger for {sweep_id} vanished")))
    }

    async fn update<F>(&self, sweep_id: &str, apply: F) -> Result<(), SweepError>
    where
        F: FnOnce(&mut SweepLedger) + Send,
    {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = self.entry(&mut ledgers, sweep_id)?;
        apply(ledger);
        if let Some(path) = self.ledger_path(sweep_id) {
            atomic_write_json(&path, &*ledger)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentTracker for LedgerTracker {
    async fn begin_sweep(&self, info: &SweepInfo) -> Result<(), SweepError> {
        self.update(&info.sweep_id, |ledger| {
            ledger.name = info.name.clone();
            ledger.username = info.username.clone();
            ledger.environment = Some(info.environment.clone());
            ledger.updated_at = Utc::now();
        })
        .await
    }

    async fn completed_trials(&self, sweep_id: &str) -> Result<BTreeSet<String>, SweepError> {
        Ok(self.ledger(sweep_id).await?.completed())
    }

    async fn record_start(&self, sweep_id: &str, start: &TrialStart) -> Result<(), SweepError> {
        self.update(sweep_id, |ledger| {
            let record = ledger.trial_mut(&start.key);
            record.run_id = Some(start.run_id);
            record.project = Some(start.project.clone());
            record.params = Some(start.params.clone());
            record.config = Some(start.config.clone());
            record.seed = Some(start.seed);
            record.metric = None;
            record.error = None;
            record.push_status(TrialStatus::Resolving);
        })
        .await
    }

    async fn record_status(
        &self,
        sweep_id: &str,
        key: &TrialKey,
        status: TrialStatus,
    ) -> Result<(), SweepError> {
        self.update(sweep_id, |ledger| ledger.trial_mut(key).push_status(status))
            .await
    }

    async fn record_result(&self, sweep_id: &str, result: &TrialResult) -> Result<(), SweepError> {
        self.update(sweep_id, |ledger| {
            let record = ledger.trial_mut(&result.key);
            record.project = Some(result.project.clone());
            if result.params.is_some() {
                record.params = result.params.clone();
            }
            if result.config.is_some() {
                record.config = result.config.clone();
            }
            record.seed = result.seed.or(record.seed);
            record.metric = result.metric;
            record.error = result.error.clone();
            record.push_status(result.status);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::trial::TrialState;
    use crate::error::ResourceError;
    use crate::resolver::DatasetSelection;
    use crate::setup::CheckpointRef;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn info(sweep_id: &str) -> SweepInfo {
        SweepInfo {
            sweep_id: sweep_id.into(),
            name: "finetune".into(),
            username: "vision-lab".into(),
            total_trials: 2,
            environment: EnvironmentSnapshot::capture(),
        }
    }

    fn finished(sample: usize, status: TrialStatus, metric: Option<f64>) -> TrialResult {
        let key = TrialKey::new(
            "lowres_resnet9",
            &DatasetSelection::fine_tune("svhn", CheckpointRef::new("cifar10", 0)),
            sample,
        );
        let mut state = TrialState::new(key);
        if status == TrialStatus::Succeeded {
            state.advance(TrialStatus::Sampling).unwrap();
            state.advance(TrialStatus::Resolving).unwrap();
            state.advance(TrialStatus::Running).unwrap();
        }
        state.advance(status).unwrap();
        let error = (status == TrialStatus::Skipped).then(|| {
            TrialError::from(ResourceError::CheckpointNotFound {
                model: "lowres_resnet9".into(),
                dataset: "cifar10".into(),
                version: 0,
            })
        });
        state.into_result("finetune_svhn".into(), metric, error)
    }

    #[tokio::test]
    async fn test_in_memory_completed_trials() {
        let tracker = LedgerTracker::in_memory();
        tracker.begin_sweep(&info("abc")).await.unwrap();
        tracker
            .record_result("abc", &finished(0, TrialStatus::Succeeded, Some(0.9)))
            .await
            .unwrap();
        tracker
            .record_result("abc", &finished(1, TrialStatus::Skipped, None))
            .await
            .unwrap();

        let completed = tracker.completed_trials("abc").await.unwrap();
        assert_eq!(
            completed.into_iter().collect::<Vec<_>>(),
            vec!["lowres_resnet9/svhn/cifar10@v0/0".to_string()]
        );
        assert!(tracker.completed_trials("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_ledger_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let tracker = LedgerTracker::persistent(dir.path());
            tracker.begin_sweep(&info("abc")).await.unwrap();
            tracker
                .record_result("abc", &finished(0, TrialStatus::Succeeded, Some(0.9)))
                .await
                .unwrap();
        }
        assert!(dir.path().join("abc.json").exists());

        let reopened = LedgerTracker::persistent(dir.path());
        let ledger = reopened.ledger("abc").await.unwrap();
        assert_eq!(ledger.username, "vision-lab");
        assert_eq!(ledger.count_by_status(TrialStatus::Succeeded), 1);
        let record = ledger.trials.values().next().unwrap();
        assert_eq!(record.metric, Some(0.9));
        assert_eq!(record.history.last().unwrap().status, TrialStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_status_history_accumulates() {
        let tracker = LedgerTracker::in_memory();
        let key = finished(0, TrialStatus::Succeeded, None).key;
        tracker
            .record_status("s", &key, TrialStatus::Running)
            .await
            .unwrap();
        tracker
            .record_status("s", &key, TrialStatus::Failed)
            .await
            .unwrap();
        let ledger = tracker.ledger("s").await.unwrap();
        let statuses: Vec<TrialStatus> = ledger.trials[&key.to_string()]
            .history
            .iter()
            .map(|c| c.status)
            .collect();
        assert_eq!(statuses, vec![TrialStatus::Running, TrialStatus::Failed]);
    }
}
