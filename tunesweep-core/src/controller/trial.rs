//! Trial identity, lifecycle and results.

use super::device::Device;
use crate::error::TrialError;
use crate::resolver::{DatasetSelection, RunConfig};
use crate::setup::CheckpointRef;
use crate::sweep::{Goal, SampledParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Sampling,
    Resolving,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrialStatus::Succeeded | TrialStatus::Failed | TrialStatus::Skipped | TrialStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, next),
            (Pending, Sampling | Skipped | Failed | Cancelled)
                | (Sampling, Resolving | Failed | Cancelled)
                | (Resolving, Running | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialStatus::Pending => "pending",
            TrialStatus::Sampling => "sampling",
            TrialStatus::Resolving => "resolving",
            TrialStatus::Running => "running",
            TrialStatus::Succeeded => "succeeded",
            TrialStatus::Failed => "failed",
            TrialStatus::Skipped => "skipped",
            TrialStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal trial transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TrialStatus,
    pub to: TrialStatus,
}

/// Identity of one trial within a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub model: String,
    pub dataset: String,
    pub checkpoint: Option<CheckpointRef>,
    pub sample: usize,
}

impl TrialKey {
    pub fn new(model: &str, selection: &DatasetSelection, sample: usize) -> Self {
        Self {
            model: model.to_string(),
            dataset: selection.dataset().to_string(),
            checkpoint: selection.checkpoint().cloned(),
            sample,
        }
    }
}

/// `model/dataset/<dataset_trained_on>@v<N>|scratch/sample`
impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/", self.model, self.dataset)?;
        match &self.checkpoint {
            Some(c) => write!(f, "{c}")?,
            None => f.write_str("scratch")?,
        }
        write!(f, "/{}", self.sample)
    }
}

/// Mutable lifecycle of a trial while the controller works on it.
#[derive(Debug, Clone)]
pub struct TrialState {
    key: TrialKey,
    status: TrialStatus,
    started_at: DateTime<Utc>,
    pub params: Option<SampledParams>,
    pub config: Option<RunConfig>,
    pub device: Option<Device>,
    pub seed: Option<u64>,
    pub attempts: u32,
}

impl TrialState {
    pub fn new(key: TrialKey) -> Self {
        Self {
            key,
            status: TrialStatus::Pending,
            started_at: Utc::now(),
            params: None,
            config: None,
            device: None,
            seed: None,
            attempts: 0,
        }
    }

    pub fn key(&self) -> &TrialKey {
        &self.key
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn advance(&mut self, next: TrialStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Close the trial. The state must already be terminal.
    pub fn into_result(
        self,
        project: String,
        metric: Option<f64>,
        error: Option<TrialError>,
    ) -> TrialResult {
        TrialResult {
            key: self.key,
            project,
            status: self.status,
            params: self.params,
            config: self.config,
            metric,
            error,
            attempts: self.attempts,
            device: self.device,
            seed: self.seed,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Terminal record of one trial, yielded by the sweep stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub key: TrialKey,
    pub project: String,
    pub status: TrialStatus,
    pub params: Option<SampledParams>,
    pub config: Option<RunConfig>,
    pub metric: Option<f64>,
    pub error: Option<TrialError>,
    pub attempts: u32,
    pub device: Option<Device>,
    pub seed: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialResult {
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Aggregate counts and the best trial of a finished sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub best: Option<(TrialKey, f64)>,
}

impl SweepSummary {
    pub fn record(&mut self, result: &TrialResult, goal: Goal) {
        self.total += 1;
        match result.status {
            TrialStatus::Succeeded => self.succeeded += 1,
            TrialStatus::Failed => self.failed += 1,
            TrialStatus::Skipped => self.skipped += 1,
            TrialStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
        if let (TrialStatus::Succeeded, Some(metric)) = (result.status, result.metric) {
            let better = self
                .best
                .as_ref()
                .is_none_or(|(_, incumbent)| goal.is_better(metric, *incumbent));
            if better {
                self.best = Some((result.key.clone(), metric));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> TrialKey {
        TrialKey::new(
            "lowres_resnet9",
            &DatasetSelection::fine_tune("svhn", CheckpointRef::new("cifar10", 0)),
            2,
        )
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key().to_string(), "lowres_resnet9/svhn/cifar10@v0/2");
        let scratch = TrialKey::new("lowres_alexnet", &DatasetSelection::scratch("mnist"), 0);
        assert_eq!(scratch.to_string(), "lowres_alexnet/mnist/scratch/0");
        assert_eq!(key().checkpoint, Some(CheckpointRef::new("cifar10", 0)));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = TrialState::new(key());
        for next in [
            TrialStatus::Sampling,
            TrialStatus::Resolving,
            TrialStatus::Running,
            TrialStatus::Succeeded,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.status().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = TrialState::new(key());
        assert_eq!(
            state.advance(TrialStatus::Running),
            Err(IllegalTransition {
                from: TrialStatus::Pending,
                to: TrialStatus::Running
            })
        );
        state.advance(TrialStatus::Skipped).unwrap();
        assert!(state.advance(TrialStatus::Sampling).is_err());
        assert!(!TrialStatus::Running.can_transition_to(TrialStatus::Skipped));
    }

    #[test]
    fn test_summary_tracks_best() {
        let mut summary = SweepSummary::default();
        for (sample, metric) in [(0, 0.7), (1, 0.9), (2, 0.8)] {
            let mut k = key();
            k.sample = sample;
            let mut state = TrialState::new(k);
            state.advance(TrialStatus::Sampling).unwrap();
            state.advance(TrialStatus::Resolving).unwrap();
            state.advance(TrialStatus::Running).unwrap();
            state.advance(TrialStatus::Succeeded).unwrap();
            summary.record(&state.into_result("p".into(), Some(metric), None), Goal::Maximize);
        }
        let mut skipped = TrialState::new(key());
        skipped.advance(TrialStatus::Skipped).unwrap();
        summary.record(&skipped.into_result("p".into(), None, None), Goal::Maximize);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.skipped, 1);
        let (best, metric) = summary.best.unwrap();
        assert_eq!(best.sample, 1);
        assert_eq!(metric, 0.9);
    }
}
