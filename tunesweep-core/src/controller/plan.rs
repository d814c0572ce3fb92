//! Lazy trial enumeration.
//!
//! Trials are produced in a fixed order: target dataset, then model, then
//! dataset selection (one per checkpoint input, or scratch), then sample
//! index. Nothing is materialized up front.

use super::trial::TrialKey;
use crate::resolver::DatasetSelection;
use crate::setup::{CheckpointPolicy, CheckpointRef, SetupConfig};
use crate::training::checkpoint::CheckpointInventory;
use tracing::warn;

/// One enumerated trial, not yet dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrial {
    pub key: TrialKey,
    pub selection: DatasetSelection,
}

impl PlannedTrial {
    pub fn model(&self) -> &str {
        &self.key.model
    }

    pub fn sample(&self) -> usize {
        self.key.sample
    }
}

#[derive(Debug, Clone)]
enum SelectionSource {
    Scratch,
    Exact(Vec<CheckpointRef>),
    /// Newest stored version per `dataset_trained_on`.
    Latest(Vec<String>),
}

impl SelectionSource {
    fn slots(&self) -> usize {
        match self {
            SelectionSource::Scratch => 1,
            SelectionSource::Exact(refs) => refs.len(),
            SelectionSource::Latest(datasets) => datasets.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrialPlan {
    datasets: Vec<String>,
    models: Vec<String>,
    source: SelectionSource,
    samples: usize,
    inventory: CheckpointInventory,
    next: usize,
}

impl TrialPlan {
    pub fn new(setup: &SetupConfig, samples: usize, inventory: CheckpointInventory) -> Self {
        let source = match setup.checkpoints {
            CheckpointPolicy::None => SelectionSource::Scratch,
            CheckpointPolicy::All => SelectionSource::Exact(setup.checkpoint_inputs.clone()),
            CheckpointPolicy::Latest => {
                let mut seen: Vec<String> = Vec::new();
                for input in &setup.checkpoint_inputs {
                    if !seen.contains(&input.dataset_trained_on) {
                        seen.push(input.dataset_trained_on.clone());
                    }
                }
                SelectionSource::Latest(seen)
            }
        };
        Self {
            datasets: setup.datasets.clone(),
            models: setup.models.clone(),
            source,
            samples,
            inventory,
            next: 0,
        }
    }

    /// Number of trials the plan yields in total.
    pub fn total(&self) -> usize {
        self.datasets.len() * self.models.len() * self.source.slots() * self.samples
    }

    fn selection(&self, dataset: &str, model: &str, slot: usize) -> DatasetSelection {
        match &self.source {
            SelectionSource::Scratch => DatasetSelection::scratch(dataset),
            SelectionSource::Exact(refs) => DatasetSelection::fine_tune(dataset, refs[slot].clone()),
            SelectionSource::Latest(trained_on) => {
                let trained_on = &trained_on[slot];
                let version = match self.inventory.latest(model, trained_on) {
                    Ok(Some(version)) => version,
                    Ok(None) => 0,
                    Err(e) => {
                        warn!(model, dataset = %trained_on, error = %e, "Cannot list checkpoint versions");
                        0
                    }
                };
                DatasetSelection::fine_tune(dataset, CheckpointRef::new(trained_on, version))
            }
        }
    }
}

impl Iterator for TrialPlan {
    type Item = PlannedTrial;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total() {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let sample = index % self.samples;
        let rest = index / self.samples;
        let slots = self.source.slots();
        let slot = rest % slots;
        let rest = rest / slots;
        let model = &self.models[rest % self.models.len()];
        let dataset = &self.datasets[rest / self.models.len()];

        let selection = self.selection(dataset, model, slot);
        Some(PlannedTrial {
            key: TrialKey::new(model, &selection, sample),
            selection,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TrialPlan {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn setup(policy: CheckpointPolicy) -> SetupConfig {
        SetupConfig {
            checkpoints: policy,
            models: vec!["lowres_resnet9".into(), "lowres_alexnet".into()],
            datasets: vec!["svhn".into(), "mnist".into()],
            checkpoint_inputs: vec![
                CheckpointRef::new("cifar10", 0),
                CheckpointRef::new("cifar10", 3),
                CheckpointRef::new("cifar100", 1),
            ],
            ..SetupConfig::default()
        }
    }

    #[test]
    fn test_scratch_plan_order() {
        let plan = TrialPlan::new(&setup(CheckpointPolicy::None), 2, CheckpointInventory::new("."));
        assert_eq!(plan.total(), 8);
        let keys: Vec<String> = plan.map(|t| t.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "lowres_resnet9/svhn/scratch/0",
                "lowres_resnet9/svhn/scratch/1",
                "lowres_alexnet/svhn/scratch/0",
                "lowres_alexnet/svhn/scratch/1",
                "lowres_resnet9/mnist/scratch/0",
                "lowres_resnet9/mnist/scratch/1",
                "lowres_alexnet/mnist/scratch/0",
                "lowres_alexnet/mnist/scratch/1",
            ]
        );
    }

    #[test]
    fn test_all_policy_is_refs_times_models_per_dataset() {
        let plan = TrialPlan::new(&setup(CheckpointPolicy::All), 1, CheckpointInventory::new("."));
        assert_eq!(plan.len(), 2 * 2 * 3);
        let svhn = plan.clone().filter(|t| t.key.dataset == "svhn").count();
        assert_eq!(svhn, 3 * 2);
        let first = plan.clone().next().unwrap();
        assert_eq!(
            first.selection,
            DatasetSelection::fine_tune("svhn", CheckpointRef::new("cifar10", 0))
        );
    }

    #[test]
    fn test_latest_policy_picks_newest_version() {
        let dir = TempDir::new().unwrap();
        for v in [0, 5] {
            let ckpt = dir
                .path()
                .join(format!("cifar10/lowres_resnet9/version_{v}/checkpoints"));
            std::fs::create_dir_all(&ckpt).unwrap();
            std::fs::write(ckpt.join("last.ckpt"), b"w").unwrap();
        }
        let mut s = setup(CheckpointPolicy::Latest);
        s.models.truncate(1);
        s.datasets.truncate(1);
        let plan = TrialPlan::new(&s, 1, CheckpointInventory::new(dir.path()));
        assert_eq!(plan.total(), 2);

        let refs: Vec<CheckpointRef> = plan.filter_map(|t| t.key.checkpoint).collect();
        assert_eq!(
            refs,
            vec![CheckpointRef::new("cifar10", 5), CheckpointRef::new("cifar100", 0)]
        );
    }

    #[test]
    fn test_empty_models_yield_nothing() {
        let mut s = setup(CheckpointPolicy::None);
        s.models.clear();
        let mut plan = TrialPlan::new(&s, 3, CheckpointInventory::new("."));
        assert_eq!(plan.total(), 0);
        assert!(plan.next().is_none());
    }
}
