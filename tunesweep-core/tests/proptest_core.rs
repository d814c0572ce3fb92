//! Property-based tests for resolution, freezing and planning.

use proptest::prelude::*;

use tunesweep_core::controller::TrialPlan;
use tunesweep_core::resolver::{DatasetSelection, RunConfig, resolve};
use tunesweep_core::setup::{CheckpointPolicy, CheckpointRef, SetupConfig};
use tunesweep_core::sweep::SampledParams;
use tunesweep_core::training::checkpoint::CheckpointInventory;
use tunesweep_core::training::freeze::{LayerSelector, compute_frozen_set};
use tunesweep_core::training::graphs::GraphCatalog;

const MODELS: &[&str] = &[
    "lowres_resnet9",
    "lowres_resnet18",
    "lowres_alexnet",
    "lowres_vgg11",
];
const DATASETS: &[&str] = &["svhn", "cifar10", "cifar100", "mnist", "fashionmnist"];
const OPTIMIZERS: &[&str] = &["sgd", "adam", "adamw"];

fn base_setup() -> SetupConfig {
    SetupConfig {
        mode: Some("finetune".into()),
        data_dir: Some("data".into()),
        dataset_percentage: Some(100),
        output_dir: Some("output".into()),
        precision: Some(32),
        seed: Some(0),
        models: vec!["lowres_resnet9".into()],
        datasets: vec!["svhn".into()],
        ..SetupConfig::default()
    }
}

fn sampled(lr: f64, batch: u32, epochs: u32, wd: f64, optimizer: &str) -> SampledParams {
    SampledParams::new()
        .with("learning_rate", lr)
        .with("optimizer", optimizer)
        .with("batch_size", batch)
        .with("scheduler", "None")
        .with("max_epochs", epochs)
        .with("weight_decay", wd)
}

fn selection_strategy() -> impl Strategy<Value = (String, Option<CheckpointRef>)> {
    (
        prop::sample::select(DATASETS),
        prop::option::of((prop::sample::select(DATASETS), 0u32..20)),
    )
        .prop_map(|(dataset, ckpt)| {
            (
                dataset.to_string(),
                ckpt.map(|(trained_on, version)| CheckpointRef::new(trained_on, version)),
            )
        })
}

fn to_selection(dataset: &str, checkpoint: Option<CheckpointRef>) -> DatasetSelection {
    match checkpoint {
        Some(reference) => DatasetSelection::fine_tune(dataset, reference),
        None => DatasetSelection::scratch(dataset),
    }
}

// --- Resolution properties ---

proptest! {
    #[test]
    fn resolve_is_total_and_idempotent(
        model in prop::sample::select(MODELS),
        (dataset, checkpoint) in selection_strategy(),
        lr in 1e-6f64..1.0,
        batch in 1u32..1024,
        epochs in 1u32..500,
        wd in 0.0f64..0.1,
        optimizer in prop::sample::select(OPTIMIZERS),
        pct in 1i64..=100,
        seed in 0i64..1_000_000,
    ) {
        let mut setup = base_setup();
        setup.dataset_percentage = Some(pct);
        setup.seed = Some(seed);
        let params = sampled(lr, batch, epochs, wd, optimizer);
        let selection = to_selection(&dataset, checkpoint.clone());

        let first = resolve(&setup, &params, model, &selection).unwrap();
        let second = resolve(&setup, &params, model, &selection).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.dataset.as_str(), dataset.as_str());
        prop_assert_eq!(first.checkpoint, checkpoint);
        prop_assert_eq!(first.hyperparameters.batch_size, batch);
        prop_assert_eq!(first.seed, seed as u64);
        prop_assert!(first.num_classes > 0);
    }

    #[test]
    fn run_config_json_roundtrip(
        model in prop::sample::select(MODELS),
        (dataset, checkpoint) in selection_strategy(),
        lr in 1e-6f64..1.0,
        wd in 0.0f64..0.1,
    ) {
        let params = sampled(lr, 64, 10, wd, "sgd").with("label_smoothing", 0.1);
        let selection = to_selection(&dataset, checkpoint);
        let config = resolve(&base_setup(), &params, model, &selection).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, config);
    }

    #[test]
    fn train_mode_rejects_checkpoint_selection(
        model in prop::sample::select(MODELS),
        (dataset, trained_on) in (prop::sample::select(DATASETS), prop::sample::select(DATASETS)),
        version in 0u32..10,
    ) {
        let mut setup = base_setup();
        setup.mode = Some("train".into());
        let selection = DatasetSelection::fine_tune(dataset, CheckpointRef::new(trained_on, version));
        let result = resolve(&setup, &sampled(0.01, 32, 5, 0.0, "sgd"), model, &selection);
        prop_assert!(result.is_err());
    }
}

// --- Freeze properties ---

proptest! {
    #[test]
    fn frozen_set_respects_head_flags(
        model in prop::sample::select(MODELS),
        reset_head in any::<bool>(),
        replace_fc in any::<bool>(),
        with_linear in any::<bool>(),
    ) {
        let graph = GraphCatalog::builtin().get(model).unwrap();
        let selector = if with_linear {
            LayerSelector::parse("Conv2d,Linear")
        } else {
            LayerSelector::parse("Conv2d")
        };
        let frozen = compute_frozen_set(&selector, &graph, reset_head, replace_fc).unwrap();

        for id in &frozen {
            let layer_name = id.as_str().rsplit_once('.').map(|(l, _)| l).unwrap_or_default();
            let layer = graph.layer(layer_name).unwrap();
            prop_assert!(selector.matches(&layer.layer_type));
            if reset_head {
                prop_assert!(!layer.is_head());
            }
        }
        if replace_fc {
            let head = graph.final_classifier().unwrap();
            for id in head.parameter_ids() {
                prop_assert!(!frozen.contains(&id));
            }
        }
    }

    #[test]
    fn empty_selector_freezes_nothing(
        model in prop::sample::select(MODELS),
        reset_head in any::<bool>(),
        replace_fc in any::<bool>(),
    ) {
        let graph = GraphCatalog::builtin().get(model).unwrap();
        let frozen = compute_frozen_set(&LayerSelector::None, &graph, reset_head, replace_fc).unwrap();
        prop_assert!(frozen.is_empty());
    }
}

// --- Planning properties ---

proptest! {
    #[test]
    fn all_policy_plans_refs_times_models_per_dataset(
        n_models in 1usize..=4,
        n_datasets in 1usize..=5,
        versions in prop::collection::vec(0u32..5, 1..6),
        samples in 1usize..4,
    ) {
        let setup = SetupConfig {
            checkpoints: CheckpointPolicy::All,
            models: MODELS[..n_models].iter().map(|m| m.to_string()).collect(),
            datasets: DATASETS[..n_datasets].iter().map(|d| d.to_string()).collect(),
            checkpoint_inputs: versions.iter().map(|v| CheckpointRef::new("cifar10", *v)).collect(),
            ..base_setup()
        };
        let plan = TrialPlan::new(&setup, samples, CheckpointInventory::new("."));
        let refs = versions.len();
        prop_assert_eq!(plan.total(), n_datasets * n_models * refs * samples);

        for dataset in &setup.datasets {
            let per_dataset = plan
                .clone()
                .filter(|t| &t.key.dataset == dataset && t.sample() == 0)
                .count();
            prop_assert!(per_dataset <= n_models * refs);
        }
    }

    #[test]
    fn plan_keys_are_unique_when_inputs_are(
        n_models in 1usize..=4,
        samples in 1usize..5,
    ) {
        let setup = SetupConfig {
            checkpoints: CheckpointPolicy::All,
            models: MODELS[..n_models].iter().map(|m| m.to_string()).collect(),
            datasets: vec!["svhn".into(), "mnist".into()],
            checkpoint_inputs: vec![CheckpointRef::new("cifar10", 0), CheckpointRef::new("cifar100", 2)],
            ..base_setup()
        };
        let keys: std::collections::BTreeSet<String> =
            TrialPlan::new(&setup, samples, CheckpointInventory::new("."))
                .map(|t| t.key.to_string())
                .collect();
        prop_assert_eq!(keys.len(), 2 * n_models * 2 * samples);
    }
}
