//! Static catalog of the image-classification datasets and model identifiers
//! a sweep may reference.

use serde::Serialize;

/// Shape information for a dataset, used to size a replaced classification head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    pub name: &'static str,
    pub num_classes: u32,
    pub in_channels: u32,
}

const DATASETS: &[DatasetInfo] = &[
    DatasetInfo { name: "cifar10", num_classes: 10, in_channels: 3 },
    DatasetInfo { name: "cifar100", num_classes: 100, in_channels: 3 },
    DatasetInfo { name: "mnist", num_classes: 10, in_channels: 1 },
    DatasetInfo { name: "kmnist", num_classes: 49, in_channels: 1 },
    DatasetInfo { name: "fashionmnist", num_classes: 10, in_channels: 1 },
    DatasetInfo { name: "cinic10", num_classes: 10, in_channels: 3 },
    DatasetInfo { name: "imagenet1k", num_classes: 1000, in_channels: 3 },
    DatasetInfo { name: "svhn", num_classes: 10, in_channels: 3 },
    DatasetInfo { name: "tinyimagenet", num_classes: 200, in_channels: 3 },
    // Labels start at 1, so the head needs one extra output.
    DatasetInfo { name: "grocerystore", num_classes: 43, in_channels: 3 },
    DatasetInfo { name: "sun397", num_classes: 899, in_channels: 3 },
    DatasetInfo { name: "histaerial25x25", num_classes: 7, in_channels: 3 },
    DatasetInfo { name: "histaerial50x50", num_classes: 7, in_channels: 3 },
    DatasetInfo { name: "histaerial100x100", num_classes: 42, in_channels: 3 },
    DatasetInfo { name: "fractaldb60", num_classes: 60, in_channels: 3 },
];

/// Classifier identifiers understood by the reference training program.
pub const KNOWN_MODELS: &[&str] = &[
    "lowres_vgg11_bn",
    "lowres_vgg13_bn",
    "lowres_vgg16_bn",
    "lowres_vgg19_bn",
    "lowres_vgg11",
    "lowres_vgg13",
    "lowres_vgg16",
    "lowres_vgg19",
    "lowres_resnet9",
    "lowres_resnet14",
    "lowres_resnet18",
    "lowres_resnet18_noresidual",
    "lowres_resnet34",
    "lowres_resnet50",
    "lowres_resnet101",
    "lowres_resnet152",
    "lowres_preact_resnet14",
    "lowres_preact_resnet18",
    "lowres_preact_resnet18_noresidual",
    "lowres_preact_resnet34",
    "lowres_wide_resnet50_2",
    "lowres_wide_resnet101_2",
    "lowres_resnext50_32x4d",
    "lowres_resnext101_32x8d",
    "lowres_densenet121",
    "lowres_densenet161",
    "lowres_densenet169",
    "lowres_mobilenet_v2",
    "lowres_googlenet",
    "lowres_inception_v3",
    "lowres_alexnet",
];

/// Look up a dataset by identifier.
pub fn dataset_info(name: &str) -> Option<&'static DatasetInfo> {
    DATASETS.iter().find(|d| d.name == name)
}

pub fn is_known_model(name: &str) -> bool {
    KNOWN_MODELS.contains(&name)
}
