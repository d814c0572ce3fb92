//! Model layer graphs used by the freeze policy.
//!
//! A handful of low-resolution classifiers ship built in. Other models are
//! described by `<model>.json` files in an operator-supplied directory, which
//! take precedence over the built-in graphs.

use super::freeze::{Layer, ModelGraph};
use crate::error::ConfigError;
use std::path::PathBuf;

const CONV: &[&str] = &["weight"];
const CONV_BIAS: &[&str] = &["weight", "bias"];
const NORM: &[&str] = &["weight", "bias"];
const LINEAR: &[&str] = &["weight", "bias"];

/// Models with a built-in layer graph.
pub const BUILTIN_GRAPHS: &[&str] = &[
    "lowres_resnet9",
    "lowres_resnet18",
    "lowres_alexnet",
    "lowres_vgg11",
    "lowres_vgg11_bn",
];

#[derive(Debug, Clone, Default)]
pub struct GraphCatalog {
    dir: Option<PathBuf>,
}

impl GraphCatalog {
    /// Built-in graphs only.
    pub fn builtin() -> Self {
        Self { dir: None }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn get(&self, model: &str) -> Result<ModelGraph, ConfigError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{model}.json"));
            if path.is_file() {
                return ModelGraph::from_json_file(&path);
            }
        }
        builtin_graph(model).ok_or_else(|| ConfigError::UnknownModel {
            model: model.to_string(),
        })
    }

    pub fn contains(&self, model: &str) -> bool {
        self.dir
            .as_ref()
            .is_some_and(|d| d.join(format!("{model}.json")).is_file())
            || BUILTIN_GRAPHS.contains(&model)
    }
}

fn builtin_graph(model: &str) -> Option<ModelGraph> {
    let layers = match model {
        "lowres_resnet9" => resnet9(),
        "lowres_resnet18" => resnet18(),
        "lowres_alexnet" => alexnet(),
        "lowres_vgg11" => vgg11(false),
        "lowres_vgg11_bn" => vgg11(true),
        _ => return None,
    };
    Some(ModelGraph::new(model, layers))
}

fn conv_bn(layers: &mut Vec<Layer>, prefix: &str) {
    layers.push(Layer::new(&format!("{prefix}.0"), "Conv2d", CONV));
    layers.push(Layer::new(&format!("{prefix}.1"), "BatchNorm2d", NORM));
}

fn resnet9() -> Vec<Layer> {
    let mut layers = Vec::new();
    conv_bn(&mut layers, "prep");
    conv_bn(&mut layers, "layer1");
    conv_bn(&mut layers, "res1.0");
    conv_bn(&mut layers, "res1.1");
    conv_bn(&mut layers, "layer2");
    conv_bn(&mut layers, "layer3");
    conv_bn(&mut layers, "res3.0");
    conv_bn(&mut layers, "res3.1");
    layers.push(Layer::new("fc", "Linear", LINEAR).head());
    layers
}

fn resnet18() -> Vec<Layer> {
    let mut layers = vec![
        Layer::new("conv1", "Conv2d", CONV),
        Layer::new("bn1", "BatchNorm2d", NORM),
    ];
    for stage in 1..=4 {
        for block in 0..2 {
            let p = format!("layer{stage}.{block}");
            layers.push(Layer::new(&format!("{p}.conv1"), "Conv2d", CONV));
            layers.push(Layer::new(&format!("{p}.bn1"), "BatchNorm2d", NORM));
            layers.push(Layer::new(&format!("{p}.conv2"), "Conv2d", CONV));
            layers.push(Layer::new(&format!("{p}.bn2"), "BatchNorm2d", NORM));
            if stage > 1 && block == 0 {
                conv_bn(&mut layers, &format!("{p}.downsample"));
            }
        }
    }
    layers.push(Layer::new("fc", "Linear", LINEAR).head());
    layers
}

fn alexnet() -> Vec<Layer> {
    let mut layers: Vec<Layer> = [0, 3, 6, 8, 10]
        .iter()
        .map(|i| Layer::new(&format!("features.{i}"), "Conv2d", CONV_BIAS))
        .collect();
    for i in [1, 4, 6] {
        layers.push(Layer::new(&format!("classifier.{i}"), "Linear", LINEAR).head());
    }
    layers
}

fn vgg11(batch_norm: bool) -> Vec<Layer> {
    // 64, M, 128, M, 256, 256, M, 512, 512, M, 512, 512, M
    const CONVS_PER_STAGE: [usize; 5] = [1, 1, 2, 2, 2];
    let mut layers = Vec::new();
    let mut index = 0;
    for convs in CONVS_PER_STAGE {
        for _ in 0..convs {
            layers.push(Layer::new(&format!("features.{index}"), "Conv2d", CONV_BIAS));
            index += 1;
            if batch_norm {
                layers.push(Layer::new(&format!("features.{index}"), "BatchNorm2d", NORM));
                index += 1;
            }
            // ReLU
            index += 1;
        }
        // MaxPool2d
        index += 1;
    }
    for i in [0, 3, 6] {
        layers.push(Layer::new(&format!("classifier.{i}"), "Linear", LINEAR).head());
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::freeze::{LayerSelector, compute_frozen_set};
    use tempfile::TempDir;

    #[test]
    fn test_builtin_graphs_resolve() {
        let catalog = GraphCatalog::builtin();
        for model in BUILTIN_GRAPHS {
            let graph = catalog.get(model).unwrap();
            assert!(graph.final_classifier().is_some(), "{model}");
            assert!(crate::catalog::is_known_model(model), "{model}");
        }
    }

    #[test]
    fn test_resnet9_final_classifier() {
        let graph = GraphCatalog::builtin().get("lowres_resnet9").unwrap();
        assert_eq!(graph.final_classifier().unwrap().name, "fc");
        assert_eq!(graph.layers.iter().filter(|l| l.layer_type == "Conv2d").count(), 8);
    }

    #[test]
    fn test_vgg_layer_indices() {
        let plain = GraphCatalog::builtin().get("lowres_vgg11").unwrap();
        let bn = GraphCatalog::builtin().get("lowres_vgg11_bn").unwrap();
        assert_eq!(plain.layers[1].name, "features.3");
        assert_eq!(bn.layers[2].name, "features.4");
        assert_eq!(plain.final_classifier().unwrap().name, "classifier.6");
        assert!(bn.layer_types().contains("BatchNorm2d"));
        assert!(!plain.layer_types().contains("BatchNorm2d"));
    }

    #[test]
    fn test_unknown_model() {
        assert_eq!(
            GraphCatalog::builtin().get("lowres_googlenet").unwrap_err(),
            ConfigError::UnknownModel {
                model: "lowres_googlenet".into()
            }
        );
    }

    #[test]
    fn test_directory_graph_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let graph = ModelGraph::new(
            "lowres_resnet9",
            vec![Layer::new("only", "Linear", LINEAR).head()],
        );
        std::fs::write(
            dir.path().join("lowres_resnet9.json"),
            serde_json::to_string(&graph).unwrap(),
        )
        .unwrap();

        let catalog = GraphCatalog::with_dir(dir.path());
        let loaded = catalog.get("lowres_resnet9").unwrap();
        assert_eq!(loaded.layers.len(), 1);
        assert!(matches!(
            compute_frozen_set(&LayerSelector::parse("Conv2d"), &loaded, false, false),
            Err(ConfigError::UnknownSelector { .. })
        ));
    }
}
