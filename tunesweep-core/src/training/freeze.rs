//! Layer freezing policy.
//!
//! Given a model's layer graph and a freeze selector, decides which parameters
//! are excluded from gradient updates. Explicit trainability wins: head layers
//! under `reset_head` and the replaced classifier under `replace_fc` are never
//! frozen, whatever the selector says.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Fully qualified parameter name, e.g. `layer1.0.conv1.weight`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(String);

impl ParameterId {
    pub fn new(layer: &str, param: &str) -> Self {
        Self(format!("{layer}.{param}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRole {
    #[default]
    Feature,
    /// Part of the classification head.
    Head,
}

/// One layer of a model graph with its own (non-recursive) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub layer_type: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub role: LayerRole,
}

impl Layer {
    pub fn new(name: &str, layer_type: &str, parameters: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            role: LayerRole::Feature,
        }
    }

    pub fn head(mut self) -> Self {
        self.role = LayerRole::Head;
        self
    }

    pub fn is_head(&self) -> bool {
        self.role == LayerRole::Head
    }

    pub fn parameter_ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.parameters
            .iter()
            .map(|p| ParameterId::new(&self.name, p))
    }
}

/// Ordered layer graph of a model, input to output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelGraph {
    pub model: String,
    pub layers: Vec<Layer>,
}

impl ModelGraph {
    pub fn new(model: &str, layers: Vec<Layer>) -> Self {
        Self {
            model: model.to_string(),
            layers,
        }
    }

    /// Load a graph from a JSON file and check its layer names are unique.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let model = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let invalid = |message: String| ConfigError::InvalidGraph {
            model: model.clone(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let graph: ModelGraph = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        graph.check()?;
        Ok(graph)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name.as_str()) {
                return Err(ConfigError::InvalidGraph {
                    model: self.model.clone(),
                    message: format!("duplicate layer '{}'", layer.name),
                });
            }
        }
        Ok(())
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Layers marked as head. A graph without any head role treats its last
    /// layer with parameters as the head.
    pub fn head_layers(&self) -> impl Iterator<Item = &Layer> {
        let marked = self.layers.iter().any(Layer::is_head);
        let fallback = if marked {
            None
        } else {
            self.layers.iter().rposition(|l| !l.parameters.is_empty())
        };
        self.layers
            .iter()
            .enumerate()
            .filter(move |(i, l)| if marked { l.is_head() } else { Some(*i) == fallback })
            .map(|(_, l)| l)
    }

    /// The final classification layer: the last head layer of type `Linear`,
    /// or the last head layer of any type.
    pub fn final_classifier(&self) -> Option<&Layer> {
        self.head_layers()
            .filter(|l| l.layer_type == "Linear")
            .last()
            .or_else(|| self.head_layers().last())
    }

    pub fn parameter_ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.layers.iter().flat_map(Layer::parameter_ids)
    }

    pub fn layer_types(&self) -> BTreeSet<&str> {
        self.layers.iter().map(|l| l.layer_type.as_str()).collect()
    }
}

/// Which layer types to freeze. Written as a comma-separated list of type
/// names, or `none`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LayerSelector {
    #[default]
    None,
    Types(Vec<String>),
}

impl LayerSelector {
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return LayerSelector::None;
        }
        let types: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if types.is_empty() {
            LayerSelector::None
        } else {
            LayerSelector::Types(types)
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, LayerSelector::None)
    }

    pub fn matches(&self, layer_type: &str) -> bool {
        match self {
            LayerSelector::None => false,
            LayerSelector::Types(types) => types.iter().any(|t| t.eq_ignore_ascii_case(layer_type)),
        }
    }
}

impl From<String> for LayerSelector {
    fn from(s: String) -> Self {
        LayerSelector::parse(&s)
    }
}

impl From<LayerSelector> for String {
    fn from(selector: LayerSelector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for LayerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSelector::None => f.write_str("none"),
            LayerSelector::Types(types) => f.write_str(&types.join(",")),
        }
    }
}

/// Compute the parameters excluded from gradient updates.
pub fn compute_frozen_set(
    selector: &LayerSelector,
    graph: &ModelGraph,
    reset_head: bool,
    replace_fc: bool,
) -> Result<BTreeSet<ParameterId>, ConfigError> {
    let LayerSelector::Types(types) = selector else {
        return Ok(BTreeSet::new());
    };

    if let Some(unmatched) = types.iter().find(|t| {
        !graph
            .layers
            .iter()
            .any(|l| l.layer_type.eq_ignore_ascii_case(t))
    }) {
        return Err(ConfigError::UnknownSelector {
            selector: unmatched.clone(),
            model: graph.model.clone(),
        });
    }

    let replaced = if replace_fc {
        graph.final_classifier().map(|l| l.name.as_str())
    } else {
        None
    };
    let head: BTreeSet<&str> = if reset_head {
        graph.head_layers().map(|l| l.name.as_str()).collect()
    } else {
        BTreeSet::new()
    };

    Ok(graph
        .layers
        .iter()
        .filter(|l| selector.matches(&l.layer_type))
        .filter(|l| !head.contains(l.name.as_str()))
        .filter(|l| Some(l.name.as_str()) != replaced)
        .flat_map(Layer::parameter_ids)
        .collect())
}

/// A classification layer swapped for a freshly initialized one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadReplacement {
    pub layer: String,
    pub num_classes: u32,
}

/// Per-job freeze decision. Computed at job start and handed to the runner;
/// never persisted by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FreezeSpec {
    pub frozen: BTreeSet<ParameterId>,
    pub head_replacement: Option<HeadReplacement>,
    pub num_classes: u32,
}

impl FreezeSpec {
    /// Nothing frozen, no head replaced.
    pub fn none(num_classes: u32) -> Self {
        Self {
            frozen: BTreeSet::new(),
            head_replacement: None,
            num_classes,
        }
    }

    pub fn derive(
        selector: &LayerSelector,
        graph: &ModelGraph,
        reset_head: bool,
        replace_fc: bool,
        num_classes: u32,
    ) -> Result<Self, ConfigError> {
        let frozen = compute_frozen_set(selector, graph, reset_head, replace_fc)?;
        let head_replacement = if replace_fc {
            graph.final_classifier().map(|l| HeadReplacement {
                layer: l.name.clone(),
                num_classes,
            })
        } else {
            None
        };
        Ok(Self {
            frozen,
            head_replacement,
            num_classes,
        })
    }

    pub fn is_frozen(&self, id: &ParameterId) -> bool {
        self.frozen.contains(id)
    }

    /// Parameters of `graph` that still receive gradient updates.
    pub fn trainable<'g>(&'g self, graph: &'g ModelGraph) -> impl Iterator<Item = ParameterId> + 'g {
        graph.parameter_ids().filter(|id| !self.is_frozen(id))
    }
}
