//! Search-space definition: methods, metric goals, parameter domains and
//! sampled assignments.

use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Search method used to pick assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Bayes,
    Grid,
    Random,
}

/// Optimization direction of the sweep metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Maximize,
    Minimize,
}

impl Goal {
    /// Whether `candidate` improves on `incumbent` under this goal.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Goal::Maximize => candidate > incumbent,
            Goal::Minimize => candidate < incumbent,
        }
    }

    /// Order two metric values so that the better one sorts first.
    pub fn rank(self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        match self {
            Goal::Maximize => ord.reverse(),
            Goal::Minimize => ord,
        }
    }
}

/// The metric a sweep optimizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub goal: Goal,
}

/// A single concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view; floats qualify only when they carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// `null` and the literal string "None" both denote an absent value.
    pub fn is_absent(&self) -> bool {
        match self {
            ParamValue::Null => true,
            ParamValue::Text(s) => s.eq_ignore_ascii_case("none"),
            _ => false,
        }
    }

    /// Equality that treats `Int(2)` and `Float(2.0)` as the same value.
    pub fn same_value(&self, other: &ParamValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "None"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Sampling distribution for a bounded range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Uniform,
    IntUniform,
    LogUniformValues,
}

/// Domain of one hyperparameter: a fixed value, a discrete set, or a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterDomain {
    Fixed {
        value: ParamValue,
    },
    Values {
        values: Vec<ParamValue>,
    },
    Range {
        min: ParamValue,
        max: ParamValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distribution: Option<Distribution>,
    },
}

impl ParameterDomain {
    pub fn fixed(value: impl Into<ParamValue>) -> Self {
        ParameterDomain::Fixed {
            value: value.into(),
        }
    }

    pub fn values<V: Into<ParamValue>>(values: impl IntoIterator<Item = V>) -> Self {
        ParameterDomain::Values {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range(min: f64, max: f64) -> Self {
        ParameterDomain::Range {
            min: ParamValue::Float(min),
            max: ParamValue::Float(max),
            distribution: None,
        }
    }

    pub fn int_range(min: i64, max: i64) -> Self {
        ParameterDomain::Range {
            min: ParamValue::Int(min),
            max: ParamValue::Int(max),
            distribution: None,
        }
    }

    pub fn log_range(min: f64, max: f64) -> Self {
        ParameterDomain::Range {
            min: ParamValue::Float(min),
            max: ParamValue::Float(max),
            distribution: Some(Distribution::LogUniformValues),
        }
    }

    /// Numeric bounds of a range domain.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            ParameterDomain::Range { min, max, .. } => Some((min.as_f64()?, max.as_f64()?)),
            _ => None,
        }
    }

    /// Effective distribution of a range; integer bounds imply `IntUniform`.
    pub fn distribution(&self) -> Option<Distribution> {
        match self {
            ParameterDomain::Range {
                min,
                max,
                distribution,
            } => Some(distribution.unwrap_or(
                match (min, max) {
                    (ParamValue::Int(_), ParamValue::Int(_)) => Distribution::IntUniform,
                    _ => Distribution::Uniform,
                },
            )),
            _ => None,
        }
    }

    /// The finite value set of a fixed or discrete domain.
    pub fn discrete_values(&self) -> Option<&[ParamValue]> {
        match self {
            ParameterDomain::Fixed { value } => Some(std::slice::from_ref(value)),
            ParameterDomain::Values { values } => Some(values),
            ParameterDomain::Range { .. } => None,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        match self {
            ParameterDomain::Fixed { .. } => Ok(()),
            ParameterDomain::Values { values } if values.is_empty() => Err(
                ConfigError::invalid_sweep(format!("parameter '{name}' has an empty value set")),
            ),
            ParameterDomain::Values { .. } => Ok(()),
            ParameterDomain::Range { min, max, .. } => {
                let (lo, hi) = self.bounds().ok_or_else(|| {
                    ConfigError::invalid_sweep(format!(
                        "parameter '{name}' range bounds must be numeric (got {min}, {max})"
                    ))
                })?;
                if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
                    return Err(ConfigError::invalid_sweep(format!(
                        "parameter '{name}' range requires min < max (got {lo} >= {hi})"
                    )));
                }
                match self.distribution() {
                    Some(Distribution::LogUniformValues) if lo <= 0.0 => {
                        Err(ConfigError::invalid_sweep(format!(
                            "parameter '{name}' log-uniform range requires min > 0"
                        )))
                    }
                    Some(Distribution::IntUniform)
                        if min.as_i64().is_none() || max.as_i64().is_none() =>
                    {
                        Err(ConfigError::invalid_sweep(format!(
                            "parameter '{name}' int_uniform range requires integer bounds"
                        )))
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Whether `value` satisfies this domain.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            ParameterDomain::Fixed { value: v } => v.same_value(value),
            ParameterDomain::Values { values } => values.iter().any(|v| v.same_value(value)),
            ParameterDomain::Range { .. } => {
                let Some((lo, hi)) = self.bounds() else {
                    return false;
                };
                let in_bounds = value.as_f64().is_some_and(|v| v >= lo && v <= hi);
                match self.distribution() {
                    Some(Distribution::IntUniform) => in_bounds && value.as_i64().is_some(),
                    _ => in_bounds,
                }
            }
        }
    }

    /// Draw one value uniformly from the domain.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            ParameterDomain::Fixed { value } => value.clone(),
            ParameterDomain::Values { values } => {
                values[rng.gen_range(0..values.len())].clone()
            }
            ParameterDomain::Range { .. } => {
                let (lo, hi) = self.bounds().unwrap_or((0.0, 1.0));
                match self.distribution() {
                    Some(Distribution::IntUniform) => {
                        ParamValue::Int(rng.gen_range(lo as i64..=hi as i64))
                    }
                    Some(Distribution::LogUniformValues) => {
                        ParamValue::Float(rng.gen_range(lo.ln()..hi.ln()).exp().clamp(lo, hi))
                    }
                    _ => ParamValue::Float(rng.gen_range(lo..hi)),
                }
            }
        }
    }
}

/// Parameter name to domain, ordered by name.
pub type ParameterSpace = BTreeMap<String, ParameterDomain>;

/// Immutable sweep definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: SearchMethod,
    pub metric: MetricSpec,
    #[serde(rename = "parameters")]
    pub parameter_space: ParameterSpace,
    /// Samples drawn per model × dataset-selection combination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_cap: Option<usize>,
}

impl SweepSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metric.name.trim().is_empty() {
            return Err(ConfigError::missing("hyperparameters.metric.name"));
        }
        if self.run_cap == Some(0) {
            return Err(ConfigError::invalid_sweep("run_cap must be at least 1"));
        }
        for (name, domain) in &self.parameter_space {
            domain.validate(name)?;
            if self.method == SearchMethod::Grid && domain.discrete_values().is_none() {
                return Err(ConfigError::invalid_sweep(format!(
                    "grid search cannot enumerate the range of '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Number of points in the grid formed by the discrete domains.
    pub fn grid_size(&self) -> usize {
        self.parameter_space
            .values()
            .filter_map(|d| d.discrete_values().map(<[ParamValue]>::len))
            .product()
    }

    /// How many assignments each combination receives.
    pub fn samples_per_combination(&self) -> usize {
        self.run_cap.unwrap_or(match self.method {
            SearchMethod::Grid => self.grid_size().max(1),
            _ => 1,
        })
    }
}

/// One concrete assignment of hyperparameters for a trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampledParams(BTreeMap<String, ParamValue>);

impl SampledParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that the keys are exactly those of `space` and every value lies
    /// in its domain.
    pub fn validate_against(&self, space: &ParameterSpace) -> Result<(), ConfigError> {
        if let Some(absent) = space.keys().find(|key| !self.0.contains_key(*key)) {
            return Err(ConfigError::missing(absent));
        }
        for (key, value) in &self.0 {
            let domain = space.get(key).ok_or_else(|| {
                ConfigError::invalid_sweep(format!("sampled parameter '{key}' is not in the search space"))
            })?;
            if !domain.contains(value) {
                return Err(ConfigError::out_of_range(
                    key.clone(),
                    format!("sampled value {value} lies outside its domain"),
                ));
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, ParamValue)> for SampledParams {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
