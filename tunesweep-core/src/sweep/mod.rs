//! Sweep definition and parameter sampling.

pub mod sampler;
pub mod space;

pub use sampler::{BayesSampler, GridSampler, ParameterSampler, RandomSampler, SharedSampler};
pub use space::{
    Distribution, Goal, MetricSpec, ParamValue, ParameterDomain, ParameterSpace, SampledParams,
    SearchMethod, SweepSpec,
};
