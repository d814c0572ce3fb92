//! Parameter samplers.
//!
//! The sweep controller treats the sampler as an external collaborator behind
//! [`ParameterSampler`]. Grid, seeded random, and a TPE-style Bayesian sampler
//! are provided; all updates go through [`SharedSampler`], which serializes
//! access so concurrent trials never mutate the posterior at the same time.

use super::space::{
    Distribution, Goal, ParamValue, ParameterDomain, ParameterSpace, SampledParams, SearchMethod,
    SweepSpec,
};
use crate::error::ConfigError;
use rand::distributions::{Distribution as _, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Produces one assignment per trial and learns from completed trials.
pub trait ParameterSampler: Send {
    /// Suggest the assignment for the `sample_index`-th sample of a combination.
    fn suggest(&mut self, sample_index: usize) -> Result<SampledParams, ConfigError>;

    /// Feed back a trial that reached a terminal state. `metric` is `None`
    /// when the trial failed or was cancelled.
    fn observe(&mut self, params: &SampledParams, metric: Option<f64>);

    fn name(&self) -> &'static str;
}

/// Build the sampler matching `spec.method`.
pub fn sampler_for(spec: &SweepSpec, seed: u64) -> Result<Box<dyn ParameterSampler>, ConfigError> {
    Ok(match spec.method {
        SearchMethod::Grid => Box::new(GridSampler::new(&spec.parameter_space)?),
        SearchMethod::Random => Box::new(RandomSampler::new(spec.parameter_space.clone(), seed)),
        SearchMethod::Bayes => Box::new(BayesSampler::new(
            spec.parameter_space.clone(),
            spec.metric.goal,
            seed,
        )),
    })
}

/// Enumerates the cartesian product of discrete domains, wrapping around.
#[derive(Debug, Clone)]
pub struct GridSampler {
    axes: Vec<(String, Vec<ParamValue>)>,
}

impl GridSampler {
    pub fn new(space: &ParameterSpace) -> Result<Self, ConfigError> {
        let axes = space
            .iter()
            .map(|(name, domain)| {
                domain
                    .discrete_values()
                    .map(|values| (name.clone(), values.to_vec()))
                    .ok_or_else(|| {
                        ConfigError::invalid_sweep(format!(
                            "grid search cannot enumerate the range of '{name}'"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { axes })
    }

    pub fn size(&self) -> usize {
        self.axes.iter().map(|(_, v)| v.len()).product()
    }
}

impl ParameterSampler for GridSampler {
    fn suggest(&mut self, sample_index: usize) -> Result<SampledParams, ConfigError> {
        let size = self.size();
        if size == 0 {
            return Ok(SampledParams::new());
        }
        // Mixed-radix decode; the last axis varies fastest.
        let mut rest = sample_index % size;
        let mut picks = Vec::with_capacity(self.axes.len());
        for (name, values) in self.axes.iter().rev() {
            picks.push((name.clone(), values[rest % values.len()].clone()));
            rest /= values.len();
        }
        Ok(picks.into_iter().collect())
    }

    fn observe(&mut self, _params: &SampledParams, _metric: Option<f64>) {}

    fn name(&self) -> &'static str {
        "grid"
    }
}

/// Independent uniform draws from every domain.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: ParameterSpace,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(space: ParameterSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ParameterSampler for RandomSampler {
    fn suggest(&mut self, _sample_index: usize) -> Result<SampledParams, ConfigError> {
        Ok(sample_space(&self.space, &mut self.rng))
    }

    fn observe(&mut self, _params: &SampledParams, _metric: Option<f64>) {}

    fn name(&self) -> &'static str {
        "random"
    }
}

fn sample_space<R: Rng + ?Sized>(space: &ParameterSpace, rng: &mut R) -> SampledParams {
    space
        .iter()
        .map(|(name, domain)| (name.clone(), domain.sample(rng)))
        .collect()
}

/// Tree-structured Parzen estimator over the sweep metric.
///
/// The first `n_startup` suggestions are random. After that, observations are
/// split by the `gamma` quantile into good and bad sets (respecting the metric
/// goal) and each parameter is drawn where the good/bad density ratio is highest.
#[derive(Debug, Clone)]
pub struct BayesSampler {
    space: ParameterSpace,
    goal: Goal,
    rng: StdRng,
    observations: Vec<(SampledParams, f64)>,
    n_startup: usize,
    gamma: f64,
    n_candidates: usize,
}

impl BayesSampler {
    pub fn new(space: ParameterSpace, goal: Goal, seed: u64) -> Self {
        Self {
            space,
            goal,
            rng: StdRng::seed_from_u64(seed),
            observations: Vec::new(),
            n_startup: 5,
            gamma: 0.25,
            n_candidates: 24,
        }
    }

    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n.max(2);
        self
    }

    /// Best observed assignment and its metric.
    pub fn best(&self) -> Option<(&SampledParams, f64)> {
        self.observations
            .iter()
            .min_by(|a, b| self.goal.rank(a.1, b.1))
            .map(|(p, m)| (p, *m))
    }

    /// Partition observations into the best `gamma` share and the rest.
    fn split(&self) -> (Vec<SampledParams>, Vec<SampledParams>) {
        let mut ranked = self.observations.clone();
        ranked.sort_by(|a, b| self.goal.rank(a.1, b.1));
        let n_good = ((ranked.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.max(1).min(ranked.len() - 1);
        let bad = ranked.split_off(n_good);
        (
            ranked.into_iter().map(|(p, _)| p).collect(),
            bad.into_iter().map(|(p, _)| p).collect(),
        )
    }

    fn sample_parameter(
        &mut self,
        name: &str,
        domain: &ParameterDomain,
        good: &[&SampledParams],
        bad: &[&SampledParams],
    ) -> ParamValue {
        match domain {
            ParameterDomain::Fixed { value } => value.clone(),
            ParameterDomain::Values { values } => {
                let weights: Vec<f64> = values
                    .iter()
                    .map(|v| {
                        let in_good = count_matching(good, name, v);
                        let in_bad = count_matching(bad, name, v);
                        let k = values.len() as f64;
                        let l = (in_good + 1.0) / (good.len() as f64 + k);
                        let g = (in_bad + 1.0) / (bad.len() as f64 + k);
                        l / g
                    })
                    .collect();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => values[dist.sample(&mut self.rng)].clone(),
                    Err(_) => domain.sample(&mut self.rng),
                }
            }
            ParameterDomain::Range { .. } => self.sample_range(name, domain, good, bad),
        }
    }

    fn sample_range(
        &mut self,
        name: &str,
        domain: &ParameterDomain,
        good: &[&SampledParams],
        bad: &[&SampledParams],
    ) -> ParamValue {
        let Some((lo, hi)) = domain.bounds() else {
            return domain.sample(&mut self.rng);
        };
        let dist = domain.distribution();
        let log = dist == Some(Distribution::LogUniformValues);
        let to_space = |v: f64| if log { v.ln() } else { v };
        let (lo_t, hi_t) = (to_space(lo), to_space(hi));

        let observed = |set: &[&SampledParams]| -> Vec<f64> {
            set.iter()
                .filter_map(|p| p.get(name).and_then(ParamValue::as_f64))
                .filter(|v| *v >= lo && *v <= hi)
                .map(to_space)
                .collect()
        };
        let good_vals = observed(good);
        let bad_vals = observed(bad);
        if good_vals.is_empty() {
            return domain.sample(&mut self.rng);
        }

        let bandwidth = (hi_t - lo_t) / 10.0;
        let mut best = good_vals[0];
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..self.n_candidates {
            let base = good_vals[self.rng.gen_range(0..good_vals.len())];
            // Box-Muller
            let u1: f64 = self.rng.gen_range(1e-10..1.0);
            let u2: f64 = self.rng.gen_range(0.0..1.0);
            let noise = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            let candidate = (base + noise * bandwidth).clamp(lo_t, hi_t);
            let ratio = kde_density(candidate, &good_vals, bandwidth)
                / (kde_density(candidate, &bad_vals, bandwidth) + 1e-10);
            if ratio > best_ratio {
                best_ratio = ratio;
                best = candidate;
            }
        }

        let value = (if log { best.exp() } else { best }).clamp(lo, hi);
        match dist {
            Some(Distribution::IntUniform) => ParamValue::Int(value.round() as i64),
            _ => ParamValue::Float(value),
        }
    }
}

fn count_matching(set: &[&SampledParams], name: &str, value: &ParamValue) -> f64 {
    set.iter()
        .filter(|p| p.get(name).is_some_and(|v| v.same_value(value)))
        .count() as f64
}

fn kde_density(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}

impl ParameterSampler for BayesSampler {
    fn suggest(&mut self, _sample_index: usize) -> Result<SampledParams, ConfigError> {
        if self.observations.len() < self.n_startup {
            return Ok(sample_space(&self.space, &mut self.rng));
        }
        let (good, bad) = self.split();
        let good_refs: Vec<&SampledParams> = good.iter().collect();
        let bad_refs: Vec<&SampledParams> = bad.iter().collect();

        let space = self.space.clone();
        Ok(space
            .iter()
            .map(|(name, domain)| {
                let value = self.sample_parameter(name, domain, &good_refs, &bad_refs);
                (name.clone(), value)
            })
            .collect())
    }

    fn observe(&mut self, params: &SampledParams, metric: Option<f64>) {
        if let Some(metric) = metric.filter(|m| m.is_finite()) {
            self.observations.push((params.clone(), metric));
        }
    }

    fn name(&self) -> &'static str {
        "bayes"
    }
}

/// Serialized handle to the sweep's single sampler.
#[derive(Clone)]
pub struct SharedSampler {
    inner: Arc<Mutex<Box<dyn ParameterSampler>>>,
}

impl SharedSampler {
    pub fn new(sampler: Box<dyn ParameterSampler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sampler)),
        }
    }

    pub fn from_spec(spec: &SweepSpec, seed: u64) -> Result<Self, ConfigError> {
        Ok(Self::new(sampler_for(spec, seed)?))
    }

    pub async fn suggest(&self, sample_index: usize) -> Result<SampledParams, ConfigError> {
        self.inner.lock().await.suggest(sample_index)
    }

    pub async fn observe(&self, params: &SampledParams, metric: Option<f64>) {
        self.inner.lock().await.observe(params, metric);
    }

    pub async fn name(&self) -> &'static str {
        self.inner.lock().await.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::space::MetricSpec;
    use std::collections::HashSet;

    fn grid_space() -> ParameterSpace {
        let mut space = ParameterSpace::new();
        space.insert("optimizer".into(), ParameterDomain::values(["sgd", "adam"]));
        space.insert("batch_size".into(), ParameterDomain::values([64, 128, 256]));
        space.insert("scheduler".into(), ParameterDomain::fixed("None"));
        space
    }

    #[test]
    fn test_grid_covers_every_point_once() {
        let mut grid = GridSampler::new(&grid_space()).unwrap();
        assert_eq!(grid.size(), 6);
        let seen: HashSet<String> = (0..6)
            .map(|i| serde_json::to_string(&grid.suggest(i).unwrap()).unwrap())
            .collect();
        assert_eq!(seen.len(), 6);
        assert_eq!(grid.suggest(0).unwrap(), grid.suggest(6).unwrap());
    }

    #[test]
    fn test_grid_rejects_range() {
        let mut space = grid_space();
        space.insert("learning_rate".into(), ParameterDomain::range(0.001, 0.1));
        assert!(GridSampler::new(&space).is_err());
    }

    #[test]
    fn test_random_is_reproducible() {
        let mut space = grid_space();
        space.insert("learning_rate".into(), ParameterDomain::log_range(1e-4, 1e-1));
        let mut a = RandomSampler::new(space.clone(), 11);
        let mut b = RandomSampler::new(space, 11);
        for i in 0..10 {
            assert_eq!(a.suggest(i).unwrap(), b.suggest(i).unwrap());
        }
    }

    #[test]
    fn test_bayes_concentrates_on_good_region() {
        let mut space = ParameterSpace::new();
        space.insert("learning_rate".into(), ParameterDomain::range(0.0, 1.0));
        let mut sampler = BayesSampler::new(space, Goal::Maximize, 3).with_startup(10);

        // Metric peaks at learning_rate = 0.8.
        for i in 0..60 {
            let params = sampler.suggest(i).unwrap();
            let lr = params.get("learning_rate").and_then(ParamValue::as_f64).unwrap();
            assert!((0.0..=1.0).contains(&lr));
            sampler.observe(&params, Some(-(lr - 0.8).abs()));
        }

        let late: Vec<f64> = (0..20)
            .map(|i| {
                sampler
                    .suggest(100 + i)
                    .unwrap()
                    .get("learning_rate")
                    .and_then(ParamValue::as_f64)
                    .unwrap()
            })
            .collect();
        let mean = late.iter().sum::<f64>() / late.len() as f64;
        assert!((mean - 0.8).abs() < 0.2, "mean suggestion {mean}");
        let (_, best) = sampler.best().unwrap();
        assert!(best > -0.1);
    }

    #[test]
    fn test_bayes_ignores_failed_trials() {
        let mut sampler = BayesSampler::new(grid_space(), Goal::Minimize, 1);
        let params = sampler.suggest(0).unwrap();
        sampler.observe(&params, None);
        sampler.observe(&params, Some(f64::NAN));
        assert!(sampler.best().is_none());
    }

    #[test]
    fn test_sampler_for_method() {
        let spec = SweepSpec {
            name: None,
            method: SearchMethod::Grid,
            metric: MetricSpec {
                name: "acc/val".into(),
                goal: Goal::Maximize,
            },
            parameter_space: grid_space(),
            run_cap: None,
        };
        assert_eq!(sampler_for(&spec, 0).unwrap().name(), "grid");
    }

    #[tokio::test]
    async fn test_shared_sampler_serializes_updates() {
        let mut space = ParameterSpace::new();
        space.insert("learning_rate".into(), ParameterDomain::range(0.0, 1.0));
        let shared = SharedSampler::new(Box::new(BayesSampler::new(space, Goal::Maximize, 5)));

        let mut handles = Vec::new();
        for i in 0..16 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                let params = shared.suggest(i).await.unwrap();
                shared.observe(&params, Some(i as f64)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(shared.name().await, "bayes");
    }
}
