//! Collecting scalar metrics out of update and evaluation steps. Code doing the work reports
//! named values into a [`Reporter`], the scopes it is called under prefix the names so the same
//! loss reported by the updater and by the evaluator end up as `main/loss` and
//! `validation/main/loss`.
use std::collections::BTreeMap;

/// Named scalars reported during one step.
pub type Observation = BTreeMap<String, f32>;

#[derive(Clone, Debug, Default)]
pub struct Reporter {
    observation: Observation,
    prefixes: Vec<String>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, name: &str, value: f32) {
        let key = self
            .prefixes
            .iter()
            .map(|x| x.as_str())
            .chain(std::iter::once(name))
            .collect::<Vec<_>>()
            .join("/");
        self.observation.insert(key, value);
    }

    /// Runs `f` with `prefix` added to the names of everything it reports.
    pub fn scope<T>(&mut self, prefix: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.prefixes.push(prefix.to_string());
        let res = f(self);
        self.prefixes.pop();
        res
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    /// Hands over everything reported so far, leaving the reporter empty.
    pub fn take(&mut self) -> Observation {
        std::mem::take(&mut self.observation)
    }
}

/// Running mean and standard deviation of a scalar.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Summary {
    sum: f64,
    sum_sq: f64,
    count: usize,
}

impl Summary {
    pub fn add(&mut self, value: f32) {
        let value = value as f64;
        self.sum += value;
        self.sum_sq += value * value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn std(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.sum / self.count as f64;
        let var = self.sum_sq / self.count as f64 - mean * mean;
        var.max(0.0).sqrt() as f32
    }
}

/// Per key [`Summary`] over a run of observations. Keys only present in some observations are
/// averaged over the observations that contain them.
#[derive(Clone, Debug, Default)]
pub struct DictSummary {
    summaries: BTreeMap<String, Summary>,
}

impl DictSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observation: &Observation) {
        for (k, v) in observation {
            self.summaries.entry(k.clone()).or_default().add(*v);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn compute_mean(&self) -> Observation {
        self.summaries
            .iter()
            .map(|(k, v)| (k.clone(), v.mean()))
            .collect()
    }

    /// Mean and standard deviation for every key, the std under `<key>.std`.
    pub fn make_statistics(&self) -> Observation {
        let mut stats = Observation::new();
        for (k, v) in &self.summaries {
            stats.insert(k.clone(), v.mean());
            stats.insert(format!("{}.std", k), v.std());
        }
        stats
    }
}
