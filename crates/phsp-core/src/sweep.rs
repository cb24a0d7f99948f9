//! Sweep configuration: which models run with which parameter points.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// A named parameter vector, ordered by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterPoint(BTreeMap<String, f64>);

impl ParameterPoint {
    /// Create an empty point.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add a parameter value.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Set a parameter value.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Get a parameter value.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Command-line form: one `name=value` argument per parameter.
    pub fn to_args(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(default)");
        }
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(", "))
    }
}

/// Values taken by one parameter across a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAxis {
    pub name: String,
    pub values: Vec<f64>,
}

impl ParameterAxis {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// `count` evenly spaced values from `start` to `stop` inclusive.
    pub fn linspace(name: impl Into<String>, start: f64, stop: f64, count: usize) -> Self {
        let values = match count {
            0 => Vec::new(),
            1 => vec![start],
            n => {
                let step = (stop - start) / (n - 1) as f64;
                (0..n)
                    .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                    .collect()
            }
        };
        Self::new(name, values)
    }
}

/// A grid sweep over one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSweep {
    pub model: PathBuf,
    #[serde(default)]
    pub axes: Vec<ParameterAxis>,
}

impl ModelSweep {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            axes: Vec::new(),
        }
    }

    /// Builder method to add an axis.
    pub fn with_axis(mut self, axis: ParameterAxis) -> Self {
        self.axes.push(axis);
        self
    }

    /// Cartesian product of the axes; the first axis varies slowest.
    pub fn expand(&self) -> Vec<SweepEntry> {
        let mut points = vec![ParameterPoint::new()];
        for axis in &self.axes {
            let mut next = Vec::with_capacity(points.len() * axis.values.len());
            for point in &points {
                for value in &axis.values {
                    next.push(point.clone().with(axis.name.clone(), *value));
                }
            }
            points = next;
        }
        points
            .into_iter()
            .map(|params| SweepEntry::new(self.model.clone(), params))
            .collect()
    }
}

/// One (model, parameter point) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    pub model: PathBuf,
    #[serde(default)]
    pub params: ParameterPoint,
}

impl SweepEntry {
    pub fn new(model: impl Into<PathBuf>, params: ParameterPoint) -> Self {
        Self {
            model: model.into(),
            params,
        }
    }
}

/// Ordered list of tasks to run plus where to put their output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Directory receiving per-run logs and the task table snapshot.
    pub output_dir: PathBuf,

    /// Tasks in execution/reporting order.
    #[serde(default)]
    pub entries: Vec<SweepEntry>,
}

impl SweepConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            entries: Vec::new(),
        }
    }

    /// Builder method to add a single entry.
    pub fn with_entry(mut self, model: impl Into<PathBuf>, params: ParameterPoint) -> Self {
        self.entries.push(SweepEntry::new(model, params));
        self
    }

    /// Concatenate grid expansions in model order.
    pub fn from_model_sweeps(output_dir: impl Into<PathBuf>, sweeps: &[ModelSweep]) -> Self {
        Self {
            output_dir: output_dir.into(),
            entries: sweeps.iter().flat_map(ModelSweep::expand).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject configurations the engine cannot launch.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput("output_dir is empty".to_string()));
        }
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.model.as_os_str().is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "entry {} has an empty model path",
                    index
                )));
            }
            if let Some((name, value)) = entry.params.iter().find(|(_, v)| !v.is_finite()) {
                return Err(CoreError::InvalidInput(format!(
                    "entry {} parameter '{}' is not finite ({})",
                    index, name, value
                )));
            }
        }
        Ok(())
    }
}

/// On-disk sweep description: grids per model and/or explicit entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFile {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub models: Vec<ModelSweep>,
    #[serde(default)]
    pub entries: Vec<SweepEntry>,
}

impl SweepFile {
    /// Grid expansions first, then explicit entries.
    pub fn into_config(self) -> SweepConfig {
        let mut config = SweepConfig::from_model_sweeps(self.output_dir, &self.models);
        config.entries.extend(self.entries);
        config
    }
}
