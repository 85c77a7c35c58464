//! Probe sinks
//!
//! Queues and strategies report context-tagged measurements (queue fill level,
//! overhead, resource usage) to a [`ProbeSink`]. Reporting is fire-and-forget
//! and skipped entirely when nobody observes the sink.

use crate::SchedulerError;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Context of one measurement, e.g. `[("cid", 3), ("MAC.QoSClass", 1)]`
pub type ProbeContext<'a> = &'a [(&'a str, i64)];

/// Receiver of numeric measurements
pub trait ProbeSink {
    /// Record one value
    fn put(&self, value: f64, context: ProbeContext<'_>);

    /// False if values are discarded anyway
    fn has_observers(&self) -> bool;
}

/// Put `value` into `sink` if one is attached and observed
pub fn put_if_observed(sink: Option<&dyn ProbeSink>, value: f64, context: ProbeContext<'_>) {
    if let Some(sink) = sink {
        if sink.has_observers() {
            sink.put(value, context);
        }
    }
}

/// How a recorder evaluates its samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsType {
    /// Keep count, mean, min and max only
    Moments,
    /// Keep every sample
    Samples,
}

impl std::str::FromStr for StatisticsType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Moments" | "moments" => Ok(StatisticsType::Moments),
            "Samples" | "samples" => Ok(StatisticsType::Samples),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

/// Running moments of one probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    /// Number of samples
    pub count: u64,
    /// Sum of the samples
    pub sum: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
}

impl Default for Moments {
    fn default() -> Self {
        Self { count: 0, sum: 0.0, min: f64::INFINITY, max: f64::NEG_INFINITY }
    }
}

impl Moments {
    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Mean, or zero without samples
    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
    }
}

/// In-memory probe sink keeping statistics per context
#[derive(Debug)]
pub struct ProbeRecorder {
    name: String,
    statistics: StatisticsType,
    moments: RefCell<BTreeMap<String, Moments>>,
    samples: RefCell<Vec<(String, f64)>>,
}

impl ProbeRecorder {
    /// Create a recorder named `name`
    pub fn new(name: impl Into<String>, statistics: StatisticsType) -> Self {
        Self {
            name: name.into(),
            statistics,
            moments: RefCell::new(BTreeMap::new()),
            samples: RefCell::new(Vec::new()),
        }
    }

    /// Create from a configured statistics type name
    pub fn from_config(name: impl Into<String>, statistics: &str) -> Result<Self, SchedulerError> {
        Ok(Self::new(name, statistics.parse()?))
    }

    /// Probe name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moments over all contexts
    pub fn total(&self) -> Moments {
        let mut total = Moments::default();
        for m in self.moments.borrow().values() {
            total.count += m.count;
            total.sum += m.sum;
            total.min = total.min.min(m.min);
            total.max = total.max.max(m.max);
        }
        total
    }

    /// Moments per context key
    pub fn per_context(&self) -> BTreeMap<String, Moments> {
        self.moments.borrow().clone()
    }

    /// Recorded samples (empty for `Moments`)
    pub fn samples(&self) -> Vec<(String, f64)> {
        self.samples.borrow().clone()
    }

    fn context_key(context: ProbeContext<'_>) -> String {
        context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl ProbeSink for ProbeRecorder {
    fn put(&self, value: f64, context: ProbeContext<'_>) {
        let key = Self::context_key(context);
        trace!("probe {}[{}] <- {}", self.name, key, value);
        self.moments.borrow_mut().entry(key.clone()).or_default().add(value);
        if self.statistics == StatisticsType::Samples {
            self.samples.borrow_mut().push((key, value));
        }
    }

    fn has_observers(&self) -> bool {
        true
    }
}

impl fmt::Display for ProbeRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total();
        write!(
            f,
            "{}: n={} mean={:.4} min={:.4} max={:.4}",
            self.name,
            total.count,
            total.mean(),
            if total.count == 0 { 0.0 } else { total.min },
            if total.count == 0 { 0.0 } else { total.max }
        )
    }
}
