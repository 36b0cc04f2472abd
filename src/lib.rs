pub mod aggregator;
pub mod codec;
pub mod config;
pub mod enrich;
pub mod error;
pub mod exporter;
pub mod health;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod sink;
pub mod source;

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

pub type MetricKey = String;
/// Unix time in milliseconds.
pub type Time = u64;
pub type Labels = BTreeMap<String, String>;
pub type Resource = BTreeMap<String, String>;

pub fn now() -> Time {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub name: MetricKey,
    pub time: Time,
    pub value: f64,
    pub unit: String,
    pub labels: Labels,
}
impl Sample {
    pub fn new(name: impl Into<MetricKey>, time: Time, value: f64) -> Self {
        Self {
            name: name.into(),
            time,
            value,
            unit: String::new(),
            labels: Labels::new(),
        }
    }
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A group of samples flushed together, plus the resource they describe.
///
/// The resource map can only be changed through [`enrich::enrich`], which
/// consumes the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    resource: Resource,
    samples: Vec<Sample>,
}
impl Batch {
    pub fn new(resource: Resource, samples: Vec<Sample>) -> Self {
        Self { resource, samples }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Splits into batches of at most `max` samples each. `max == 0` keeps the
    /// batch whole.
    pub fn split(self, max: usize) -> Vec<Batch> {
        if max == 0 || self.samples.len() <= max {
            return vec![self];
        }
        let Self { resource, samples } = self;
        let mut batches = Vec::with_capacity(samples.len().div_ceil(max));
        let mut samples = samples.into_iter().peekable();
        while samples.peek().is_some() {
            let chunk: Vec<Sample> = samples.by_ref().take(max).collect();
            batches.push(Batch::new(resource.clone(), chunk));
        }
        batches
    }

    pub(crate) fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_order_and_resource() {
        let resource = Resource::from([("source.name".to_string(), "db".to_string())]);
        let samples = (0..5).map(|i| Sample::new("x", i, i as f64)).collect();
        let batches = Batch::new(resource.clone(), samples).split(2);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert!(batches.iter().all(|b| b.resource() == &resource));
        let times: Vec<Time> = batches
            .into_iter()
            .flat_map(Batch::into_samples)
            .map(|s| s.time)
            .collect();
        assert_eq!(times, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn split_zero_is_unbounded() {
        let samples = (0..3).map(|i| Sample::new("x", i, 0.0)).collect();
        let batches = Batch::new(Resource::new(), samples).split(0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }
}
