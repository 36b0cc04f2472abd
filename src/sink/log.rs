use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

use super::Sink;
use crate::{error::DeliveryError, Batch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// One event per batch.
    #[default]
    Basic,
    /// One event per sample as well.
    Detailed,
}

/// Logs the first `initial` events of every `window`, then every
/// `thereafter`-th. `thereafter == 0` logs nothing past the initial burst.
#[derive(Debug)]
pub struct Sampler {
    initial: u64,
    thereafter: u64,
    window: Duration,
    state: Mutex<(Instant, u64)>,
}
impl Sampler {
    pub fn new(initial: u64, thereafter: u64, window: Duration) -> Self {
        Self {
            initial,
            thereafter,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn sample(&self) -> bool {
        let mut state = self.state.lock();
        let (window_start, count) = &mut *state;
        let now = Instant::now();
        if now.duration_since(*window_start) >= self.window {
            *window_start = now;
            *count = 0;
        }
        *count += 1;
        if *count <= self.initial {
            return true;
        }
        self.thereafter != 0 && (*count - self.initial) % self.thereafter == 0
    }
}

#[derive(Debug)]
pub struct LogSink {
    name: String,
    verbosity: Verbosity,
    sampler: Sampler,
}
impl LogSink {
    pub fn new(name: impl Into<String>, verbosity: Verbosity, sampler: Sampler) -> Self {
        Self {
            name: name.into(),
            verbosity,
            sampler,
        }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        if !self.sampler.sample() {
            return Ok(());
        }
        tracing::info!(
            sink = %self.name,
            samples = batch.len(),
            resource = ?batch.resource(),
            "metric batch"
        );
        if self.verbosity == Verbosity::Detailed {
            for sample in batch.samples() {
                tracing::info!(
                    sink = %self.name,
                    name = %sample.name,
                    value = sample.value,
                    unit = %sample.unit,
                    time = sample.time,
                    labels = ?sample.labels,
                    "metric sample"
                );
            }
        }
        Ok(())
    }
}
