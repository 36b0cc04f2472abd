pub mod file;
pub mod log;
pub mod memory;
pub mod otlp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::{SinkConfig, SinkKind},
    error::DeliveryError,
    Batch,
};

/// A destination for batches.
///
/// `deliver` is called once per attempt; retrying is up to the caller.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError>;
}

pub fn build(config: &SinkConfig) -> anyhow::Result<Arc<dyn Sink>> {
    let name = config.name.clone();
    let sink: Arc<dyn Sink> = match &config.kind {
        SinkKind::Otlp(otlp) => otlp::build(name, otlp, config.timeout)?,
        SinkKind::File(file) => Arc::new(file::FileSink::new(
            name,
            file.path.clone(),
            file.rotation(),
        )),
        SinkKind::Log(log) => Arc::new(log::LogSink::new(name, log.verbosity, log.sampler())),
    };
    Ok(sink)
}
