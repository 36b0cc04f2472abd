use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    aggregator::BatchConfig,
    config::{Config, ConnectorKind, CredentialsConfig},
    enrich::{enrich, ResourceAttributes},
    exporter::{DeliveryReport, Multiplexer, SinkSettings},
    health::Health,
    scheduler::{ScheduleConfig, Scheduler, SchedulerHandle},
    shutdown::Shutdown,
    sink::{self, Sink},
    source::{host::HostConnector, tcp::TcpConnector, Connector, ProbeSource, Source},
    Batch,
};

const MERGE_CHANNEL_SIZE: usize = 64;

/// Each source gets its own scheduler and aggregator; their batches meet on
/// one channel ahead of the enricher.
pub struct Pipeline {
    schedule: ScheduleConfig,
    batch: BatchConfig,
    attributes: ResourceAttributes,
    sources: Vec<Arc<dyn Source>>,
    sinks: Vec<(Arc<dyn Sink>, SinkSettings)>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
}
impl Pipeline {
    pub fn new(schedule: ScheduleConfig, batch: BatchConfig, attributes: ResourceAttributes) -> Self {
        Self {
            schedule,
            batch,
            attributes,
            sources: vec![],
            sinks: vec![],
            reports: None,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut pipeline = Self::new(config.schedule(), config.batch(), config.resource_attributes());
        for source in &config.sources {
            let descriptor = source.descriptor()?;
            let credentials = source
                .credentials
                .as_ref()
                .map(CredentialsConfig::resolve)
                .transpose()?;
            let connector: Arc<dyn Connector> = match source.connector {
                ConnectorKind::Tcp => Arc::new(TcpConnector::new(source.connect_timeout)),
                ConnectorKind::Host => Arc::new(HostConnector::new()),
            };
            tracing::info!(source = %source.name, %descriptor, "source configured");
            pipeline.add_source(Arc::new(ProbeSource::new(
                source.name.clone(),
                descriptor,
                credentials,
                connector,
                source.probes(),
            )));
        }
        for sink_config in &config.sinks {
            let settings = SinkSettings {
                retry: (&sink_config.retry).into(),
                queue_size: sink_config.queue_size,
                timeout: sink_config.timeout,
            };
            pipeline.add_sink(sink::build(sink_config)?, settings);
            tracing::info!(sink = %sink_config.name, "sink configured");
        }
        Ok(pipeline)
    }

    pub fn add_source(&mut self, source: Arc<dyn Source>) -> &mut Self {
        self.sources.push(source);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn Sink>, settings: SinkSettings) -> &mut Self {
        self.sinks.push((sink, settings));
        self
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<DeliveryReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Starts every task; must be called inside a tokio runtime.
    pub fn spawn(self) -> RunningPipeline {
        let health = Arc::new(Health::new(self.schedule.interval, self.sinks.len()));
        let shutdown = Shutdown::new();

        let mut mux = Multiplexer::new(health.clone());
        if let Some(reports) = self.reports {
            mux = mux.with_reports(reports);
        }
        for (sink, settings) in self.sinks {
            mux.add_sink(sink, settings);
        }

        let (tx, rx) = mpsc::channel(MERGE_CHANNEL_SIZE);
        let mut tasks = vec![];
        let mut schedulers = vec![];
        for source in self.sources {
            let (scheduler, handle) =
                Scheduler::new(source, self.schedule, self.batch, tx.clone(), health.clone());
            tasks.push(tokio::spawn(scheduler.run(shutdown.subscribe())));
            schedulers.push(handle);
        }
        drop(tx);
        let grace = self.schedule.shutdown_grace;
        tasks.push(tokio::spawn(forward(rx, self.attributes, mux, grace)));

        RunningPipeline {
            health,
            shutdown,
            tasks,
            schedulers,
            grace,
        }
    }
}

/// Enriches merged batches and hands them to the multiplexer until every
/// scheduler has stopped.
async fn forward(
    mut rx: mpsc::Receiver<Batch>,
    attributes: ResourceAttributes,
    mux: Multiplexer,
    grace: Duration,
) {
    while let Some(batch) = rx.recv().await {
        let batch = enrich(batch, &attributes);
        tracing::debug!(samples = batch.len(), "exporting batch");
        mux.export(batch);
    }
    mux.close(grace).await;
}

pub struct RunningPipeline {
    health: Arc<Health>,
    shutdown: Shutdown,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    schedulers: Vec<SchedulerHandle>,
    grace: Duration,
}
impl RunningPipeline {
    pub fn health(&self) -> Arc<Health> {
        self.health.clone()
    }

    pub fn pause(&self) {
        self.schedulers.iter().for_each(SchedulerHandle::pause);
    }
    pub fn resume(&self) {
        self.schedulers.iter().for_each(SchedulerHandle::resume);
    }

    /// Stops scraping, flushes what is buffered and drains the sink queues.
    pub async fn shutdown(self) {
        self.health.mark_stopping();
        for task in self.tasks {
            self.shutdown.register(task).await;
        }
        // Scrape grace, then sink drain grace, plus slack.
        let timeout = self.grace * 2 + Duration::from_secs(1);
        self.shutdown.shutdown(timeout).await;
    }
}
