use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use metric_relay::{
    aggregator::BatchConfig,
    enrich::ResourceAttributes,
    error::ScrapeError,
    exporter::{DeliveryReport, SinkSettings},
    pipeline::Pipeline,
    scheduler::ScheduleConfig,
    sink::memory::MemorySink,
    source::{Scrape, Source},
    Batch, Sample,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Returns the next planned sample count on every scrape, then nothing.
struct ScriptedSource {
    plan: Mutex<VecDeque<usize>>,
    per_scrape: usize,
}
impl ScriptedSource {
    fn planned(plan: impl IntoIterator<Item = usize>) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(plan.into_iter().collect()),
            per_scrape: 0,
        })
    }
    fn steady(per_scrape: usize) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(VecDeque::new()),
            per_scrape,
        })
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn name(&self) -> &str {
        "oracledb"
    }
    async fn scrape(&self) -> Result<Scrape, ScrapeError> {
        let n = self.plan.lock().pop_front().unwrap_or(self.per_scrape);
        let time = metric_relay::now();
        let samples = (0..n)
            .map(|i| Sample::new(format!("oracledb.probe{i}"), time, i as f64))
            .collect();
        Ok(Scrape {
            samples,
            failures: vec![],
        })
    }
}

fn attributes() -> ResourceAttributes {
    ResourceAttributes::new()
        .with("service.name", "oracle-relay")
        .with("deployment.environment", "test")
}

fn sizes(batches: &[Batch]) -> Vec<usize> {
    batches.iter().map(Batch::len).collect()
}

#[tokio::test(start_paused = true)]
async fn batches_reach_every_sink_once() {
    let batch = BatchConfig {
        send_batch_size: 3,
        send_batch_max_size: 0,
        timeout: Duration::from_secs(3600),
    };
    let (tx, mut reports) = mpsc::unbounded_channel::<DeliveryReport>();
    let first = Arc::new(MemorySink::new("first"));
    let second = Arc::new(MemorySink::new("second"));
    let mut pipeline = Pipeline::new(ScheduleConfig::new(Duration::from_secs(5)), batch, attributes())
        .with_reports(tx);
    pipeline
        .add_source(ScriptedSource::planned([4, 3]))
        .add_sink(first.clone(), SinkSettings::default())
        .add_sink(second.clone(), SinkSettings::default());
    let running = pipeline.spawn();

    for _ in 0..4 {
        let report = reports.recv().await.unwrap();
        assert!(report.outcome.is_delivered());
    }
    // One more idle tick must not produce anything.
    tokio::time::sleep(Duration::from_secs(6)).await;
    running.shutdown().await;
    assert!(reports.try_recv().is_err());

    let first = first.batches();
    let second = second.batches();
    assert_eq!(sizes(&first), [4, 3]);
    assert_eq!(first, second);

    let resource = first[0].resource();
    assert_eq!(resource["service.name"], "oracle-relay");
    assert_eq!(resource["deployment.environment"], "test");
    assert_eq!(resource["source.name"], "oracledb");
    assert_eq!(first[1].resource(), resource);
}

#[tokio::test(start_paused = true)]
async fn readiness_follows_the_scheduler() {
    let interval = Duration::from_secs(5);
    let batch = BatchConfig {
        send_batch_size: 8192,
        send_batch_max_size: 0,
        timeout: interval,
    };
    let sink = Arc::new(MemorySink::new("memory"));
    let mut pipeline = Pipeline::new(ScheduleConfig::new(interval), batch, attributes());
    pipeline
        .add_source(ScriptedSource::steady(1))
        .add_sink(sink.clone(), SinkSettings::default());
    let running = pipeline.spawn();
    let health = running.health();
    assert!(!health.is_ready());

    // Scrapes at 0 and 5; the first batch is flushed and delivered at 5.
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert!(health.is_ready());
    assert_eq!(sink.count(), 1);

    running.pause();
    tokio::time::sleep(interval * 2).await;
    assert!(!health.is_ready());

    running.resume();
    tokio::time::sleep(interval).await;
    assert!(health.is_ready());

    running.shutdown().await;
    assert!(!health.is_live());
}
