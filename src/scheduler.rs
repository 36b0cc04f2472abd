use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};

use crate::{
    aggregator::{Aggregator, BatchConfig},
    error::ScrapeError,
    health::Health,
    source::{Scrape, Source},
    Batch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// A scrape still running after this long is cancelled.
    pub scrape_timeout: Duration,
    /// How long shutdown waits for an in-flight scrape.
    pub shutdown_grace: Duration,
}
impl ScheduleConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            scrape_timeout: interval,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Pauses and resumes a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    paused: Arc<watch::Sender<bool>>,
}
impl SchedulerHandle {
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

type ScrapeResult = Result<Scrape, ScrapeError>;

/// Drives one source: scrapes it every interval and feeds its aggregator.
///
/// At most one scrape runs at a time; ticks that arrive while one is still
/// running are skipped.
pub struct Scheduler {
    source: Arc<dyn Source>,
    config: ScheduleConfig,
    aggregator: Aggregator,
    batches: mpsc::Sender<Batch>,
    health: Arc<Health>,
    paused: watch::Receiver<bool>,
}
impl Scheduler {
    pub fn new(
        source: Arc<dyn Source>,
        config: ScheduleConfig,
        batch: BatchConfig,
        batches: mpsc::Sender<Batch>,
        health: Arc<Health>,
    ) -> (Self, SchedulerHandle) {
        let (paused_tx, paused) = watch::channel(false);
        let aggregator = Aggregator::new(source.resource(), batch);
        let scheduler = Self {
            source,
            config,
            aggregator,
            batches,
            health,
            paused,
        };
        let handle = SchedulerHandle {
            paused: Arc::new(paused_tx),
        };
        (scheduler, handle)
    }

    /// Runs until `stop` turns true, then flushes what is buffered.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let name = self.source.name().to_string();
        tracing::info!(source = %name, interval = ?self.config.interval, "scheduler started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<ScrapeResult>> = None;

        loop {
            tokio::select! {
                () = stopped(&mut stop) => break,
                res = join(&mut in_flight) => {
                    in_flight = None;
                    self.on_scrape(res);
                    if !self.flush_if_due().await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let paused = *self.paused.borrow();
                    if paused {
                        continue;
                    }
                    if !self.flush_if_due().await {
                        break;
                    }
                    if in_flight.is_some() {
                        self.health.record_skipped_tick();
                        tracing::warn!(source = %name, "previous scrape still running, tick skipped");
                        continue;
                    }
                    in_flight = Some(self.spawn_scrape());
                }
            }
        }

        if let Some(mut handle) = in_flight.take() {
            match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(res) => self.on_scrape(res),
                Err(_) => {
                    handle.abort();
                    tracing::warn!(source = %name, "in-flight scrape abandoned at shutdown");
                }
            }
        }
        for batch in self.aggregator.flush_split() {
            if self.batches.send(batch).await.is_err() {
                break;
            }
        }
        tracing::info!(source = %name, "scheduler stopped");
    }

    fn spawn_scrape(&self) -> JoinHandle<ScrapeResult> {
        let source = self.source.clone();
        let timeout = self.config.scrape_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, source.scrape()).await {
                Ok(res) => res,
                Err(_) => Err(ScrapeError::Timeout(timeout)),
            }
        })
    }

    fn on_scrape(&mut self, res: Result<ScrapeResult, JoinError>) {
        let source = self.source.name();
        let res = res.unwrap_or_else(|e| {
            Err(ScrapeError::Connection {
                target: source.to_string(),
                reason: format!("scrape task failed: {e}"),
            })
        });
        match res {
            Ok(scrape) => {
                for failure in &scrape.failures {
                    tracing::warn!(source, error = %failure, "probe failed");
                }
                tracing::debug!(source, samples = scrape.samples.len(), "scrape finished");
                self.health.record_scrape_ok();
                self.aggregator.add(scrape.samples);
            }
            Err(e) => {
                if e.is_auth() {
                    tracing::error!(source, error = %e, "scrape failed");
                } else {
                    tracing::warn!(source, error = %e, "scrape failed");
                }
                self.health.record_scrape_failure(&e);
            }
        }
    }

    /// Returns `false` once nobody receives batches any more.
    async fn flush_if_due(&mut self) -> bool {
        if !self.aggregator.is_due(Instant::now()) {
            return true;
        }
        let batches = self.aggregator.flush_split();
        if batches.is_empty() {
            self.health.record_export();
        }
        for batch in batches {
            if self.batches.send(batch).await.is_err() {
                tracing::warn!(source = self.source.name(), "batch channel closed");
                return false;
            }
        }
        true
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|&stop| stop).await;
}

async fn join<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{Sample, Time};

    struct CountingSource {
        scrapes: AtomicU32,
        delay: Duration,
        samples: usize,
    }
    impl CountingSource {
        fn new(delay: Duration, samples: usize) -> Arc<Self> {
            Arc::new(Self {
                scrapes: AtomicU32::new(0),
                delay,
                samples,
            })
        }
    }

    #[async_trait]
    impl Source for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }
        async fn scrape(&self) -> Result<Scrape, ScrapeError> {
            let n = self.scrapes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let samples = (0..self.samples)
                .map(|i| Sample::new("counting.value", Time::from(n), i as f64))
                .collect();
            Ok(Scrape {
                samples,
                failures: vec![],
            })
        }
    }

    fn batch_config(size: usize) -> BatchConfig {
        BatchConfig {
            send_batch_size: size,
            send_batch_max_size: 0,
            timeout: Duration::from_secs(3600),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scrapes_every_interval_and_flushes_when_full() {
        let source = CountingSource::new(Duration::ZERO, 2);
        let health = Arc::new(Health::new(Duration::from_secs(5), 1));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (scheduler, _handle) = Scheduler::new(
            source.clone(),
            ScheduleConfig::new(Duration::from_secs(5)),
            batch_config(4),
            tx,
            health.clone(),
        );
        let task = tokio::spawn(scheduler.run(stop_rx));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.resource()["source.name"], "counting");
        assert_eq!(source.scrapes.load(Ordering::SeqCst), 2);

        stop_tx.send_replace(true);
        task.await.unwrap();
        assert!(health.snapshot().scrapes_ok >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_scrape_skips_ticks_and_times_out() {
        let source = CountingSource::new(Duration::from_secs(60), 1);
        let health = Arc::new(Health::new(Duration::from_secs(5), 1));
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = ScheduleConfig {
            interval: Duration::from_secs(5),
            scrape_timeout: Duration::from_secs(12),
            shutdown_grace: Duration::from_secs(1),
        };
        let (scheduler, _handle) =
            Scheduler::new(source.clone(), config, batch_config(100), tx, health.clone());
        let task = tokio::spawn(scheduler.run(stop_rx));

        // Scrape at 0 is cancelled at 12; ticks at 5 and 10 are skipped.
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        let status = health.snapshot();
        assert_eq!(status.ticks_skipped, 2);
        assert_eq!(status.scrapes_failed, 1);
        assert_eq!(source.scrapes.load(Ordering::SeqCst), 1);

        stop_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn paused_scheduler_does_not_scrape() {
        let source = CountingSource::new(Duration::ZERO, 1);
        let health = Arc::new(Health::new(Duration::from_secs(5), 1));
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (scheduler, handle) = Scheduler::new(
            source.clone(),
            ScheduleConfig::new(Duration::from_secs(5)),
            batch_config(100),
            tx,
            health,
        );
        handle.pause();
        let task = tokio::spawn(scheduler.run(stop_rx));
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(source.scrapes.load(Ordering::SeqCst), 0);

        // Next tick at 35.
        handle.resume();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(source.scrapes.load(Ordering::SeqCst), 1);

        stop_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_buffered_samples() {
        let source = CountingSource::new(Duration::ZERO, 3);
        let health = Arc::new(Health::new(Duration::from_secs(5), 1));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (scheduler, _handle) = Scheduler::new(
            source,
            ScheduleConfig::new(Duration::from_secs(5)),
            batch_config(100),
            tx,
            health,
        );
        let task = tokio::spawn(scheduler.run(stop_rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send_replace(true);
        task.await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(rx.recv().await.is_none());
    }
}
