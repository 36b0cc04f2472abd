use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::DeliveryError, health::Health, retry::RetryPolicy, sink::Sink, Batch,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkSettings {
    pub retry: RetryPolicy,
    pub queue_size: usize,
    /// Ceiling on one `deliver` call.
    pub timeout: Duration,
}
impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            queue_size: 1000,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Permanent(DeliveryError),
    RetriesExhausted(DeliveryError),
    QueueFull,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32, reason: DropReason },
}
impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// What happened to one batch on one sink.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub sink: String,
    pub samples: usize,
    pub outcome: DeliveryOutcome,
}

/// Delivers `batch` to `sink`, retrying transient failures per `policy`.
///
/// Every finished attempt is recorded in `health`; while the sink is backing
/// off it counts as retrying. Once `cancel` fires the batch is dropped as
/// [`DropReason::Closed`].
pub async fn deliver_with_retry(
    sink: &dyn Sink,
    batch: &Batch,
    policy: &RetryPolicy,
    timeout: Duration,
    health: &Health,
    cancel: &CancellationToken,
) -> DeliveryOutcome {
    let mut state = policy.start();
    let mut retrying = false;
    let outcome = loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break DeliveryOutcome::Dropped {
                attempts: state.attempts(),
                reason: DropReason::Closed,
            },
            attempt = tokio::time::timeout(timeout, sink.deliver(batch)) => attempt,
        };
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "delivery did not finish within {timeout:?}"
            ))),
        };
        health.record_export();
        let err = match result {
            Ok(()) => {
                break DeliveryOutcome::Delivered {
                    attempts: state.attempts() + 1,
                }
            }
            Err(err) => err,
        };
        let wait = state.on_failure();
        if err.is_permanent() {
            break DeliveryOutcome::Dropped {
                attempts: state.attempts(),
                reason: DropReason::Permanent(err),
            };
        }
        let Some(wait) = wait else {
            break DeliveryOutcome::Dropped {
                attempts: state.attempts(),
                reason: DropReason::RetriesExhausted(err),
            };
        };
        if !retrying {
            retrying = true;
            health.sink_retrying();
        }
        tracing::warn!(
            sink = sink.name(),
            attempt = state.attempts(),
            error = %err,
            ?wait,
            "delivery failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break DeliveryOutcome::Dropped {
                attempts: state.attempts(),
                reason: DropReason::Closed,
            },
            _ = tokio::time::sleep(wait) => {}
        }
    };
    if retrying {
        health.sink_settled();
    }
    outcome
}

#[derive(Debug)]
struct Route {
    name: String,
    tx: mpsc::Sender<Arc<Batch>>,
}

#[derive(Debug)]
pub struct Multiplexer {
    routes: Vec<Route>,
    workers: Vec<JoinHandle<()>>,
    health: Arc<Health>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    cancel: CancellationToken,
}
impl Multiplexer {
    pub fn new(health: Arc<Health>) -> Self {
        Self {
            routes: vec![],
            workers: vec![],
            health,
            reports: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sends a report for every batch handled by sinks added afterwards.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<DeliveryReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Spawns the worker of `sink`; must be called inside a tokio runtime.
    pub fn add_sink(&mut self, sink: Arc<dyn Sink>, settings: SinkSettings) {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let name = sink.name().to_string();
        let worker = Worker {
            sink,
            settings,
            health: self.health.clone(),
            reports: self.reports.clone(),
            cancel: self.cancel.child_token(),
        };
        self.workers.push(tokio::spawn(worker.run(rx)));
        self.routes.push(Route { name, tx });
    }

    /// Queues `batch` on every sink. Returns how many sinks accepted it.
    pub fn export(&self, batch: Batch) -> usize {
        let batch = Arc::new(batch);
        let mut queued = 0;
        for route in &self.routes {
            let reason = match route.tx.try_send(batch.clone()) {
                Ok(()) => {
                    queued += 1;
                    continue;
                }
                Err(TrySendError::Full(_)) => DropReason::QueueFull,
                Err(TrySendError::Closed(_)) => DropReason::Closed,
            };
            tracing::warn!(sink = %route.name, ?reason, samples = batch.len(), "batch dropped");
            self.health.record_dropped();
            report(
                &self.reports,
                &route.name,
                &batch,
                DeliveryOutcome::Dropped {
                    attempts: 0,
                    reason,
                },
            );
        }
        queued
    }

    /// Stops accepting batches and lets the workers drain their queues for up
    /// to `grace`. After that, the batch in flight and everything still
    /// queued is dropped and reported as [`DropReason::Closed`].
    pub async fn close(self, grace: Duration) {
        let Self {
            routes,
            workers,
            cancel,
            ..
        } = self;
        drop(routes);
        let drained = futures::future::join_all(workers);
        tokio::pin!(drained);
        if tokio::time::timeout(grace, &mut drained).await.is_err() {
            tracing::warn!(?grace, "sink queues not drained in time, dropping the rest");
            cancel.cancel();
            drained.await;
        }
    }
}

fn report(
    reports: &Option<mpsc::UnboundedSender<DeliveryReport>>,
    sink: &str,
    batch: &Batch,
    outcome: DeliveryOutcome,
) {
    if let Some(reports) = reports {
        let _ = reports.send(DeliveryReport {
            sink: sink.to_string(),
            samples: batch.len(),
            outcome,
        });
    }
}

struct Worker {
    sink: Arc<dyn Sink>,
    settings: SinkSettings,
    health: Arc<Health>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    cancel: CancellationToken,
}
impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Arc<Batch>>) {
        let name = self.sink.name().to_string();
        while let Some(batch) = rx.recv().await {
            let outcome = deliver_with_retry(
                self.sink.as_ref(),
                &batch,
                &self.settings.retry,
                self.settings.timeout,
                &self.health,
                &self.cancel,
            )
            .await;
            match &outcome {
                DeliveryOutcome::Delivered { attempts } => {
                    self.health.record_delivered();
                    tracing::debug!(sink = %name, attempts, samples = batch.len(), "batch delivered");
                }
                DeliveryOutcome::Dropped { attempts, reason } => {
                    self.health.record_dropped();
                    tracing::error!(sink = %name, attempts, ?reason, samples = batch.len(), "batch dropped");
                }
            }
            report(&self.reports, &name, &batch, outcome);
        }
    }
}
