use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use poem::{
    get, handler,
    http::StatusCode,
    listener::TcpListener,
    middleware::AddData,
    web::{Data, Json},
    Endpoint, EndpointExt, Route, Server,
};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ScrapeError;

/// `0` means never.
#[derive(Debug, Default)]
struct Stamp(AtomicU64);
impl Stamp {
    fn set(&self, origin: Instant) {
        let ms = u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.0.store(ms.saturating_add(1), Ordering::Release);
    }
    fn age(&self, origin: Instant) -> Option<Duration> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            stamp => Some(origin.elapsed().saturating_sub(Duration::from_millis(stamp - 1))),
        }
    }
}

/// Ready means a scrape and an export both happened within the last two
/// collection intervals, and not every sink is stuck retrying.
#[derive(Debug)]
pub struct Health {
    origin: Instant,
    stale_after: Duration,
    sinks: usize,
    stopping: AtomicBool,
    degraded: AtomicBool,
    last_scrape: Stamp,
    last_export: Stamp,
    sinks_retrying: AtomicUsize,
    scrapes_ok: AtomicU64,
    scrapes_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    batches_delivered: AtomicU64,
    batches_dropped: AtomicU64,
}
impl Health {
    pub fn new(interval: Duration, sinks: usize) -> Self {
        Self {
            origin: Instant::now(),
            stale_after: interval * 2,
            sinks,
            stopping: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_scrape: Stamp::default(),
            last_export: Stamp::default(),
            sinks_retrying: AtomicUsize::new(0),
            scrapes_ok: AtomicU64::new(0),
            scrapes_failed: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
        }
    }

    pub fn record_scrape_ok(&self) {
        self.last_scrape.set(self.origin);
        self.scrapes_ok.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
    }

    /// A failed scrape still counts as a completed one.
    pub fn record_scrape_failure(&self, err: &ScrapeError) {
        self.last_scrape.set(self.origin);
        self.scrapes_failed.fetch_add(1, Ordering::Relaxed);
        if err.is_auth() {
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    pub fn record_skipped_tick(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery attempt finished, or a due flush found nothing to send.
    pub fn record_export(&self) {
        self.last_export.set(self.origin);
    }

    pub fn record_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_retrying(&self) {
        self.sinks_retrying.fetch_add(1, Ordering::AcqRel);
    }
    pub fn sink_settled(&self) {
        self.sinks_retrying.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        !self.stopping.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        let fresh = |stamp: &Stamp| matches!(stamp.age(self.origin), Some(age) if age <= self.stale_after);
        let all_retrying =
            self.sinks > 0 && self.sinks_retrying.load(Ordering::Acquire) >= self.sinks;
        self.is_live() && fresh(&self.last_scrape) && fresh(&self.last_export) && !all_retrying
    }

    pub fn snapshot(&self) -> Status {
        let ms = |stamp: &Stamp| {
            stamp
                .age(self.origin)
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX))
        };
        Status {
            live: self.is_live(),
            ready: self.is_ready(),
            degraded: self.is_degraded(),
            last_scrape_age_ms: ms(&self.last_scrape),
            last_export_age_ms: ms(&self.last_export),
            sinks: self.sinks,
            sinks_retrying: self.sinks_retrying.load(Ordering::Acquire),
            scrapes_ok: self.scrapes_ok.load(Ordering::Relaxed),
            scrapes_failed: self.scrapes_failed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub live: bool,
    pub ready: bool,
    pub degraded: bool,
    pub last_scrape_age_ms: Option<u64>,
    pub last_export_age_ms: Option<u64>,
    pub sinks: usize,
    pub sinks_retrying: usize,
    pub scrapes_ok: u64,
    pub scrapes_failed: u64,
    pub ticks_skipped: u64,
    pub batches_delivered: u64,
    pub batches_dropped: u64,
}

#[handler]
fn livez(Data(health): Data<&Arc<Health>>) -> (StatusCode, &'static str) {
    if health.is_live() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    }
}

#[handler]
fn readyz(Data(health): Data<&Arc<Health>>) -> (StatusCode, &'static str) {
    if health.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[handler]
fn status(Data(health): Data<&Arc<Health>>) -> Json<Status> {
    Json(health.snapshot())
}

pub fn routes(health: Arc<Health>) -> impl Endpoint {
    Route::new()
        .at("/livez", get(livez))
        .at("/readyz", get(readyz))
        .at("/status", get(status))
        .with(AddData::new(health))
}

pub async fn serve(
    listen: SocketAddr,
    health: Arc<Health>,
    stop: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!(%listen, "health endpoint listening");
    Server::new(TcpListener::bind(listen))
        .run_with_graceful_shutdown(routes(health), stop, Some(Duration::from_secs(1)))
        .await
}
