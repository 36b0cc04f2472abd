pub mod credentials;
pub mod descriptor;
pub mod host;
pub mod tcp;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;

use crate::{error::ScrapeError, Labels, Resource, Sample, Time};

pub use credentials::Credentials;
pub use descriptor::{ConnectionDescriptor, DescriptorError};

/// One value read by a probe, before it is stamped into a [`Sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub labels: Labels,
}
impl Reading {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            labels: Labels::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Scrape {
    pub samples: Vec<Sample>,
    /// Probes that failed while the others still produced samples.
    pub failures: Vec<ScrapeError>,
}

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    /// Attributes describing the monitored system; seeds the resource of
    /// every batch built from this source.
    fn resource(&self) -> Resource {
        Resource::from([("source.name".to_string(), self.name().to_string())])
    }
    async fn scrape(&self) -> Result<Scrape, ScrapeError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ScrapeError>;
}

#[async_trait]
pub trait Session: Send {
    async fn probe(&mut self, probe: &str) -> Result<Vec<Reading>, ScrapeError>;
}

/// Opens a fresh [`Session`] per scrape and runs each probe against it.
/// Only connection and auth failures abort the scrape.
pub struct ProbeSource {
    name: String,
    descriptor: ConnectionDescriptor,
    credentials: Option<Credentials>,
    connector: Arc<dyn Connector>,
    probes: Vec<String>,
    last_time: AtomicU64,
}
impl ProbeSource {
    pub fn new(
        name: impl Into<String>,
        descriptor: ConnectionDescriptor,
        credentials: Option<Credentials>,
        connector: Arc<dyn Connector>,
        probes: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor,
            credentials,
            connector,
            probes,
            last_time: AtomicU64::new(0),
        }
    }

    /// Never goes backwards, even if the wall clock does.
    fn stamp(&self) -> Time {
        let now = crate::now();
        let prev = self.last_time.fetch_max(now, Ordering::AcqRel);
        now.max(prev)
    }
}
impl core::fmt::Debug for ProbeSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProbeSource")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("credentials", &self.credentials)
            .field("probes", &self.probes)
            .finish()
    }
}

#[async_trait]
impl Source for ProbeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource(&self) -> Resource {
        let d = &self.descriptor;
        Resource::from([
            ("source.name".to_string(), self.name.clone()),
            ("db.system".to_string(), d.scheme.clone()),
            ("server.address".to_string(), d.host.clone()),
            ("server.port".to_string(), d.port.to_string()),
            ("db.service".to_string(), d.service.clone()),
        ])
    }

    async fn scrape(&self) -> Result<Scrape, ScrapeError> {
        let mut session = self
            .connector
            .connect(&self.descriptor, self.credentials.as_ref())
            .await?;
        let time = self.stamp();
        let mut scrape = Scrape::default();
        for probe in &self.probes {
            match session.probe(probe).await {
                Ok(readings) => {
                    scrape.samples.extend(readings.into_iter().map(|r| Sample {
                        name: format!("{}.{}", self.name, r.name),
                        time,
                        value: r.value,
                        unit: r.unit,
                        labels: r.labels,
                    }));
                }
                Err(e @ ScrapeError::Query { .. }) => scrape.failures.push(e),
                Err(e) => return Err(e),
            }
        }
        Ok(scrape)
    }
}
