use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    aggregator::BatchConfig,
    codec::Compression,
    enrich::ResourceAttributes,
    retry::RetryPolicy,
    scheduler::ScheduleConfig,
    sink::{
        file::RotationPolicy,
        log::{Sampler, Verbosity},
        otlp::{self, Protocol},
    },
    source::{ConnectionDescriptor, Credentials, DescriptorError},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("source `{source_name}`: {error}")]
    Descriptor {
        source_name: String,
        error: DescriptorError,
    },
    #[error("{0}")]
    Invalid(String),
}

mod duration {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub batch: BatchSection,
    /// Static resource attributes; they override detected ones.
    #[serde(default)]
    pub resource: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionConfig {
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,
    /// Defaults to `interval`.
    #[serde(default, with = "duration::option")]
    pub scrape_timeout: Option<Duration>,
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,
}
impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            scrape_timeout: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSection {
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
    #[serde(default)]
    pub send_batch_max_size: usize,
    /// Defaults to the collection interval.
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
}
impl Default for BatchSection {
    fn default() -> Self {
        Self {
            send_batch_size: default_send_batch_size(),
            send_batch_max_size: 0,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_listen")]
    pub listen: SocketAddr,
}
impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_health_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}
impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Tcp,
    Host,
}
impl ConnectorKind {
    pub fn default_probes(self) -> &'static [&'static str] {
        match self {
            Self::Tcp => crate::source::tcp::PROBES,
            Self::Host => crate::source::host::PROBES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub connector: ConnectorKind,
    /// Connection descriptor; optional for `host`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Defaults to every probe the connector knows.
    #[serde(default)]
    pub probes: Option<Vec<String>>,
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}
impl SourceConfig {
    pub fn descriptor(&self) -> Result<ConnectionDescriptor, ConfigError> {
        let endpoint = match (&self.endpoint, self.connector) {
            (Some(endpoint), _) => endpoint.as_str(),
            (None, ConnectorKind::Host) => "host://localhost:0/",
            (None, ConnectorKind::Tcp) => {
                return Err(ConfigError::Invalid(format!(
                    "source `{}`: `endpoint` is required",
                    self.name
                )))
            }
        };
        endpoint.parse().map_err(|error| ConfigError::Descriptor {
            source_name: self.name.clone(),
            error,
        })
    }

    pub fn probes(&self) -> Vec<String> {
        match &self.probes {
            Some(probes) => probes.clone(),
            None => self
                .connector
                .default_probes()
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// The password is never written in the config file itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    pub username: String,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}
impl CredentialsConfig {
    pub fn resolve(&self) -> Result<Credentials, ConfigError> {
        let password = match (&self.password_env, &self.password_file) {
            (Some(var), None) => std::env::var(var).map_err(|_| {
                ConfigError::Invalid(format!("environment variable `{var}` is not set"))
            })?,
            (None, Some(path)) => fs::read_to_string(path)
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?
                .trim_end_matches(['\r', '\n'])
                .to_string(),
            _ => {
                return Err(ConfigError::Invalid(
                    "credentials need exactly one of `password_env` or `password_file`".into(),
                ))
            }
        };
        Ok(Credentials::new(self.username.clone(), password))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_interval", with = "duration")]
    pub initial_interval: Duration,
    #[serde(default = "default_max_interval", with = "duration")]
    pub max_interval: Duration,
    #[serde(default = "default_max_elapsed_time", with = "duration")]
    pub max_elapsed_time: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            max_elapsed_time: default_max_elapsed_time(),
            multiplier: default_multiplier(),
        }
    }
}
impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        RetryPolicy {
            enabled: c.enabled,
            initial_interval: c.initial_interval,
            max_interval: c.max_interval,
            max_elapsed_time: c.max_elapsed_time,
            multiplier: c.multiplier,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Batches waiting for this sink before new ones are dropped.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Ceiling on a single delivery attempt.
    #[serde(default = "default_sink_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkKind {
    Otlp(OtlpConfig),
    File(FileConfig),
    Log(LogSinkConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtlpConfig {
    pub endpoint: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub compression: Compression,
    /// Values may reference the environment as `${VAR}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl OtlpConfig {
    /// Checks what the sink would otherwise only reject when built.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.protocol {
            Protocol::Http => {
                url::Url::parse(&otlp::metrics_url(&self.endpoint))
                    .with_context(|| format!("invalid endpoint `{}`", self.endpoint))?;
            }
            Protocol::Grpc => {
                otlp::grpc_endpoint(&self.endpoint)?;
            }
        }
        otlp::metadata(&self.headers)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default, with = "duration::option")]
    pub max_age: Option<Duration>,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}
impl FileConfig {
    pub fn rotation(&self) -> RotationPolicy {
        RotationPolicy {
            max_size_bytes: self.max_size_mb.saturating_mul(1024 * 1024),
            max_age: self.max_age,
            max_backups: self.max_backups,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSinkConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default = "default_sampling_initial")]
    pub sampling_initial: u64,
    #[serde(default = "default_sampling_thereafter")]
    pub sampling_thereafter: u64,
}
impl LogSinkConfig {
    pub fn sampler(&self) -> Sampler {
        Sampler::new(
            self.sampling_initial,
            self.sampling_thereafter,
            Duration::from_secs(1),
        )
    }
}

fn default_true() -> bool {
    true
}
fn default_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}
fn default_send_batch_size() -> usize {
    8192
}
fn default_health_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 13133))
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_initial_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_elapsed_time() -> Duration {
    Duration::from_secs(300)
}
fn default_multiplier() -> f64 {
    1.5
}
fn default_queue_size() -> usize {
    1000
}
fn default_sink_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_size_mb() -> u64 {
    100
}
fn default_max_backups() -> usize {
    5
}
fn default_sampling_initial() -> u64 {
    2
}
fn default_sampling_thereafter() -> u64 {
    500
}

/// Replaces `$VAR` and `${VAR}` with the value of environment variable `VAR`.
pub fn expand_env(value: &str) -> Result<String, ConfigError> {
    shellexpand::env(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| ConfigError::Invalid(format!("`{value}`: {e}")))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses, expands header references and validates.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        for sink in &mut config.sinks {
            if let SinkKind::Otlp(otlp) = &mut sink.kind {
                for value in otlp.headers.values_mut() {
                    *value = expand_env(value)?;
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.collection.interval.is_zero() {
            return invalid("collection.interval must be greater than zero".into());
        }
        if self.schedule().scrape_timeout.is_zero() {
            return invalid("collection.scrape_timeout must be greater than zero".into());
        }
        if self.batch.send_batch_size == 0 {
            return invalid("batch.send_batch_size must be greater than zero".into());
        }
        if self.batch.send_batch_max_size != 0
            && self.batch.send_batch_max_size < self.batch.send_batch_size
        {
            return invalid("batch.send_batch_max_size must be 0 or >= send_batch_size".into());
        }
        if self.sources.is_empty() {
            return invalid("at least one source is required".into());
        }
        if self.sinks.is_empty() {
            return invalid("at least one sink is required".into());
        }
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(&source.name) {
                return invalid(format!("duplicate source name `{}`", source.name));
            }
            source.descriptor()?;
            if let Some(probes) = &source.probes {
                if probes.is_empty() {
                    return invalid(format!("source `{}` has an empty probe list", source.name));
                }
            }
            if let Some(creds) = &source.credentials {
                creds.resolve()?;
            }
        }
        let mut names = std::collections::HashSet::new();
        for sink in &self.sinks {
            if !names.insert(&sink.name) {
                return invalid(format!("duplicate sink name `{}`", sink.name));
            }
            if sink.queue_size == 0 {
                return invalid(format!("sink `{}`: queue_size must be greater than zero", sink.name));
            }
            RetryPolicy::from(&sink.retry)
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("sink `{}`: retry: {e}", sink.name)))?;
            if let SinkKind::Otlp(otlp) = &sink.kind {
                otlp.validate()
                    .map_err(|e| ConfigError::Invalid(format!("sink `{}`: {e:#}", sink.name)))?;
            }
        }
        Ok(())
    }

    pub fn schedule(&self) -> ScheduleConfig {
        let interval = self.collection.interval;
        ScheduleConfig {
            interval,
            scrape_timeout: self.collection.scrape_timeout.unwrap_or(interval),
            shutdown_grace: self.collection.shutdown_grace,
        }
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            send_batch_size: self.batch.send_batch_size,
            send_batch_max_size: self.batch.send_batch_max_size,
            timeout: self.batch.timeout.unwrap_or(self.collection.interval),
        }
    }

    /// Detected attributes overridden by the configured ones.
    pub fn resource_attributes(&self) -> ResourceAttributes {
        let configured = self.resource.iter().collect::<ResourceAttributes>();
        ResourceAttributes::detect().overridden_by(configured)
    }
}
