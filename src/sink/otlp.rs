use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use serde::Deserialize;
use tonic::{
    codec::CompressionEncoding,
    metadata::{AsciiMetadataKey, AsciiMetadataValue},
    transport::{Channel, Endpoint},
    Code, Status,
};

use super::Sink;
use crate::{
    codec::{self, Compression},
    config::OtlpConfig,
    error::DeliveryError,
    Batch,
};

const METRICS_PATH: &str = "/v1/metrics";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
}

pub fn build(
    name: String,
    config: &OtlpConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn Sink>> {
    let headers = config.headers.clone();
    let sink: Arc<dyn Sink> = match config.protocol {
        Protocol::Http => Arc::new(HttpSink::new(
            name,
            &config.endpoint,
            headers,
            config.compression,
            timeout,
        )),
        Protocol::Grpc => Arc::new(GrpcSink::new(
            name,
            &config.endpoint,
            &headers,
            config.compression,
            timeout,
        )?),
    };
    Ok(sink)
}

/// Appends the OTLP metrics path unless the endpoint already names it.
pub fn metrics_url(endpoint: &str) -> String {
    if endpoint.ends_with(METRICS_PATH) {
        return endpoint.to_string();
    }
    format!("{}{METRICS_PATH}", endpoint.trim_end_matches('/'))
}

/// Server errors, 408 and 429 are worth retrying; any other 4xx is final.
pub fn retryable_status(code: u16) -> bool {
    matches!(code, 408 | 429 | 500..=599)
}

fn classify_http(err: ureq::Error) -> DeliveryError {
    match err {
        ureq::Error::Status(code, _) if retryable_status(code) => {
            DeliveryError::Transient(format!("server responded {code}"))
        }
        ureq::Error::Status(code, _) => {
            DeliveryError::Permanent(format!("server responded {code}"))
        }
        ureq::Error::Transport(t) => DeliveryError::Transient(t.to_string()),
    }
}

#[derive(Debug)]
pub struct HttpSink {
    name: String,
    agent: ureq::Agent,
    url: String,
    headers: BTreeMap<String, String>,
    compression: Compression,
}
impl HttpSink {
    pub fn new(
        name: String,
        endpoint: &str,
        headers: BTreeMap<String, String>,
        compression: Compression,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            name,
            agent,
            url: metrics_url(endpoint),
            headers,
            compression,
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let body = codec::encode_body(batch, self.compression)?;
        let mut req = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/x-protobuf");
        if self.compression == Compression::Gzip {
            req = req.set("Content-Encoding", "gzip");
        }
        for (key, value) in &self.headers {
            req = req.set(key, value);
        }
        // Blocking I/O
        tokio::task::spawn_blocking(move || req.send_bytes(&body))
            .await
            .map_err(|e| DeliveryError::Transient(format!("export task: {e}")))?
            .map(|_resp| ())
            .map_err(classify_http)
    }
}

fn classify_status(status: &Status) -> DeliveryError {
    match status.code() {
        Code::Cancelled
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable
        | Code::DataLoss => DeliveryError::Transient(status.to_string()),
        _ => DeliveryError::Permanent(status.to_string()),
    }
}

#[derive(Debug)]
pub struct GrpcSink {
    name: String,
    client: MetricsServiceClient<Channel>,
    headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}
impl GrpcSink {
    /// Connects lazily on first delivery; must be called inside a tokio
    /// runtime.
    pub fn new(
        name: String,
        endpoint: &str,
        headers: &BTreeMap<String, String>,
        compression: Compression,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let channel = grpc_endpoint(endpoint)?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        let mut client = MetricsServiceClient::new(channel);
        if compression == Compression::Gzip {
            client = client.send_compressed(CompressionEncoding::Gzip);
        }
        Ok(Self {
            name,
            client,
            headers: metadata(headers)?,
        })
    }
}

pub fn grpc_endpoint(endpoint: &str) -> anyhow::Result<Endpoint> {
    Endpoint::from_shared(endpoint.to_string())
        .with_context(|| format!("invalid gRPC endpoint `{endpoint}`"))
}

/// Header names are lowercased; values must be visible ASCII.
pub fn metadata(
    headers: &BTreeMap<String, String>,
) -> anyhow::Result<Vec<(AsciiMetadataKey, AsciiMetadataValue)>> {
    headers
        .iter()
        .map(|(name, value)| {
            let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
                .with_context(|| format!("invalid header name `{name}`"))?;
            let value = AsciiMetadataValue::try_from(value.as_str())
                .with_context(|| format!("invalid value for header `{name}`"))?;
            Ok((key, value))
        })
        .collect()
}

#[async_trait]
impl Sink for GrpcSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let mut request = tonic::Request::new(codec::encode_request(batch));
        for (key, value) in &self.headers {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        let mut client = self.client.clone();
        let response = client
            .export(request)
            .await
            .map_err(|status| classify_status(&status))?
            .into_inner();
        if let Some(partial) = response.partial_success {
            if partial.rejected_data_points > 0 {
                tracing::warn!(
                    sink = %self.name,
                    rejected = partial.rejected_data_points,
                    message = %partial.error_message,
                    "backend rejected part of a batch"
                );
            }
        }
        Ok(())
    }
}
