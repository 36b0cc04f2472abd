use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::TcpStream, time::Instant};

use super::{ConnectionDescriptor, Connector, Credentials, Reading, Session};
use crate::error::ScrapeError;

pub const PROBES: &[&str] = &["up", "connect.duration"];

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}
impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ScrapeError> {
        let target = descriptor.target();
        let start = Instant::now();
        let connect = TcpStream::connect((descriptor.host.as_str(), descriptor.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_stream)) => Ok(Box::new(TcpSession {
                connect_duration: start.elapsed(),
            })),
            Ok(Err(e)) => Err(ScrapeError::Connection {
                target,
                reason: e.to_string(),
            }),
            Err(_) => Err(ScrapeError::Connection {
                target,
                reason: format!("connect timed out after {:?}", self.connect_timeout),
            }),
        }
    }
}

#[derive(Debug)]
struct TcpSession {
    connect_duration: Duration,
}

#[async_trait]
impl Session for TcpSession {
    async fn probe(&mut self, probe: &str) -> Result<Vec<Reading>, ScrapeError> {
        let reading = match probe {
            "up" => Reading::new("up", 1.0, "1"),
            "connect.duration" => Reading::new(
                "connect.duration",
                self.connect_duration.as_secs_f64() * 1000.0,
                "ms",
            ),
            _ => {
                return Err(ScrapeError::Query {
                    probe: probe.to_string(),
                    reason: "unknown tcp probe".to_string(),
                })
            }
        };
        Ok(vec![reading])
    }
}
