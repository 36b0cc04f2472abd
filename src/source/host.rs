use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::System;

use super::{ConnectionDescriptor, Connector, Credentials, Reading, Session};
use crate::error::ScrapeError;

pub const PROBES: &[&str] = &["cpu.utilization", "memory.used", "memory.total"];

/// Statistics of the machine the relay runs on. The descriptor is ignored.
///
/// CPU usage is computed between two refreshes, so the first scrape reports
/// zero.
#[derive(Debug, Clone)]
pub struct HostConnector {
    system: Arc<Mutex<System>>,
}
impl HostConnector {
    pub fn new() -> Self {
        let system = Arc::new(Mutex::new(System::new()));
        Self { system }
    }
}
impl Default for HostConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HostConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ScrapeError> {
        let mut sys = self.system.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Ok(Box::new(HostSession {
            cpu: sys.global_cpu_usage(),
            memory_used: sys.used_memory(),
            memory_total: sys.total_memory(),
        }))
    }
}

#[derive(Debug)]
struct HostSession {
    cpu: f32,
    memory_used: u64,
    memory_total: u64,
}

#[async_trait]
impl Session for HostSession {
    async fn probe(&mut self, probe: &str) -> Result<Vec<Reading>, ScrapeError> {
        let reading = match probe {
            "cpu.utilization" => Reading::new(probe, f64::from(self.cpu), "%"),
            "memory.used" => Reading::new(probe, self.memory_used as f64, "By"),
            "memory.total" => Reading::new(probe, self.memory_total as f64, "By"),
            _ => {
                return Err(ScrapeError::Query {
                    probe: probe.to_string(),
                    reason: "unknown host probe".to_string(),
                })
            }
        };
        Ok(vec![reading])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_memory() {
        let descriptor: ConnectionDescriptor = "host://localhost:0/".parse().unwrap();
        let mut session = HostConnector::new().connect(&descriptor, None).await.unwrap();
        let total = session.probe("memory.total").await.unwrap();
        assert!(total[0].value > 0.0);
        assert!(session.probe("disk.used").await.is_err());
    }
}
