use crate::{Batch, Resource};

pub const HOST_NAME: &str = "host.name";
pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Resource attributes applied to every batch, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceAttributes {
    entries: Vec<(String, String)>,
}
impl ResourceAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes of this process: host name, a per-process instance id and
    /// the default service name.
    pub fn detect() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(sysinfo::System::host_name);
        let mut attrs = Self::new()
            .with(SERVICE_NAME, env!("CARGO_PKG_NAME"))
            .with(SERVICE_INSTANCE_ID, uuid::Uuid::new_v4().to_string());
        if let Some(host) = host {
            attrs = attrs.with(HOST_NAME, host);
        }
        attrs
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Appends `other` after `self`, so `other` wins on shared keys.
    pub fn overridden_by(mut self, other: ResourceAttributes) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { entries }
    }
}

/// Merges `attributes` into the batch resource. Configured attributes win
/// over the ones the source put there; among themselves the last one wins.
pub fn enrich(mut batch: Batch, attributes: &ResourceAttributes) -> Batch {
    let resource: &mut Resource = batch.resource_mut();
    for (key, value) in attributes.iter() {
        resource.insert(key.to_string(), value.to_string());
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;

    fn batch() -> Batch {
        let resource = Resource::from([
            ("source.name".to_string(), "oracledb".to_string()),
            ("deployment.environment".to_string(), "dev".to_string()),
        ]);
        Batch::new(resource, vec![Sample::new("oracledb.up", 1, 1.0)])
    }

    #[test]
    fn configured_attributes_win() {
        let attrs: ResourceAttributes = [
            ("deployment.environment", "staging"),
            ("deployment.environment", "prod"),
            ("service.name", "relay"),
        ]
        .into_iter()
        .collect();
        let batch = enrich(batch(), &attrs);
        assert_eq!(batch.resource()["deployment.environment"], "prod");
        assert_eq!(batch.resource()["service.name"], "relay");
        assert_eq!(batch.resource()["source.name"], "oracledb");
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn enrich_is_idempotent() {
        let attrs = ResourceAttributes::new()
            .with("k8s.namespace.name", "monitoring")
            .with("source.name", "renamed");
        let once = enrich(batch(), &attrs);
        let twice = enrich(once.clone(), &attrs);
        assert_eq!(once, twice);
    }

    #[test]
    fn static_overrides_detected() {
        let detected = ResourceAttributes::detect();
        assert!(detected.iter().any(|(k, _)| k == SERVICE_INSTANCE_ID));
        let merged = detected.overridden_by(ResourceAttributes::new().with(SERVICE_NAME, "mine"));
        let batch = enrich(batch(), &merged);
        assert_eq!(batch.resource()[SERVICE_NAME], "mine");
    }
}
