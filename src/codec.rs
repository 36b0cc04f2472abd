use std::io::Write;

use flate2::{write::GzEncoder, Compression as GzLevel};
use opentelemetry_proto::tonic::{
    collector::metrics::v1::ExportMetricsServiceRequest,
    common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue},
    metrics::v1::{
        metric::Data, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics,
        ScopeMetrics,
    },
    resource::v1::Resource as OtlpResource,
};
use prost::Message;
use serde::Deserialize;

use crate::{error::DeliveryError, Batch, Sample};

const NANOS_PER_MILLI: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

pub fn encode_attributes<'a>(
    attrs: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Vec<KeyValue> {
    attrs
        .into_iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.clone())),
            }),
        })
        .collect()
}

fn encode_point(sample: &Sample) -> NumberDataPoint {
    NumberDataPoint {
        attributes: encode_attributes(&sample.labels),
        time_unix_nano: sample.time.saturating_mul(NANOS_PER_MILLI),
        value: Some(number_data_point::Value::AsDouble(sample.value)),
        ..Default::default()
    }
}

/// One gauge per metric name, in order of first appearance.
pub fn encode_metrics(samples: &[Sample]) -> Vec<Metric> {
    let mut metrics: Vec<Metric> = vec![];
    for sample in samples {
        let point = encode_point(sample);
        let existing = metrics
            .iter_mut()
            .find(|m| m.name == sample.name && m.unit == sample.unit);
        match existing {
            Some(Metric {
                data: Some(Data::Gauge(gauge)),
                ..
            }) => gauge.data_points.push(point),
            _ => metrics.push(Metric {
                name: sample.name.clone(),
                unit: sample.unit.clone(),
                data: Some(Data::Gauge(Gauge {
                    data_points: vec![point],
                })),
                ..Default::default()
            }),
        }
    }
    metrics
}

pub fn encode_request(batch: &Batch) -> ExportMetricsServiceRequest {
    let scope = InstrumentationScope {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    };
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(OtlpResource {
                attributes: encode_attributes(batch.resource()),
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(scope),
                metrics: encode_metrics(batch.samples()),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// Protobuf body for OTLP/HTTP. A payload that cannot be encoded will never
/// be deliverable, so encoding failures are permanent.
pub fn encode_body(batch: &Batch, compression: Compression) -> Result<Vec<u8>, DeliveryError> {
    let body = encode_request(batch).encode_to_vec();
    match compression {
        Compression::None => Ok(body),
        Compression::Gzip => {
            let mut wtr = GzEncoder::new(Vec::with_capacity(body.len() / 2), GzLevel::default());
            wtr.write_all(&body)
                .and_then(|()| wtr.finish())
                .map_err(|e| DeliveryError::Permanent(format!("gzip: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::Resource;

    fn batch() -> Batch {
        let resource = Resource::from([("service.name".to_string(), "relay".to_string())]);
        Batch::new(
            resource,
            vec![
                Sample::new("db.sessions", 1_000, 3.0).with_label("pdb", "A"),
                Sample::new("db.up", 1_000, 1.0),
                Sample::new("db.sessions", 1_000, 5.0).with_label("pdb", "B"),
            ],
        )
    }

    #[test]
    fn groups_points_by_metric() {
        let request = encode_request(&batch());
        let rm = &request.resource_metrics[0];
        let attrs = &rm.resource.as_ref().unwrap().attributes;
        assert_eq!(attrs[0].key, "service.name");
        let metrics = &rm.scope_metrics[0].metrics;
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["db.sessions", "db.up"]);
        let Some(Data::Gauge(gauge)) = &metrics[0].data else {
            panic!("expected gauge");
        };
        assert_eq!(gauge.data_points.len(), 2);
        assert_eq!(gauge.data_points[0].time_unix_nano, 1_000_000_000);
        assert_eq!(gauge.data_points[1].attributes[0].key, "pdb");
    }

    #[test]
    fn gzip_body_decodes() {
        let body = encode_body(&batch(), Compression::Gzip).unwrap();
        let mut raw = vec![];
        GzDecoder::new(&body[..]).read_to_end(&mut raw).unwrap();
        let decoded = ExportMetricsServiceRequest::decode(&raw[..]).unwrap();
        assert_eq!(decoded, encode_request(&batch()));
        let plain = encode_body(&batch(), Compression::None).unwrap();
        assert_eq!(plain, raw);
    }
}
