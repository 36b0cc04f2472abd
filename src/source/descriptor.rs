use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("invalid connection descriptor: {0}")]
    Parse(String),
    #[error("connection descriptor has no host")]
    MissingHost,
    #[error("connection descriptor has no port and scheme `{0}` has no default")]
    MissingPort(String),
    #[error("credentials must not be embedded in the connection descriptor")]
    EmbeddedCredentials,
    #[error("invalid value `{value}` for flag `{flag}`")]
    InvalidFlag { flag: String, value: String },
}

/// Where and how to reach a monitored system:
/// `scheme://host[:port]/service[?tls=true&tls_verify=false&...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub service: String,
    pub tls: bool,
    pub tls_verify: bool,
    pub params: BTreeMap<String, String>,
}
impl ConnectionDescriptor {
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "oracle" | "oracledb" => Some(1521),
        "postgres" | "postgresql" => Some(5432),
        "mysql" => Some(3306),
        _ => None,
    }
}

fn parse_flag(flag: &str, value: &str) -> Result<bool, DescriptorError> {
    match value {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(DescriptorError::InvalidFlag {
            flag: flag.to_string(),
            value: value.to_string(),
        }),
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| DescriptorError::Parse(e.to_string()))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(DescriptorError::EmbeddedCredentials);
        }
        let scheme = url.scheme().to_string();
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(DescriptorError::MissingHost),
        };
        let port = url
            .port()
            .or_else(|| default_port(&scheme))
            .ok_or_else(|| DescriptorError::MissingPort(scheme.clone()))?;
        let service = url.path().trim_matches('/').to_string();
        let mut tls = false;
        let mut tls_verify = true;
        let mut params = BTreeMap::new();
        for (key, value) in url.query_pairs() {
            match &*key {
                "tls" => tls = parse_flag("tls", &value)?,
                "tls_verify" | "insecure_skip_verify" => {
                    let flag = parse_flag(&key, &value)?;
                    tls_verify = if key == "tls_verify" { flag } else { !flag };
                }
                _ => {
                    params.insert(key.into_owned(), value.into_owned());
                }
            }
        }
        Ok(Self {
            scheme,
            host,
            port,
            service,
            tls,
            tls_verify,
            params,
        })
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/{}", self.scheme, self.host, self.port, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oracle_descriptor() {
        let d: ConnectionDescriptor = "oracle://db.internal:1522/ORCLPDB1?tls=true&tls_verify=false"
            .parse()
            .unwrap();
        assert_eq!(d.scheme, "oracle");
        assert_eq!(d.host, "db.internal");
        assert_eq!(d.port, 1522);
        assert_eq!(d.service, "ORCLPDB1");
        assert!(d.tls);
        assert!(!d.tls_verify);
        assert_eq!(d.target(), "db.internal:1522");
    }

    #[test]
    fn default_port_by_scheme() {
        let d: ConnectionDescriptor = "oracle://db/FREE".parse().unwrap();
        assert_eq!(d.port, 1521);
        assert!(d.tls_verify);
        let err = "tcp://db/FREE".parse::<ConnectionDescriptor>().unwrap_err();
        assert_eq!(err, DescriptorError::MissingPort("tcp".into()));
    }

    #[test]
    fn rejects_embedded_credentials() {
        let err = "oracle://system:hunter2@db:1521/FREE"
            .parse::<ConnectionDescriptor>()
            .unwrap_err();
        assert_eq!(err, DescriptorError::EmbeddedCredentials);
    }

    #[test]
    fn keeps_unknown_params() {
        let d: ConnectionDescriptor = "oracle://db:1521/FREE?insecure_skip_verify=yes&pool=4"
            .parse()
            .unwrap();
        assert!(!d.tls_verify);
        assert_eq!(d.params.get("pool").map(String::as_str), Some("4"));
    }

    #[test]
    fn rejects_bad_flag() {
        let err = "oracle://db:1521/FREE?tls=maybe"
            .parse::<ConnectionDescriptor>()
            .unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidFlag { .. }));
    }
}
