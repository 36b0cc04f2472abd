use std::time::Duration;

use thiserror::Error;

/// Failures of a single scrape. None of them are fatal to the process; the
/// scheduler records them and tries again on the next tick.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },
    /// Stays failing until the credentials are corrected externally.
    #[error("credentials rejected by {target}")]
    Auth { target: String },
    #[error("probe `{probe}` failed: {reason}")]
    Query { probe: String, reason: String },
    #[error("scrape did not finish within {0:?}")]
    Timeout(Duration),
}
impl ScrapeError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The batch can never be delivered to this sink, e.g. a malformed payload.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}
impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}
