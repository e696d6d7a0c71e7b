//! Error taxonomy for the onboard locator.
//!
//! Every fallible operation in this crate returns one of these kinds. There
//! are no ad-hoc string errors: callers match on the variant to decide
//! whether a tick should count a miss, suppress a position, or abort at
//! start-up.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    /// Malformed configuration, unreadable pack files, out-of-range coordinates.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Camera or serial port could not be opened.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Single-frame grab failure, single serial write failure, single
    /// candidate read failure. Always recoverable on the next tick.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Expected absence of a visual fix this tick; not a bug, just an
    /// observable outcome.
    #[error("no match")]
    NoMatch,

    /// Homography estimation failed or produced an unusable matrix.
    #[error("degenerate geometry: {0}")]
    Degenerate(String),

    /// Measurement failed Mahalanobis gating.
    #[error("gate rejected: innovation distance {0:.3} exceeds threshold")]
    GateRejected(f64),

    /// Position lies outside the configured geofence.
    #[error("safety violation: position outside geofence")]
    SafetyViolation,

    /// MSP/NMEA checksum generation impossible. Should be unreachable.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, LocatorError>;
