//! Core utilities and shared types for the mdstest engine.

pub mod model;
pub mod ports;
pub mod ratelimiter;

pub use model::*;
pub use ports::{Port, PortRange, PortRangeError};

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Terminal failure classes surfaced by the engine.
///
/// Device-side: `Unreachable`, `Timeout`, `ProtocolError`.
/// Backend-side: `ComposeFailed`, `ValidateFailed`, `DecodeFailed`.
/// Local: `RegistryPersistFailure`. `Cancelled` and `Aborted` only appear in run
/// reports, for test cases that never reached validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Unreachable,
    Timeout,
    ProtocolError,
    ComposeFailed,
    ValidateFailed,
    DecodeFailed,
    RegistryPersistFailure,
    Cancelled,
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Unreachable => "Unreachable",
            FailureKind::Timeout => "Timeout",
            FailureKind::ProtocolError => "ProtocolError",
            FailureKind::ComposeFailed => "ComposeFailed",
            FailureKind::ValidateFailed => "ValidateFailed",
            FailureKind::DecodeFailed => "DecodeFailed",
            FailureKind::RegistryPersistFailure => "RegistryPersistFailure",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// RFC3339 UTC timestamp used for records and reports.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
