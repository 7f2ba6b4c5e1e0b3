//! Error taxonomy for the copier.
//!
//! Transport failures flip the owning adapter and its dependents to `error`;
//! execution failures stay scoped to one follower; license failures gate the
//! whole group; config failures are rejected before anything runs.

use rust_decimal::Decimal;
use thiserror::Error;

/// License validation failures.
#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license invalid: {0}")]
    Invalid(String),

    #[error("license expired")]
    Expired,

    #[error("license endpoint unreachable: {0}")]
    Network(String),

    #[error("license endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

/// Adapter/transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("adapter not connected")]
    NotConnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures executing a transformed command on a follower.
#[derive(Debug, Error)]
pub enum CopyExecutionError {
    #[error("rejected by broker: {0}")]
    RejectedByBroker(String),

    #[error("partial fill: requested {requested}, filled {filled}")]
    PartialFill { requested: Decimal, filled: Decimal },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invalid copier configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lot multiplier must be > 0, got {0}")]
    InvalidLotMultiplier(Decimal),

    #[error("invalid symbol mapping for {0}: empty target")]
    InvalidSymbolMapping(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),
}
