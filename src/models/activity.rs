//! Append-only activity records: one row per copy attempt, never mutated.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeAction;

/// Classification of an activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Open,
    Close,
    Modify,
    Error,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Open => "open",
            ActivityKind::Close => "close",
            ActivityKind::Modify => "modify",
            ActivityKind::Error => "error",
        }
    }
}

/// Outcome of a copy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Failed => "failed",
        }
    }
}

/// One copy attempt. Group and follower are referenced by opaque id only so
/// log rows never hold live configuration references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierActivityEntry {
    pub id: String,
    pub group_id: String,
    pub follower_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub symbol: String,
    pub action: TradeAction,
    pub volume: Decimal,
    pub price: Decimal,
    pub latency_ms: u64,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
}

impl CopierActivityEntry {
    pub fn is_success(&self) -> bool {
        self.status == ActivityStatus::Success
    }
}
