//! Canonical trade event model shared by every platform adapter.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    /// Opposite direction, used when a follower runs in reverse (hedge) mode.
    pub fn inverted(&self) -> Self {
        match self {
            TradeAction::Buy => TradeAction::Sell,
            TradeAction::Sell => TradeAction::Buy,
        }
    }
}

/// What happened on the leader account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeEventKind {
    Open,
    Close,
    Modify,
}

impl TradeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeEventKind::Open => "open",
            TradeEventKind::Close => "close",
            TradeEventKind::Modify => "modify",
        }
    }
}

/// Canonical trade event, produced by the normalizer from platform-native
/// payloads. Everything downstream of an adapter works on this type only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Position ticket on the leader terminal. Unique per leader account;
    /// also the dedupe key for duplicate delivery.
    pub leader_ticket: i64,

    /// Leader-side symbol, possibly carrying a broker suffix (e.g. "EURUSD.m")
    pub symbol: String,

    pub action: TradeAction,

    pub kind: TradeEventKind,

    /// Volume in lots
    pub volume: Decimal,

    /// Execution price on the leader account
    pub price: Decimal,

    /// Realized profit, present on close events
    #[serde(default)]
    pub profit: Option<Decimal>,

    /// EA magic number attached to the leader order, if any
    #[serde(default)]
    pub magic: Option<i64>,

    pub timestamp: DateTime<Utc>,

    /// Leader account the event originated from
    pub source_account_id: String,
}

/// Command dispatched to a follower adapter after the transform pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyCommand {
    /// Leader ticket the command derives from; echoed into the order comment
    /// so reconciliation can map broker positions back to their source.
    pub leader_ticket: i64,

    /// Follower-side symbol after alias mapping and suffix append
    pub symbol: String,

    pub action: TradeAction,

    pub kind: TradeEventKind,

    /// Target volume in lots after multiplier and lot-step normalization
    pub volume: Decimal,

    /// Leader price, advisory only; followers fill at market
    pub price: Decimal,

    #[serde(default)]
    pub magic: Option<i64>,

    /// Order comment tag, e.g. "hedgesync:184467"
    pub comment: String,
}

impl CopyCommand {
    /// Comment tag that marks a broker position as owned by this copier.
    pub fn comment_tag(leader_ticket: i64) -> String {
        format!("hedgesync:{}", leader_ticket)
    }

    /// Parse a leader ticket back out of an order comment, if it is ours.
    pub fn ticket_from_comment(comment: &str) -> Option<i64> {
        comment.strip_prefix("hedgesync:")?.parse().ok()
    }
}

/// Response returned by an adapter for a dispatched command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,

    /// Ticket assigned on the follower terminal
    #[serde(default)]
    pub ticket: Option<i64>,

    /// Fill price on the follower terminal
    #[serde(default)]
    pub price: Option<Decimal>,

    /// Volume actually filled, when the terminal reports it; absent means
    /// the full requested volume.
    #[serde(default, rename = "filled")]
    pub filled_volume: Option<Decimal>,

    #[serde(default)]
    pub error: Option<String>,
}
