//! Account snapshot reported by a terminal: balance, equity, open positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeAction;

/// A position currently open on a broker terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: i64,
    pub symbol: String,
    pub action: TradeAction,
    pub volume: Decimal,
    pub price_open: Decimal,
    pub profit: Decimal,

    #[serde(default)]
    pub magic: Option<i64>,

    #[serde(default)]
    pub comment: String,
}

/// Periodic account state emitted by an adapter's status channel and queried
/// during crash-recovery reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub margin_free: Decimal,

    /// Sum of unrealized P&L across open positions
    pub floating_pnl: Decimal,

    pub positions: Vec<BrokerPosition>,
    pub timestamp: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Positions opened by this copier, keyed by the leader ticket encoded
    /// in the order comment.
    pub fn copied_positions(&self) -> impl Iterator<Item = (i64, &BrokerPosition)> {
        self.positions.iter().filter_map(|p| {
            crate::models::CopyCommand::ticket_from_comment(&p.comment).map(|t| (t, p))
        })
    }
}
