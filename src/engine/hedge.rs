//! Hedge accounting.
//!
//! A follower in reverse mode exists to offset the leader's P&L. Both sides
//! are measured against immutable baselines captured at group creation, so
//! the numbers stay scoped to this group's lifetime regardless of what else
//! happens on the accounts.

use rust_decimal::Decimal;

/// Point-in-time view of how well a follower offsets its leader.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeHealth {
    /// Leader P&L accrued since the group baseline.
    pub expected: Decimal,

    /// Follower P&L actually realized, including floating positions.
    pub realized: Decimal,

    /// expected - realized. Nonzero means slippage, partial fills or missed
    /// copies have opened a gap.
    pub discrepancy: Decimal,
}

impl HedgeHealth {
    pub fn assess(
        current_leader_pnl: Decimal,
        leader_baseline_pnl: Decimal,
        follower_balance: Decimal,
        follower_baseline_balance: Decimal,
        follower_floating_pnl: Decimal,
    ) -> Self {
        let expected = expected_hedge(current_leader_pnl, leader_baseline_pnl);
        let realized = realized_hedge(
            follower_balance,
            follower_baseline_balance,
            follower_floating_pnl,
        );
        Self {
            expected,
            realized,
            discrepancy: expected - realized,
        }
    }

    /// True when the gap exceeds the given absolute threshold.
    pub fn is_material(&self, threshold: Decimal) -> bool {
        self.discrepancy.abs() > threshold
    }
}

pub fn expected_hedge(current_leader_pnl: Decimal, leader_baseline_pnl: Decimal) -> Decimal {
    current_leader_pnl - leader_baseline_pnl
}

pub fn realized_hedge(
    follower_balance: Decimal,
    follower_baseline_balance: Decimal,
    follower_floating_pnl: Decimal,
) -> Decimal {
    (follower_balance - follower_baseline_balance) + follower_floating_pnl
}
