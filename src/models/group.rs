//! Copier group and follower configuration.
//!
//! A group wires one leader account to a set of follower accounts. The group
//! owns its followers by value; the activity log references both only by id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Trading platform a terminal runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mt5,
    Mt4,
    Ctrader,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mt5 => "mt5",
            Platform::Mt4 => "mt4",
            Platform::Ctrader => "ctrader",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mt5" => Ok(Platform::Mt5),
            "mt4" => Ok(Platform::Mt4),
            "ctrader" => Ok(Platform::Ctrader),
            other => Err(ConfigError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Lifecycle status of a copier group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Paused,
    Error,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Paused => "paused",
            GroupStatus::Error => "error",
        }
    }
}

/// Lifecycle status of a follower within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowerStatus {
    Active,
    Paused,
    Error,
    Pending,
}

impl FollowerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowerStatus::Active => "active",
            FollowerStatus::Paused => "paused",
            FollowerStatus::Error => "error",
            FollowerStatus::Pending => "pending",
        }
    }
}

/// Per-symbol override: maps a leader symbol to a follower symbol, with an
/// optional lot multiplier that takes precedence over the follower default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRule {
    pub target: String,

    #[serde(default)]
    pub lot_multiplier: Option<Decimal>,
}

/// Lot constraints of the follower terminal, applied after the multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotSpec {
    pub step: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

impl Default for LotSpec {
    fn default() -> Self {
        Self {
            step: Decimal::new(1, 2),  // 0.01
            min: Decimal::new(1, 2),   // 0.01
            max: Decimal::from(100),
        }
    }
}

/// Rolling statistics for one follower.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowerStats {
    pub trades_today: u64,
    pub trades_total: u64,
    pub failed_copies: u64,
    pub total_profit: Decimal,
    pub avg_latency_ms: f64,
    pub last_copy_time: Option<DateTime<Utc>>,
}

impl FollowerStats {
    /// Success rate over all recorded copy attempts.
    pub fn success_rate(&self) -> f64 {
        let total = self.trades_total + self.failed_copies;
        if total == 0 {
            return 0.0;
        }
        self.trades_total as f64 / total as f64
    }
}

/// Aggregate statistics for a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub total_followers: u32,
    pub active_followers: u32,
    pub trades_total: u64,
    pub failed_copies: u64,
    pub avg_latency_ms: f64,
}

impl GroupStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.trades_total + self.failed_copies;
        if total == 0 {
            return 0.0;
        }
        self.trades_total as f64 / total as f64
    }
}

/// Configuration for one follower account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerConfig {
    pub id: String,
    pub account_id: String,
    pub platform: Platform,

    /// Evaluation phase of the account (e.g. prop-firm phase 1/2/funded)
    #[serde(default)]
    pub phase: Option<String>,

    pub status: FollowerStatus,

    /// Default scalar applied to leader volume; must be > 0
    pub lot_multiplier: Decimal,

    /// Invert buy/sell before dispatch. Defaults to true: the follower
    /// account exists to hold the offsetting position.
    pub reverse_mode: bool,

    /// If non-empty, only these leader symbols are copied
    #[serde(default)]
    pub symbol_whitelist: Vec<String>,

    #[serde(default)]
    pub symbol_blacklist: Vec<String>,

    /// Suffix appended to the mapped symbol for this follower's broker
    #[serde(default)]
    pub symbol_suffix: String,

    /// Leader symbol -> follower symbol overrides
    #[serde(default)]
    pub symbol_aliases: HashMap<String, SymbolRule>,

    /// If non-empty, only these magic numbers are copied
    #[serde(default)]
    pub magic_whitelist: Vec<i64>,

    #[serde(default)]
    pub magic_blacklist: Vec<i64>,

    #[serde(default)]
    pub lot_spec: LotSpec,

    /// Balance snapshot captured at group/phase creation; immutable after.
    pub baseline_balance: Decimal,

    #[serde(default)]
    pub stats: FollowerStats,
}

impl FollowerConfig {
    /// Validate invariants that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lot_multiplier <= Decimal::ZERO {
            return Err(ConfigError::InvalidLotMultiplier(self.lot_multiplier));
        }
        for (source, rule) in &self.symbol_aliases {
            if rule.target.is_empty() {
                return Err(ConfigError::InvalidSymbolMapping(source.clone()));
            }
            if let Some(mult) = rule.lot_multiplier {
                if mult <= Decimal::ZERO {
                    return Err(ConfigError::InvalidLotMultiplier(mult));
                }
            }
        }
        Ok(())
    }
}

/// A leader account wired to one or more followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierGroup {
    pub id: String,
    pub name: String,
    pub status: GroupStatus,

    pub leader_account_id: String,
    pub leader_platform: Platform,

    #[serde(default)]
    pub leader_phase: Option<String>,

    /// Broker suffix stripped off leader symbols before filtering
    #[serde(default)]
    pub leader_symbol_suffix_remove: String,

    /// Leader P&L snapshot at group creation; scopes discrepancy metrics
    /// to this group's lifetime. Immutable after creation.
    pub leader_baseline_pnl: Decimal,

    pub followers: Vec<FollowerConfig>,

    #[serde(default)]
    pub stats: GroupStats,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CopierGroup {
    /// Validate the group and every owned follower.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for follower in &self.followers {
            follower.validate()?;
        }
        Ok(())
    }

    /// Recompute follower counters. Upholds active <= total.
    pub fn refresh_follower_counts(&mut self) {
        self.stats.total_followers = self.followers.len() as u32;
        self.stats.active_followers = self
            .followers
            .iter()
            .filter(|f| f.status == FollowerStatus::Active)
            .count() as u32;
    }

    pub fn follower(&self, follower_id: &str) -> Option<&FollowerConfig> {
        self.followers.iter().find(|f| f.id == follower_id)
    }

    pub fn follower_mut(&mut self, follower_id: &str) -> Option<&mut FollowerConfig> {
        self.followers.iter_mut().find(|f| f.id == follower_id)
    }

    /// Strip the leader broker suffix, if configured and present.
    pub fn normalize_leader_symbol<'a>(&self, symbol: &'a str) -> &'a str {
        if !self.leader_symbol_suffix_remove.is_empty() {
            if let Some(stripped) = symbol.strip_suffix(&self.leader_symbol_suffix_remove) {
                return stripped;
            }
        }
        symbol
    }
}
