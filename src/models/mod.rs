//! Data models for groups, followers, trade events and the activity log.

mod activity;
mod group;
mod snapshot;
mod trade;

pub use activity::{ActivityKind, ActivityStatus, CopierActivityEntry};
pub use group::{
    CopierGroup, FollowerConfig, FollowerStats, FollowerStatus, GroupStats, GroupStatus, LotSpec,
    Platform, SymbolRule,
};
pub use snapshot::{AccountSnapshot, BrokerPosition};
pub use trade::{CommandResponse, CopyCommand, TradeAction, TradeEvent, TradeEventKind};
