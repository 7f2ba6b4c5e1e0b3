//! Per-follower transform pipeline.
//!
//! A pure function from (group, follower, leader event) to either a dispatch
//! command or a skip. Stages run in a fixed order: magic filter, symbol
//! whitelist/blacklist, alias mapping, suffix append, volume scaling,
//! lot normalization, direction inversion. The same event fans out to each
//! follower independently; one follower's filters never affect another's.

use rust_decimal::Decimal;

use crate::models::{CopierGroup, CopyCommand, FollowerConfig, LotSpec, TradeEvent};

/// Why an event was not dispatched to a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MagicNotWhitelisted,
    MagicBlacklisted,
    SymbolNotWhitelisted,
    SymbolBlacklisted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MagicNotWhitelisted => "magic not in whitelist",
            SkipReason::MagicBlacklisted => "magic blacklisted",
            SkipReason::SymbolNotWhitelisted => "symbol not in whitelist",
            SkipReason::SymbolBlacklisted => "symbol blacklisted",
        }
    }
}

/// Result of running the pipeline for one follower.
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    Dispatch(CopyCommand),
    Skip(SkipReason),
}

/// Run the full pipeline. Filters evaluate against the leader symbol after
/// the group's broker suffix is stripped, so "EURUSD.m" and "EURUSD" leaders
/// hit the same follower rules.
pub fn transform_event(
    group: &CopierGroup,
    follower: &FollowerConfig,
    event: &TradeEvent,
) -> TransformOutcome {
    // Magic filters
    if !follower.magic_whitelist.is_empty() {
        match event.magic {
            Some(magic) if follower.magic_whitelist.contains(&magic) => {}
            _ => return TransformOutcome::Skip(SkipReason::MagicNotWhitelisted),
        }
    }
    if let Some(magic) = event.magic {
        if follower.magic_blacklist.contains(&magic) {
            return TransformOutcome::Skip(SkipReason::MagicBlacklisted);
        }
    }

    // Symbol filters on the normalized leader symbol
    let normalized = group.normalize_leader_symbol(&event.symbol);
    if !follower.symbol_whitelist.is_empty()
        && !follower.symbol_whitelist.iter().any(|s| s == normalized)
    {
        return TransformOutcome::Skip(SkipReason::SymbolNotWhitelisted);
    }
    if follower.symbol_blacklist.iter().any(|s| s == normalized) {
        return TransformOutcome::Skip(SkipReason::SymbolBlacklisted);
    }

    // Alias mapping; a per-symbol multiplier overrides the follower default
    let (mapped, multiplier) = match follower.symbol_aliases.get(normalized) {
        Some(rule) => (
            rule.target.as_str(),
            rule.lot_multiplier.unwrap_or(follower.lot_multiplier),
        ),
        None => (normalized, follower.lot_multiplier),
    };

    let symbol = format!("{}{}", mapped, follower.symbol_suffix);

    let volume = normalize_volume(event.volume * multiplier, &follower.lot_spec);

    let action = if follower.reverse_mode {
        event.action.inverted()
    } else {
        event.action
    };

    TransformOutcome::Dispatch(CopyCommand {
        leader_ticket: event.leader_ticket,
        symbol,
        action,
        kind: event.kind,
        volume,
        price: event.price,
        magic: event.magic,
        comment: CopyCommand::comment_tag(event.leader_ticket),
    })
}

/// Round down to the terminal's lot step, then clamp into [min, max].
pub fn normalize_volume(volume: Decimal, spec: &LotSpec) -> Decimal {
    let stepped = if spec.step > Decimal::ZERO {
        (volume / spec.step).floor() * spec.step
    } else {
        volume
    };
    stepped.clamp(spec.min, spec.max)
}
