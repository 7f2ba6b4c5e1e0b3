//! Dispatch core: fans one leader event out to every active follower.
//!
//! Events for a group arrive on one bounded channel and are processed
//! strictly in arrival order; fan-out inside one event runs follower by
//! follower so a group's command stream stays ordered per terminal. One
//! follower failing never blocks the others, it is recorded and skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityLog, StatImpact};
use crate::adapters::AdapterRegistry;
use crate::config::CopierConfig;
use crate::db::Database;
use crate::errors::{ConfigError, CopyExecutionError, TransportError};
use crate::license::LicenseManager;
use crate::models::{
    ActivityKind, ActivityStatus, CopierActivityEntry, CopierGroup, CopyCommand, FollowerStatus,
    GroupStatus, TradeEvent, TradeEventKind,
};

use super::hedge::HedgeHealth;
use super::transform::{transform_event, SkipReason, TransformOutcome};

/// Outcome of one follower's share of an event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Copied { ticket: Option<i64>, latency_ms: u64 },
    Skipped(SkipReason),
    Duplicate,
    DryRun,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub follower_id: String,
    pub outcome: DispatchOutcome,
}

/// The copier engine. Holds group configuration, the duplicate-delivery
/// guard and the wiring to adapters, license gate and activity log.
pub struct CopierEngine {
    config: CopierConfig,
    db: Arc<Database>,
    license: Arc<LicenseManager>,
    adapters: Arc<AdapterRegistry>,
    activity: Arc<ActivityLog>,
    groups: RwLock<HashMap<String, CopierGroup>>,
    seen: RwLock<HashSet<(String, String, i64)>>,
}

impl CopierEngine {
    pub fn new(
        config: CopierConfig,
        db: Arc<Database>,
        license: Arc<LicenseManager>,
        adapters: Arc<AdapterRegistry>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            config,
            db,
            license,
            adapters,
            activity,
            groups: RwLock::new(HashMap::new()),
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Load persisted groups, stats and the seen-ticket guard.
    pub async fn load_state(&self) -> Result<()> {
        let groups = self.db.load_groups().await.context("loading groups")?;
        for group in &groups {
            for follower in &group.followers {
                self.activity
                    .seed(&group.id, &follower.id, follower.stats.clone())
                    .await;
            }
        }

        let mut map = self.groups.write().await;
        for group in groups {
            map.insert(group.id.clone(), group);
        }
        drop(map);

        let pruned = self
            .db
            .prune_seen_tickets(self.config.seen_ticket_retention_days)
            .await?;
        if pruned > 0 {
            info!(pruned, "aged out old seen tickets");
        }

        let tickets = self.db.load_seen_tickets().await?;
        let mut seen = self.seen.write().await;
        for (group_id, follower_id, ticket) in tickets {
            seen.insert((group_id, follower_id, ticket));
        }

        info!(
            groups = self.groups.read().await.len(),
            seen_tickets = seen.len(),
            "engine state loaded"
        );
        Ok(())
    }

    pub async fn group(&self, group_id: &str) -> Option<CopierGroup> {
        self.groups.read().await.get(group_id).cloned()
    }

    pub async fn groups(&self) -> Vec<CopierGroup> {
        self.groups.read().await.values().cloned().collect()
    }

    /// Validate, persist and register a group.
    pub async fn upsert_group(&self, mut group: CopierGroup) -> Result<()> {
        group.validate()?;
        group.refresh_follower_counts();
        self.db.save_group(&group).await?;
        self.groups.write().await.insert(group.id.clone(), group);
        Ok(())
    }

    pub async fn set_group_status(&self, group_id: &str, status: GroupStatus) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| ConfigError::GroupNotFound(group_id.to_string()))?;
        group.status = status;
        group.updated_at = Utc::now();
        drop(groups);

        self.db.update_group_status(group_id, status).await?;
        info!(group = %group_id, status = status.as_str(), "group status changed");
        Ok(())
    }

    pub async fn set_follower_status(
        &self,
        group_id: &str,
        follower_id: &str,
        status: FollowerStatus,
    ) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| ConfigError::GroupNotFound(group_id.to_string()))?;
        if let Some(follower) = group.follower_mut(follower_id) {
            follower.status = status;
        }
        group.refresh_follower_counts();
        drop(groups);

        self.db.update_follower_status(follower_id, status).await?;
        Ok(())
    }

    /// Process one leader event for one group: license gate, then per-follower
    /// transform and dispatch.
    pub async fn process_event(
        &self,
        group_id: &str,
        event: &TradeEvent,
    ) -> Result<Vec<DispatchRecord>> {
        let group = self
            .group(group_id)
            .await
            .ok_or_else(|| ConfigError::GroupNotFound(group_id.to_string()))?;

        if group.status != GroupStatus::Active {
            debug!(group = %group_id, status = group.status.as_str(), "group not active, dropping event");
            return Ok(vec![]);
        }

        // License gate: lock-only fast path, never a network call on the
        // dispatch path. The runner's revalidation task owns refresh.
        if !self.license.is_token_valid() {
            let reason = "license: no valid token".to_string();
            warn!(group = %group_id, "license gate closed, blocking dispatch");
            let mut records = Vec::new();
            for follower in group.followers.iter().filter(|f| f.status == FollowerStatus::Active) {
                let entry = self.entry(
                    &group,
                    &follower.id,
                    ActivityKind::Error,
                    event.symbol.clone(),
                    event,
                    event.volume,
                    0,
                    ActivityStatus::Failed,
                    Some(reason.clone()),
                );
                self.activity.record(entry, StatImpact::Filtered).await?;
                records.push(DispatchRecord {
                    follower_id: follower.id.clone(),
                    outcome: DispatchOutcome::Failed(reason.clone()),
                });
            }
            return Ok(records);
        }

        let mut records = Vec::with_capacity(group.followers.len());
        for follower in &group.followers {
            if follower.status != FollowerStatus::Active {
                continue;
            }

            let outcome = self.dispatch_to_follower(&group, follower, event).await?;
            records.push(DispatchRecord {
                follower_id: follower.id.clone(),
                outcome,
            });
        }

        Ok(records)
    }

    async fn dispatch_to_follower(
        &self,
        group: &CopierGroup,
        follower: &crate::models::FollowerConfig,
        event: &TradeEvent,
    ) -> Result<DispatchOutcome> {
        // Duplicate delivery of an open is silently dropped; the position
        // already exists.
        if event.kind == TradeEventKind::Open
            && self.is_seen(&group.id, &follower.id, event.leader_ticket).await
        {
            debug!(
                group = %group.id,
                follower = %follower.id,
                ticket = event.leader_ticket,
                "duplicate open, skipping"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        let cmd = match transform_event(group, follower, event) {
            TransformOutcome::Dispatch(cmd) => cmd,
            TransformOutcome::Skip(reason) => {
                let entry = self.entry(
                    group,
                    &follower.id,
                    activity_kind(event.kind),
                    group.normalize_leader_symbol(&event.symbol).to_string(),
                    event,
                    event.volume,
                    0,
                    ActivityStatus::Failed,
                    Some(format!("skipped: {}", reason.as_str())),
                );
                self.activity.record(entry, StatImpact::Filtered).await?;
                return Ok(DispatchOutcome::Skipped(reason));
            }
        };

        if self.config.dry_run {
            info!(
                group = %group.id,
                follower = %follower.id,
                symbol = %cmd.symbol,
                action = cmd.action.as_str(),
                volume = %cmd.volume,
                "DRY RUN: would dispatch"
            );
            let entry = self.entry(
                group,
                &follower.id,
                activity_kind(cmd.kind),
                cmd.symbol.clone(),
                event,
                cmd.volume,
                0,
                ActivityStatus::Success,
                Some("dry run".to_string()),
            );
            self.activity.record(entry, StatImpact::Filtered).await?;
            return Ok(DispatchOutcome::DryRun);
        }

        let Some(adapter) = self.adapters.get(&follower.account_id) else {
            let msg = format!("no adapter for account {}", follower.account_id);
            self.record_failure(group, follower, event, &cmd, 0, &msg).await?;
            return Ok(DispatchOutcome::Failed(msg));
        };

        let started = Instant::now();
        let result = timeout(self.config.command_timeout(), adapter.send_command(&cmd)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let err = CopyExecutionError::Transport(e);
                self.record_failure(group, follower, event, &cmd, latency_ms, &err.to_string())
                    .await?;
                return Ok(DispatchOutcome::Failed(err.to_string()));
            }
            Err(_) => {
                let err = CopyExecutionError::Transport(TransportError::Timeout(
                    self.config.command_timeout_secs,
                ));
                self.record_failure(group, follower, event, &cmd, latency_ms, &err.to_string())
                    .await?;
                return Ok(DispatchOutcome::Failed(err.to_string()));
            }
        };

        if !response.success {
            let err = CopyExecutionError::RejectedByBroker(
                response
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            );
            self.record_failure(group, follower, event, &cmd, latency_ms, &err.to_string())
                .await?;
            return Ok(DispatchOutcome::Failed(err.to_string()));
        }

        // A short fill still opens a position; record the gap so hedge
        // discrepancy has an explanation.
        let fill_note = match response.filled_volume {
            Some(filled) if filled < cmd.volume => {
                let note = CopyExecutionError::PartialFill {
                    requested: cmd.volume,
                    filled,
                }
                .to_string();
                warn!(
                    group = %group.id,
                    follower = %follower.id,
                    symbol = %cmd.symbol,
                    %note,
                    "short fill on follower terminal"
                );
                Some(note)
            }
            _ => None,
        };

        // Success: update the duplicate guard and hedge bookkeeping before
        // acknowledging.
        match cmd.kind {
            TradeEventKind::Open => {
                self.mark_seen(&group.id, &follower.id, event.leader_ticket).await?;
                if let Some(ticket) = response.ticket {
                    self.db
                        .record_open_hedge(
                            &group.id,
                            &follower.id,
                            event.leader_ticket,
                            ticket,
                            &cmd.symbol,
                            cmd.volume,
                        )
                        .await?;
                }
            }
            TradeEventKind::Close => {
                self.db
                    .clear_open_hedge(&group.id, &follower.id, event.leader_ticket)
                    .await?;
            }
            TradeEventKind::Modify => {}
        }

        let entry = self.entry(
            group,
            &follower.id,
            activity_kind(cmd.kind),
            cmd.symbol.clone(),
            event,
            cmd.volume,
            latency_ms,
            ActivityStatus::Success,
            fill_note,
        );
        self.activity
            .record(
                entry,
                StatImpact::Copied {
                    latency_ms,
                    profit_delta: follower_profit(event, &cmd, follower.reverse_mode),
                },
            )
            .await?;

        debug!(
            group = %group.id,
            follower = %follower.id,
            symbol = %cmd.symbol,
            action = cmd.action.as_str(),
            volume = %cmd.volume,
            latency_ms,
            "copy dispatched"
        );

        Ok(DispatchOutcome::Copied {
            ticket: response.ticket,
            latency_ms,
        })
    }

    /// Hedge accounting for one follower, measured from live snapshots.
    pub async fn hedge_health(&self, group_id: &str, follower_id: &str) -> Result<HedgeHealth> {
        let group = self
            .group(group_id)
            .await
            .ok_or_else(|| ConfigError::GroupNotFound(group_id.to_string()))?;
        let follower = group
            .follower(follower_id)
            .ok_or_else(|| anyhow::anyhow!("follower not found: {follower_id}"))?;

        let leader = self
            .adapters
            .get(&group.leader_account_id)
            .ok_or(TransportError::NotConnected)?;
        let leader_snap = leader.account_snapshot().await?;

        let follower_adapter = self
            .adapters
            .get(&follower.account_id)
            .ok_or(TransportError::NotConnected)?;
        let follower_snap = follower_adapter.account_snapshot().await?;

        Ok(HedgeHealth::assess(
            leader_snap.equity,
            group.leader_baseline_pnl,
            follower_snap.balance,
            follower.baseline_balance,
            follower_snap.floating_pnl,
        ))
    }

    async fn is_seen(&self, group_id: &str, follower_id: &str, ticket: i64) -> bool {
        self.seen
            .read()
            .await
            .contains(&(group_id.to_string(), follower_id.to_string(), ticket))
    }

    /// Record a ticket as handled, memory first and then durably.
    pub async fn mark_seen(&self, group_id: &str, follower_id: &str, ticket: i64) -> Result<()> {
        self.seen
            .write()
            .await
            .insert((group_id.to_string(), follower_id.to_string(), ticket));
        self.db.mark_ticket_seen(group_id, follower_id, ticket).await
    }

    async fn record_failure(
        &self,
        group: &CopierGroup,
        follower: &crate::models::FollowerConfig,
        event: &TradeEvent,
        cmd: &CopyCommand,
        latency_ms: u64,
        message: &str,
    ) -> Result<()> {
        warn!(
            group = %group.id,
            follower = %follower.id,
            symbol = %cmd.symbol,
            error = %message,
            "copy failed"
        );
        let entry = self.entry(
            group,
            &follower.id,
            activity_kind(cmd.kind),
            cmd.symbol.clone(),
            event,
            cmd.volume,
            latency_ms,
            ActivityStatus::Failed,
            Some(message.to_string()),
        );
        self.activity.record(entry, StatImpact::Failed).await
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        group: &CopierGroup,
        follower_id: &str,
        kind: ActivityKind,
        symbol: String,
        event: &TradeEvent,
        volume: Decimal,
        latency_ms: u64,
        status: ActivityStatus,
        error_message: Option<String>,
    ) -> CopierActivityEntry {
        CopierActivityEntry {
            id: Uuid::new_v4().to_string(),
            group_id: group.id.clone(),
            follower_id: follower_id.to_string(),
            timestamp: Utc::now(),
            kind,
            symbol,
            action: event.action,
            volume,
            price: event.price,
            latency_ms,
            status,
            error_message,
        }
    }
}

fn activity_kind(kind: TradeEventKind) -> ActivityKind {
    match kind {
        TradeEventKind::Open => ActivityKind::Open,
        TradeEventKind::Close => ActivityKind::Close,
        TradeEventKind::Modify => ActivityKind::Modify,
    }
}

/// Follower-side profit estimate for a close, scaled by the copied volume
/// share and inverted when the follower hedges.
fn follower_profit(event: &TradeEvent, cmd: &CopyCommand, reversed: bool) -> Option<Decimal> {
    if event.kind != TradeEventKind::Close {
        return None;
    }
    let profit = event.profit?;
    let scale = if event.volume > Decimal::ZERO {
        cmd.volume / event.volume
    } else {
        Decimal::ONE
    };
    let signed = if reversed { -profit } else { profit };
    Some(signed * scale)
}
