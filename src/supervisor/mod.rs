//! Connection supervision: heartbeat deadlines, reconnect with exponential
//! backoff, and crash-recovery reconciliation.
//!
//! One supervisor task runs per adapter. It connects (retrying forever with
//! capped backoff), reconciles persisted hedge state against the live
//! account, flips cleanly reconciled dependents back to active, then watches
//! the receive loop and the heartbeat deadline side by side. Whichever trips
//! first tears the connection down and restarts the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::ExponentialBackoff;
use tracing::{info, warn};

use crate::adapters::PlatformAdapter;
use crate::config::CopierConfig;
use crate::db::Database;
use crate::engine::CopierEngine;
use crate::models::{FollowerStatus, GroupStatus};

/// What a connection outage affects: the whole group when the leader feed
/// dies, a single follower otherwise.
#[derive(Debug, Clone)]
pub enum Dependent {
    Leader { group_id: String },
    Follower { group_id: String, follower_id: String },
}

/// Outcome of reconciling one follower after a restart or reconnect.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Persisted hedges still open on the terminal.
    pub matched: usize,

    /// Persisted hedges with no live position; closed while we were away.
    pub closed_while_offline: usize,

    /// Live positions carrying our comment tag with no persisted hedge.
    pub unexpected: usize,
}

pub struct Supervisor {
    config: CopierConfig,
    engine: Arc<CopierEngine>,
    db: Arc<Database>,
}

impl Supervisor {
    pub fn new(config: CopierConfig, engine: Arc<CopierEngine>, db: Arc<Database>) -> Self {
        Self { config, engine, db }
    }

    /// Reconnect schedule: 1s doubling up to the configured cap, never
    /// giving up.
    pub fn reconnect_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: self.config.reconnect_max_interval(),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Supervise one adapter until the process shuts down.
    pub async fn run_adapter(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        dependents: Vec<Dependent>,
    ) {
        loop {
            self.connect_with_backoff(&adapter).await;
            let dirty = self.reconcile_dependents(&adapter, &dependents).await;
            self.mark_dependents_up(&dependents, &dirty).await;

            tokio::select! {
                result = adapter.run_event_loop() => {
                    match result {
                        Ok(()) => {
                            info!(account = %adapter.account_id(), "event loop finished, supervisor exiting");
                            return;
                        }
                        Err(e) => {
                            warn!(account = %adapter.account_id(), error = %e, "event loop failed");
                        }
                    }
                }
                _ = self.watch_silence(&adapter) => {
                    warn!(
                        account = %adapter.account_id(),
                        threshold = self.config.missed_heartbeat_threshold,
                        "transport unhealthy, tearing connection down"
                    );
                }
            }

            adapter.disconnect().await;
            self.mark_dependents_down(&dependents).await;
        }
    }

    async fn connect_with_backoff(&self, adapter: &Arc<dyn PlatformAdapter>) {
        let policy = self.reconnect_policy();
        let account = adapter.account_id().to_string();

        // max_elapsed_time is None, so this only returns on success.
        let _ = backoff::future::retry(policy, || async {
            adapter.connect().await.map_err(|e| {
                warn!(account = %account, error = %e, "connect failed, backing off");
                backoff::Error::transient(e)
            })
        })
        .await;

        info!(account = %account, "adapter connected");
    }

    /// Resolves once the adapter has been silent past the heartbeat deadline
    /// or has marked its own transport down (e.g. a command channel torn
    /// down mid round-trip).
    async fn watch_silence(&self, adapter: &Arc<dyn PlatformAdapter>) {
        let deadline = self.config.heartbeat_deadline();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            if !adapter.is_connected() {
                return;
            }
            let silent = adapter
                .health()
                .silence()
                .map_or(false, |silence| silence > deadline);
            if silent {
                return;
            }
        }
    }

    /// Flip dependents that were knocked into `error` back to active. A
    /// manual pause survives the outage, and a follower whose reconcile
    /// found orphaned positions stays in `error` pending manual reset.
    async fn mark_dependents_up(&self, dependents: &[Dependent], dirty: &HashSet<(String, String)>) {
        for dep in dependents {
            let result = match dep {
                Dependent::Leader { group_id } => {
                    match self.engine.group(group_id).await {
                        Some(g) if g.status == GroupStatus::Error => {
                            self.engine.set_group_status(group_id, GroupStatus::Active).await
                        }
                        _ => Ok(()),
                    }
                }
                Dependent::Follower {
                    group_id,
                    follower_id,
                } if dirty.contains(&(group_id.clone(), follower_id.clone())) => {
                    info!(
                        group = %group_id,
                        follower = %follower_id,
                        "follower kept in error until orphaned positions are resolved"
                    );
                    Ok(())
                }
                Dependent::Follower {
                    group_id,
                    follower_id,
                } => match self.engine.group(group_id).await {
                    Some(g)
                        if g.follower(follower_id)
                            .map_or(false, |f| f.status == FollowerStatus::Error) =>
                    {
                        self.engine
                            .set_follower_status(group_id, follower_id, FollowerStatus::Active)
                            .await
                    }
                    _ => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(error = %e, "failed to restore dependent status");
            }
        }
    }

    async fn mark_dependents_down(&self, dependents: &[Dependent]) {
        for dep in dependents {
            let result = match dep {
                Dependent::Leader { group_id } => {
                    self.engine.set_group_status(group_id, GroupStatus::Error).await
                }
                Dependent::Follower {
                    group_id,
                    follower_id,
                } => {
                    self.engine
                        .set_follower_status(group_id, follower_id, FollowerStatus::Error)
                        .await
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "failed to degrade dependent status");
            }
        }
    }

    /// Reconcile every follower this adapter serves. Returns the followers
    /// that must stay in `error`: those with orphaned positions, and those
    /// whose reconcile failed outright.
    async fn reconcile_dependents(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        dependents: &[Dependent],
    ) -> HashSet<(String, String)> {
        let mut dirty = HashSet::new();
        for dep in dependents {
            if let Dependent::Follower {
                group_id,
                follower_id,
            } = dep
            {
                match self.reconcile_follower(group_id, follower_id, adapter).await {
                    Ok(report) => {
                        info!(
                            group = %group_id,
                            follower = %follower_id,
                            matched = report.matched,
                            closed_while_offline = report.closed_while_offline,
                            unexpected = report.unexpected,
                            "reconciliation complete"
                        );
                        if report.unexpected > 0 {
                            dirty.insert((group_id.clone(), follower_id.clone()));
                        }
                    }
                    Err(e) => {
                        warn!(group = %group_id, follower = %follower_id, error = %e, "reconciliation failed");
                        dirty.insert((group_id.clone(), follower_id.clone()));
                    }
                }
            }
        }
        dirty
    }

    /// Compare persisted open hedges against the live account. Positions we
    /// know about are re-seeded into the duplicate guard so a replayed open
    /// cannot double them; hedges that vanished while offline are cleared;
    /// tagged positions we have no record of are flagged and left alone.
    pub async fn reconcile_follower(
        &self,
        group_id: &str,
        follower_id: &str,
        adapter: &Arc<dyn PlatformAdapter>,
    ) -> Result<ReconcileReport> {
        let snapshot = adapter.account_snapshot().await?;
        let live: std::collections::HashMap<i64, i64> = snapshot
            .copied_positions()
            .map(|(leader_ticket, pos)| (leader_ticket, pos.ticket))
            .collect();

        let persisted = self.db.open_hedges_for_follower(group_id, follower_id).await?;

        let mut report = ReconcileReport::default();
        for hedge in &persisted {
            if live.contains_key(&hedge.leader_ticket) {
                report.matched += 1;
                self.engine
                    .mark_seen(group_id, follower_id, hedge.leader_ticket)
                    .await?;
            } else {
                report.closed_while_offline += 1;
                warn!(
                    group = %group_id,
                    follower = %follower_id,
                    leader_ticket = hedge.leader_ticket,
                    "hedge closed while offline, clearing record"
                );
                self.db
                    .clear_open_hedge(group_id, follower_id, hedge.leader_ticket)
                    .await?;
            }
        }

        let persisted_tickets: std::collections::HashSet<i64> =
            persisted.iter().map(|h| h.leader_ticket).collect();
        for (leader_ticket, follower_ticket) in &live {
            if !persisted_tickets.contains(leader_ticket) {
                report.unexpected += 1;
                warn!(
                    group = %group_id,
                    follower = %follower_id,
                    leader_ticket,
                    follower_ticket,
                    "tagged position with no hedge record, leaving untouched"
                );
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::activity::ActivityLog;
    use crate::adapters::testing::MockAdapter;
    use crate::adapters::AdapterRegistry;
    use crate::license::{LicenseCredentials, LicenseManager};
    use crate::models::{
        AccountSnapshot, BrokerPosition, CopierGroup, FollowerConfig, FollowerStats, GroupStats,
        LotSpec, Platform, TradeAction,
    };

    async fn build() -> (Supervisor, Arc<CopierEngine>, Arc<Database>) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let activity = Arc::new(ActivityLog::new(db.clone()));
        let license = Arc::new(
            LicenseManager::new(
                "http://127.0.0.1:1".to_string(),
                LicenseCredentials {
                    key: "HSYNC-TEST-0001".to_string(),
                    account_id: "100500".to_string(),
                    broker: "DemoBroker".to_string(),
                    device_id: "dev-1".to_string(),
                },
            )
            .unwrap(),
        );

        let engine = Arc::new(CopierEngine::new(
            CopierConfig::default(),
            db.clone(),
            license,
            Arc::new(AdapterRegistry::new()),
            activity,
        ));

        let group = CopierGroup {
            id: "g1".to_string(),
            name: "test".to_string(),
            status: GroupStatus::Active,
            leader_account_id: "100500".to_string(),
            leader_platform: Platform::Mt5,
            leader_phase: None,
            leader_symbol_suffix_remove: String::new(),
            leader_baseline_pnl: Decimal::ZERO,
            followers: vec![FollowerConfig {
                id: "f1".to_string(),
                account_id: "200100".to_string(),
                platform: Platform::Mt5,
                phase: None,
                status: crate::models::FollowerStatus::Active,
                lot_multiplier: dec!(1),
                reverse_mode: true,
                symbol_whitelist: vec![],
                symbol_blacklist: vec![],
                symbol_suffix: String::new(),
                symbol_aliases: Default::default(),
                magic_whitelist: vec![],
                magic_blacklist: vec![],
                lot_spec: LotSpec::default(),
                baseline_balance: dec!(1000),
                stats: FollowerStats::default(),
            }],
            stats: GroupStats::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        engine.upsert_group(group).await.unwrap();

        let supervisor = Supervisor::new(CopierConfig::default(), engine.clone(), db.clone());
        (supervisor, engine, db)
    }

    fn tagged_position(ticket: i64, leader_ticket: i64) -> BrokerPosition {
        BrokerPosition {
            ticket,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Sell,
            volume: dec!(0.5),
            price_open: dec!(1.0850),
            profit: Decimal::ZERO,
            magic: None,
            comment: format!("hedgesync:{leader_ticket}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_policy_schedule() {
        let (supervisor, _engine, _db) = build().await;

        let policy = supervisor.reconnect_policy();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(60));
        assert!(policy.max_elapsed_time.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_matches_clears_and_flags() {
        let (supervisor, _engine, db) = build().await;

        // Two persisted hedges: 42 still open, 43 gone.
        db.record_open_hedge("g1", "f1", 42, 501, "EURUSD", dec!(0.5))
            .await
            .unwrap();
        db.record_open_hedge("g1", "f1", 43, 502, "EURUSD", dec!(0.5))
            .await
            .unwrap();

        let adapter = MockAdapter::new("200100");
        *adapter.snapshot.lock().await = Some(AccountSnapshot {
            account_id: "200100".to_string(),
            balance: dec!(1000),
            equity: dec!(1000),
            margin: Decimal::ZERO,
            margin_free: dec!(1000),
            floating_pnl: Decimal::ZERO,
            positions: vec![
                tagged_position(501, 42),
                // Tagged but unknown to us
                tagged_position(999, 99),
                // Manual position, no tag, ignored entirely
                BrokerPosition {
                    ticket: 600,
                    symbol: "XAUUSD".to_string(),
                    action: TradeAction::Buy,
                    volume: dec!(1),
                    price_open: dec!(2400),
                    profit: Decimal::ZERO,
                    magic: None,
                    comment: "manual".to_string(),
                },
            ],
            timestamp: Utc::now(),
        });

        let adapter: Arc<dyn PlatformAdapter> = adapter;
        let report = supervisor
            .reconcile_follower("g1", "f1", &adapter)
            .await
            .unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                matched: 1,
                closed_while_offline: 1,
                unexpected: 1,
            }
        );

        // Matched hedge seeds the duplicate guard
        assert!(db.has_seen_ticket("g1", "f1", 42).await.unwrap());
        // Vanished hedge is cleared
        let remaining = db.open_hedges_for_follower("g1", "f1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].leader_ticket, 42);
    }

    #[tokio::test]
    async fn test_status_transitions_respect_manual_pause() {
        let (supervisor, engine, _db) = build().await;

        let deps = vec![
            Dependent::Leader {
                group_id: "g1".to_string(),
            },
            Dependent::Follower {
                group_id: "g1".to_string(),
                follower_id: "f1".to_string(),
            },
        ];

        supervisor.mark_dependents_down(&deps).await;
        let group = engine.group("g1").await.unwrap();
        assert_eq!(group.status, GroupStatus::Error);
        assert_eq!(
            group.follower("f1").unwrap().status,
            crate::models::FollowerStatus::Error
        );

        supervisor.mark_dependents_up(&deps, &HashSet::new()).await;
        let group = engine.group("g1").await.unwrap();
        assert_eq!(group.status, GroupStatus::Active);
        assert_eq!(
            group.follower("f1").unwrap().status,
            crate::models::FollowerStatus::Active
        );

        // A manual pause is not overridden by a reconnect
        engine
            .set_group_status("g1", GroupStatus::Paused)
            .await
            .unwrap();
        supervisor.mark_dependents_up(&deps, &HashSet::new()).await;
        assert_eq!(engine.group("g1").await.unwrap().status, GroupStatus::Paused);
    }

    #[tokio::test]
    async fn test_orphaned_positions_keep_follower_in_error() {
        let (supervisor, engine, _db) = build().await;

        let deps = vec![Dependent::Follower {
            group_id: "g1".to_string(),
            follower_id: "f1".to_string(),
        }];
        supervisor.mark_dependents_down(&deps).await;

        // Tagged live position with no hedge record
        let adapter = MockAdapter::new("200100");
        *adapter.snapshot.lock().await = Some(AccountSnapshot {
            account_id: "200100".to_string(),
            balance: dec!(1000),
            equity: dec!(1000),
            margin: Decimal::ZERO,
            margin_free: dec!(1000),
            floating_pnl: Decimal::ZERO,
            positions: vec![tagged_position(999, 99)],
            timestamp: Utc::now(),
        });

        let adapter: Arc<dyn PlatformAdapter> = adapter;
        let dirty = supervisor.reconcile_dependents(&adapter, &deps).await;
        assert!(dirty.contains(&("g1".to_string(), "f1".to_string())));

        supervisor.mark_dependents_up(&deps, &dirty).await;
        let group = engine.group("g1").await.unwrap();
        assert_eq!(
            group.follower("f1").unwrap().status,
            crate::models::FollowerStatus::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_silence_trips_after_deadline() {
        // Resume real time during setup: sqlx connects on a blocking thread,
        // which the paused clock's auto-advance doesn't track, so the pool's
        // acquire timeout would fire immediately.
        tokio::time::resume();
        let (supervisor, _engine, _db) = build().await;
        tokio::time::pause();

        let adapter = MockAdapter::new("200100");
        let adapter: Arc<dyn PlatformAdapter> = adapter;

        // Deadline is 15s (5s interval, 3 misses); silence trips shortly after.
        let result = tokio::time::timeout(
            Duration::from_secs(30),
            supervisor.watch_silence(&adapter),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_silence_trips_on_torn_down_transport() {
        tokio::time::resume();
        let (supervisor, _engine, _db) = build().await;
        tokio::time::pause();

        let adapter = MockAdapter::new("200100");
        adapter.health().mark_disconnected();

        let adapter: Arc<dyn PlatformAdapter> = adapter;
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.watch_silence(&adapter),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_silence_holds_while_traffic_flows() {
        tokio::time::resume();
        let (supervisor, _engine, _db) = build().await;
        tokio::time::pause();

        let adapter = MockAdapter::new("200100");
        let health = adapter.health();
        let keepalive = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(4)).await;
                health.touch();
            }
        });

        let adapter: Arc<dyn PlatformAdapter> = adapter;
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            supervisor.watch_silence(&adapter),
        )
        .await;
        assert!(result.is_err());

        keepalive.abort();
    }
}
