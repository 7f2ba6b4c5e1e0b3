//! Service runner: wires database, license, adapters, engine and supervisor
//! together and drives the event loops until shutdown.
//!
//! One bounded channel exists per leader adapter. Its dispatch task drains
//! events strictly in order and fans each one out to every group that leader
//! feeds, so per-leader ordering holds no matter how many groups share the
//! account.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::activity::ActivityLog;
use crate::adapters::{
    AdapterRegistry, FileIpcAdapter, FileIpcConfig, NamedPipeAdapter, NamedPipeConfig,
    PlatformAdapter, SocketBusAdapter, SocketBusConfig,
};
use crate::config::CopierConfig;
use crate::db::Database;
use crate::engine::CopierEngine;
use crate::license::LicenseManager;
use crate::models::TradeEvent;
use crate::supervisor::{Dependent, Supervisor};

/// Transport wiring for one account, read from the endpoints file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportEndpoint {
    SocketBus {
        broadcast_addr: String,
        command_addr: String,
    },
    FileIpc {
        dir: PathBuf,
    },
    NamedPipe {
        status_pipe: PathBuf,
        command_pipe: PathBuf,
    },
}

/// account id -> transport wiring, loaded from a JSON file next to the
/// database.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointsConfig {
    pub accounts: HashMap<String, TransportEndpoint>,
}

impl EndpointsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading endpoints file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing endpoints file {}", path.display()))
    }
}

/// Build the adapter matching one account's endpoint entry.
pub fn build_adapter(account_id: &str, endpoint: &TransportEndpoint) -> Arc<dyn PlatformAdapter> {
    match endpoint {
        TransportEndpoint::SocketBus {
            broadcast_addr,
            command_addr,
        } => SocketBusAdapter::new(
            account_id,
            SocketBusConfig {
                broadcast_addr: broadcast_addr.clone(),
                command_addr: command_addr.clone(),
            },
        ),
        TransportEndpoint::FileIpc { dir } => {
            FileIpcAdapter::new(account_id, FileIpcConfig::new(dir.clone()))
        }
        TransportEndpoint::NamedPipe {
            status_pipe,
            command_pipe,
        } => NamedPipeAdapter::new(
            account_id,
            NamedPipeConfig {
                status_pipe: status_pipe.clone(),
                command_pipe: command_pipe.clone(),
            },
        ),
    }
}

/// The assembled service.
pub struct Runner {
    config: CopierConfig,
    db: Arc<Database>,
    engine: Arc<CopierEngine>,
    supervisor: Arc<Supervisor>,
    adapters: Arc<AdapterRegistry>,
    activity: Arc<ActivityLog>,
    license: Arc<LicenseManager>,
}

impl Runner {
    /// Assemble everything from persisted groups and the endpoints file.
    pub async fn build(
        config: CopierConfig,
        endpoints: EndpointsConfig,
        license: Arc<LicenseManager>,
    ) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_url).await?);
        let activity = Arc::new(ActivityLog::new(db.clone()));

        let groups = db.load_groups().await?;
        let mut registry = AdapterRegistry::new();
        for group in &groups {
            for account in std::iter::once(group.leader_account_id.as_str())
                .chain(group.followers.iter().map(|f| f.account_id.as_str()))
            {
                if registry.get(account).is_some() {
                    continue;
                }
                match endpoints.accounts.get(account) {
                    Some(endpoint) => registry.insert(build_adapter(account, endpoint)),
                    None => warn!(account = %account, "no endpoint configured, account will stay offline"),
                }
            }
        }
        let adapters = Arc::new(registry);

        let engine = Arc::new(CopierEngine::new(
            config.clone(),
            db.clone(),
            license.clone(),
            adapters.clone(),
            activity.clone(),
        ));
        engine.load_state().await?;

        let supervisor = Arc::new(Supervisor::new(config.clone(), engine.clone(), db.clone()));

        Ok(Self {
            config,
            db,
            engine,
            supervisor,
            adapters,
            activity,
            license,
        })
    }

    pub fn engine(&self) -> Arc<CopierEngine> {
        self.engine.clone()
    }

    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        // Warm up the license cache; the dispatch path only ever reads it.
        match self.license.validate("service").await {
            Ok(token) => info!(plan = %token.plan, ttl = token.ttl_seconds, "license validated"),
            Err(e) => warn!(error = %e, "license validation failed at startup, dispatch is gated"),
        }

        let groups = self.engine.groups().await;
        if groups.is_empty() {
            warn!("no copier groups configured, nothing to do");
        }

        // Group ids fed by each leader account
        let mut led_groups: HashMap<String, Vec<String>> = HashMap::new();
        for group in &groups {
            led_groups
                .entry(group.leader_account_id.clone())
                .or_default()
                .push(group.id.clone());
        }

        // Dispatch loops are drained at shutdown; everything else is aborted.
        let mut dispatch_tasks = Vec::new();
        let mut service_tasks = Vec::new();

        // One event channel and dispatch task per leader adapter
        for (leader_account, group_ids) in &led_groups {
            let Some(adapter) = self.adapters.get(leader_account) else {
                warn!(account = %leader_account, "leader has no adapter, its groups stay idle");
                continue;
            };

            let (tx, rx) = mpsc::channel::<TradeEvent>(self.config.event_channel_capacity);
            adapter.subscribe(tx);
            dispatch_tasks.push(tokio::spawn(dispatch_loop(
                self.engine.clone(),
                group_ids.clone(),
                rx,
            )));
        }

        // One supervisor task per adapter
        for (account_id, adapter) in self.adapters.iter() {
            let mut dependents = Vec::new();
            for group in &groups {
                if &group.leader_account_id == account_id {
                    dependents.push(Dependent::Leader {
                        group_id: group.id.clone(),
                    });
                }
                for follower in &group.followers {
                    if &follower.account_id == account_id {
                        dependents.push(Dependent::Follower {
                            group_id: group.id.clone(),
                            follower_id: follower.id.clone(),
                        });
                    }
                }
            }

            let supervisor = self.supervisor.clone();
            let adapter = adapter.clone();
            service_tasks.push(tokio::spawn(async move {
                supervisor.run_adapter(adapter, dependents).await;
            }));
        }

        // Background license revalidation. Refreshes the token ahead of
        // expiry so the engine's lock-only gate stays open; a failed
        // revalidation pauses every active group.
        {
            let license = self.license.clone();
            let engine = self.engine.clone();
            service_tasks.push(tokio::spawn(async move {
                loop {
                    // Wake at three quarters of the remaining TTL, with a
                    // floor so an empty cache retries promptly.
                    let ttl = license.token_ttl();
                    let sleep_secs = (ttl.saturating_mul(3) / 4).max(30);
                    tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;

                    match license.validate("service").await {
                        Ok(token) => {
                            info!(ttl = token.ttl_seconds, "license token refreshed");
                        }
                        Err(e) => {
                            error!(error = %e, "license revalidation failed, pausing active groups");
                            for group in engine.groups().await {
                                if group.status != crate::models::GroupStatus::Active {
                                    continue;
                                }
                                if let Err(e) = engine
                                    .set_group_status(&group.id, crate::models::GroupStatus::Paused)
                                    .await
                                {
                                    warn!(group = %group.id, error = %e, "failed to pause group");
                                }
                            }
                        }
                    }
                }
            }));
        }

        // Periodic statistics flush
        {
            let engine = self.engine.clone();
            let activity = self.activity.clone();
            let db = self.db.clone();
            let period = self.config.stats_flush_interval();
            service_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = flush_stats(&engine, &activity, &db).await {
                        warn!(error = %e, "stats flush failed");
                    }
                }
            }));
        }

        // Periodic hedge discrepancy check
        {
            let engine = self.engine.clone();
            let period = self.config.stats_flush_interval();
            service_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    monitor_hedges(&engine).await;
                }
            }));
        }

        info!(
            groups = groups.len(),
            adapters = self.adapters.len(),
            dry_run = self.config.dry_run,
            "copier running"
        );

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");

        // Stop event producers and tickers first.
        for task in &service_tasks {
            task.abort();
        }
        let _ = futures::future::join_all(service_tasks).await;

        // Detach the leader feeds, then let the dispatch loops drain their
        // queues: an in-flight copy must finish and land its activity row
        // before counters flush.
        for leader_account in led_groups.keys() {
            if let Some(adapter) = self.adapters.get(leader_account) {
                let (detached_tx, _) = mpsc::channel::<TradeEvent>(1);
                adapter.subscribe(detached_tx);
            }
        }
        let _ = futures::future::join_all(dispatch_tasks).await;

        // Final flush so restart resumes with current counters
        flush_stats(&self.engine, &self.activity, &self.db).await?;

        for group in &groups {
            let stats = self
                .activity
                .group_stats(
                    &group.id,
                    group.stats.total_followers,
                    group.stats.active_followers,
                )
                .await;
            info!(
                group = %group.name,
                trades = stats.trades_total,
                failed = stats.failed_copies,
                success_rate = format!("{:.1}%", stats.success_rate() * 100.0),
                avg_latency_ms = format!("{:.0}", stats.avg_latency_ms),
                "session summary"
            );
        }

        self.db.pool().close().await;
        info!("statistics flushed, database closed, goodbye");
        Ok(())
    }
}

/// Persist follower counters and per-group aggregates in one pass.
async fn flush_stats(
    engine: &Arc<CopierEngine>,
    activity: &Arc<ActivityLog>,
    db: &Arc<Database>,
) -> Result<()> {
    activity.flush().await?;
    for group in engine.groups().await {
        let stats = activity
            .group_stats(
                &group.id,
                group.stats.total_followers,
                group.stats.active_followers,
            )
            .await;
        db.flush_group_stats(&group.id, &stats).await?;
    }
    Ok(())
}

/// Log hedge discrepancy per active follower; a gap past the alert threshold
/// is flagged at warn level.
async fn monitor_hedges(engine: &Arc<CopierEngine>) {
    let alert_threshold = rust_decimal::Decimal::ONE;

    for group in engine.groups().await {
        if group.status != crate::models::GroupStatus::Active {
            continue;
        }
        for follower in &group.followers {
            if follower.status != crate::models::FollowerStatus::Active || !follower.reverse_mode {
                continue;
            }
            match engine.hedge_health(&group.id, &follower.id).await {
                Ok(health) if health.is_material(alert_threshold) => {
                    warn!(
                        group = %group.id,
                        follower = %follower.id,
                        expected = %health.expected,
                        realized = %health.realized,
                        discrepancy = %health.discrepancy,
                        "hedge discrepancy past threshold"
                    );
                }
                Ok(health) => {
                    info!(
                        group = %group.id,
                        follower = %follower.id,
                        discrepancy = %health.discrepancy,
                        "hedge on track"
                    );
                }
                Err(e) => {
                    warn!(group = %group.id, follower = %follower.id, error = %e, "hedge check failed");
                }
            }
        }
    }
}

/// Drain one leader's event stream in order, fanning each event out to every
/// group that leader feeds.
async fn dispatch_loop(
    engine: Arc<CopierEngine>,
    group_ids: Vec<String>,
    mut rx: mpsc::Receiver<TradeEvent>,
) {
    while let Some(event) = rx.recv().await {
        for group_id in &group_ids {
            if let Err(e) = engine.process_event(group_id, &event).await {
                error!(group = %group_id, ticket = event.leader_ticket, error = %e, "event processing failed");
            }
        }
    }
    info!("leader event channel closed, dispatch loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::adapters::testing::MockAdapter;
    use crate::license::{CachedToken, LicenseCredentials};
    use crate::models::{
        CopierGroup, FollowerConfig, FollowerStats, FollowerStatus, GroupStats, GroupStatus,
        LotSpec, Platform, TradeAction, TradeEventKind,
    };

    #[tokio::test]
    async fn test_dispatch_loop_drains_queued_events_before_exit() {
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
        license.seed_cache(CachedToken {
            token: "tok".to_string(),
            plan: "pro".to_string(),
            ttl_seconds: 600,
            expires_at: Utc::now() + chrono::Duration::seconds(600),
        });

        let adapter = MockAdapter::new("200100");
        let mut registry = AdapterRegistry::new();
        registry.insert(adapter.clone());

        let engine = Arc::new(CopierEngine::new(
            CopierConfig::default(),
            db.clone(),
            license,
            Arc::new(registry),
            activity,
        ));
        engine
            .upsert_group(CopierGroup {
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
                    status: FollowerStatus::Active,
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
            })
            .await
            .unwrap();

        // Two events are already queued when the sender goes away; both must
        // be processed before the loop exits.
        let (tx, rx) = mpsc::channel::<TradeEvent>(8);
        for ticket in [1i64, 2] {
            tx.send(TradeEvent {
                leader_ticket: ticket,
                symbol: "EURUSD".to_string(),
                action: TradeAction::Buy,
                kind: TradeEventKind::Open,
                volume: dec!(1.0),
                price: dec!(1.0850),
                profit: None,
                magic: None,
                timestamp: Utc::now(),
                source_account_id: "100500".to_string(),
            })
            .await
            .unwrap();
        }
        drop(tx);

        dispatch_loop(engine.clone(), vec!["g1".to_string()], rx).await;

        assert_eq!(adapter.sent_commands().await.len(), 2);
        let rows = db.recent_activity("g1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_endpoints_parse_all_transports() {
        let raw = r#"{
            "accounts": {
                "100500": {
                    "transport": "socket_bus",
                    "broadcast_addr": "127.0.0.1:9100",
                    "command_addr": "127.0.0.1:9101"
                },
                "200100": {
                    "transport": "file_ipc",
                    "dir": "/var/lib/hedgesync/mt4-200100"
                },
                "300200": {
                    "transport": "named_pipe",
                    "status_pipe": "/run/hedgesync/ct-300200.status",
                    "command_pipe": "/run/hedgesync/ct-300200.cmd"
                }
            }
        }"#;

        let parsed: EndpointsConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.accounts.len(), 3);
        assert!(matches!(
            parsed.accounts["100500"],
            TransportEndpoint::SocketBus { .. }
        ));
        assert!(matches!(
            parsed.accounts["200100"],
            TransportEndpoint::FileIpc { .. }
        ));
        assert!(matches!(
            parsed.accounts["300200"],
            TransportEndpoint::NamedPipe { .. }
        ));
    }

    #[test]
    fn test_build_adapter_keeps_account_identity() {
        let endpoint = TransportEndpoint::SocketBus {
            broadcast_addr: "127.0.0.1:9100".to_string(),
            command_addr: "127.0.0.1:9101".to_string(),
        };
        let adapter = build_adapter("100500", &endpoint);
        assert_eq!(adapter.account_id(), "100500");
        assert!(!adapter.is_connected());
    }
}
