//! Database persistence for copier state.
//!
//! Stores everything needed to resume after restart:
//! - Group and follower configuration
//! - The append-only activity log (no update or delete path exists)
//! - Seen leader tickets (duplicate-delivery dedupe)
//! - Open hedges (for crash-recovery reconciliation)
//! - Follower/group statistics flushes
//! - License device registrations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    ActivityKind, ActivityStatus, CopierActivityEntry, CopierGroup, FollowerConfig, FollowerStats,
    FollowerStatus, GroupStats, GroupStatus, TradeAction,
};

/// Database connection pool with full state management.
pub struct Database {
    pool: SqlitePool,
}

/// Stored activity row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredActivity {
    pub id: String,
    pub group_id: String,
    pub follower_id: String,
    pub timestamp: String,
    pub kind: String,
    pub symbol: String,
    pub action: String,
    pub volume: f64,
    pub price: f64,
    pub latency_ms: i64,
    pub status: String,
    pub error_message: Option<String>,
}

/// Persisted in-flight hedge: a successfully opened copy that has not been
/// closed yet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpenHedge {
    pub group_id: String,
    pub follower_id: String,
    pub leader_ticket: i64,
    pub follower_ticket: i64,
    pub symbol: String,
    pub volume: f64,
    pub opened_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Copier groups
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copier_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'paused',
                leader_account_id TEXT NOT NULL,
                leader_platform TEXT NOT NULL,
                leader_phase TEXT,
                leader_suffix_remove TEXT NOT NULL DEFAULT '',
                leader_baseline_pnl REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Followers; filter configuration kept as one JSON document
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS followers (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                phase TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                lot_multiplier REAL NOT NULL DEFAULT 1.0,
                reverse_mode INTEGER NOT NULL DEFAULT 1,
                filters_json TEXT NOT NULL DEFAULT '{}',
                baseline_balance REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (group_id) REFERENCES copier_groups(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Activity log: append-only, rows are never updated or deleted
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                volume REAL NOT NULL,
                price REAL NOT NULL,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Seen leader tickets (to avoid duplicate fills)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_tickets (
                group_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                leader_ticket INTEGER NOT NULL,
                seen_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (group_id, follower_id, leader_ticket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // In-flight hedges for restart reconciliation
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_hedges (
                group_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                leader_ticket INTEGER NOT NULL,
                follower_ticket INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                volume REAL NOT NULL,
                opened_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (group_id, follower_id, leader_ticket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follower stats flushes
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_stats (
                follower_id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                trades_today INTEGER NOT NULL DEFAULT 0,
                trades_total INTEGER NOT NULL DEFAULT 0,
                failed_copies INTEGER NOT NULL DEFAULT 0,
                total_profit REAL NOT NULL DEFAULT 0,
                avg_latency_ms REAL NOT NULL DEFAULT 0,
                last_copy_time TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Group stats flushes
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_stats (
                group_id TEXT PRIMARY KEY,
                total_followers INTEGER NOT NULL DEFAULT 0,
                active_followers INTEGER NOT NULL DEFAULT 0,
                trades_total INTEGER NOT NULL DEFAULT 0,
                failed_copies INTEGER NOT NULL DEFAULT 0,
                avg_latency_ms REAL NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // License device registrations
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS license_devices (
                license_key TEXT NOT NULL,
                device_id TEXT NOT NULL,
                token TEXT NOT NULL DEFAULT '',
                plan TEXT NOT NULL DEFAULT '',
                expires_at TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (license_key, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_activity_group ON activity_log(group_id, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_activity_follower ON activity_log(follower_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_followers_group ON followers(group_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Groups ====================

    /// Insert or update a group and all of its followers.
    pub async fn save_group(&self, group: &CopierGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copier_groups (
                id, name, status, leader_account_id, leader_platform, leader_phase,
                leader_suffix_remove, leader_baseline_pnl, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                leader_suffix_remove = excluded.leader_suffix_remove,
                updated_at = datetime('now')
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(group.status.as_str())
        .bind(&group.leader_account_id)
        .bind(group.leader_platform.as_str())
        .bind(&group.leader_phase)
        .bind(&group.leader_symbol_suffix_remove)
        .bind(group.leader_baseline_pnl.to_f64().unwrap_or(0.0))
        .bind(group.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        for follower in &group.followers {
            self.save_follower(&group.id, follower).await?;
        }

        Ok(())
    }

    /// Insert or update one follower.
    pub async fn save_follower(&self, group_id: &str, follower: &FollowerConfig) -> Result<()> {
        let filters = serde_json::json!({
            "symbol_whitelist": follower.symbol_whitelist,
            "symbol_blacklist": follower.symbol_blacklist,
            "symbol_suffix": follower.symbol_suffix,
            "symbol_aliases": follower.symbol_aliases,
            "magic_whitelist": follower.magic_whitelist,
            "magic_blacklist": follower.magic_blacklist,
            "lot_spec": follower.lot_spec,
        });

        sqlx::query(
            r#"
            INSERT INTO followers (
                id, group_id, account_id, platform, phase, status,
                lot_multiplier, reverse_mode, filters_json, baseline_balance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                lot_multiplier = excluded.lot_multiplier,
                reverse_mode = excluded.reverse_mode,
                filters_json = excluded.filters_json,
                updated_at = datetime('now')
            "#,
        )
        .bind(&follower.id)
        .bind(group_id)
        .bind(&follower.account_id)
        .bind(follower.platform.as_str())
        .bind(&follower.phase)
        .bind(follower.status.as_str())
        .bind(follower.lot_multiplier.to_f64().unwrap_or(1.0))
        .bind(follower.reverse_mode as i32)
        .bind(filters.to_string())
        .bind(follower.baseline_balance.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every group with its followers and last flushed stats.
    pub async fn load_groups(&self) -> Result<Vec<CopierGroup>> {
        #[derive(sqlx::FromRow)]
        struct GroupRow {
            id: String,
            name: String,
            status: String,
            leader_account_id: String,
            leader_platform: String,
            leader_phase: Option<String>,
            leader_suffix_remove: String,
            leader_baseline_pnl: f64,
            created_at: String,
            updated_at: String,
        }

        #[derive(sqlx::FromRow)]
        struct FollowerRow {
            id: String,
            account_id: String,
            platform: String,
            phase: Option<String>,
            status: String,
            lot_multiplier: f64,
            reverse_mode: i64,
            filters_json: String,
            baseline_balance: f64,
        }

        let group_rows: Vec<GroupRow> =
            sqlx::query_as("SELECT * FROM copier_groups ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        let mut groups = Vec::with_capacity(group_rows.len());
        for row in group_rows {
            let follower_rows: Vec<FollowerRow> = sqlx::query_as(
                "SELECT id, account_id, platform, phase, status, lot_multiplier, reverse_mode, filters_json, baseline_balance FROM followers WHERE group_id = ?",
            )
            .bind(&row.id)
            .fetch_all(&self.pool)
            .await?;

            let mut followers = Vec::with_capacity(follower_rows.len());
            for f in follower_rows {
                let filters: serde_json::Value =
                    serde_json::from_str(&f.filters_json).unwrap_or_default();

                let stats = self.load_follower_stats(&f.id).await?.unwrap_or_default();

                followers.push(FollowerConfig {
                    id: f.id,
                    account_id: f.account_id,
                    platform: f.platform.parse().map_err(|e| anyhow::anyhow!("{e}"))?,
                    phase: f.phase,
                    status: parse_follower_status(&f.status),
                    lot_multiplier: Decimal::try_from(f.lot_multiplier)?,
                    reverse_mode: f.reverse_mode != 0,
                    symbol_whitelist: json_field(&filters, "symbol_whitelist"),
                    symbol_blacklist: json_field(&filters, "symbol_blacklist"),
                    symbol_suffix: filters
                        .get("symbol_suffix")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    symbol_aliases: json_field(&filters, "symbol_aliases"),
                    magic_whitelist: json_field(&filters, "magic_whitelist"),
                    magic_blacklist: json_field(&filters, "magic_blacklist"),
                    lot_spec: filters
                        .get("lot_spec")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default(),
                    baseline_balance: Decimal::try_from(f.baseline_balance)?,
                    stats,
                });
            }

            let mut group = CopierGroup {
                id: row.id,
                name: row.name,
                status: parse_group_status(&row.status),
                leader_account_id: row.leader_account_id,
                leader_platform: row.leader_platform.parse().map_err(|e| anyhow::anyhow!("{e}"))?,
                leader_phase: row.leader_phase,
                leader_symbol_suffix_remove: row.leader_suffix_remove,
                leader_baseline_pnl: Decimal::try_from(row.leader_baseline_pnl)?,
                followers,
                stats: Default::default(),
                created_at: parse_time(&row.created_at),
                updated_at: parse_time(&row.updated_at),
            };
            group.refresh_follower_counts();
            groups.push(group);
        }

        Ok(groups)
    }

    pub async fn update_group_status(&self, group_id: &str, status: GroupStatus) -> Result<()> {
        sqlx::query(
            "UPDATE copier_groups SET status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_follower_status(
        &self,
        follower_id: &str,
        status: FollowerStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE followers SET status = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(status.as_str())
            .bind(follower_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Activity Log ====================

    /// Durably append one activity row. There is deliberately no update or
    /// delete counterpart.
    pub async fn append_activity(&self, entry: &CopierActivityEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (
                id, group_id, follower_id, timestamp, kind, symbol, action,
                volume, price, latency_ms, status, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.group_id)
        .bind(&entry.follower_id)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.kind.as_str())
        .bind(entry.symbol.as_str())
        .bind(entry.action.as_str())
        .bind(entry.volume.to_f64().unwrap_or(0.0))
        .bind(entry.price.to_f64().unwrap_or(0.0))
        .bind(entry.latency_ms as i64)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recent activity for a group, newest first.
    pub async fn recent_activity(&self, group_id: &str, limit: i64) -> Result<Vec<StoredActivity>> {
        sqlx::query_as::<_, StoredActivity>(
            "SELECT * FROM activity_log WHERE group_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch activity")
    }

    /// Activity counts (total, success, failed) for a group.
    pub async fn activity_counts(&self, group_id: &str) -> Result<(i64, i64, i64)> {
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM activity_log WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(&self.pool)
                .await?;

        let (success,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM activity_log WHERE group_id = ? AND status = 'success'",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;

        let (failed,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM activity_log WHERE group_id = ? AND status = 'failed'",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((total, success, failed))
    }

    // ==================== Seen Tickets ====================

    pub async fn has_seen_ticket(
        &self,
        group_id: &str,
        follower_id: &str,
        leader_ticket: i64,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM seen_tickets WHERE group_id = ? AND follower_id = ? AND leader_ticket = ?",
        )
        .bind(group_id)
        .bind(follower_id)
        .bind(leader_ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    pub async fn mark_ticket_seen(
        &self,
        group_id: &str,
        follower_id: &str,
        leader_ticket: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO seen_tickets (group_id, follower_id, leader_ticket) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(follower_id)
        .bind(leader_ticket)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Age out dedupe entries older than the retention window. The seen set
    /// only has to outlive duplicate delivery of the same leader ticket, not
    /// the account's full history, so old rows are dropped before the set is
    /// loaded into memory. Returns the number of rows removed.
    pub async fn prune_seen_tickets(&self, max_age_days: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM seen_tickets WHERE seen_at < datetime('now', ?)")
            .bind(format!("-{max_age_days} days"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All seen tickets, loaded once at startup into the engine's in-memory set.
    pub async fn load_seen_tickets(&self) -> Result<Vec<(String, String, i64)>> {
        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT group_id, follower_id, leader_ticket FROM seen_tickets")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // ==================== Open Hedges ====================

    pub async fn record_open_hedge(
        &self,
        group_id: &str,
        follower_id: &str,
        leader_ticket: i64,
        follower_ticket: i64,
        symbol: &str,
        volume: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO open_hedges
                (group_id, follower_id, leader_ticket, follower_ticket, symbol, volume)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(follower_id)
        .bind(leader_ticket)
        .bind(follower_ticket)
        .bind(symbol)
        .bind(volume.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_open_hedge(
        &self,
        group_id: &str,
        follower_id: &str,
        leader_ticket: i64,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM open_hedges WHERE group_id = ? AND follower_id = ? AND leader_ticket = ?",
        )
        .bind(group_id)
        .bind(follower_id)
        .bind(leader_ticket)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn open_hedges_for_follower(
        &self,
        group_id: &str,
        follower_id: &str,
    ) -> Result<Vec<OpenHedge>> {
        sqlx::query_as::<_, OpenHedge>(
            "SELECT * FROM open_hedges WHERE group_id = ? AND follower_id = ?",
        )
        .bind(group_id)
        .bind(follower_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open hedges")
    }

    // ==================== Stats ====================

    pub async fn flush_follower_stats(
        &self,
        group_id: &str,
        follower_id: &str,
        stats: &FollowerStats,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follower_stats (
                follower_id, group_id, trades_today, trades_total, failed_copies,
                total_profit, avg_latency_ms, last_copy_time, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(follower_id) DO UPDATE SET
                trades_today = excluded.trades_today,
                trades_total = excluded.trades_total,
                failed_copies = excluded.failed_copies,
                total_profit = excluded.total_profit,
                avg_latency_ms = excluded.avg_latency_ms,
                last_copy_time = excluded.last_copy_time,
                updated_at = datetime('now')
            "#,
        )
        .bind(follower_id)
        .bind(group_id)
        .bind(stats.trades_today as i64)
        .bind(stats.trades_total as i64)
        .bind(stats.failed_copies as i64)
        .bind(stats.total_profit.to_f64().unwrap_or(0.0))
        .bind(stats.avg_latency_ms)
        .bind(stats.last_copy_time.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn flush_group_stats(&self, group_id: &str, stats: &GroupStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_stats (
                group_id, total_followers, active_followers, trades_total,
                failed_copies, avg_latency_ms, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(group_id) DO UPDATE SET
                total_followers = excluded.total_followers,
                active_followers = excluded.active_followers,
                trades_total = excluded.trades_total,
                failed_copies = excluded.failed_copies,
                avg_latency_ms = excluded.avg_latency_ms,
                updated_at = datetime('now')
            "#,
        )
        .bind(group_id)
        .bind(stats.total_followers as i64)
        .bind(stats.active_followers as i64)
        .bind(stats.trades_total as i64)
        .bind(stats.failed_copies as i64)
        .bind(stats.avg_latency_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_group_stats(&self, group_id: &str) -> Result<Option<GroupStats>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            total_followers: i64,
            active_followers: i64,
            trades_total: i64,
            failed_copies: i64,
            avg_latency_ms: f64,
        }

        let row: Option<Row> = sqlx::query_as(
            "SELECT total_followers, active_followers, trades_total, failed_copies, avg_latency_ms FROM group_stats WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| GroupStats {
            total_followers: r.total_followers as u32,
            active_followers: r.active_followers as u32,
            trades_total: r.trades_total as u64,
            failed_copies: r.failed_copies as u64,
            avg_latency_ms: r.avg_latency_ms,
        }))
    }

    pub async fn load_follower_stats(&self, follower_id: &str) -> Result<Option<FollowerStats>> {
        #[derive(sqlx::FromRow)]
        struct StatsRow {
            trades_today: i64,
            trades_total: i64,
            failed_copies: i64,
            total_profit: f64,
            avg_latency_ms: f64,
            last_copy_time: Option<String>,
        }

        let row: Option<StatsRow> = sqlx::query_as(
            "SELECT trades_today, trades_total, failed_copies, total_profit, avg_latency_ms, last_copy_time FROM follower_stats WHERE follower_id = ?",
        )
        .bind(follower_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| FollowerStats {
            trades_today: r.trades_today as u64,
            trades_total: r.trades_total as u64,
            failed_copies: r.failed_copies as u64,
            total_profit: Decimal::try_from(r.total_profit).unwrap_or(Decimal::ZERO),
            avg_latency_ms: r.avg_latency_ms,
            last_copy_time: r.last_copy_time.as_deref().map(parse_time),
        }))
    }

    // ==================== License ====================

    pub async fn save_license_record(
        &self,
        license_key: &str,
        device_id: &str,
        token: &str,
        plan: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO license_devices (license_key, device_id, token, plan, expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(license_key, device_id) DO UPDATE SET
                token = excluded.token,
                plan = excluded.plan,
                expires_at = excluded.expires_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(license_key)
        .bind(device_id)
        .bind(token)
        .bind(plan)
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_group_status(s: &str) -> GroupStatus {
    match s {
        "active" => GroupStatus::Active,
        "error" => GroupStatus::Error,
        _ => GroupStatus::Paused,
    }
}

fn parse_follower_status(s: &str) -> FollowerStatus {
    match s {
        "active" => FollowerStatus::Active,
        "paused" => FollowerStatus::Paused,
        "error" => FollowerStatus::Error,
        _ => FollowerStatus::Pending,
    }
}

fn json_field<T: serde::de::DeserializeOwned + Default>(value: &serde_json::Value, key: &str) -> T {
    value
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Convert a stored activity row back into the domain entry.
impl StoredActivity {
    pub fn kind(&self) -> ActivityKind {
        match self.kind.as_str() {
            "open" => ActivityKind::Open,
            "close" => ActivityKind::Close,
            "modify" => ActivityKind::Modify,
            _ => ActivityKind::Error,
        }
    }

    pub fn status(&self) -> ActivityStatus {
        if self.status == "success" {
            ActivityStatus::Success
        } else {
            ActivityStatus::Failed
        }
    }

    pub fn action(&self) -> TradeAction {
        if self.action == "BUY" {
            TradeAction::Buy
        } else {
            TradeAction::Sell
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityKind, ActivityStatus, Platform};
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn sample_entry(id: &str, status: ActivityStatus) -> CopierActivityEntry {
        CopierActivityEntry {
            id: id.to_string(),
            group_id: "g1".to_string(),
            follower_id: "f1".to_string(),
            timestamp: Utc::now(),
            kind: ActivityKind::Open,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Sell,
            volume: dec!(0.5),
            price: dec!(1.0850),
            latency_ms: 42,
            status,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_activity_append_and_counts() {
        let db = memory_db().await;

        db.append_activity(&sample_entry("a1", ActivityStatus::Success))
            .await
            .unwrap();
        db.append_activity(&sample_entry("a2", ActivityStatus::Failed))
            .await
            .unwrap();

        let (total, success, failed) = db.activity_counts("g1").await.unwrap();
        assert_eq!((total, success, failed), (2, 1, 1));

        let recent = db.recent_activity("g1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind(), ActivityKind::Open);
    }

    #[tokio::test]
    async fn test_seen_ticket_dedupe() {
        let db = memory_db().await;

        assert!(!db.has_seen_ticket("g1", "f1", 42).await.unwrap());
        db.mark_ticket_seen("g1", "f1", 42).await.unwrap();
        assert!(db.has_seen_ticket("g1", "f1", 42).await.unwrap());

        // Idempotent
        db.mark_ticket_seen("g1", "f1", 42).await.unwrap();
        let all = db.load_seen_tickets().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_seen_tickets_pruned_by_age() {
        let db = memory_db().await;

        db.mark_ticket_seen("g1", "f1", 41).await.unwrap();
        db.mark_ticket_seen("g1", "f1", 42).await.unwrap();

        // Backdate one entry past the retention window
        sqlx::query("UPDATE seen_tickets SET seen_at = datetime('now', '-90 days') WHERE leader_ticket = 41")
            .execute(db.pool())
            .await
            .unwrap();

        let removed = db.prune_seen_tickets(30).await.unwrap();
        assert_eq!(removed, 1);

        assert!(!db.has_seen_ticket("g1", "f1", 41).await.unwrap());
        assert!(db.has_seen_ticket("g1", "f1", 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_hedge_lifecycle() {
        let db = memory_db().await;

        db.record_open_hedge("g1", "f1", 42, 9001, "EURUSD", dec!(0.5))
            .await
            .unwrap();

        let hedges = db.open_hedges_for_follower("g1", "f1").await.unwrap();
        assert_eq!(hedges.len(), 1);
        assert_eq!(hedges[0].leader_ticket, 42);
        assert_eq!(hedges[0].follower_ticket, 9001);

        db.clear_open_hedge("g1", "f1", 42).await.unwrap();
        let hedges = db.open_hedges_for_follower("g1", "f1").await.unwrap();
        assert!(hedges.is_empty());
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let db = memory_db().await;

        let mut group = CopierGroup {
            id: "g1".to_string(),
            name: "fund-a".to_string(),
            status: GroupStatus::Active,
            leader_account_id: "100500".to_string(),
            leader_platform: Platform::Mt5,
            leader_phase: Some("funded".to_string()),
            leader_symbol_suffix_remove: ".m".to_string(),
            leader_baseline_pnl: dec!(100),
            followers: vec![FollowerConfig {
                id: "f1".to_string(),
                account_id: "200100".to_string(),
                platform: Platform::Ctrader,
                phase: None,
                status: FollowerStatus::Active,
                lot_multiplier: dec!(0.5),
                reverse_mode: true,
                symbol_whitelist: vec!["EURUSD".to_string()],
                symbol_blacklist: vec![],
                symbol_suffix: ".pro".to_string(),
                symbol_aliases: Default::default(),
                magic_whitelist: vec![],
                magic_blacklist: vec![7],
                lot_spec: Default::default(),
                baseline_balance: dec!(1000),
                stats: Default::default(),
            }],
            stats: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        group.refresh_follower_counts();

        db.save_group(&group).await.unwrap();

        let loaded = db.load_groups().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let g = &loaded[0];
        assert_eq!(g.id, "g1");
        assert_eq!(g.status, GroupStatus::Active);
        assert_eq!(g.leader_symbol_suffix_remove, ".m");
        assert_eq!(g.followers.len(), 1);

        let f = &g.followers[0];
        assert_eq!(f.platform, Platform::Ctrader);
        assert_eq!(f.lot_multiplier, dec!(0.5));
        assert!(f.reverse_mode);
        assert_eq!(f.symbol_whitelist, vec!["EURUSD".to_string()]);
        assert_eq!(f.magic_blacklist, vec![7]);
        assert_eq!(f.symbol_suffix, ".pro");

        db.update_group_status("g1", GroupStatus::Paused).await.unwrap();
        let loaded = db.load_groups().await.unwrap();
        assert_eq!(loaded[0].status, GroupStatus::Paused);
    }

    #[tokio::test]
    async fn test_follower_stats_flush_round_trip() {
        let db = memory_db().await;

        let stats = FollowerStats {
            trades_today: 3,
            trades_total: 17,
            failed_copies: 2,
            total_profit: dec!(120.5),
            avg_latency_ms: 83.5,
            last_copy_time: Some(Utc::now()),
        };

        db.flush_follower_stats("g1", "f1", &stats).await.unwrap();
        let loaded = db.load_follower_stats("f1").await.unwrap().unwrap();

        assert_eq!(loaded.trades_total, 17);
        assert_eq!(loaded.failed_copies, 2);
        assert!((loaded.avg_latency_ms - 83.5).abs() < f64::EPSILON);
        assert!(loaded.last_copy_time.is_some());
    }

    #[tokio::test]
    async fn test_group_stats_flush_round_trip() {
        let db = memory_db().await;

        let stats = GroupStats {
            total_followers: 2,
            active_followers: 1,
            trades_total: 20,
            failed_copies: 3,
            avg_latency_ms: 91.0,
        };

        db.flush_group_stats("g1", &stats).await.unwrap();
        let loaded = db.load_group_stats("g1").await.unwrap().unwrap();

        assert_eq!(loaded.total_followers, 2);
        assert_eq!(loaded.active_followers, 1);
        assert_eq!(loaded.trades_total, 20);
        assert_eq!(loaded.failed_copies, 3);
        assert!((loaded.success_rate() - 20.0 / 23.0).abs() < 1e-9);
    }
}
