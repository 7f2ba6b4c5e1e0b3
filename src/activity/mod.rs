//! Activity recording and statistics aggregation.
//!
//! Every copy attempt lands in the database as an append-only row before its
//! outcome is acknowledged anywhere else. Statistics are maintained
//! incrementally on top of the same stream (running counters and a running
//! latency mean), so reading stats never rescans the log.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Database;
use crate::models::{CopierActivityEntry, FollowerStats, GroupStats};

/// How a recorded entry affects follower statistics.
#[derive(Debug, Clone)]
pub enum StatImpact {
    /// Command executed on the follower terminal.
    Copied {
        latency_ms: u64,
        profit_delta: Option<Decimal>,
    },

    /// Dispatch attempted and failed (timeout, transport, broker rejection).
    Failed,

    /// Event never reached the wire (filter skip, license gate). Logged for
    /// the audit trail but not counted against the follower's success rate.
    Filtered,
}

/// Append-only activity log with incremental per-follower statistics.
pub struct ActivityLog {
    db: Arc<Database>,
    stats: Mutex<HashMap<(String, String), FollowerStats>>,
    day: Mutex<NaiveDate>,
}

impl ActivityLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            stats: Mutex::new(HashMap::new()),
            day: Mutex::new(Utc::now().date_naive()),
        }
    }

    /// Preload stats flushed by a previous run.
    pub async fn seed(&self, group_id: &str, follower_id: &str, stats: FollowerStats) {
        self.stats
            .lock()
            .await
            .insert((group_id.to_string(), follower_id.to_string()), stats);
    }

    /// Durably append one entry, then fold it into the running statistics.
    /// The database write happens first: an entry that never hits disk must
    /// not be visible in any counter.
    pub async fn record(&self, entry: CopierActivityEntry, impact: StatImpact) -> Result<()> {
        self.db.append_activity(&entry).await?;
        self.roll_day_if_needed().await;

        let key = (entry.group_id.clone(), entry.follower_id.clone());
        let mut stats = self.stats.lock().await;
        let follower = stats.entry(key).or_default();

        match impact {
            StatImpact::Copied {
                latency_ms,
                profit_delta,
            } => {
                follower.trades_today += 1;
                follower.trades_total += 1;
                // Running mean: avg += (x - avg) / n
                let n = follower.trades_total as f64;
                follower.avg_latency_ms += (latency_ms as f64 - follower.avg_latency_ms) / n;
                if let Some(delta) = profit_delta {
                    follower.total_profit += delta;
                }
                follower.last_copy_time = Some(entry.timestamp);
            }
            StatImpact::Failed => {
                follower.failed_copies += 1;
            }
            StatImpact::Filtered => {
                debug!(
                    group = %entry.group_id,
                    follower = %entry.follower_id,
                    reason = entry.error_message.as_deref().unwrap_or(""),
                    "event filtered"
                );
            }
        }

        Ok(())
    }

    /// Reset the daily counters when the UTC day has rolled over.
    async fn roll_day_if_needed(&self) {
        let today = Utc::now().date_naive();
        let mut day = self.day.lock().await;
        if *day != today {
            *day = today;
            for stats in self.stats.lock().await.values_mut() {
                stats.trades_today = 0;
            }
        }
    }

    pub async fn follower_stats(&self, group_id: &str, follower_id: &str) -> FollowerStats {
        self.stats
            .lock()
            .await
            .get(&(group_id.to_string(), follower_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate across every follower of a group.
    pub async fn group_stats(
        &self,
        group_id: &str,
        total_followers: u32,
        active_followers: u32,
    ) -> GroupStats {
        let stats = self.stats.lock().await;
        let mut out = GroupStats {
            total_followers,
            active_followers,
            ..Default::default()
        };

        let mut latency_weight = 0u64;
        for ((gid, _), s) in stats.iter() {
            if gid != group_id {
                continue;
            }
            out.trades_total += s.trades_total;
            out.failed_copies += s.failed_copies;
            latency_weight += s.trades_total;
            out.avg_latency_ms += s.avg_latency_ms * s.trades_total as f64;
        }
        if latency_weight > 0 {
            out.avg_latency_ms /= latency_weight as f64;
        }

        out
    }

    /// Persist every follower's running statistics.
    pub async fn flush(&self) -> Result<()> {
        let stats = self.stats.lock().await;
        for ((group_id, follower_id), s) in stats.iter() {
            self.db
                .flush_follower_stats(group_id, follower_id, s)
                .await?;
        }
        debug!(followers = stats.len(), "statistics flushed");
        Ok(())
    }
}
