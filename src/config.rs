//! Runtime configuration, loaded from the environment.

use anyhow::Result;
use std::time::Duration;

/// Tunables for the dispatch engine and supervisor. Every value has a
/// default; environment variables override.
#[derive(Debug, Clone)]
pub struct CopierConfig {
    pub database_url: String,

    /// Bound on one command round-trip to a follower terminal. Expiry marks
    /// the attempt failed; there is no automatic retry of trade commands.
    pub command_timeout_secs: u64,

    /// Expected heartbeat cadence from terminal bridges.
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before an adapter is declared down.
    pub missed_heartbeat_threshold: u32,

    /// Cap on the supervisor's exponential reconnect backoff.
    pub reconnect_max_interval_secs: u64,

    /// Capacity of each group's bounded event channel.
    pub event_channel_capacity: usize,

    /// Cadence of periodic statistics flushes to the database.
    pub stats_flush_interval_secs: u64,

    /// Dedupe entries older than this are aged out of the database at
    /// startup, keeping the seen-ticket set bounded.
    pub seen_ticket_retention_days: i64,

    /// Log transformed commands without dispatching them.
    pub dry_run: bool,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://hedgesync.db?mode=rwc".to_string(),
            command_timeout_secs: 8,
            heartbeat_interval_secs: 5,
            missed_heartbeat_threshold: 3,
            reconnect_max_interval_secs: 60,
            event_channel_capacity: 256,
            stats_flush_interval_secs: 30,
            seen_ticket_retention_days: 30,
            dry_run: false,
        }
    }
}

impl CopierConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: std::env::var("HEDGESYNC_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            command_timeout_secs: env_parse("HEDGESYNC_COMMAND_TIMEOUT_SECS")?
                .unwrap_or(defaults.command_timeout_secs),
            heartbeat_interval_secs: env_parse("HEDGESYNC_HEARTBEAT_INTERVAL_SECS")?
                .unwrap_or(defaults.heartbeat_interval_secs),
            missed_heartbeat_threshold: env_parse("HEDGESYNC_MISSED_HEARTBEAT_THRESHOLD")?
                .unwrap_or(defaults.missed_heartbeat_threshold),
            reconnect_max_interval_secs: env_parse("HEDGESYNC_RECONNECT_MAX_INTERVAL_SECS")?
                .unwrap_or(defaults.reconnect_max_interval_secs),
            event_channel_capacity: env_parse("HEDGESYNC_EVENT_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.event_channel_capacity),
            stats_flush_interval_secs: env_parse("HEDGESYNC_STATS_FLUSH_INTERVAL_SECS")?
                .unwrap_or(defaults.stats_flush_interval_secs),
            seen_ticket_retention_days: env_parse("HEDGESYNC_SEEN_TICKET_RETENTION_DAYS")?
                .unwrap_or(defaults.seen_ticket_retention_days),
            dry_run: std::env::var("HEDGESYNC_DRY_RUN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.dry_run),
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_max_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_interval_secs)
    }

    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs(self.stats_flush_interval_secs)
    }

    /// Silence longer than this marks the connection down.
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * self.missed_heartbeat_threshold as u64)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}
