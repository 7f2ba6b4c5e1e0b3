//! HedgeSync: trade-hedging copier daemon
//!
//! Mirrors positions from leader trading accounts onto follower accounts
//! across MT5, MT4 and cTrader terminals, with per-follower risk transforms
//! and reverse (hedge) execution.

mod activity;
mod adapters;
mod config;
mod db;
mod engine;
mod errors;
mod license;
mod models;
mod protocol;
mod runner;
mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use crate::config::CopierConfig;
use crate::db::Database;
use crate::license::LicenseManager;
use crate::models::{
    CopierGroup, FollowerConfig, FollowerStats, FollowerStatus, GroupStats, GroupStatus, LotSpec,
    Platform,
};
use crate::runner::{EndpointsConfig, Runner};

/// HedgeSync copier CLI.
#[derive(Parser)]
#[command(name = "hedgesync")]
#[command(about = "Mirror leader account trades onto hedge follower accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./hedgesync.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the copier daemon
    Run {
        /// Path to the account endpoints file
        #[arg(short, long, default_value = "endpoints.json")]
        endpoints: PathBuf,

        /// Log transformed commands without dispatching them
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a copier group for a leader account
    CreateGroup {
        /// Display name
        name: String,

        /// Leader account id
        #[arg(short = 'a', long)]
        leader_account: String,

        /// Leader platform (mt5, mt4, ctrader)
        #[arg(short, long, default_value = "mt5")]
        platform: String,

        /// Broker suffix stripped off leader symbols (e.g. ".m")
        #[arg(long, default_value = "")]
        suffix_remove: String,

        /// Leader P&L baseline at creation
        #[arg(long, default_value = "0")]
        baseline_pnl: f64,

        /// Prop-firm phase label for the leader account
        #[arg(long)]
        phase: Option<String>,
    },

    /// Add a follower account to a group
    AddFollower {
        /// Group id
        group: String,

        /// Follower account id
        #[arg(short, long)]
        account: String,

        /// Follower platform (mt5, mt4, ctrader)
        #[arg(short, long, default_value = "ctrader")]
        platform: String,

        /// Lot multiplier applied to leader volume
        #[arg(short, long, default_value = "1.0")]
        multiplier: f64,

        /// Copy same-direction instead of hedging
        #[arg(long)]
        no_reverse: bool,

        /// Symbol suffix for the follower's broker (e.g. ".pro")
        #[arg(long, default_value = "")]
        suffix: String,

        /// Comma-separated symbol whitelist
        #[arg(long)]
        whitelist: Option<String>,

        /// Comma-separated symbol blacklist
        #[arg(long)]
        blacklist: Option<String>,

        /// Comma-separated magic number whitelist
        #[arg(long)]
        magic_whitelist: Option<String>,

        /// Comma-separated magic number blacklist
        #[arg(long)]
        magic_blacklist: Option<String>,

        /// Balance baseline for hedge accounting
        #[arg(long, default_value = "0")]
        baseline_balance: f64,

        /// Prop-firm phase label
        #[arg(long)]
        phase: Option<String>,
    },

    /// List all groups and their followers
    List,

    /// Pause a group (no dispatch until resumed)
    Pause {
        /// Group id
        group: String,
    },

    /// Resume a paused group
    Resume {
        /// Group id
        group: String,
    },

    /// Show recent copy activity for a group
    Activity {
        /// Group id
        group: String,

        /// Number of rows to show
        #[arg(short, long, default_value = "25")]
        limit: i64,
    },

    /// Show statistics for a group
    Stats {
        /// Group id
        group: String,
    },

    /// Validate the license and show plan and token TTL
    License {
        /// Account id presented to the license server
        #[arg(short, long, default_value = "-")]
        account: String,

        /// Broker name presented to the license server
        #[arg(short, long, default_value = "-")]
        broker: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { endpoints, dry_run } => {
            let mut config = CopierConfig::from_env()?;
            config.database_url = cli.database.clone();
            config.dry_run = config.dry_run || dry_run;

            let endpoints = EndpointsConfig::load(&endpoints)?;
            let license = Arc::new(license_from_env_or_exit()?);

            let runner = Runner::build(config.clone(), endpoints, license).await?;

            println!("\n=== HedgeSync Copier ===");
            println!("Database: {}", cli.database);
            println!(
                "Mode: {}",
                if config.dry_run {
                    "DRY RUN (no commands dispatched)"
                } else {
                    "LIVE"
                }
            );
            println!("Command timeout: {}s", config.command_timeout_secs);
            println!("\nPress Ctrl+C to stop.\n");

            runner.run().await?;
        }

        Commands::CreateGroup {
            name,
            leader_account,
            platform,
            suffix_remove,
            baseline_pnl,
            phase,
        } => {
            let db = Database::new(&cli.database).await?;

            let group = CopierGroup {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                status: GroupStatus::Paused,
                leader_account_id: leader_account,
                leader_platform: platform.parse::<Platform>()?,
                leader_phase: phase,
                leader_symbol_suffix_remove: suffix_remove,
                leader_baseline_pnl: Decimal::try_from(baseline_pnl)?,
                followers: vec![],
                stats: GroupStats::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            group.validate()?;
            db.save_group(&group).await?;

            info!(group = %group.id, name = %name, "group created");
            println!("Created group '{}' ({})", name, group.id);
            println!("Add followers, then resume it: hedgesync resume {}", group.id);
        }

        Commands::AddFollower {
            group,
            account,
            platform,
            multiplier,
            no_reverse,
            suffix,
            whitelist,
            blacklist,
            magic_whitelist,
            magic_blacklist,
            baseline_balance,
            phase,
        } => {
            let db = Database::new(&cli.database).await?;
            let groups = db.load_groups().await?;
            let target = groups
                .iter()
                .find(|g| g.id == group)
                .ok_or_else(|| anyhow::anyhow!("group not found: {group}"))?;

            let follower = FollowerConfig {
                id: Uuid::new_v4().to_string(),
                account_id: account.clone(),
                platform: platform.parse::<Platform>()?,
                phase,
                status: FollowerStatus::Active,
                lot_multiplier: Decimal::try_from(multiplier)?,
                reverse_mode: !no_reverse,
                symbol_whitelist: split_list(whitelist),
                symbol_blacklist: split_list(blacklist),
                symbol_suffix: suffix,
                symbol_aliases: HashMap::new(),
                magic_whitelist: split_magic(magic_whitelist)?,
                magic_blacklist: split_magic(magic_blacklist)?,
                lot_spec: LotSpec::default(),
                baseline_balance: Decimal::try_from(baseline_balance)?,
                stats: FollowerStats::default(),
            };
            follower.validate()?;
            db.save_follower(&target.id, &follower).await?;

            println!(
                "Added follower {} ({}) to group '{}': x{} {}",
                account,
                follower.id,
                target.name,
                multiplier,
                if follower.reverse_mode {
                    "reversed"
                } else {
                    "same-direction"
                }
            );
        }

        Commands::List => {
            let db = Database::new(&cli.database).await?;
            let groups = db.load_groups().await?;

            if groups.is_empty() {
                println!("No groups configured. Use 'hedgesync create-group <name>' to add one.");
                return Ok(());
            }

            for group in groups {
                println!(
                    "\n{} [{}]  leader {} ({})  {}",
                    group.name,
                    group.status.as_str(),
                    group.leader_account_id,
                    group.leader_platform.as_str(),
                    group.id,
                );
                println!(
                    "  {:<38} {:<10} {:<9} {:>6} {:>8} {:>7}",
                    "FOLLOWER", "ACCOUNT", "PLATFORM", "MULT", "REVERSE", "STATUS"
                );
                for f in &group.followers {
                    println!(
                        "  {:<38} {:<10} {:<9} {:>6} {:>8} {:>7}",
                        f.id,
                        f.account_id,
                        f.platform.as_str(),
                        f.lot_multiplier,
                        if f.reverse_mode { "yes" } else { "no" },
                        f.status.as_str(),
                    );
                }
            }
        }

        Commands::Pause { group } => {
            let db = Database::new(&cli.database).await?;
            db.update_group_status(&group, GroupStatus::Paused).await?;
            println!("Paused group {}", group);
        }

        Commands::Resume { group } => {
            let db = Database::new(&cli.database).await?;
            db.update_group_status(&group, GroupStatus::Active).await?;
            println!("Resumed group {}", group);
        }

        Commands::Activity { group, limit } => {
            let db = Database::new(&cli.database).await?;
            let rows = db.recent_activity(&group, limit).await?;

            if rows.is_empty() {
                println!("No activity recorded for group {}", group);
                return Ok(());
            }

            println!(
                "{:<20} {:<8} {:<10} {:<5} {:>8} {:>8} {:<8} ERROR",
                "TIME", "KIND", "SYMBOL", "SIDE", "VOLUME", "LAT(MS)", "STATUS"
            );
            println!("{}", "-".repeat(90));
            for row in rows {
                println!(
                    "{:<20} {:<8} {:<10} {:<5} {:>8.2} {:>8} {:<8} {}",
                    &row.timestamp[..19.min(row.timestamp.len())],
                    row.kind().as_str(),
                    row.symbol,
                    row.action().as_str(),
                    row.volume,
                    row.latency_ms,
                    row.status().as_str(),
                    row.error_message.as_deref().unwrap_or("-"),
                );
            }
        }

        Commands::Stats { group } => {
            let db = Database::new(&cli.database).await?;
            let groups = db.load_groups().await?;
            let target = groups
                .iter()
                .find(|g| g.id == group)
                .ok_or_else(|| anyhow::anyhow!("group not found: {group}"))?;

            let (total, success, failed) = db.activity_counts(&group).await?;

            println!("\n=== Group: {} ===", target.name);
            println!("Status:           {}", target.status.as_str());
            println!(
                "Followers:        {} ({} active)",
                target.stats.total_followers, target.stats.active_followers
            );
            println!("Activity rows:    {}", total);
            println!("Successful:       {}", success);
            println!("Failed:           {}", failed);
            if let Some(flushed) = db.load_group_stats(&group).await? {
                println!(
                    "Last flush:       {:.1}% success, avg {:.0}ms",
                    flushed.success_rate() * 100.0,
                    flushed.avg_latency_ms,
                );
            }

            println!("\n--- Followers ---");
            for f in &target.followers {
                println!(
                    "{} ({}): {} trades ({} today), {} failed, {:.1}% success, avg {:.0}ms, P&L {}",
                    f.account_id,
                    f.id,
                    f.stats.trades_total,
                    f.stats.trades_today,
                    f.stats.failed_copies,
                    f.stats.success_rate() * 100.0,
                    f.stats.avg_latency_ms,
                    f.stats.total_profit,
                );
            }
        }

        Commands::License { account, broker } => {
            let manager = LicenseManager::from_env(&account, &broker)?;

            match manager.validate("cli").await {
                Ok(token) => {
                    println!("License valid");
                    println!("Plan:       {}", token.plan);
                    println!("Token TTL:  {}s", manager.token_ttl());

                    // Remember the device registration for the daemon
                    let db = Database::new(&cli.database).await?;
                    let creds = manager.credentials();
                    db.save_license_record(
                        &creds.key,
                        &creds.device_id,
                        &token.token,
                        &token.plan,
                        token.expires_at,
                    )
                    .await?;
                }
                Err(e) => {
                    println!("License check failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn license_from_env_or_exit() -> Result<LicenseManager> {
    LicenseManager::from_env("-", "-").map_err(|e| {
        anyhow::anyhow!("{e}. Set HEDGESYNC_LICENSE_KEY (and optionally HEDGESYNC_LICENSE_URL).")
    })
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn split_magic(raw: Option<String>) -> Result<Vec<i64>> {
    split_list(raw)
        .into_iter()
        .map(|item| {
            item.parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid magic number '{item}': {e}"))
        })
        .collect()
}
