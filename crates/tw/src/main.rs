//! TabWarden CLI.
//!
//! Inspects and maintains the recovery database, and runs a demo engine
//! against the in-memory mock browser to exercise the full restart-recovery
//! flow end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tw_core::anchor::AnchorManager;
use tw_core::browser::{MockBrowser, WindowKind};
use tw_core::cleanup::{cleanup_apply, cleanup_preview, CleanupPlan};
use tw_core::config::Config;
use tw_core::runtime::Runtime;
use tw_core::session::SessionManager;
use tw_core::storage::{now_ms, StorageHandle};

#[derive(Parser)]
#[command(name = "tw", version, about = "TabWarden session-recovery engine")]
struct Cli {
    /// Config file path (TOML).
    #[arg(long, global = true, env = "TW_CONFIG")]
    config: Option<PathBuf>,

    /// Database path override.
    #[arg(long, global = true, env = "TW_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show database and session status.
    Status,
    /// Inspect and resolve pending recovery entries.
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },
    /// Inspect or clear the anchor-window template.
    Anchor {
        #[command(subcommand)]
        action: AnchorAction,
    },
    /// Delete aged orphan windows (dry-run unless --apply).
    Cleanup {
        /// Actually delete instead of previewing.
        #[arg(long)]
        apply: bool,
    },
    /// Show automoved/autoclosed audit entries.
    Audit {
        /// Days of history to show.
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Run the engine against a seeded mock browser and walk through a
    /// restart-recovery cycle.
    Demo,
}

#[derive(Subcommand)]
enum RecoveryAction {
    /// List unresolved orphan windows.
    List,
    /// Delete an orphan window without recreating it.
    Discard { window_id: i64 },
    /// Remove an orphan from the pending list but keep its data.
    Keep { window_id: i64 },
    /// Clear the whole pending list and the recovery banner.
    Dismiss,
}

#[derive(Subcommand)]
enum AnchorAction {
    /// Show the saved anchor template.
    Status,
    /// Delete the anchor template.
    Clear,
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map_or_else(|| ms.to_string(), |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tw=info,tw_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }

    match cli.command {
        Command::Status => status(&config).await,
        Command::Recovery { action } => recovery(&config, action).await,
        Command::Anchor { action } => anchor(&config, action).await,
        Command::Cleanup { apply } => cleanup(&config, apply).await,
        Command::Audit { days } => audit(&config, days).await,
        Command::Demo => demo(config).await,
    }
}

async fn open_storage(config: &Config) -> Result<StorageHandle> {
    let path = config.resolved_db_path();
    debug!(path = %path.display(), "Opening recovery database");
    StorageHandle::new(&path.to_string_lossy())
        .await
        .with_context(|| format!("opening database at {}", path.display()))
}

/// Store-only session handle for recovery/anchor maintenance; the mock
/// browser stands in because these actions never touch a live browser.
fn offline_session(config: &Config, storage: &StorageHandle) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        storage.clone(),
        Arc::new(MockBrowser::new()),
        config.recovery.clone(),
    ))
}

async fn status(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;

    let session = storage.get_active_session().await?;
    let live_windows = storage.windows(false).await?.len();
    let live_tabs = storage.count_tabs(false).await?;
    let orphan_windows = storage.windows(true).await?.len();
    let orphan_tabs = storage.count_tabs(true).await?;
    let pending = storage.pending_recovery().await?.len();
    let anchor = storage.get_anchor().await?;

    println!("Database: {}", storage.db_path());
    match session {
        Some(session) => println!(
            "Active session: #{} (started {})",
            session.id,
            format_ts(session.started_at)
        ),
        None => println!("Active session: none"),
    }
    println!("Live: {live_windows} windows, {live_tabs} tabs");
    println!("Orphaned: {orphan_windows} windows, {orphan_tabs} tabs ({pending} pending decisions)");
    match anchor {
        Some(anchor) => println!(
            "Anchor: \"{}\" ({} tabs)",
            anchor.window_title,
            anchor.tabs.len()
        ),
        None => println!("Anchor: not set"),
    }

    storage.shutdown().await?;
    Ok(())
}

async fn recovery(config: &Config, action: RecoveryAction) -> Result<()> {
    let storage = open_storage(config).await?;
    let session = offline_session(config, &storage);

    match action {
        RecoveryAction::List => {
            let pending = storage.pending_recovery().await?;
            if pending.is_empty() {
                println!("No pending recovery entries.");
            }
            for entry in pending {
                let title = if entry.title.is_empty() {
                    "(untitled)"
                } else {
                    &entry.title
                };
                println!(
                    "window {} {} — {} tabs, since {}",
                    entry.window_id,
                    title,
                    entry.tab_preview.len(),
                    format_ts(entry.created_at)
                );
                for url in entry.tab_preview.iter().take(5) {
                    println!("    {url}");
                }
            }
        }
        RecoveryAction::Discard { window_id } => {
            session.discard_unmatched_window(window_id).await?;
            info!(window_id, "Orphan window discarded");
            println!("Discarded orphan window {window_id}.");
        }
        RecoveryAction::Keep { window_id } => {
            let existed = session.keep_unmatched_window(window_id).await?;
            if existed {
                println!("Kept orphan window {window_id} for later.");
            } else {
                println!("Window {window_id} was not pending.");
            }
        }
        RecoveryAction::Dismiss => {
            session.dismiss_recovery().await?;
            println!("Recovery banner dismissed.");
        }
    }

    storage.shutdown().await?;
    Ok(())
}

async fn anchor(config: &Config, action: AnchorAction) -> Result<()> {
    let storage = open_storage(config).await?;

    match action {
        AnchorAction::Status => match storage.get_anchor().await? {
            Some(anchor) => {
                println!("Anchor: \"{}\"", anchor.window_title);
                for tab in &anchor.tabs {
                    println!(
                        "    {} (time {}s{})",
                        tab.url,
                        tab.time_accumulated / 1000,
                        if tab.pinned { ", pinned" } else { "" }
                    );
                }
                for group in &anchor.tab_groups {
                    println!("    group \"{}\" ({})", group.title, group.color);
                }
            }
            None => println!("No anchor configured."),
        },
        AnchorAction::Clear => {
            let session = offline_session(config, &storage);
            let manager = AnchorManager::new(
                storage.clone(),
                Arc::new(MockBrowser::new()),
                session,
            );
            if manager.clear_anchor().await? {
                println!("Anchor cleared.");
            } else {
                println!("No anchor was set.");
            }
        }
    }

    storage.shutdown().await?;
    Ok(())
}

fn print_plan(plan: &CleanupPlan) {
    let verb = if plan.dry_run { "eligible" } else { "deleted" };
    for table in &plan.tables {
        let count = if plan.dry_run {
            table.eligible_rows
        } else {
            table.deleted_rows
        };
        println!(
            "{}: {count} rows {verb} (older than {} days)",
            table.table, table.retention_days
        );
    }
    if plan.dry_run {
        println!("Dry run; pass --apply to delete.");
    }
}

async fn cleanup(config: &Config, apply: bool) -> Result<()> {
    let storage = open_storage(config).await?;
    let plan = if apply {
        cleanup_apply(&storage, &config.cleanup).await?
    } else {
        cleanup_preview(&storage, &config.cleanup).await?
    };
    print_plan(&plan);
    storage.shutdown().await?;
    Ok(())
}

async fn audit(config: &Config, days: u32) -> Result<()> {
    let storage = open_storage(config).await?;
    let now = now_ms();
    let from = now - i64::from(days) * 86_400_000;
    let entries = storage.audit_range(from, now + 1).await?;
    if entries.is_empty() {
        println!("No audit entries in the last {days} days.");
    }
    for entry in entries {
        println!(
            "{} {} {} {}",
            format_ts(entry.at),
            entry.kind,
            entry.tab_url,
            entry.detail.as_deref().unwrap_or("")
        );
    }
    storage.shutdown().await?;
    Ok(())
}

/// Seed a mock browser with a "previous session", simulate a restart, and run
/// the engine so every stage of recovery is visible in the logs.
async fn demo(mut config: Config) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("tw-demo-{}", std::process::id()));
    let db_path = dir.join("demo.db");
    println!("Demo database: {}", db_path.display());
    config.db_path = Some(db_path);

    // Session one: two windows the user titled and used.
    let mock = Arc::new(MockBrowser::new());
    mock.add_window(1, WindowKind::Normal).await;
    mock.add_tab(10, 1, "https://github.com/rust-lang/rust", "rust").await;
    mock.add_tab(11, 1, "https://docs.rs/tokio", "tokio docs").await;
    mock.add_window(2, WindowKind::Normal).await;
    mock.add_tab(20, 2, "https://news.ycombinator.com", "HN").await;

    let runtime = Runtime::new(config.clone(), mock.clone()).await?;
    runtime.start().await?;
    runtime
        .storage()
        .set_window_title(1, "Development")
        .await?;
    runtime.tracker().on_tab_activated_at(10, now_ms() - 90_000).await?;
    runtime.tracker().on_tab_activated_at(11, now_ms()).await?;
    runtime.shutdown().await?;
    info!("Demo session one seeded");
    println!("Seeded session one (window 1 titled \"Development\").");

    // Browser restart: same content, all-new IDs, one window lost.
    let mock = Arc::new(MockBrowser::new());
    mock.add_window(31, WindowKind::Normal).await;
    mock.add_tab(310, 31, "https://github.com/rust-lang/rust", "rust").await;
    mock.add_tab(311, 31, "https://docs.rs/tokio", "tokio docs").await;

    let runtime = Runtime::new(config, mock).await?;
    let outcome = runtime.start().await?;
    println!("Restart detection: {outcome:?}");

    if let Some(report) = runtime.session().recovery_report().await? {
        for m in &report.matched {
            println!(
                "matched: old window {} -> new window {} (\"{}\", confidence {:.2})",
                m.orphan_window_id, m.current_window_id, m.title, m.confidence
            );
        }
        for u in &report.unmatched_orphans {
            println!(
                "unmatched: window {} (\"{}\", {} tabs) awaiting a decision",
                u.window_id,
                u.title,
                u.tab_preview.len()
            );
        }
    }

    let restored = runtime.storage().get_window(31).await?;
    if let Some(window) = restored {
        println!("Window 31 carries title: \"{}\"", window.title);
    }
    runtime.shutdown().await?;
    Ok(())
}
