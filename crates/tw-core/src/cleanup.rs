//! Retention-aware orphan cleanup with safe dry-run preview.
//!
//! Orphan windows kept "for later" (and those never acted on) age out after
//! a configurable number of days. The engine supports two modes:
//!
//! - **Preview** (dry-run): returns per-table counts without modifying data.
//! - **Apply**: deletes eligible windows with their tabs and groups.

use serde::Serialize;

use crate::config::CleanupConfig;
use crate::storage::{now_ms, StorageHandle};

/// Per-table cleanup counts for preview and apply results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupTableSummary {
    pub table: String,
    pub eligible_rows: usize,
    pub deleted_rows: usize,
    pub retention_days: u32,
}

/// Full cleanup plan: a list of per-table summaries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupPlan {
    pub tables: Vec<CleanupTableSummary>,
    pub total_eligible: usize,
    pub total_deleted: usize,
    pub dry_run: bool,
}

fn retention_cutoff_ms(now: i64, days: u32) -> i64 {
    now - i64::from(days) * 86_400_000
}

/// Preview what would be cleaned up (dry-run).
pub async fn cleanup_preview(
    storage: &StorageHandle,
    config: &CleanupConfig,
) -> crate::Result<CleanupPlan> {
    let cutoff_ms = retention_cutoff_ms(now_ms(), config.orphan_max_age_days);
    let (windows, tabs, groups) = storage.count_aged_orphans(cutoff_ms).await?;

    let mut plan = CleanupPlan {
        dry_run: true,
        ..Default::default()
    };
    for (table, eligible) in [
        ("windows", windows),
        ("tabs", tabs),
        ("tab_groups", groups),
    ] {
        plan.tables.push(CleanupTableSummary {
            table: table.to_string(),
            eligible_rows: eligible,
            deleted_rows: 0,
            retention_days: config.orphan_max_age_days,
        });
        plan.total_eligible += eligible;
    }
    Ok(plan)
}

/// Apply cleanup: delete eligible orphan windows (cascading) and return the
/// result plan.
pub async fn cleanup_apply(
    storage: &StorageHandle,
    config: &CleanupConfig,
) -> crate::Result<CleanupPlan> {
    let cutoff_ms = retention_cutoff_ms(now_ms(), config.orphan_max_age_days);
    let (windows, tabs, groups) = storage.count_aged_orphans(cutoff_ms).await?;
    let deleted_windows = storage.delete_aged_orphan_windows(cutoff_ms).await?;

    let mut plan = CleanupPlan {
        dry_run: false,
        ..Default::default()
    };
    for (table, eligible, deleted) in [
        ("windows", windows, deleted_windows),
        ("tabs", tabs, tabs),
        ("tab_groups", groups, groups),
    ] {
        plan.tables.push(CleanupTableSummary {
            table: table.to_string(),
            eligible_rows: eligible,
            deleted_rows: deleted,
            retention_days: config.orphan_max_age_days,
        });
        plan.total_eligible += eligible;
        plan.total_deleted += deleted;
    }

    tracing::info!(
        deleted_windows,
        deleted_tabs = tabs,
        deleted_groups = groups,
        "Orphan cleanup applied"
    );
    Ok(plan)
}
