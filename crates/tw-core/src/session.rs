//! Session lifecycle and restart recovery.
//!
//! The session manager detects browser restarts, orphans the prior session's
//! records, reconciles the freshly created browser state against those
//! orphans with the similarity matcher, and carries user metadata (window
//! titles, accumulated time, pinned flags, group titles) across the identity
//! break. Unmatched orphans are parked for user-driven recovery decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::{BrowserHandle, TabInfo, WindowKind};
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::matcher::{
    calculate_match_score, find_best_matches, generate_window_signature, is_valid_url,
    WindowTabSet,
};
use crate::storage::{
    now_ms, PendingRecoveryRecord, StorageHandle, TabGroupRecord, TabRecord, WindowRecord,
};
use crate::wait::{wait_for, WaitOptions};

/// How long a freshly restored tab is exempt from navigation-triggered
/// time resets.
pub const RESTORING_WINDOW_MS: i64 = 10_000;

/// Settings key holding the serialized recovery report.
pub const RECOVERY_RESULT_KEY: &str = "recovery_result";

/// Outcome of restart detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Nothing was stored: fresh install or wiped profile.
    FreshStart,
    /// At least one stored window ID is still live; the process survived.
    NoRestart,
    /// Stored windows exist but none of their IDs are live.
    Restart,
    /// No normal browser window appeared within the wait budget
    /// (profile picker, etc). Retry later.
    Deferred,
}

/// One reconciled window pair in the recovery report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedWindowReport {
    pub orphan_window_id: i64,
    pub current_window_id: i64,
    pub title: String,
    pub confidence: f64,
    pub tab_preview: Vec<String>,
}

/// One orphan window awaiting a user decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedWindowReport {
    pub window_id: i64,
    pub title: String,
    pub tab_preview: Vec<String>,
}

/// Structured recovery result, persisted so the UI can render a banner even
/// if the background process restarts before the user sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub matched: Vec<MatchedWindowReport>,
    pub unmatched_orphans: Vec<UnmatchedWindowReport>,
}

/// Result of restoring an unmatched orphan window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// Created browser window, `None` when the orphan had no creatable URLs.
    pub window_id: Option<i64>,
    pub tabs_restored: usize,
}

/// Core orchestrator. Constructed once at startup and shared by handle.
pub struct SessionManager {
    storage: StorageHandle,
    browser: BrowserHandle,
    recovery: RecoveryConfig,
    /// 0 = no session yet.
    current_session_id: AtomicI64,
    /// tab_id -> epoch-ms mark time; entries expire lazily.
    restoring: Mutex<HashMap<i64, i64>>,
    initialized: AtomicBool,
}

impl SessionManager {
    #[must_use]
    pub fn new(storage: StorageHandle, browser: BrowserHandle, recovery: RecoveryConfig) -> Self {
        Self {
            storage,
            browser,
            recovery,
            current_session_id: AtomicI64::new(0),
            restoring: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn current_session_id(&self) -> i64 {
        self.current_session_id.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    // -- restoring-tab suppression ---------------------------------------

    /// Mark a tab as freshly restored; see [`RESTORING_WINDOW_MS`].
    pub fn mark_restoring(&self, tab_id: i64) {
        self.mark_restoring_at(tab_id, now_ms());
    }

    pub fn mark_restoring_at(&self, tab_id: i64, now: i64) {
        let mut map = match self.restoring.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(tab_id, now);
    }

    /// Is navigation-triggered reset logic currently suppressed for this tab?
    #[must_use]
    pub fn is_tab_restoring(&self, tab_id: i64) -> bool {
        self.is_tab_restoring_at(tab_id, now_ms())
    }

    #[must_use]
    pub fn is_tab_restoring_at(&self, tab_id: i64, now: i64) -> bool {
        let mut map = match self.restoring.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        match map.get(&tab_id) {
            Some(marked_at) if now - marked_at < RESTORING_WINDOW_MS => true,
            Some(_) => {
                map.remove(&tab_id);
                false
            }
            None => false,
        }
    }

    // -- initialization ---------------------------------------------------

    /// Run restart detection and, when a restart is confirmed, the full
    /// recovery pass. Returns the detection outcome; `Deferred` leaves the
    /// manager uninitialized so a later window-created event can retry.
    pub async fn initialize(&self) -> Result<RestartOutcome> {
        let outcome = self.detect_browser_restart().await?;
        match outcome {
            RestartOutcome::Deferred => {
                info!("No normal window yet; deferring initialization");
                return Ok(RestartOutcome::Deferred);
            }
            RestartOutcome::Restart => {
                info!("Browser restart detected; running recovery");
                self.perform_recovery().await?;
            }
            RestartOutcome::FreshStart => {
                info!("Fresh start; creating initial session");
                let session_id = self.storage.create_session(now_ms()).await?;
                self.current_session_id.store(session_id, Ordering::SeqCst);
                self.snapshot_live_state(session_id).await?;
            }
            RestartOutcome::NoRestart => {
                let session_id = match self.storage.get_active_session().await? {
                    Some(session) => session.id,
                    None => self.storage.create_session(now_ms()).await?,
                };
                self.current_session_id.store(session_id, Ordering::SeqCst);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(outcome)
    }

    /// Determine whether the browser process restarted since our records
    /// were written.
    ///
    /// Stored window IDs intersecting the live set means the old process is
    /// still running; a non-empty stored set with zero overlap can only mean
    /// the browser itself restarted and reassigned every ID.
    pub async fn detect_browser_restart(&self) -> Result<RestartOutcome> {
        let stored = self.storage.windows(false).await?;
        if stored.is_empty() {
            return Ok(RestartOutcome::FreshStart);
        }

        let Some(live) = self.wait_for_normal_windows().await? else {
            return Ok(RestartOutcome::Deferred);
        };

        let live_ids: std::collections::HashSet<i64> = live.iter().map(|w| w.id).collect();
        if stored.iter().any(|w| live_ids.contains(&w.id)) {
            Ok(RestartOutcome::NoRestart)
        } else {
            Ok(RestartOutcome::Restart)
        }
    }

    /// Wait until at least one normal window exists. `None` when the budget
    /// expires first (startup races such as a profile picker).
    async fn wait_for_normal_windows(&self) -> Result<Option<Vec<crate::browser::WindowInfo>>> {
        let browser = self.browser.clone();
        let outcome = wait_for(
            move || {
                let browser = browser.clone();
                async move {
                    let windows = browser.list_windows().await?;
                    let normal: Vec<_> = windows
                        .into_iter()
                        .filter(|w| w.kind == WindowKind::Normal)
                        .collect();
                    Ok(if normal.is_empty() { None } else { Some(normal) })
                }
            },
            Duration::from_millis(self.recovery.window_wait_timeout_ms),
            WaitOptions::default(),
        )
        .await?;
        Ok(outcome.into_ready())
    }

    // -- recovery ----------------------------------------------------------

    /// Full recovery pass after a confirmed restart.
    pub async fn perform_recovery(&self) -> Result<RecoveryReport> {
        // 1. Atomic orphan sweep: nothing stays at is_orphan = 0.
        let orphaned = self.storage.mark_all_orphaned().await?;
        debug!(orphaned, "Orphan sweep complete");

        // 2. New session.
        let session_id = self.storage.create_session(now_ms()).await?;
        self.current_session_id.store(session_id, Ordering::SeqCst);

        // 3. Re-poll for normal windows; a window we saw during detection may
        //    still be materializing its tabs.
        if self.wait_for_normal_windows().await?.is_none() {
            warn!("Normal windows disappeared during recovery");
        }

        // 4. Snapshot the live browser state as fresh non-orphan records.
        self.snapshot_live_state(session_id).await?;

        // 5. Match orphans against the snapshot.
        let orphan_sets = self.window_tab_sets(true).await?;
        let current_sets = self.window_tab_sets(false).await?;
        let outcome = find_best_matches(&orphan_sets, &current_sets);
        info!(
            matched = outcome.matched.len(),
            unmatched_orphans = outcome.unmatched_orphans.len(),
            "Window matching complete"
        );

        // 6. Transfer metadata for every matched pair, then drop the orphan.
        let mut report = RecoveryReport::default();
        for m in &outcome.matched {
            let title = self
                .transfer_window_metadata(m.orphan_window_id, m.current_window_id)
                .await?;
            self.reconcile_group_titles(m.orphan_window_id, m.current_window_id)
                .await;
            let preview = self.tab_preview(m.current_window_id, false).await?;
            self.storage
                .delete_window_cascade(m.orphan_window_id)
                .await?;
            report.matched.push(MatchedWindowReport {
                orphan_window_id: m.orphan_window_id,
                current_window_id: m.current_window_id,
                title,
                confidence: m.confidence,
                tab_preview: preview,
            });
        }

        // 7. Park unmatched orphans for user decisions.
        self.storage.clear_pending_recovery().await?;
        for &window_id in &outcome.unmatched_orphans {
            let title = self
                .storage
                .get_window(window_id)
                .await?
                .map(|w| w.title)
                .unwrap_or_default();
            let preview = self.tab_preview(window_id, true).await?;
            self.storage
                .upsert_pending_recovery(PendingRecoveryRecord {
                    window_id,
                    title: title.clone(),
                    confidence: None,
                    tab_preview: preview.clone(),
                    created_at: now_ms(),
                })
                .await?;
            report.unmatched_orphans.push(UnmatchedWindowReport {
                window_id,
                title,
                tab_preview: preview,
            });
        }

        // 8. Persist the report for the UI banner.
        let report_json = serde_json::to_string(&report)?;
        self.storage
            .set_setting(RECOVERY_RESULT_KEY, &report_json)
            .await?;
        Ok(report)
    }

    /// The persisted recovery report, if any. Parse failures degrade to
    /// "no result available".
    pub async fn recovery_report(&self) -> Result<Option<RecoveryReport>> {
        let Some(raw) = self.storage.get_setting(RECOVERY_RESULT_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                warn!(%err, "Discarding unparseable recovery report");
                Ok(None)
            }
        }
    }

    /// Insert every live window/tab/group as a fresh non-orphan record.
    async fn snapshot_live_state(&self, session_id: i64) -> Result<()> {
        let now = now_ms();
        let windows = self.browser.list_windows().await?;
        for window in windows.iter().filter(|w| w.kind == WindowKind::Normal) {
            let tabs = self.browser.tabs_in_window(window.id).await?;
            let urls: Vec<&str> = tabs.iter().map(|t| t.url.as_str()).collect();
            let signature = generate_window_signature(&urls);
            self.storage
                .upsert_window(WindowRecord {
                    id: window.id,
                    session_id,
                    is_orphan: false,
                    title: String::new(),
                    url_signature: signature.hash,
                    created_at: now,
                    last_accessed: now,
                })
                .await?;
            for tab in &tabs {
                self.storage
                    .upsert_tab(tab_record_from_info(tab, session_id, now))
                    .await?;
            }
            for group in self.browser.groups_in_window(window.id).await? {
                self.storage
                    .upsert_group(TabGroupRecord {
                        id: group.id,
                        window_id: group.window_id,
                        session_id,
                        is_orphan: false,
                        title: group.title,
                        color: group.color,
                        collapsed: group.collapsed,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Build per-window URL sets for the matcher.
    async fn window_tab_sets(&self, is_orphan: bool) -> Result<Vec<WindowTabSet>> {
        let windows = self.storage.windows(is_orphan).await?;
        let mut sets = Vec::with_capacity(windows.len());
        for window in windows {
            let tabs = self.storage.tabs_for_window(window.id, is_orphan).await?;
            sets.push(WindowTabSet {
                window_id: window.id,
                urls: tabs.into_iter().map(|t| t.url).collect(),
            });
        }
        Ok(sets)
    }

    /// Copy title, per-URL accumulated time, and pinned state from an orphan
    /// window onto its matched current window. Returns the title carried
    /// over (for the report).
    async fn transfer_window_metadata(
        &self,
        orphan_window_id: i64,
        current_window_id: i64,
    ) -> Result<String> {
        let orphan_window = self.storage.get_window(orphan_window_id).await?;
        let title = orphan_window.map(|w| w.title).unwrap_or_default();
        if !title.is_empty() {
            self.storage
                .set_window_title(current_window_id, &title)
                .await?;
        }

        let orphan_tabs = self.storage.tabs_for_window(orphan_window_id, true).await?;
        let current_tabs = self
            .storage
            .tabs_for_window(current_window_id, false)
            .await?;

        let mut by_url: HashMap<&str, &TabRecord> = HashMap::new();
        for tab in &orphan_tabs {
            // First occurrence wins for duplicate URLs.
            by_url.entry(tab.url.as_str()).or_insert(tab);
        }

        for current in &current_tabs {
            let Some(orphan) = by_url.get(current.url.as_str()) else {
                continue;
            };
            if orphan.time_accumulated > 0 {
                self.storage
                    .set_tab_time(current.id, orphan.time_accumulated)
                    .await?;
            }
            if orphan.pinned && !current.pinned {
                // Browser call is best-effort enrichment.
                if let Err(err) = self.browser.set_tab_pinned(current.id, true).await {
                    warn!(tab_id = current.id, %err, "Failed to re-pin tab");
                }
                self.storage.set_tab_pinned(current.id, true).await?;
            }
        }
        Ok(title)
    }

    /// Carry orphan group titles/colors onto live groups in the matched
    /// window, pairing groups by member-URL overlap. Best-effort: failures
    /// are logged, never abort recovery.
    async fn reconcile_group_titles(&self, orphan_window_id: i64, current_window_id: i64) {
        if let Err(err) = self
            .try_reconcile_group_titles(orphan_window_id, current_window_id)
            .await
        {
            warn!(
                orphan_window_id,
                current_window_id,
                %err,
                "Group title reconciliation failed"
            );
        }
    }

    async fn try_reconcile_group_titles(
        &self,
        orphan_window_id: i64,
        current_window_id: i64,
    ) -> Result<()> {
        let orphan_groups = self
            .storage
            .groups_for_window(orphan_window_id, true)
            .await?;
        let current_groups = self
            .storage
            .groups_for_window(current_window_id, false)
            .await?;
        if orphan_groups.is_empty() || current_groups.is_empty() {
            return Ok(());
        }

        let orphan_tabs = self.storage.tabs_for_window(orphan_window_id, true).await?;
        let current_tabs = self
            .storage
            .tabs_for_window(current_window_id, false)
            .await?;

        let member_urls = |tabs: &[TabRecord], group_id: i64| -> std::collections::HashSet<String> {
            tabs.iter()
                .filter(|t| t.group_id == group_id)
                .map(|t| t.url.clone())
                .collect()
        };

        // Score every (orphan, live) pair by URL overlap over the larger set.
        let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
        for (oi, orphan) in orphan_groups.iter().enumerate() {
            let orphan_urls = member_urls(&orphan_tabs, orphan.id);
            if orphan_urls.is_empty() {
                continue;
            }
            for (ci, current) in current_groups.iter().enumerate() {
                let current_urls = member_urls(&current_tabs, current.id);
                if current_urls.is_empty() {
                    continue;
                }
                let overlap = orphan_urls.intersection(&current_urls).count();
                if overlap == 0 {
                    continue;
                }
                let score = overlap as f64 / orphan_urls.len().max(current_urls.len()) as f64;
                candidates.push((score, oi, ci));
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_orphans = std::collections::HashSet::new();
        let mut used_current = std::collections::HashSet::new();
        for (_, oi, ci) in candidates {
            if !used_orphans.insert(oi) || !used_current.insert(ci) {
                continue;
            }
            let orphan = &orphan_groups[oi];
            let current = &current_groups[ci];
            self.browser
                .update_group(current.id, &orphan.title, &orphan.color, orphan.collapsed)
                .await?;
            self.storage
                .upsert_group(TabGroupRecord {
                    id: current.id,
                    window_id: current.window_id,
                    session_id: current.session_id,
                    is_orphan: false,
                    title: orphan.title.clone(),
                    color: orphan.color.clone(),
                    collapsed: orphan.collapsed,
                })
                .await?;
        }
        Ok(())
    }

    async fn tab_preview(&self, window_id: i64, is_orphan: bool) -> Result<Vec<String>> {
        let tabs = self.storage.tabs_for_window(window_id, is_orphan).await?;
        Ok(tabs.into_iter().map(|t| t.url).collect())
    }

    // -- user actions on unmatched orphans ---------------------------------

    /// Recreate a browser window from an orphan's valid tab URLs, carrying
    /// over accumulated time, pinned flags, and tab groups. Failure leaves
    /// the orphan data intact for retry.
    pub async fn restore_unmatched_window(&self, window_id: i64) -> Result<RestoreOutcome> {
        let orphan_window = self.storage.get_window(window_id).await?;
        let orphan_tabs = self.storage.tabs_for_window(window_id, true).await?;
        let orphan_groups = self.storage.groups_for_window(window_id, true).await?;

        let valid_tabs: Vec<&TabRecord> = orphan_tabs
            .iter()
            .filter(|t| is_valid_url(&t.url))
            .collect();

        // Nothing creatable: no-op success, orphan is resolved anyway.
        if valid_tabs.is_empty() {
            self.storage.delete_window_cascade(window_id).await?;
            self.storage.delete_pending_recovery(window_id).await?;
            return Ok(RestoreOutcome {
                window_id: None,
                tabs_restored: 0,
            });
        }

        let session_id = self.current_session_id();
        let now = now_ms();
        let (new_window, first_tab) = self.browser.create_window(&valid_tabs[0].url).await?;

        let title = orphan_window.map(|w| w.title).unwrap_or_default();
        let urls: Vec<&str> = valid_tabs.iter().map(|t| t.url.as_str()).collect();
        self.storage
            .upsert_window(WindowRecord {
                id: new_window.id,
                session_id,
                is_orphan: false,
                title,
                url_signature: generate_window_signature(&urls).hash,
                created_at: now,
                last_accessed: now,
            })
            .await?;

        // orphan group_id -> tab ids created into the new window
        let mut group_members: HashMap<i64, Vec<i64>> = HashMap::new();
        let mut created = Vec::with_capacity(valid_tabs.len());
        created.push((first_tab.id, valid_tabs[0]));
        for orphan in &valid_tabs[1..] {
            let tab = self.browser.create_tab(new_window.id, &orphan.url).await?;
            created.push((tab.id, orphan));
        }

        for (index, (new_id, orphan)) in created.iter().enumerate() {
            // Mark restoring before writing time so the navigation events the
            // creation just triggered cannot reset what we are restoring.
            self.mark_restoring(*new_id);
            self.storage
                .upsert_tab(TabRecord {
                    id: *new_id,
                    window_id: new_window.id,
                    session_id,
                    is_orphan: false,
                    title: orphan.title.clone(),
                    url: orphan.url.clone(),
                    favicon_url: orphan.favicon_url.clone(),
                    last_accessed: orphan.last_accessed,
                    time_accumulated: orphan.time_accumulated,
                    index: index as i64,
                    group_id: -1,
                    pinned: orphan.pinned,
                })
                .await?;
            if orphan.pinned {
                if let Err(err) = self.browser.set_tab_pinned(*new_id, true).await {
                    warn!(tab_id = *new_id, %err, "Failed to pin restored tab");
                }
            }
            if orphan.group_id >= 0 {
                group_members.entry(orphan.group_id).or_default().push(*new_id);
            }
        }

        // Rebuild tab groups per original membership.
        for orphan_group in &orphan_groups {
            let Some(members) = group_members.get(&orphan_group.id) else {
                continue;
            };
            let new_group_id = self
                .browser
                .group_tabs(new_window.id, members.clone())
                .await?;
            self.browser
                .update_group(
                    new_group_id,
                    &orphan_group.title,
                    &orphan_group.color,
                    orphan_group.collapsed,
                )
                .await?;
            self.storage
                .upsert_group(TabGroupRecord {
                    id: new_group_id,
                    window_id: new_window.id,
                    session_id,
                    is_orphan: false,
                    title: orphan_group.title.clone(),
                    color: orphan_group.color.clone(),
                    collapsed: orphan_group.collapsed,
                })
                .await?;
            for member in members {
                if let Some(mut tab) = self.storage.get_tab(*member).await? {
                    tab.group_id = new_group_id;
                    self.storage.upsert_tab(tab).await?;
                }
            }
        }

        // Only now is the orphan resolved.
        self.storage.delete_window_cascade(window_id).await?;
        self.storage.delete_pending_recovery(window_id).await?;
        info!(
            orphan_window_id = window_id,
            new_window_id = new_window.id,
            tabs = created.len(),
            "Restored orphan window"
        );
        Ok(RestoreOutcome {
            window_id: Some(new_window.id),
            tabs_restored: created.len(),
        })
    }

    /// Delete an orphan window outright. No browser window is created.
    pub async fn discard_unmatched_window(&self, window_id: i64) -> Result<()> {
        self.storage.delete_window_cascade(window_id).await?;
        self.storage.delete_pending_recovery(window_id).await?;
        Ok(())
    }

    /// Remove from the pending UI list only; orphan data stays for a future
    /// matching pass, subject to age-based cleanup.
    pub async fn keep_unmatched_window(&self, window_id: i64) -> Result<bool> {
        self.storage.delete_pending_recovery(window_id).await
    }

    /// Dismiss the recovery banner entirely.
    pub async fn dismiss_recovery(&self) -> Result<()> {
        self.storage.clear_pending_recovery().await?;
        self.storage.delete_setting(RECOVERY_RESULT_KEY).await?;
        Ok(())
    }

    #[must_use]
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    #[must_use]
    pub fn browser(&self) -> &BrowserHandle {
        &self.browser
    }

    #[must_use]
    pub fn recovery_config(&self) -> &RecoveryConfig {
        &self.recovery
    }
}

/// Build a tab record from live browser state.
#[must_use]
pub fn tab_record_from_info(tab: &TabInfo, session_id: i64, now: i64) -> TabRecord {
    TabRecord {
        id: tab.id,
        window_id: tab.window_id,
        session_id,
        is_orphan: false,
        title: tab.title.clone(),
        url: tab.url.clone(),
        favicon_url: tab.favicon_url.clone(),
        last_accessed: now,
        time_accumulated: 0,
        index: tab.index,
        group_id: tab.group_id,
        pinned: tab.pinned,
    }
}

/// URL-overlap coverage of `saved` by `live`: matched / |saved|.
/// Used by anchor binding and pending-list pruning.
#[must_use]
pub fn url_coverage(saved: &[String], live: &[String]) -> f64 {
    let saved_set: std::collections::HashSet<&str> =
        saved.iter().map(String::as_str).collect();
    if saved_set.is_empty() {
        return 0.0;
    }
    let live_set: std::collections::HashSet<&str> = live.iter().map(String::as_str).collect();
    let matched = saved_set.intersection(&live_set).count();
    matched as f64 / saved_set.len() as f64
}

/// Score two URL collections with the window matcher. Exposed for callers
/// that compare a saved template against live windows.
#[must_use]
pub fn score_url_sets(a: &[String], b: &[String]) -> f64 {
    calculate_match_score(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserInterface, MockBrowser};
    use crate::config::RecoveryConfig;
    use std::sync::Arc;

    async fn setup() -> (tempfile::TempDir, StorageHandle, Arc<MockBrowser>, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tw.db");
        let storage = StorageHandle::new(&db_path.to_string_lossy()).await.unwrap();
        let mock = Arc::new(MockBrowser::new());
        let recovery = RecoveryConfig {
            window_wait_timeout_ms: 200,
            ..RecoveryConfig::default()
        };
        let manager = SessionManager::new(storage.clone(), mock.clone(), recovery);
        (dir, storage, mock, manager)
    }

    fn stored_window(id: i64) -> WindowRecord {
        WindowRecord {
            id,
            session_id: 1,
            is_orphan: false,
            title: String::new(),
            url_signature: String::new(),
            created_at: 0,
            last_accessed: 0,
        }
    }

    #[tokio::test]
    async fn no_stored_windows_means_fresh_start() {
        let (_dir, storage, mock, manager) = setup().await;
        mock.add_window(3, WindowKind::Normal).await;

        let outcome = manager.detect_browser_restart().await.unwrap();
        assert_eq!(outcome, RestartOutcome::FreshStart);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn surviving_window_id_means_no_restart() {
        let (_dir, storage, mock, manager) = setup().await;
        storage.upsert_window(stored_window(1)).await.unwrap();
        storage.upsert_window(stored_window(2)).await.unwrap();
        mock.add_window(1, WindowKind::Normal).await;
        mock.add_window(3, WindowKind::Normal).await;

        let outcome = manager.detect_browser_restart().await.unwrap();
        assert_eq!(outcome, RestartOutcome::NoRestart);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disjoint_window_ids_mean_restart() {
        let (_dir, storage, mock, manager) = setup().await;
        storage.upsert_window(stored_window(1)).await.unwrap();
        storage.upsert_window(stored_window(2)).await.unwrap();
        mock.add_window(3, WindowKind::Normal).await;
        mock.add_window(4, WindowKind::Normal).await;

        let outcome = manager.detect_browser_restart().await.unwrap();
        assert_eq!(outcome, RestartOutcome::Restart);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn no_normal_window_defers_detection() {
        let (_dir, storage, mock, manager) = setup().await;
        storage.upsert_window(stored_window(1)).await.unwrap();
        mock.add_window(9, WindowKind::Popup).await;

        let outcome = manager.detect_browser_restart().await.unwrap();
        assert_eq!(outcome, RestartOutcome::Deferred);
        assert!(!manager.is_initialized());
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restoring_mark_expires_lazily() {
        let (_dir, storage, _mock, manager) = setup().await;
        manager.mark_restoring_at(7, 1_000_000);
        assert!(manager.is_tab_restoring_at(7, 1_000_000 + 5_000));
        assert!(!manager.is_tab_restoring_at(7, 1_000_000 + 11_000));
        // Lazy expiry removed the entry.
        assert!(!manager.is_tab_restoring_at(7, 1_000_000 + 5_000));
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restore_with_only_internal_urls_is_noop_success() {
        let (_dir, storage, mock, manager) = setup().await;
        let mut orphan = stored_window(50);
        orphan.is_orphan = true;
        storage.upsert_window(orphan).await.unwrap();
        storage
            .upsert_tab(TabRecord {
                id: 500,
                window_id: 50,
                session_id: 1,
                is_orphan: true,
                title: String::new(),
                url: "chrome://settings".to_string(),
                favicon_url: None,
                last_accessed: 0,
                time_accumulated: 0,
                index: 0,
                group_id: -1,
                pinned: false,
            })
            .await
            .unwrap();

        let outcome = manager.restore_unmatched_window(50).await.unwrap();
        assert!(outcome.window_id.is_none());
        assert_eq!(outcome.tabs_restored, 0);
        assert!(storage.get_window(50).await.unwrap().is_none());
        assert!(mock.list_windows().await.unwrap().is_empty());
        storage.shutdown().await.unwrap();
    }

    #[test]
    fn url_coverage_ratio() {
        let saved = vec![
            "https://a.com".to_string(),
            "https://b.com".to_string(),
            "https://c.com".to_string(),
            "https://d.com".to_string(),
        ];
        let live = vec![
            "https://a.com".to_string(),
            "https://b.com".to_string(),
            "https://z.com".to_string(),
        ];
        let coverage = url_coverage(&saved, &live);
        assert!((coverage - 0.5).abs() < 1e-9);
        assert!((url_coverage(&[], &live) - 0.0).abs() < 1e-9);
    }
}
