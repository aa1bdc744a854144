//! Anchor-window force sync.
//!
//! The anchor is one user-designated window whose title and per-tab
//! accumulated time are restored from a saved template on every
//! initialization. Ordinary restart matching is probabilistic and can
//! misassign a title or drop time when a window's tab set drifted; the
//! anchor template is applied unconditionally on top of whatever matching
//! decided, so that window always comes back exactly as saved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browser::{BrowserHandle, WindowKind};
use crate::error::Result;
use crate::matcher::{generate_window_signature, is_valid_url};
use crate::session::{tab_record_from_info, url_coverage, SessionManager};
use crate::storage::{
    now_ms, AnchorGroup, AnchorTab, AnchorWindowConfig, StorageHandle, TabGroupRecord,
    WindowRecord,
};

/// Minimum fraction of the anchor's saved URLs a live window must contain to
/// be bound to the anchor.
pub const ANCHOR_OVERLAP_MIN: f64 = 0.5;

/// Settle delay after recreating the anchor window, giving event listeners
/// time to record the created tabs before the force-write.
pub const ANCHOR_SETTLE_MS: u64 = 2_500;

/// Settings key holding the currently bound browser window ID.
pub const ACTIVE_ANCHOR_WINDOW_ID_KEY: &str = "active_anchor_window_id";

/// Hook invoked after anchor restoration completes, so open UI views can
/// refresh.
pub type AnchorNotifyHook = Arc<dyn Fn(i64) + Send + Sync>;

/// Applies and maintains the anchor-window template.
pub struct AnchorManager {
    storage: StorageHandle,
    browser: BrowserHandle,
    session: Arc<SessionManager>,
    notify_hook: Mutex<Option<AnchorNotifyHook>>,
}

impl AnchorManager {
    #[must_use]
    pub fn new(storage: StorageHandle, browser: BrowserHandle, session: Arc<SessionManager>) -> Self {
        Self {
            storage,
            browser,
            session,
            notify_hook: Mutex::new(None),
        }
    }

    pub fn set_notify_hook(&self, hook: AnchorNotifyHook) {
        if let Ok(mut slot) = self.notify_hook.lock() {
            *slot = Some(hook);
        }
    }

    /// Restore the anchor window. Runs after every initialization path,
    /// restart or not. Returns the bound window ID, or `None` when no anchor
    /// is configured.
    pub async fn restore_anchor_window(&self) -> Result<Option<i64>> {
        let Some(config) = self.storage.get_anchor().await? else {
            return Ok(None);
        };
        let saved_urls: Vec<String> = config.tabs.iter().map(|t| t.url.clone()).collect();

        let window_id = match self.find_bound_window(&saved_urls).await? {
            Some(window_id) => {
                debug!(window_id, "Bound anchor to existing window");
                window_id
            }
            None => {
                let Some(window_id) = self.recreate_anchor_window(&config).await? else {
                    // Nothing creatable; leave the template alone.
                    warn!("Anchor template has no creatable URLs");
                    return Ok(None);
                };
                window_id
            }
        };

        self.force_apply_anchor_data(window_id, &config).await?;

        // Read the forced values back out of the store, so the template now
        // also reflects tabs the user added since it was saved.
        let refreshed = self.snapshot_window_as_anchor(window_id).await?;
        self.storage.set_anchor(refreshed).await?;
        self.storage
            .set_setting(ACTIVE_ANCHOR_WINDOW_ID_KEY, &window_id.to_string())
            .await?;

        // The anchor window must never also show up as an orphan banner entry.
        self.prune_overlapping_pending(&saved_urls).await?;

        let hook = self.notify_hook.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(window_id);
        }
        info!(window_id, "Anchor window restored");
        Ok(Some(window_id))
    }

    /// Best live normal window covering at least half the saved URLs.
    async fn find_bound_window(&self, saved_urls: &[String]) -> Result<Option<i64>> {
        let mut best: Option<(i64, f64)> = None;
        for window in self.browser.list_windows().await? {
            if window.kind != WindowKind::Normal {
                continue;
            }
            let tabs = self.browser.tabs_in_window(window.id).await?;
            let live_urls: Vec<String> = tabs.into_iter().map(|t| t.url).collect();
            let coverage = url_coverage(saved_urls, &live_urls);
            if coverage >= ANCHOR_OVERLAP_MIN
                && best.map_or(true, |(_, best_cov)| coverage > best_cov)
            {
                best = Some((window.id, coverage));
            }
        }
        Ok(best.map(|(id, _)| id))
    }

    /// Recreate the anchor window from the template when no live window
    /// qualifies. Returns `None` when the template has no creatable URLs.
    async fn recreate_anchor_window(&self, config: &AnchorWindowConfig) -> Result<Option<i64>> {
        let creatable: Vec<&AnchorTab> = config
            .tabs
            .iter()
            .filter(|t| is_valid_url(&t.url))
            .collect();
        let Some(first) = creatable.first() else {
            return Ok(None);
        };

        let (window, first_tab) = self.browser.create_window(&first.url).await?;
        let mut created = vec![(first_tab.id, *first)];
        for anchor_tab in &creatable[1..] {
            let tab = self.browser.create_tab(window.id, &anchor_tab.url).await?;
            created.push((tab.id, *anchor_tab));
        }

        // Give event listeners a moment to record the new tabs.
        tokio::time::sleep(Duration::from_millis(ANCHOR_SETTLE_MS)).await;

        // group template id -> member tab ids
        let mut group_members: HashMap<i64, Vec<i64>> = HashMap::new();
        for (tab_id, anchor_tab) in &created {
            if anchor_tab.pinned {
                if let Err(err) = self.browser.set_tab_pinned(*tab_id, true).await {
                    warn!(tab_id, %err, "Failed to pin anchor tab");
                }
            }
            if anchor_tab.group_id >= 0 {
                group_members
                    .entry(anchor_tab.group_id)
                    .or_default()
                    .push(*tab_id);
            }
        }
        for group in &config.tab_groups {
            let Some(members) = group_members.get(&group.id) else {
                continue;
            };
            let new_group_id = self.browser.group_tabs(window.id, members.clone()).await?;
            self.browser
                .update_group(new_group_id, &group.title, &group.color, group.collapsed)
                .await?;
        }

        info!(window_id = window.id, tabs = created.len(), "Recreated anchor window");
        Ok(Some(window.id))
    }

    /// Force-write the template's title and per-tab accumulated time onto a
    /// live window, creating store records where event listeners have not
    /// caught up yet. Affected tabs are marked restoring first so navigation
    /// events cannot zero the values being written.
    pub async fn force_apply_anchor_data(
        &self,
        window_id: i64,
        config: &AnchorWindowConfig,
    ) -> Result<()> {
        let session_id = self.session.current_session_id();
        let now = now_ms();
        let live_tabs = self.browser.tabs_in_window(window_id).await?;

        if self.storage.get_window(window_id).await?.is_none() {
            let urls: Vec<&str> = live_tabs.iter().map(|t| t.url.as_str()).collect();
            self.storage
                .upsert_window(WindowRecord {
                    id: window_id,
                    session_id,
                    is_orphan: false,
                    title: String::new(),
                    url_signature: generate_window_signature(&urls).hash,
                    created_at: now,
                    last_accessed: now,
                })
                .await?;
        }
        self.storage
            .set_window_title(window_id, &config.window_title)
            .await?;

        let mut saved_by_url: HashMap<&str, &AnchorTab> = HashMap::new();
        for tab in &config.tabs {
            saved_by_url.entry(tab.url.as_str()).or_insert(tab);
        }

        for live in &live_tabs {
            let Some(saved) = saved_by_url.get(live.url.as_str()) else {
                continue;
            };
            self.session.mark_restoring(live.id);
            if self.storage.get_tab(live.id).await?.is_none() {
                self.storage
                    .upsert_tab(tab_record_from_info(live, session_id, now))
                    .await?;
            }
            self.storage
                .set_tab_time(live.id, saved.time_accumulated)
                .await?;
        }
        Ok(())
    }

    /// Snapshot a live window (and its store-held time values) into an anchor
    /// template.
    pub async fn snapshot_window_as_anchor(&self, window_id: i64) -> Result<AnchorWindowConfig> {
        let window_title = self
            .storage
            .get_window(window_id)
            .await?
            .map(|w| w.title)
            .unwrap_or_default();

        let live_tabs = self.browser.tabs_in_window(window_id).await?;
        let mut tabs = Vec::with_capacity(live_tabs.len());
        for live in &live_tabs {
            let time_accumulated = self
                .storage
                .get_tab(live.id)
                .await?
                .map_or(0, |t| t.time_accumulated);
            tabs.push(AnchorTab {
                url: live.url.clone(),
                title: live.title.clone(),
                favicon_url: live.favicon_url.clone(),
                index: live.index,
                pinned: live.pinned,
                group_id: live.group_id,
                time_accumulated,
            });
        }

        let tab_groups = self
            .browser
            .groups_in_window(window_id)
            .await?
            .into_iter()
            .map(|g| AnchorGroup {
                id: g.id,
                title: g.title,
                color: g.color,
                collapsed: g.collapsed,
            })
            .collect();

        Ok(AnchorWindowConfig {
            window_title,
            tabs,
            tab_groups,
        })
    }

    /// Designate a live window as the anchor: snapshot it into the template
    /// and bind it. Also records the window's store title if it has one.
    pub async fn set_anchor_from_window(&self, window_id: i64) -> Result<AnchorWindowConfig> {
        let config = self.snapshot_window_as_anchor(window_id).await?;
        self.storage.set_anchor(config.clone()).await?;
        self.storage
            .set_setting(ACTIVE_ANCHOR_WINDOW_ID_KEY, &window_id.to_string())
            .await?;

        // Keep the group records current; live groups are authoritative here.
        let session_id = self.session.current_session_id();
        for group in self.browser.groups_in_window(window_id).await? {
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
        Ok(config)
    }

    /// Re-snapshot the bound window's tabs into the template. Used when the
    /// user edits the anchor window (adds/removes tabs) and on time flushes
    /// for anchor tabs.
    pub async fn update_anchor_tabs(&self, window_id: i64) -> Result<Option<AnchorWindowConfig>> {
        if self.storage.get_anchor().await?.is_none() {
            return Ok(None);
        }
        let config = self.snapshot_window_as_anchor(window_id).await?;
        self.storage.set_anchor(config.clone()).await?;
        Ok(Some(config))
    }

    /// Unbind and delete the template.
    pub async fn clear_anchor(&self) -> Result<bool> {
        let existed = self.storage.clear_anchor().await?;
        self.storage
            .delete_setting(ACTIVE_ANCHOR_WINDOW_ID_KEY)
            .await?;
        Ok(existed)
    }

    /// The currently bound window ID, if recorded.
    pub async fn active_anchor_window_id(&self) -> Result<Option<i64>> {
        Ok(self
            .storage
            .get_setting(ACTIVE_ANCHOR_WINDOW_ID_KEY)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    /// Drop pending-recovery entries whose saved URLs overlap the anchor's at
    /// 50% or more. Only the pending row is removed; the orphan window rows
    /// stay subject to the usual orphan actions and aged-orphan GC.
    async fn prune_overlapping_pending(&self, saved_urls: &[String]) -> Result<()> {
        for entry in self.storage.pending_recovery().await? {
            let coverage = url_coverage(saved_urls, &entry.tab_preview);
            if coverage >= ANCHOR_OVERLAP_MIN {
                debug!(
                    window_id = entry.window_id,
                    coverage, "Pruning pending entry overlapping the anchor"
                );
                self.storage
                    .delete_pending_recovery(entry.window_id)
                    .await?;
            }
        }
        Ok(())
    }
}
