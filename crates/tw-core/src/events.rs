//! Browser event wiring.
//!
//! Translates tab/window/group lifecycle events into store mutations, with
//! the timing rules the recovery machinery depends on:
//!
//! - Removal events delete records after a delay, not immediately. When the
//!   whole browser process is exiting, the delayed deletion never fires and
//!   the records survive to drive restart detection.
//! - Navigation resets of accumulated time are suppressed while a tab is
//!   marked restoring.
//! - Window-signature recomputation waits for the window to stabilize
//!   instead of firing on every intermediate loading state.
//! - The toolbar badge recount is debounced, with an immediate variant for
//!   right after recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::anchor::AnchorManager;
use crate::browser::{BrowserHandle, TabGroupInfo, TabInfo, WindowInfo, WindowKind};
use crate::error::Result;
use crate::matcher::generate_window_signature;
use crate::session::{tab_record_from_info, SessionManager};
use crate::storage::{now_ms, StorageHandle, TabGroupRecord, WindowRecord};
use crate::time_tracker::TimeTracker;

/// Grace period before a removed tab/window row is actually deleted.
pub const DEFERRED_DELETE_MS: u64 = 60_000;

/// Quiet period a window must hold before its signature is recomputed.
pub const STABILIZE_MS: u64 = 5_000;

/// Badge recount debounce.
pub const BADGE_DEBOUNCE_MS: u64 = 500;

/// Keyed deferred-action scheduler.
///
/// Each scheduled action is keyed; scheduling the same key again replaces
/// (aborts) the pending one. This is how a reopened tab cancels its own
/// pending deletion and how debouncing works.
#[derive(Default)]
pub struct DeferredActions {
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DeferredActions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, replacing any pending action
    /// with the same key.
    pub fn schedule<F>(&self, key: &str, delay: Duration, action: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prior) = pending.insert(key.to_string(), handle) {
            prior.abort();
        }
    }

    /// Cancel a pending action. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = pending.remove(key) {
            handle.abort();
            true
        } else {
            false
        }
    }

    /// Cancel everything (shutdown).
    pub fn cancel_all(&self) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}

fn tab_key(tab_id: i64) -> String {
    format!("tab:{tab_id}")
}

fn window_key(window_id: i64) -> String {
    format!("window:{window_id}")
}

fn group_key(group_id: i64) -> String {
    format!("group:{group_id}")
}

fn signature_key(window_id: i64) -> String {
    format!("signature:{window_id}")
}

/// Receives browser lifecycle events and applies them to the store.
pub struct EventRegistrar {
    storage: StorageHandle,
    browser: BrowserHandle,
    session: Arc<SessionManager>,
    anchor: Arc<AnchorManager>,
    tracker: Arc<TimeTracker>,
    deferred: Arc<DeferredActions>,
}

impl EventRegistrar {
    #[must_use]
    pub fn new(
        storage: StorageHandle,
        browser: BrowserHandle,
        session: Arc<SessionManager>,
        anchor: Arc<AnchorManager>,
        tracker: Arc<TimeTracker>,
    ) -> Self {
        Self {
            storage,
            browser,
            session,
            anchor,
            tracker,
            deferred: Arc::new(DeferredActions::new()),
        }
    }

    #[must_use]
    pub fn deferred(&self) -> &Arc<DeferredActions> {
        &self.deferred
    }

    // -- tabs ---------------------------------------------------------------

    pub async fn on_tab_created(&self, tab: &TabInfo) -> Result<()> {
        // A reopened tab with the same id cancels its pending deletion.
        self.deferred.cancel(&tab_key(tab.id));
        let session_id = self.session.current_session_id();
        self.storage
            .upsert_tab(tab_record_from_info(tab, session_id, now_ms()))
            .await?;
        self.schedule_signature_recompute(tab.window_id);
        self.schedule_badge_update();
        Ok(())
    }

    /// Navigation and title changes. A URL change normally resets the tab's
    /// accumulated time (a new page starts a new clock), except while the tab
    /// is marked restoring.
    pub async fn on_tab_updated(
        &self,
        tab_id: i64,
        url: Option<&str>,
        title: Option<&str>,
    ) -> Result<()> {
        let Some(mut record) = self.storage.get_tab(tab_id).await? else {
            return Ok(());
        };

        let mut navigated = false;
        if let Some(url) = url {
            if url != record.url {
                navigated = true;
                record.url = url.to_string();
            }
        }
        if let Some(title) = title {
            record.title = title.to_string();
        }

        if navigated && !self.session.is_tab_restoring(tab_id) {
            record.time_accumulated = 0;
            record.last_accessed = now_ms();
        }
        let window_id = record.window_id;
        self.storage.upsert_tab(record).await?;

        if navigated {
            self.schedule_signature_recompute(window_id);
            self.schedule_anchor_resync(window_id);
        }
        Ok(())
    }

    pub async fn on_tab_activated(&self, tab_id: i64) -> Result<()> {
        self.tracker.on_tab_activated(tab_id).await?;
        // Staleness refresh is suppressed for restoring tabs: activation on
        // creation must not look like user attention.
        if !self.session.is_tab_restoring(tab_id) {
            self.storage.touch_tab(tab_id, now_ms()).await?;
        }
        Ok(())
    }

    pub async fn on_tab_moved(&self, tab_id: i64, new_index: i64) -> Result<()> {
        if let Some(mut record) = self.storage.get_tab(tab_id).await? {
            record.index = new_index;
            self.storage.upsert_tab(record).await?;
        }
        Ok(())
    }

    /// Tab dragged into another window.
    pub async fn on_tab_attached(
        &self,
        tab_id: i64,
        new_window_id: i64,
        new_index: i64,
    ) -> Result<()> {
        let Some(mut record) = self.storage.get_tab(tab_id).await? else {
            return Ok(());
        };
        let old_window_id = record.window_id;
        record.window_id = new_window_id;
        record.index = new_index;
        record.group_id = -1;
        self.storage.upsert_tab(record).await?;
        self.schedule_signature_recompute(old_window_id);
        self.schedule_signature_recompute(new_window_id);
        Ok(())
    }

    pub async fn on_tab_removed(&self, tab_id: i64) -> Result<()> {
        self.tracker.on_tab_removed(tab_id).await?;
        let window_id = self
            .storage
            .get_tab(tab_id)
            .await?
            .map(|record| record.window_id);

        let storage = self.storage.clone();
        self.deferred.schedule(
            &tab_key(tab_id),
            Duration::from_millis(DEFERRED_DELETE_MS),
            async move {
                if let Err(err) = storage.delete_tab(tab_id).await {
                    warn!(tab_id, %err, "Deferred tab deletion failed");
                }
            },
        );

        if let Some(window_id) = window_id {
            self.schedule_signature_recompute(window_id);
        }
        self.schedule_badge_update();
        Ok(())
    }

    // -- windows ------------------------------------------------------------

    /// Returns whether initialization was still pending when this window
    /// appeared; the runtime retries deferred startup on that signal.
    pub async fn on_window_created(&self, window: &WindowInfo) -> Result<bool> {
        self.deferred.cancel(&window_key(window.id));
        if !self.session.is_initialized() {
            return Ok(true);
        }
        if window.kind == WindowKind::Normal {
            let now = now_ms();
            self.storage
                .upsert_window(WindowRecord {
                    id: window.id,
                    session_id: self.session.current_session_id(),
                    is_orphan: false,
                    title: String::new(),
                    url_signature: String::new(),
                    created_at: now,
                    last_accessed: now,
                })
                .await?;
        }
        self.schedule_badge_update();
        Ok(false)
    }

    pub fn on_window_removed(&self, window_id: i64) {
        let storage = self.storage.clone();
        self.deferred.schedule(
            &window_key(window_id),
            Duration::from_millis(DEFERRED_DELETE_MS),
            async move {
                if let Err(err) = storage.delete_window_cascade(window_id).await {
                    warn!(window_id, %err, "Deferred window deletion failed");
                }
            },
        );
        self.schedule_badge_update();
    }

    pub async fn on_window_focus_changed(&self, focused: bool) -> Result<()> {
        self.tracker.on_focus_changed(focused).await
    }

    // -- tab groups ----------------------------------------------------------

    pub async fn on_group_updated(&self, group: &TabGroupInfo) -> Result<()> {
        self.deferred.cancel(&group_key(group.id));
        self.storage
            .upsert_group(TabGroupRecord {
                id: group.id,
                window_id: group.window_id,
                session_id: self.session.current_session_id(),
                is_orphan: false,
                title: group.title.clone(),
                color: group.color.clone(),
                collapsed: group.collapsed,
            })
            .await?;
        self.schedule_anchor_resync(group.window_id);
        Ok(())
    }

    pub fn on_group_removed(&self, group_id: i64) {
        let storage = self.storage.clone();
        self.deferred.schedule(
            &group_key(group_id),
            Duration::from_millis(DEFERRED_DELETE_MS),
            async move {
                if let Err(err) = storage.delete_group(group_id).await {
                    warn!(group_id, %err, "Deferred group deletion failed");
                }
            },
        );
    }

    // -- side effects ---------------------------------------------------------

    /// Recompute a window's signature once it has stabilized. Rescheduled by
    /// every further change to the same window.
    fn schedule_signature_recompute(&self, window_id: i64) {
        let storage = self.storage.clone();
        self.deferred.schedule(
            &signature_key(window_id),
            Duration::from_millis(STABILIZE_MS),
            async move {
                if let Err(err) = recompute_signature(&storage, window_id).await {
                    // Best-effort enrichment; never aborts anything.
                    warn!(window_id, %err, "Signature recompute failed");
                }
            },
        );
    }

    /// Re-snapshot the anchor template when its bound window changes.
    fn schedule_anchor_resync(&self, window_id: i64) {
        let anchor = Arc::clone(&self.anchor);
        self.deferred.schedule(
            &format!("anchor:{window_id}"),
            Duration::from_millis(STABILIZE_MS),
            async move {
                match anchor.active_anchor_window_id().await {
                    Ok(Some(bound)) if bound == window_id => {
                        if let Err(err) = anchor.update_anchor_tabs(window_id).await {
                            warn!(window_id, %err, "Anchor resync failed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(window_id, %err, "Anchor lookup failed"),
                }
            },
        );
    }

    /// Debounced badge recount.
    pub fn schedule_badge_update(&self) {
        let browser = self.browser.clone();
        self.deferred.schedule(
            "badge",
            Duration::from_millis(BADGE_DEBOUNCE_MS),
            async move {
                if let Err(err) = update_badge(&browser).await {
                    warn!(%err, "Badge update failed");
                }
            },
        );
    }

    /// Immediate badge recount, used right after recovery so the user sees
    /// correct state without the debounce delay.
    pub async fn update_badge_now(&self) -> Result<()> {
        self.deferred.cancel("badge");
        update_badge(&self.browser).await
    }
}

async fn update_badge(browser: &BrowserHandle) -> Result<()> {
    let count = browser.list_tabs().await?.len();
    browser.set_badge_text(&count.to_string()).await?;
    debug!(count, "Badge updated");
    Ok(())
}

async fn recompute_signature(storage: &StorageHandle, window_id: i64) -> Result<()> {
    let tabs = storage.tabs_for_window(window_id, false).await?;
    let urls: Vec<&str> = tabs.iter().map(|t| t.url.as_str()).collect();
    let signature = generate_window_signature(&urls);
    storage
        .set_window_signature(window_id, &signature.hash, now_ms())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBrowser;
    use crate::config::RecoveryConfig;
    use crate::storage::TabRecord;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: StorageHandle,
        mock: Arc<MockBrowser>,
        session: Arc<SessionManager>,
        registrar: EventRegistrar,
    }

    async fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tw.db");
        let storage = StorageHandle::new(&db_path.to_string_lossy()).await.unwrap();
        let mock = Arc::new(MockBrowser::new());
        let session = Arc::new(SessionManager::new(
            storage.clone(),
            mock.clone(),
            RecoveryConfig::default(),
        ));
        let anchor = Arc::new(AnchorManager::new(
            storage.clone(),
            mock.clone(),
            session.clone(),
        ));
        let tracker = Arc::new(TimeTracker::new(storage.clone()));
        let registrar = EventRegistrar::new(
            storage.clone(),
            mock.clone(),
            session.clone(),
            anchor,
            tracker,
        );
        Fixture {
            _dir: dir,
            storage,
            mock,
            session,
            registrar,
        }
    }

    fn stored_tab(id: i64, window_id: i64, url: &str, time: i64) -> TabRecord {
        TabRecord {
            id,
            window_id,
            session_id: 1,
            is_orphan: false,
            title: String::new(),
            url: url.to_string(),
            favicon_url: None,
            last_accessed: 0,
            time_accumulated: time,
            index: 0,
            group_id: -1,
            pinned: false,
        }
    }

    #[tokio::test]
    async fn deferred_action_replacement_aborts_prior() {
        let deferred = DeferredActions::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let first = hits.clone();
        deferred.schedule("k", Duration::from_millis(20), async move {
            first.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let second = hits.clone();
        deferred.schedule("k", Duration::from_millis(20), async move {
            second.fetch_add(10, std::sync::atomic::Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_prevents_pending_action() {
        let deferred = DeferredActions::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let inner = hits.clone();
        deferred.schedule("k", Duration::from_millis(20), async move {
            inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(deferred.cancel("k"));
        assert!(!deferred.cancel("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn navigation_resets_time_unless_restoring() {
        let f = setup().await;
        f.storage
            .upsert_tab(stored_tab(1, 1, "https://old.com", 9_000))
            .await
            .unwrap();
        f.storage
            .upsert_tab(stored_tab(2, 1, "https://old.com", 9_000))
            .await
            .unwrap();

        // Marked 5s ago: still inside the suppression window.
        f.session.mark_restoring_at(1, now_ms() - 5_000);
        f.registrar
            .on_tab_updated(1, Some("https://new.com"), None)
            .await
            .unwrap();
        let tab = f.storage.get_tab(1).await.unwrap().unwrap();
        assert_eq!(tab.time_accumulated, 9_000);
        assert_eq!(tab.url, "https://new.com");

        // Marked 11s ago: suppression expired, navigation resets the clock.
        f.session.mark_restoring_at(2, now_ms() - 11_000);
        f.registrar
            .on_tab_updated(2, Some("https://new.com"), None)
            .await
            .unwrap();
        let tab = f.storage.get_tab(2).await.unwrap().unwrap();
        assert_eq!(tab.time_accumulated, 0);
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn same_url_update_keeps_time() {
        let f = setup().await;
        f.storage
            .upsert_tab(stored_tab(1, 1, "https://a.com", 4_000))
            .await
            .unwrap();
        f.registrar
            .on_tab_updated(1, Some("https://a.com"), Some("New Title"))
            .await
            .unwrap();
        let tab = f.storage.get_tab(1).await.unwrap().unwrap();
        assert_eq!(tab.time_accumulated, 4_000);
        assert_eq!(tab.title, "New Title");
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tab_recreation_cancels_pending_deletion() {
        let f = setup().await;
        f.storage
            .upsert_tab(stored_tab(1, 1, "https://a.com", 0))
            .await
            .unwrap();
        f.registrar.on_tab_removed(1).await.unwrap();

        // Same id comes back before the grace period fires.
        let info = TabInfo {
            id: 1,
            window_id: 1,
            index: 0,
            url: "https://a.com".to_string(),
            title: String::new(),
            favicon_url: None,
            pinned: false,
            group_id: -1,
            active: false,
        };
        f.registrar.on_tab_created(&info).await.unwrap();
        assert!(!f.registrar.deferred().cancel(&tab_key(1)));
        assert!(f.storage.get_tab(1).await.unwrap().is_some());
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn immediate_badge_shows_open_tab_count() {
        let f = setup().await;
        f.mock.add_window(1, WindowKind::Normal).await;
        f.mock.add_tab(10, 1, "https://a.com", "").await;
        f.mock.add_tab(11, 1, "https://b.com", "").await;

        f.registrar.update_badge_now().await.unwrap();
        assert_eq!(f.mock.badge_text().await, "2");
        f.storage.shutdown().await.unwrap();
    }
}
