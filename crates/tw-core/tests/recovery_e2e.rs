// End-to-end recovery scenarios against the mock browser.
use std::sync::Arc;

use tempfile::TempDir;
use tw_core::anchor::AnchorManager;
use tw_core::browser::{BrowserInterface, MockBrowser, WindowKind};
use tw_core::config::RecoveryConfig;
use tw_core::session::{RestartOutcome, SessionManager};
use tw_core::storage::{
    now_ms, AnchorTab, AnchorWindowConfig, StorageHandle, TabGroupRecord, TabRecord, WindowRecord,
};

struct Harness {
    _dir: TempDir,
    storage: StorageHandle,
    mock: Arc<MockBrowser>,
    session: Arc<SessionManager>,
    anchor: AnchorManager,
}

async fn harness() -> Harness {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("test.db").to_string_lossy().to_string();
    let storage = StorageHandle::new(&path).await.expect("open storage");
    let mock = Arc::new(MockBrowser::new());
    let recovery = RecoveryConfig {
        window_wait_timeout_ms: 500,
        ..RecoveryConfig::default()
    };
    let session = Arc::new(SessionManager::new(storage.clone(), mock.clone(), recovery));
    let anchor = AnchorManager::new(storage.clone(), mock.clone(), session.clone());
    Harness {
        _dir: dir,
        storage,
        mock,
        session,
        anchor,
    }
}

fn stored_window(id: i64, title: &str) -> WindowRecord {
    WindowRecord {
        id,
        session_id: 1,
        is_orphan: false,
        title: title.to_string(),
        url_signature: String::new(),
        created_at: now_ms(),
        last_accessed: now_ms(),
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
        last_accessed: now_ms(),
        time_accumulated: time,
        index: 0,
        group_id: -1,
        pinned: false,
    }
}

#[tokio::test]
async fn restart_recovery_carries_title_and_deletes_matched_orphan() {
    let h = harness().await;

    // Previous session: window 1 titled "Work" with two tabs.
    h.storage.upsert_window(stored_window(1, "Work")).await.unwrap();
    h.storage
        .upsert_tab(stored_tab(10, 1, "https://a.com", 7_000))
        .await
        .unwrap();
    h.storage
        .upsert_tab(stored_tab(11, 1, "https://b.com", 0))
        .await
        .unwrap();

    // After restart the browser holds the same URLs under fresh IDs.
    h.mock.add_window(2, WindowKind::Normal).await;
    h.mock.add_tab(20, 2, "https://a.com", "A").await;
    h.mock.add_tab(21, 2, "https://b.com", "B").await;

    let outcome = h.session.initialize().await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restart);

    let report = h.session.recovery_report().await.unwrap().unwrap();
    assert_eq!(report.matched.len(), 1);
    assert!(report.unmatched_orphans.is_empty());
    assert_eq!(report.matched[0].title, "Work");
    assert!(report.matched[0].confidence >= 0.35);

    // The current window carries the orphan's title; the orphan is gone.
    let current = h.storage.get_window(2).await.unwrap().unwrap();
    assert_eq!(current.title, "Work");
    assert!(h.storage.get_window(1).await.unwrap().is_none());
    assert!(h.storage.get_tab(10).await.unwrap().is_none());

    // Accumulated time transferred by exact URL.
    let tab = h.storage.get_tab(20).await.unwrap().unwrap();
    assert_eq!(tab.time_accumulated, 7_000);

    h.storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn unmatched_orphan_is_parked_then_restorable() {
    let h = harness().await;

    h.storage.upsert_window(stored_window(1, "Research")).await.unwrap();
    h.storage
        .upsert_tab(stored_tab(10, 1, "https://arxiv.org/abs/1", 3_000))
        .await
        .unwrap();
    h.storage
        .upsert_tab(stored_tab(11, 1, "https://arxiv.org/abs/2", 0))
        .await
        .unwrap();

    // The post-restart browser shows a completely different window.
    h.mock.add_window(2, WindowKind::Normal).await;
    h.mock.add_tab(20, 2, "https://news.ycombinator.com", "HN").await;

    let outcome = h.session.initialize().await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restart);

    let pending = h.storage.pending_recovery().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].window_id, 1);
    assert_eq!(pending[0].title, "Research");

    // User chooses restore: a new window opens with both saved URLs.
    let restore = h.session.restore_unmatched_window(1).await.unwrap();
    let new_window_id = restore.window_id.expect("window created");
    assert_eq!(restore.tabs_restored, 2);

    let live_tabs = h.mock.list_windows().await.unwrap();
    assert_eq!(live_tabs.len(), 2);

    // Time carried over and the new tabs are in the suppression window.
    let restored = h.storage.tabs_for_window(new_window_id, false).await.unwrap();
    assert_eq!(restored.len(), 2);
    let first = restored
        .iter()
        .find(|t| t.url == "https://arxiv.org/abs/1")
        .unwrap();
    assert_eq!(first.time_accumulated, 3_000);
    assert!(h.session.is_tab_restoring(first.id));

    // Orphan fully resolved.
    assert!(h.storage.get_window(1).await.unwrap().is_none());
    assert!(h.storage.pending_recovery().await.unwrap().is_empty());

    h.storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn discard_and_keep_actions() {
    let h = harness().await;

    for id in [1, 2] {
        let mut w = stored_window(id, "");
        w.is_orphan = true;
        h.storage.upsert_window(w).await.unwrap();
        let mut t = stored_tab(id * 10, id, "https://a.com", 0);
        t.is_orphan = true;
        h.storage.upsert_tab(t).await.unwrap();
        h.storage
            .upsert_pending_recovery(tw_core::storage::PendingRecoveryRecord {
                window_id: id,
                title: String::new(),
                confidence: None,
                tab_preview: vec!["https://a.com".to_string()],
                created_at: 0,
            })
            .await
            .unwrap();
    }

    // Discard deletes the data; keep only clears the banner entry.
    h.session.discard_unmatched_window(1).await.unwrap();
    assert!(h.storage.get_window(1).await.unwrap().is_none());

    h.session.keep_unmatched_window(2).await.unwrap();
    assert!(h.storage.get_window(2).await.unwrap().is_some());
    assert!(h.storage.pending_recovery().await.unwrap().is_empty());

    // No browser window was created by either action.
    assert!(h.mock.list_windows().await.unwrap().is_empty());

    h.storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn group_titles_carry_across_restart() {
    let h = harness().await;

    h.storage.upsert_window(stored_window(1, "")).await.unwrap();
    let mut t1 = stored_tab(10, 1, "https://a.com", 0);
    t1.group_id = 100;
    let mut t2 = stored_tab(11, 1, "https://b.com", 0);
    t2.group_id = 100;
    h.storage.upsert_tab(t1).await.unwrap();
    h.storage.upsert_tab(t2).await.unwrap();
    h.storage
        .upsert_group(TabGroupRecord {
            id: 100,
            window_id: 1,
            session_id: 1,
            is_orphan: false,
            title: "Papers".to_string(),
            color: "purple".to_string(),
            collapsed: true,
        })
        .await
        .unwrap();

    h.mock.add_window(2, WindowKind::Normal).await;
    h.mock.add_tab(20, 2, "https://a.com", "").await;
    h.mock.add_tab(21, 2, "https://b.com", "").await;
    h.mock.add_group(200, 2, "", "grey").await;
    h.mock.assign_tab_group(20, 200).await.unwrap();
    h.mock.assign_tab_group(21, 200).await.unwrap();

    let outcome = h.session.initialize().await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restart);

    let live_group = h.mock.group_state(200).await.unwrap();
    assert_eq!(live_group.title, "Papers");
    assert_eq!(live_group.color, "purple");
    assert!(live_group.collapsed);

    let stored_group = h.storage.get_group(200).await.unwrap().unwrap();
    assert_eq!(stored_group.title, "Papers");

    h.storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn anchor_recreates_window_when_nothing_overlaps() {
    let h = harness().await;

    h.mock.add_window(1, WindowKind::Normal).await;
    h.mock.add_tab(10, 1, "https://unrelated.com", "").await;

    h.storage
        .set_anchor(AnchorWindowConfig {
            window_title: "Pinned".to_string(),
            tabs: vec![
                AnchorTab {
                    url: "https://x.com".to_string(),
                    title: "X".to_string(),
                    favicon_url: None,
                    index: 0,
                    pinned: true,
                    group_id: -1,
                    time_accumulated: 60_000,
                },
                AnchorTab {
                    url: "chrome://settings".to_string(),
                    title: String::new(),
                    favicon_url: None,
                    index: 1,
                    pinned: false,
                    group_id: -1,
                    time_accumulated: 0,
                },
            ],
            tab_groups: vec![],
        })
        .await
        .unwrap();

    let bound = h.anchor.restore_anchor_window().await.unwrap();
    let bound = bound.expect("anchor bound");
    assert_ne!(bound, 1);

    // The internal-scheme tab was skipped; the real one is pinned with time.
    let tabs = h.mock.tabs_in_window(bound).await.unwrap();
    assert_eq!(tabs.len(), 1);
    assert_eq!(tabs[0].url, "https://x.com");
    assert!(tabs[0].pinned);

    let stored = h.storage.get_tab(tabs[0].id).await.unwrap().unwrap();
    assert_eq!(stored.time_accumulated, 60_000);

    let window = h.storage.get_window(bound).await.unwrap().unwrap();
    assert_eq!(window.title, "Pinned");

    h.storage.shutdown().await.unwrap();
}
