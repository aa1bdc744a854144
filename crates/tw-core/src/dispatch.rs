//! Request/response message dispatch.
//!
//! UI collaborators talk to the engine through a tagged request enum; every
//! operation gets a typed variant so the dispatch is exhaustiveness-checked
//! instead of an if/else chain over a string field. Handlers are independent
//! and stateless beyond the store; failures come back as an error response,
//! never a crash.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::anchor::AnchorManager;
use crate::browser::BrowserHandle;
use crate::error::Result;
use crate::matcher::is_valid_url;
use crate::session::{RecoveryReport, SessionManager, UnmatchedWindowReport};
use crate::storage::{AnchorTab, AnchorWindowConfig, StorageHandle};

fn nickname_key(tab_id: i64) -> String {
    format!("tab_nickname:{tab_id}")
}

fn filter_key(name: &str) -> String {
    format!("filter:{name}")
}

fn saved_window_key(name: &str) -> String {
    format!("saved_window:{name}")
}

/// A named window snapshot the user can restore later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedWindow {
    pub name: String,
    #[serde(flatten)]
    pub config: AnchorWindowConfig,
}

/// Requests accepted from UI collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetRecoveryResult,
    RestoreUnmatchedWindow { window_id: i64 },
    DiscardUnmatchedWindow { window_id: i64 },
    KeepUnmatchedWindow { window_id: i64 },
    DismissRecovery,
    SetAnchorWindow { window_id: i64 },
    ClearAnchorWindow,
    GetAnchorWindow,
    UpdateAnchorTabs { window_id: i64 },
    GetWindowTitle { window_id: i64 },
    SetWindowTitle { window_id: i64, title: String },
    DeleteWindowTitle { window_id: i64 },
    GetTabNickname { tab_id: i64 },
    SetTabNickname { tab_id: i64, nickname: String },
    DeleteTabNickname { tab_id: i64 },
    ListFilters,
    GetFilter { name: String },
    SetFilter { name: String, filter: Value },
    DeleteFilter { name: String },
    SaveWindow { name: String, window_id: i64 },
    RestoreSavedWindow { name: String },
    DeleteSavedWindow { name: String },
    ListSavedWindows,
}

/// Responses, one shape per operation family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    RecoveryResult {
        report: Option<RecoveryReport>,
    },
    WindowRestored {
        window_id: Option<i64>,
        tabs_restored: usize,
    },
    Done,
    Removed {
        existed: bool,
    },
    AnchorWindow {
        config: Option<AnchorWindowConfig>,
        active_window_id: Option<i64>,
    },
    WindowTitle {
        title: Option<String>,
    },
    TabNickname {
        nickname: Option<String>,
    },
    Filters {
        names: Vec<String>,
    },
    Filter {
        filter: Option<Value>,
    },
    SavedWindows {
        names: Vec<String>,
    },
    SavedWindow {
        saved: SavedWindow,
    },
    Error {
        message: String,
    },
}

/// Stateless message dispatcher over the engine's handles.
pub struct Dispatcher {
    storage: StorageHandle,
    browser: BrowserHandle,
    session: Arc<SessionManager>,
    anchor: Arc<AnchorManager>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        storage: StorageHandle,
        browser: BrowserHandle,
        session: Arc<SessionManager>,
        anchor: Arc<AnchorManager>,
    ) -> Self {
        Self {
            storage,
            browser,
            session,
            anchor,
        }
    }

    /// Handle one request. Errors become an `Error` response.
    pub async fn handle(&self, request: Request) -> Response {
        match self.try_handle(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "Request failed");
                Response::Error {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn try_handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::GetRecoveryResult => {
                let report = self.recovery_result_for_ui().await?;
                Ok(Response::RecoveryResult { report })
            }
            Request::RestoreUnmatchedWindow { window_id } => {
                let outcome = self.session.restore_unmatched_window(window_id).await?;
                Ok(Response::WindowRestored {
                    window_id: outcome.window_id,
                    tabs_restored: outcome.tabs_restored,
                })
            }
            Request::DiscardUnmatchedWindow { window_id } => {
                self.session.discard_unmatched_window(window_id).await?;
                Ok(Response::Done)
            }
            Request::KeepUnmatchedWindow { window_id } => {
                let existed = self.session.keep_unmatched_window(window_id).await?;
                Ok(Response::Removed { existed })
            }
            Request::DismissRecovery => {
                self.session.dismiss_recovery().await?;
                Ok(Response::Done)
            }
            Request::SetAnchorWindow { window_id } => {
                let config = self.anchor.set_anchor_from_window(window_id).await?;
                Ok(Response::AnchorWindow {
                    config: Some(config),
                    active_window_id: Some(window_id),
                })
            }
            Request::ClearAnchorWindow => {
                let existed = self.anchor.clear_anchor().await?;
                Ok(Response::Removed { existed })
            }
            Request::GetAnchorWindow => Ok(Response::AnchorWindow {
                config: self.storage.get_anchor().await?,
                active_window_id: self.anchor.active_anchor_window_id().await?,
            }),
            Request::UpdateAnchorTabs { window_id } => {
                let config = self.anchor.update_anchor_tabs(window_id).await?;
                Ok(Response::AnchorWindow {
                    config,
                    active_window_id: self.anchor.active_anchor_window_id().await?,
                })
            }
            Request::GetWindowTitle { window_id } => {
                let title = self
                    .storage
                    .get_window(window_id)
                    .await?
                    .map(|w| w.title)
                    .filter(|t| !t.is_empty());
                Ok(Response::WindowTitle { title })
            }
            Request::SetWindowTitle { window_id, title } => {
                self.storage.set_window_title(window_id, &title).await?;
                Ok(Response::Done)
            }
            Request::DeleteWindowTitle { window_id } => {
                self.storage.set_window_title(window_id, "").await?;
                Ok(Response::Done)
            }
            Request::GetTabNickname { tab_id } => Ok(Response::TabNickname {
                nickname: self.storage.get_setting(&nickname_key(tab_id)).await?,
            }),
            Request::SetTabNickname { tab_id, nickname } => {
                self.storage
                    .set_setting(&nickname_key(tab_id), &nickname)
                    .await?;
                Ok(Response::Done)
            }
            Request::DeleteTabNickname { tab_id } => {
                let existed = self.storage.delete_setting(&nickname_key(tab_id)).await?;
                Ok(Response::Removed { existed })
            }
            Request::ListFilters => {
                let names = self
                    .storage
                    .settings_with_prefix("filter:")
                    .await?
                    .into_iter()
                    .map(|(key, _)| key.trim_start_matches("filter:").to_string())
                    .collect();
                Ok(Response::Filters { names })
            }
            Request::GetFilter { name } => {
                let filter = match self.storage.get_setting(&filter_key(&name)).await? {
                    Some(raw) => Some(serde_json::from_str(&raw)?),
                    None => None,
                };
                Ok(Response::Filter { filter })
            }
            Request::SetFilter { name, filter } => {
                let raw = serde_json::to_string(&filter)?;
                self.storage.set_setting(&filter_key(&name), &raw).await?;
                Ok(Response::Done)
            }
            Request::DeleteFilter { name } => {
                let existed = self.storage.delete_setting(&filter_key(&name)).await?;
                Ok(Response::Removed { existed })
            }
            Request::SaveWindow { name, window_id } => {
                let config = self.anchor.snapshot_window_as_anchor(window_id).await?;
                let saved = SavedWindow { name, config };
                let raw = serde_json::to_string(&saved)?;
                self.storage
                    .set_setting(&saved_window_key(&saved.name), &raw)
                    .await?;
                Ok(Response::SavedWindow { saved })
            }
            Request::RestoreSavedWindow { name } => {
                let Some(raw) = self.storage.get_setting(&saved_window_key(&name)).await? else {
                    return Ok(Response::Error {
                        message: format!("No saved window named {name}"),
                    });
                };
                let saved: SavedWindow = serde_json::from_str(&raw)?;
                let (window_id, tabs_restored) = self.open_snapshot(&saved.config).await?;
                Ok(Response::WindowRestored {
                    window_id,
                    tabs_restored,
                })
            }
            Request::DeleteSavedWindow { name } => {
                let existed = self.storage.delete_setting(&saved_window_key(&name)).await?;
                Ok(Response::Removed { existed })
            }
            Request::ListSavedWindows => {
                let names = self
                    .storage
                    .settings_with_prefix("saved_window:")
                    .await?
                    .into_iter()
                    .map(|(key, _)| key.trim_start_matches("saved_window:").to_string())
                    .collect();
                Ok(Response::SavedWindows { names })
            }
        }
    }

    /// The persisted recovery report, with its unmatched list narrowed to the
    /// entries the user has not resolved yet.
    async fn recovery_result_for_ui(&self) -> Result<Option<RecoveryReport>> {
        let Some(mut report) = self.session.recovery_report().await? else {
            return Ok(None);
        };
        let pending = self.storage.pending_recovery().await?;
        report.unmatched_orphans = pending
            .into_iter()
            .map(|entry| UnmatchedWindowReport {
                window_id: entry.window_id,
                title: entry.title,
                tab_preview: entry.tab_preview,
            })
            .collect();
        Ok(Some(report))
    }

    /// Open a new browser window from a snapshot, skipping internal-scheme
    /// URLs and rebuilding pins and groups.
    async fn open_snapshot(&self, config: &AnchorWindowConfig) -> Result<(Option<i64>, usize)> {
        let creatable: Vec<&AnchorTab> = config
            .tabs
            .iter()
            .filter(|t| is_valid_url(&t.url))
            .collect();
        let Some(first) = creatable.first() else {
            return Ok((None, 0));
        };

        let (window, first_tab) = self.browser.create_window(&first.url).await?;
        let mut created = vec![(first_tab.id, *first)];
        for saved in &creatable[1..] {
            let tab = self.browser.create_tab(window.id, &saved.url).await?;
            created.push((tab.id, *saved));
        }

        let mut group_members: std::collections::HashMap<i64, Vec<i64>> =
            std::collections::HashMap::new();
        for (tab_id, saved) in &created {
            if saved.pinned {
                self.browser.set_tab_pinned(*tab_id, true).await?;
            }
            if saved.group_id >= 0 {
                group_members.entry(saved.group_id).or_default().push(*tab_id);
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
        Ok((Some(window.id), created.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserInterface, MockBrowser, WindowKind};
    use crate::config::RecoveryConfig;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: StorageHandle,
        mock: Arc<MockBrowser>,
        dispatcher: Dispatcher,
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
        let dispatcher = Dispatcher::new(storage.clone(), mock.clone(), session, anchor);
        Fixture {
            _dir: dir,
            storage,
            mock,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn request_wire_format_is_snake_case_tagged() {
        let request: Request =
            serde_json::from_str(r#"{"type":"restore_unmatched_window","window_id":5}"#).unwrap();
        match request {
            Request::RestoreUnmatchedWindow { window_id } => assert_eq!(window_id, 5),
            other => panic!("unexpected request: {other:?}"),
        }

        let raw = serde_json::to_value(Request::DismissRecovery).unwrap();
        assert_eq!(raw["type"], "dismiss_recovery");
    }

    #[tokio::test]
    async fn nickname_roundtrip() {
        let f = setup().await;
        let response = f
            .dispatcher
            .handle(Request::SetTabNickname {
                tab_id: 7,
                nickname: "docs".to_string(),
            })
            .await;
        assert!(matches!(response, Response::Done));

        let response = f.dispatcher.handle(Request::GetTabNickname { tab_id: 7 }).await;
        match response {
            Response::TabNickname { nickname } => assert_eq!(nickname.as_deref(), Some("docs")),
            other => panic!("unexpected response: {other:?}"),
        }

        let response = f
            .dispatcher
            .handle(Request::DeleteTabNickname { tab_id: 7 })
            .await;
        assert!(matches!(response, Response::Removed { existed: true }));
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn filter_crud_and_listing() {
        let f = setup().await;
        f.dispatcher
            .handle(Request::SetFilter {
                name: "news".to_string(),
                filter: serde_json::json!({"domain": "news.ycombinator.com"}),
            })
            .await;
        f.dispatcher
            .handle(Request::SetFilter {
                name: "work".to_string(),
                filter: serde_json::json!({"domain": "github.com"}),
            })
            .await;

        match f.dispatcher.handle(Request::ListFilters).await {
            Response::Filters { names } => assert_eq!(names, vec!["news", "work"]),
            other => panic!("unexpected response: {other:?}"),
        }

        match f
            .dispatcher
            .handle(Request::GetFilter {
                name: "news".to_string(),
            })
            .await
        {
            Response::Filter { filter } => {
                assert_eq!(filter.unwrap()["domain"], "news.ycombinator.com");
            }
            other => panic!("unexpected response: {other:?}"),
        }
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn saved_window_roundtrip_recreates_tabs() {
        let f = setup().await;
        f.mock.add_window(1, WindowKind::Normal).await;
        f.mock.add_tab(10, 1, "https://a.com", "A").await;
        f.mock.add_tab(11, 1, "https://b.com", "B").await;

        let response = f
            .dispatcher
            .handle(Request::SaveWindow {
                name: "research".to_string(),
                window_id: 1,
            })
            .await;
        assert!(matches!(response, Response::SavedWindow { .. }));

        f.mock.remove_window(1).await;
        let response = f
            .dispatcher
            .handle(Request::RestoreSavedWindow {
                name: "research".to_string(),
            })
            .await;
        match response {
            Response::WindowRestored {
                window_id,
                tabs_restored,
            } => {
                assert!(window_id.is_some());
                assert_eq!(tabs_restored, 2);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let windows = f.mock.list_windows().await.unwrap();
        assert_eq!(windows.len(), 1);
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_saved_window_is_an_error_response() {
        let f = setup().await;
        let response = f
            .dispatcher
            .handle(Request::RestoreSavedWindow {
                name: "missing".to_string(),
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));
        f.storage.shutdown().await.unwrap();
    }
}
