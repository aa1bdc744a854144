//! Browser interface abstraction.
//!
//! The engine never talks to a browser directly; it goes through
//! [`BrowserInterface`] so the real extension bridge and the in-memory
//! [`MockBrowser`] are interchangeable at every call site. All IDs are the
//! browser's process-assigned integers and are NOT stable across restarts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::BrowserError;
use crate::Result;

/// Boxed future for browser interface operations.
pub type BrowserFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to a browser interface implementation.
pub type BrowserHandle = Arc<dyn BrowserInterface>;

/// Window kind as reported by the browser.
///
/// Restart detection only counts `Normal` windows: during startup a profile
/// picker or devtools shell may exist with no normal window yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Normal,
    Popup,
    DevTools,
}

/// Live tab state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: i64,
    pub window_id: i64,
    /// Position within the window.
    pub index: i64,
    pub url: String,
    pub title: String,
    pub favicon_url: Option<String>,
    pub pinned: bool,
    /// `-1` means ungrouped.
    pub group_id: i64,
    pub active: bool,
}

/// Live window state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: i64,
    pub kind: WindowKind,
    pub focused: bool,
}

/// Live tab-group state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabGroupInfo {
    pub id: i64,
    pub window_id: i64,
    pub title: String,
    pub color: String,
    pub collapsed: bool,
}

/// Abstraction layer over browser interactions.
///
/// This allows swapping the real extension bridge with a mock implementation
/// for simulation/testing without changing call sites.
pub trait BrowserInterface: Send + Sync {
    /// List all windows.
    fn list_windows(&self) -> BrowserFuture<'_, Vec<WindowInfo>>;
    /// List all tabs across all windows.
    fn list_tabs(&self) -> BrowserFuture<'_, Vec<TabInfo>>;
    /// List tabs belonging to one window.
    fn tabs_in_window(&self, window_id: i64) -> BrowserFuture<'_, Vec<TabInfo>>;
    /// List all tab groups.
    fn list_groups(&self) -> BrowserFuture<'_, Vec<TabGroupInfo>>;
    /// List tab groups belonging to one window.
    fn groups_in_window(&self, window_id: i64) -> BrowserFuture<'_, Vec<TabGroupInfo>>;
    /// Create a new normal window opening `url`; returns the window and its
    /// initial tab.
    fn create_window(&self, url: &str) -> BrowserFuture<'_, (WindowInfo, TabInfo)>;
    /// Create a tab in an existing window.
    fn create_tab(&self, window_id: i64, url: &str) -> BrowserFuture<'_, TabInfo>;
    /// Pin or unpin a tab.
    fn set_tab_pinned(&self, tab_id: i64, pinned: bool) -> BrowserFuture<'_, ()>;
    /// Put tabs into a group (creating the group); returns the group ID.
    fn group_tabs(&self, window_id: i64, tab_ids: Vec<i64>) -> BrowserFuture<'_, i64>;
    /// Update a tab group's presentation.
    fn update_group(
        &self,
        group_id: i64,
        title: &str,
        color: &str,
        collapsed: bool,
    ) -> BrowserFuture<'_, ()>;
    /// Set the toolbar badge text.
    fn set_badge_text(&self, text: &str) -> BrowserFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// MockBrowser: in-memory browser state for testing and simulation
// ---------------------------------------------------------------------------

/// In-memory mock of a browser for testing, simulation, and demo scenarios.
///
/// Maintains window/tab/group state and supports direct state injection
/// without a running browser.
pub struct MockBrowser {
    state: tokio::sync::RwLock<MockState>,
    next_id: AtomicI64,
}

#[derive(Default)]
struct MockState {
    windows: HashMap<i64, WindowInfo>,
    tabs: HashMap<i64, TabInfo>,
    groups: HashMap<i64, TabGroupInfo>,
    badge: String,
}

impl MockBrowser {
    /// Create an empty mock browser.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(MockState::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a window with explicit ID (keeps the allocator above it).
    pub async fn add_window(&self, id: i64, kind: WindowKind) {
        let mut state = self.state.write().await;
        state.windows.insert(
            id,
            WindowInfo {
                id,
                kind,
                focused: false,
            },
        );
        let _ = self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Add a tab with explicit ID.
    pub async fn add_tab(&self, id: i64, window_id: i64, url: &str, title: &str) {
        let mut state = self.state.write().await;
        let index = state
            .tabs
            .values()
            .filter(|t| t.window_id == window_id)
            .count() as i64;
        state.tabs.insert(
            id,
            TabInfo {
                id,
                window_id,
                index,
                url: url.to_string(),
                title: title.to_string(),
                favicon_url: None,
                pinned: false,
                group_id: -1,
                active: false,
            },
        );
        let _ = self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Add a tab group with explicit ID.
    pub async fn add_group(&self, id: i64, window_id: i64, title: &str, color: &str) {
        let mut state = self.state.write().await;
        state.groups.insert(
            id,
            TabGroupInfo {
                id,
                window_id,
                title: title.to_string(),
                color: color.to_string(),
                collapsed: false,
            },
        );
        let _ = self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Assign a tab to an existing group directly.
    pub async fn assign_tab_group(&self, tab_id: i64, group_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let tab = state
            .tabs
            .get_mut(&tab_id)
            .ok_or(BrowserError::TabNotFound(tab_id))?;
        tab.group_id = group_id;
        Ok(())
    }

    /// Navigate an existing tab.
    pub async fn navigate_tab(&self, tab_id: i64, url: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let tab = state
            .tabs
            .get_mut(&tab_id)
            .ok_or(BrowserError::TabNotFound(tab_id))?;
        tab.url = url.to_string();
        Ok(())
    }

    /// Remove a window and everything in it.
    pub async fn remove_window(&self, window_id: i64) {
        let mut state = self.state.write().await;
        state.windows.remove(&window_id);
        state.tabs.retain(|_, t| t.window_id != window_id);
        state.groups.retain(|_, g| g.window_id != window_id);
    }

    /// Snapshot of the current badge text.
    pub async fn badge_text(&self) -> String {
        self.state.read().await.badge.clone()
    }

    /// Look up one tab's state.
    pub async fn tab_state(&self, tab_id: i64) -> Option<TabInfo> {
        self.state.read().await.tabs.get(&tab_id).cloned()
    }

    /// Look up one group's state.
    pub async fn group_state(&self, group_id: i64) -> Option<TabGroupInfo> {
        self.state.read().await.groups.get(&group_id).cloned()
    }
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserInterface for MockBrowser {
    fn list_windows(&self) -> BrowserFuture<'_, Vec<WindowInfo>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut windows: Vec<WindowInfo> = state.windows.values().cloned().collect();
            windows.sort_by_key(|w| w.id);
            Ok(windows)
        })
    }

    fn list_tabs(&self) -> BrowserFuture<'_, Vec<TabInfo>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut tabs: Vec<TabInfo> = state.tabs.values().cloned().collect();
            tabs.sort_by_key(|t| (t.window_id, t.index));
            Ok(tabs)
        })
    }

    fn tabs_in_window(&self, window_id: i64) -> BrowserFuture<'_, Vec<TabInfo>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut tabs: Vec<TabInfo> = state
                .tabs
                .values()
                .filter(|t| t.window_id == window_id)
                .cloned()
                .collect();
            tabs.sort_by_key(|t| t.index);
            Ok(tabs)
        })
    }

    fn list_groups(&self) -> BrowserFuture<'_, Vec<TabGroupInfo>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut groups: Vec<TabGroupInfo> = state.groups.values().cloned().collect();
            groups.sort_by_key(|g| g.id);
            Ok(groups)
        })
    }

    fn groups_in_window(&self, window_id: i64) -> BrowserFuture<'_, Vec<TabGroupInfo>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut groups: Vec<TabGroupInfo> = state
                .groups
                .values()
                .filter(|g| g.window_id == window_id)
                .cloned()
                .collect();
            groups.sort_by_key(|g| g.id);
            Ok(groups)
        })
    }

    fn create_window(&self, url: &str) -> BrowserFuture<'_, (WindowInfo, TabInfo)> {
        let url = url.to_string();
        Box::pin(async move {
            let window_id = self.alloc_id();
            let tab_id = self.alloc_id();
            let window = WindowInfo {
                id: window_id,
                kind: WindowKind::Normal,
                focused: false,
            };
            let tab = TabInfo {
                id: tab_id,
                window_id,
                index: 0,
                url,
                title: String::new(),
                favicon_url: None,
                pinned: false,
                group_id: -1,
                active: true,
            };
            let mut state = self.state.write().await;
            state.windows.insert(window_id, window.clone());
            state.tabs.insert(tab_id, tab.clone());
            Ok((window, tab))
        })
    }

    fn create_tab(&self, window_id: i64, url: &str) -> BrowserFuture<'_, TabInfo> {
        let url = url.to_string();
        Box::pin(async move {
            {
                let state = self.state.read().await;
                if !state.windows.contains_key(&window_id) {
                    return Err(BrowserError::WindowNotFound(window_id).into());
                }
            }
            let tab_id = self.alloc_id();
            let mut state = self.state.write().await;
            let index = state
                .tabs
                .values()
                .filter(|t| t.window_id == window_id)
                .count() as i64;
            let tab = TabInfo {
                id: tab_id,
                window_id,
                index,
                url,
                title: String::new(),
                favicon_url: None,
                pinned: false,
                group_id: -1,
                active: false,
            };
            state.tabs.insert(tab_id, tab.clone());
            Ok(tab)
        })
    }

    fn set_tab_pinned(&self, tab_id: i64, pinned: bool) -> BrowserFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let tab = state
                .tabs
                .get_mut(&tab_id)
                .ok_or(BrowserError::TabNotFound(tab_id))?;
            tab.pinned = pinned;
            Ok(())
        })
    }

    fn group_tabs(&self, window_id: i64, tab_ids: Vec<i64>) -> BrowserFuture<'_, i64> {
        Box::pin(async move {
            let group_id = self.alloc_id();
            let mut state = self.state.write().await;
            if !state.windows.contains_key(&window_id) {
                return Err(BrowserError::WindowNotFound(window_id).into());
            }
            for tab_id in &tab_ids {
                let tab = state
                    .tabs
                    .get_mut(tab_id)
                    .ok_or(BrowserError::TabNotFound(*tab_id))?;
                tab.group_id = group_id;
            }
            state.groups.insert(
                group_id,
                TabGroupInfo {
                    id: group_id,
                    window_id,
                    title: String::new(),
                    color: "grey".to_string(),
                    collapsed: false,
                },
            );
            Ok(group_id)
        })
    }

    fn update_group(
        &self,
        group_id: i64,
        title: &str,
        color: &str,
        collapsed: bool,
    ) -> BrowserFuture<'_, ()> {
        let title = title.to_string();
        let color = color.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let group = state
                .groups
                .get_mut(&group_id)
                .ok_or(BrowserError::GroupNotFound(group_id))?;
            group.title = title;
            group.color = color;
            group.collapsed = collapsed;
            Ok(())
        })
    }

    fn set_badge_text(&self, text: &str) -> BrowserFuture<'_, ()> {
        let text = text.to_string();
        Box::pin(async move {
            self.state.write().await.badge = text;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_create_window_and_tabs() {
        let browser = MockBrowser::new();
        let (window, first) = browser.create_window("https://a.com").await.unwrap();
        let second = browser.create_tab(window.id, "https://b.com").await.unwrap();

        let tabs = browser.tabs_in_window(window.id).await.unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].id, first.id);
        assert_eq!(tabs[1].id, second.id);
        assert_eq!(tabs[1].index, 1);
    }

    #[tokio::test]
    async fn mock_grouping_assigns_group_ids() {
        let browser = MockBrowser::new();
        let (window, tab) = browser.create_window("https://a.com").await.unwrap();
        let other = browser.create_tab(window.id, "https://b.com").await.unwrap();

        let group_id = browser
            .group_tabs(window.id, vec![tab.id, other.id])
            .await
            .unwrap();
        browser
            .update_group(group_id, "Work", "blue", true)
            .await
            .unwrap();

        let group = browser.group_state(group_id).await.unwrap();
        assert_eq!(group.title, "Work");
        assert!(group.collapsed);
        assert_eq!(browser.tab_state(tab.id).await.unwrap().group_id, group_id);
    }

    #[tokio::test]
    async fn mock_missing_tab_errors() {
        let browser = MockBrowser::new();
        let err = browser.set_tab_pinned(42, true).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Browser(BrowserError::TabNotFound(42))
        ));
    }
}
