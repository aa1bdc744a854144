//! Focused-time accounting.
//!
//! Tracks how long the user actively looks at each tab. A single cursor
//! records which tab is focused and since when; activation changes, focus
//! loss, and tab removal close out the interval and flush it to storage.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::storage::{now_ms, StorageHandle};

/// Intervals shorter than this are dropped as focus flicker.
pub const MIN_FLUSH_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct ActiveCursor {
    tab_id: i64,
    since_ms: i64,
}

/// Hook invoked after each flush with the tab ID that received time.
pub type FlushHook = Arc<dyn Fn(i64) + Send + Sync>;

/// Tracks the currently focused tab and accumulates wall-clock time into
/// the corresponding tab record.
pub struct TimeTracker {
    storage: StorageHandle,
    cursor: Mutex<Option<ActiveCursor>>,
    browser_focused: Mutex<bool>,
    flush_hook: Mutex<Option<FlushHook>>,
}

impl TimeTracker {
    #[must_use]
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage,
            cursor: Mutex::new(None),
            browser_focused: Mutex::new(true),
            flush_hook: Mutex::new(None),
        }
    }

    /// Register a hook called after each successful flush.
    pub fn set_flush_hook(&self, hook: FlushHook) {
        if let Ok(mut slot) = self.flush_hook.lock() {
            *slot = Some(hook);
        }
    }

    /// Tab with `tab_id` became active in its window.
    pub async fn on_tab_activated(&self, tab_id: i64) -> Result<()> {
        self.on_tab_activated_at(tab_id, now_ms()).await
    }

    pub async fn on_tab_activated_at(&self, tab_id: i64, now: i64) -> Result<()> {
        let prior = self.swap_cursor(Some(ActiveCursor {
            tab_id,
            since_ms: now,
        }));
        self.flush(prior, now).await
    }

    /// Browser-level focus changed. Losing focus closes the open interval;
    /// regaining focus restarts the clock on the already-active tab.
    pub async fn on_focus_changed(&self, focused: bool) -> Result<()> {
        self.on_focus_changed_at(focused, now_ms()).await
    }

    pub async fn on_focus_changed_at(&self, focused: bool, now: i64) -> Result<()> {
        let was_focused = {
            let mut flag = match self.browser_focused.lock() {
                Ok(flag) => flag,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *flag, focused)
        };
        if was_focused == focused {
            return Ok(());
        }

        if focused {
            // Restart the clock without crediting the unfocused gap.
            let mut cursor = match self.cursor.lock() {
                Ok(cursor) => cursor,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(active) = cursor.as_mut() {
                active.since_ms = now;
            }
            Ok(())
        } else {
            let prior = {
                let mut cursor = match self.cursor.lock() {
                    Ok(cursor) => cursor,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let snapshot = *cursor;
                // Keep the cursor so a later refocus resumes the same tab.
                if let Some(active) = cursor.as_mut() {
                    active.since_ms = now;
                }
                snapshot
            };
            // The interval being closed ran while the browser was still
            // focused; the flag already reads false here, so skip its check.
            self.flush_interval(prior, now).await
        }
    }

    /// Tab was removed. Flushes its open interval if it was the active tab.
    pub async fn on_tab_removed(&self, tab_id: i64) -> Result<()> {
        self.on_tab_removed_at(tab_id, now_ms()).await
    }

    pub async fn on_tab_removed_at(&self, tab_id: i64, now: i64) -> Result<()> {
        let prior = {
            let mut cursor = match self.cursor.lock() {
                Ok(cursor) => cursor,
                Err(poisoned) => poisoned.into_inner(),
            };
            match *cursor {
                Some(active) if active.tab_id == tab_id => cursor.take(),
                _ => None,
            }
        };
        self.flush(prior, now).await
    }

    fn swap_cursor(&self, next: Option<ActiveCursor>) -> Option<ActiveCursor> {
        let mut cursor = match self.cursor.lock() {
            Ok(cursor) => cursor,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *cursor, next)
    }

    async fn flush(&self, prior: Option<ActiveCursor>, now: i64) -> Result<()> {
        if !self.is_browser_focused() {
            return Ok(());
        }
        self.flush_interval(prior, now).await
    }

    async fn flush_interval(&self, prior: Option<ActiveCursor>, now: i64) -> Result<()> {
        let Some(prior) = prior else {
            return Ok(());
        };
        let elapsed = now - prior.since_ms;
        if elapsed < MIN_FLUSH_MS {
            return Ok(());
        }
        self.storage
            .add_tab_time(prior.tab_id, elapsed, now)
            .await?;
        debug!(tab_id = prior.tab_id, elapsed_ms = elapsed, "Flushed focused time");
        let hook = self.flush_hook.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(prior.tab_id);
        }
        Ok(())
    }

    fn is_browser_focused(&self) -> bool {
        match self.browser_focused.lock() {
            Ok(flag) => *flag,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
