//! Engine assembly and lifecycle.
//!
//! Builds the storage, session, anchor, tracker, event, and dispatch layers
//! from one config, runs the startup sequence (restart detection, recovery,
//! anchor restore, immediate badge), and owns the periodic orphan GC task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::anchor::AnchorManager;
use crate::browser::{BrowserHandle, WindowInfo};
use crate::cleanup::cleanup_apply;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::events::EventRegistrar;
use crate::session::{RestartOutcome, SessionManager};
use crate::storage::StorageHandle;
use crate::time_tracker::TimeTracker;

/// Fully wired engine.
pub struct Runtime {
    config: Config,
    storage: StorageHandle,
    browser: BrowserHandle,
    session: Arc<SessionManager>,
    anchor: Arc<AnchorManager>,
    tracker: Arc<TimeTracker>,
    registrar: Arc<EventRegistrar>,
    dispatcher: Arc<Dispatcher>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Open storage per the config and assemble the engine around the given
    /// browser handle.
    pub async fn new(config: Config, browser: BrowserHandle) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let storage = StorageHandle::new(&db_path.to_string_lossy()).await?;
        Ok(Self::with_storage(config, browser, storage))
    }

    /// Assemble around an already-open storage handle (tests, demo mode).
    #[must_use]
    pub fn with_storage(config: Config, browser: BrowserHandle, storage: StorageHandle) -> Self {
        let session = Arc::new(SessionManager::new(
            storage.clone(),
            browser.clone(),
            config.recovery.clone(),
        ));
        let anchor = Arc::new(AnchorManager::new(
            storage.clone(),
            browser.clone(),
            session.clone(),
        ));
        let tracker = Arc::new(TimeTracker::new(storage.clone()));
        let registrar = Arc::new(EventRegistrar::new(
            storage.clone(),
            browser.clone(),
            session.clone(),
            anchor.clone(),
            tracker.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            browser.clone(),
            session.clone(),
            anchor.clone(),
        ));

        // Time flushes into the anchor window propagate into the template.
        {
            let storage = storage.clone();
            let anchor = anchor.clone();
            tracker.set_flush_hook(Arc::new(move |tab_id| {
                let storage = storage.clone();
                let anchor = anchor.clone();
                tokio::spawn(async move {
                    let window_id = match storage.get_tab(tab_id).await {
                        Ok(Some(tab)) => tab.window_id,
                        Ok(None) => return,
                        Err(err) => {
                            warn!(tab_id, %err, "Flush hook tab lookup failed");
                            return;
                        }
                    };
                    match anchor.active_anchor_window_id().await {
                        Ok(Some(bound)) if bound == window_id => {
                            if let Err(err) = anchor.update_anchor_tabs(window_id).await {
                                warn!(window_id, %err, "Anchor time resync failed");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "Flush hook anchor lookup failed"),
                    }
                });
            }));
        }

        Self {
            config,
            storage,
            browser,
            session,
            anchor,
            tracker,
            registrar,
            dispatcher,
            gc_task: Mutex::new(None),
        }
    }

    /// Startup sequence: restart detection (and recovery when confirmed),
    /// anchor restore, immediate badge, periodic GC. A `Deferred` outcome
    /// skips everything after detection; call [`Runtime::on_window_created`]
    /// on later window events to retry.
    pub async fn start(&self) -> Result<RestartOutcome> {
        let outcome = self.session.initialize().await?;
        if outcome == RestartOutcome::Deferred {
            return Ok(outcome);
        }
        self.finish_startup().await?;
        Ok(outcome)
    }

    async fn finish_startup(&self) -> Result<()> {
        // Anchor restore runs on every path, restart or not.
        self.anchor.restore_anchor_window().await?;
        if let Err(err) = self.registrar.update_badge_now().await {
            warn!(%err, "Post-startup badge update failed");
        }
        self.spawn_gc();
        info!(session_id = self.session.current_session_id(), "Engine started");
        Ok(())
    }

    /// Window-created entry point that also retries deferred initialization.
    pub async fn on_window_created(&self, window: &WindowInfo) -> Result<()> {
        let init_pending = self.registrar.on_window_created(window).await?;
        if init_pending {
            let outcome = self.session.initialize().await?;
            if outcome != RestartOutcome::Deferred {
                self.finish_startup().await?;
                // Record the window that unblocked us.
                self.registrar.on_window_created(window).await?;
            }
        }
        Ok(())
    }

    fn spawn_gc(&self) {
        let storage = self.storage.clone();
        let cleanup = self.config.cleanup.clone();
        let interval = Duration::from_secs(self.config.recovery.gc_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so GC runs after one
            // interval, not at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cleanup_apply(&storage, &cleanup).await {
                    Ok(plan) if plan.total_deleted > 0 => {
                        info!(deleted = plan.total_deleted, "Periodic orphan GC");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "Periodic orphan GC failed"),
                }
            }
        });
        let mut slot = match self.gc_task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prior) = slot.replace(handle) {
            prior.abort();
        }
    }

    /// Stop background tasks and flush storage.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.gc_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.registrar.deferred().cancel_all();
        self.storage.shutdown().await
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
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    #[must_use]
    pub fn anchor(&self) -> &Arc<AnchorManager> {
        &self.anchor
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<TimeTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn registrar(&self) -> &Arc<EventRegistrar> {
        &self.registrar
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}
