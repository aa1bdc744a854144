//! Storage layer with SQLite.
//!
//! Provides persistent storage for tabs, windows, tab groups, sessions,
//! settings, the anchor-window template, pending recovery entries, and the
//! automoved/autoclosed audit log.
//!
//! # Schema Design
//!
//! The database uses WAL mode for concurrent reads and single-writer
//! semantics. All timestamps are epoch milliseconds (i64). JSON columns are
//! stored as TEXT.
//!
//! Tab/window/group primary keys are the browser's process-assigned IDs and
//! are reassigned on every browser restart; the `is_orphan` flag partitions
//! each table into live state (0) and state from a session believed to have
//! ended (1).

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, StorageError};

// =============================================================================
// Schema Definition
// =============================================================================

/// Current schema version, tracked via PRAGMA user_version.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema initialization SQL.
///
/// Convention notes:
/// - Timestamps: epoch milliseconds (i64)
/// - JSON columns: TEXT containing JSON
/// - Booleans: INTEGER 0|1
pub const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;

-- Sessions: exactly one row has active = 1
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(active) WHERE active = 1;

-- Windows: browser-assigned id, unstable across restarts
CREATE TABLE IF NOT EXISTS windows (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL,
    is_orphan INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    url_signature TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_windows_orphan ON windows(is_orphan);

-- Tabs
CREATE TABLE IF NOT EXISTS tabs (
    id INTEGER PRIMARY KEY,
    window_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    is_orphan INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    favicon_url TEXT,
    last_accessed INTEGER NOT NULL,
    time_accumulated INTEGER NOT NULL DEFAULT 0,
    tab_index INTEGER NOT NULL DEFAULT 0,
    group_id INTEGER NOT NULL DEFAULT -1,
    pinned INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tabs_window ON tabs(window_id);
CREATE INDEX IF NOT EXISTS idx_tabs_orphan ON tabs(is_orphan);

-- Tab groups
CREATE TABLE IF NOT EXISTS tab_groups (
    id INTEGER PRIMARY KEY,
    window_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    is_orphan INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    color TEXT NOT NULL DEFAULT 'grey',
    collapsed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_groups_window ON tab_groups(window_id);
CREATE INDEX IF NOT EXISTS idx_groups_orphan ON tab_groups(is_orphan);

-- Settings: key-value, JSON TEXT values
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Anchor window template: at most one row
CREATE TABLE IF NOT EXISTS anchor_window (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    window_title TEXT NOT NULL,
    tabs_json TEXT NOT NULL,
    tab_groups_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Pending recovery: one row per unmatched orphan window awaiting a user
-- decision (restore / discard / keep for later)
CREATE TABLE IF NOT EXISTS pending_recovery (
    window_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    confidence REAL,
    tab_preview_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
);

-- Audit log: automoved / autoclosed tab history (append-only)
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    tab_url TEXT NOT NULL,
    tab_title TEXT NOT NULL DEFAULT '',
    detail TEXT,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at);
";

/// Initialize (or no-op re-initialize) the schema.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::Database(format!("Failed to initialize schema: {e}")))?;
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("Failed to read user_version: {e}")))?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| StorageError::Database(format!("Failed to set user_version: {e}")))?;
    }
    Ok(())
}

/// Get current timestamp in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

// =============================================================================
// Records
// =============================================================================

/// Persisted tab state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabRecord {
    pub id: i64,
    pub window_id: i64,
    pub session_id: i64,
    pub is_orphan: bool,
    pub title: String,
    pub url: String,
    pub favicon_url: Option<String>,
    pub last_accessed: i64,
    pub time_accumulated: i64,
    pub index: i64,
    pub group_id: i64,
    pub pinned: bool,
}

/// Persisted window state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: i64,
    pub session_id: i64,
    pub is_orphan: bool,
    /// User-assigned title; empty = unset.
    pub title: String,
    /// Domain-histogram fingerprint (diagnostic).
    pub url_signature: String,
    pub created_at: i64,
    pub last_accessed: i64,
}

/// Persisted tab-group state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabGroupRecord {
    pub id: i64,
    pub window_id: i64,
    pub session_id: i64,
    pub is_orphan: bool,
    pub title: String,
    pub color: String,
    pub collapsed: bool,
}

/// One browser-process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub started_at: i64,
    pub active: bool,
}

/// A tab inside the anchor-window template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorTab {
    pub url: String,
    pub title: String,
    pub favicon_url: Option<String>,
    pub index: i64,
    pub pinned: bool,
    pub group_id: i64,
    pub time_accumulated: i64,
}

/// A tab group inside the anchor-window template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorGroup {
    pub id: i64,
    pub title: String,
    pub color: String,
    pub collapsed: bool,
}

/// The anchor-window template: the durable source of truth for one
/// user-designated window's title and per-tab accumulated time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnchorWindowConfig {
    pub window_title: String,
    pub tabs: Vec<AnchorTab>,
    pub tab_groups: Vec<AnchorGroup>,
}

/// One unmatched orphan window awaiting a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecoveryRecord {
    pub window_id: i64,
    pub title: String,
    pub confidence: Option<f64>,
    pub tab_preview: Vec<String>,
    pub created_at: i64,
}

/// Append-only audit entry (`automoved` / `autoclosed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub kind: String,
    pub tab_url: String,
    pub tab_title: String,
    pub detail: Option<String>,
    pub at: i64,
}

// =============================================================================
// Writer Command Types
// =============================================================================

/// Commands sent to the writer thread.
enum WriteCommand {
    UpsertTab {
        tab: TabRecord,
        respond: oneshot::Sender<Result<()>>,
    },
    UpsertWindow {
        window: WindowRecord,
        respond: oneshot::Sender<Result<()>>,
    },
    UpsertGroup {
        group: TabGroupRecord,
        respond: oneshot::Sender<Result<()>>,
    },
    DeleteTab {
        tab_id: i64,
        respond: oneshot::Sender<Result<bool>>,
    },
    DeleteGroup {
        group_id: i64,
        respond: oneshot::Sender<Result<bool>>,
    },
    /// Delete a window plus its tabs and groups in one transaction.
    DeleteWindowCascade {
        window_id: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Flag every tab/window/group row as orphaned, atomically.
    MarkAllOrphaned {
        respond: oneshot::Sender<Result<usize>>,
    },
    /// Create a new active session, deactivating the prior one.
    CreateSession {
        started_at: i64,
        respond: oneshot::Sender<Result<i64>>,
    },
    SetSetting {
        key: String,
        value: String,
        respond: oneshot::Sender<Result<()>>,
    },
    DeleteSetting {
        key: String,
        respond: oneshot::Sender<Result<bool>>,
    },
    /// Replace the anchor template (clears any prior row first).
    SetAnchor {
        config: AnchorWindowConfig,
        respond: oneshot::Sender<Result<()>>,
    },
    ClearAnchor {
        respond: oneshot::Sender<Result<bool>>,
    },
    UpsertPendingRecovery {
        record: PendingRecoveryRecord,
        respond: oneshot::Sender<Result<()>>,
    },
    DeletePendingRecovery {
        window_id: i64,
        respond: oneshot::Sender<Result<bool>>,
    },
    ClearPendingRecovery {
        respond: oneshot::Sender<Result<usize>>,
    },
    AppendAudit {
        record: AuditRecord,
        respond: oneshot::Sender<Result<i64>>,
    },
    /// Delete orphan windows (cascading tabs/groups) last accessed before the
    /// cutoff. Returns deleted window count.
    DeleteAgedOrphanWindows {
        cutoff_ms: i64,
        respond: oneshot::Sender<Result<usize>>,
    },
    /// Add focused wall-clock time to a tab.
    AddTabTime {
        tab_id: i64,
        delta_ms: i64,
        last_accessed: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Overwrite a tab's accumulated time (anchor force-apply, restore).
    SetTabTime {
        tab_id: i64,
        time_accumulated: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Navigation-triggered reset: zero the clock, refresh staleness.
    ResetTabTime {
        tab_id: i64,
        last_accessed: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    TouchTab {
        tab_id: i64,
        last_accessed: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    SetTabPinned {
        tab_id: i64,
        pinned: bool,
        respond: oneshot::Sender<Result<()>>,
    },
    SetWindowTitle {
        window_id: i64,
        title: String,
        respond: oneshot::Sender<Result<()>>,
    },
    SetWindowSignature {
        window_id: i64,
        signature: String,
        last_accessed: i64,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Shutdown the writer thread (flush pending writes).
    Shutdown { respond: oneshot::Sender<()> },
}

fn is_control_command(cmd: &WriteCommand) -> bool {
    matches!(cmd, WriteCommand::Shutdown { .. })
}

/// Maximum commands drained into one writer batch.
const WRITER_BATCH_CAP: usize = 64;

/// Configuration for the storage handle.
pub struct StorageConfig {
    /// Maximum pending write commands before backpressure.
    pub write_queue_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_queue_size: 1024,
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("Failed to create directory: {e}")))?;
        }
    }
    Ok(())
}

// =============================================================================
// Storage Handle
// =============================================================================

/// Async-safe storage handle.
///
/// Writes are serialized through a dedicated writer thread to avoid blocking
/// the async runtime. Reads use `spawn_blocking` with their own connection;
/// WAL mode allows them to proceed concurrently.
#[derive(Clone)]
pub struct StorageHandle {
    write_tx: mpsc::Sender<WriteCommand>,
    db_path: Arc<String>,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StorageHandle {
    /// Open/create the database at `db_path`, initialize the schema, and
    /// start the writer thread.
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_config(db_path, StorageConfig::default()).await
    }

    /// Create a storage handle with custom configuration.
    pub async fn with_config(db_path: &str, config: StorageConfig) -> Result<Self> {
        ensure_parent_dir(Path::new(db_path))?;

        let db_path_owned = db_path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path_owned)
                .map_err(|e| StorageError::Database(format!("Failed to open database: {e}")))?;
            initialize_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))??;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(config.write_queue_size);

        let writer_handle = thread::spawn(move || {
            let mut conn = conn;
            writer_loop(&mut conn, &mut write_rx);
        });

        Ok(Self {
            write_tx,
            db_path: Arc::new(db_path.to_string()),
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
        })
    }

    /// Return the database path backing this handle.
    #[must_use]
    pub fn db_path(&self) -> &str {
        self.db_path.as_str()
    }

    async fn send_write<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(build(tx))
            .await
            .map_err(|_| StorageError::Database("Writer thread not available".to_string()))?;
        rx.await
            .map_err(|_| StorageError::Database("Writer response channel closed".to_string()))?
    }

    async fn read<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(db_path.as_str()).map_err(|e| {
                StorageError::Database(format!("Failed to open read connection: {e}"))
            })?;
            query(&conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))?
    }

    // -- writes ---------------------------------------------------------

    pub async fn upsert_tab(&self, tab: TabRecord) -> Result<()> {
        self.send_write(|respond| WriteCommand::UpsertTab { tab, respond })
            .await
    }

    pub async fn upsert_window(&self, window: WindowRecord) -> Result<()> {
        self.send_write(|respond| WriteCommand::UpsertWindow { window, respond })
            .await
    }

    pub async fn upsert_group(&self, group: TabGroupRecord) -> Result<()> {
        self.send_write(|respond| WriteCommand::UpsertGroup { group, respond })
            .await
    }

    pub async fn delete_tab(&self, tab_id: i64) -> Result<bool> {
        self.send_write(|respond| WriteCommand::DeleteTab { tab_id, respond })
            .await
    }

    pub async fn delete_group(&self, group_id: i64) -> Result<bool> {
        self.send_write(|respond| WriteCommand::DeleteGroup { group_id, respond })
            .await
    }

    /// Delete a window and its tabs/groups in one transaction.
    pub async fn delete_window_cascade(&self, window_id: i64) -> Result<()> {
        self.send_write(|respond| WriteCommand::DeleteWindowCascade { window_id, respond })
            .await
    }

    /// Flag every row as orphaned. Returns total rows updated.
    pub async fn mark_all_orphaned(&self) -> Result<usize> {
        self.send_write(|respond| WriteCommand::MarkAllOrphaned { respond })
            .await
    }

    /// Create a new active session (prior active row is deactivated in the
    /// same transaction). Returns the new session ID.
    pub async fn create_session(&self, started_at: i64) -> Result<i64> {
        self.send_write(|respond| WriteCommand::CreateSession {
            started_at,
            respond,
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.send_write(|respond| WriteCommand::SetSetting {
            key,
            value,
            respond,
        })
        .await
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.send_write(|respond| WriteCommand::DeleteSetting { key, respond })
            .await
    }

    /// Replace the anchor template. At most one anchor ever exists.
    pub async fn set_anchor(&self, config: AnchorWindowConfig) -> Result<()> {
        self.send_write(|respond| WriteCommand::SetAnchor { config, respond })
            .await
    }

    pub async fn clear_anchor(&self) -> Result<bool> {
        self.send_write(|respond| WriteCommand::ClearAnchor { respond })
            .await
    }

    pub async fn upsert_pending_recovery(&self, record: PendingRecoveryRecord) -> Result<()> {
        self.send_write(|respond| WriteCommand::UpsertPendingRecovery { record, respond })
            .await
    }

    pub async fn delete_pending_recovery(&self, window_id: i64) -> Result<bool> {
        self.send_write(|respond| WriteCommand::DeletePendingRecovery { window_id, respond })
            .await
    }

    pub async fn clear_pending_recovery(&self) -> Result<usize> {
        self.send_write(|respond| WriteCommand::ClearPendingRecovery { respond })
            .await
    }

    /// Append an audit entry; returns the row ID.
    pub async fn append_audit(&self, record: AuditRecord) -> Result<i64> {
        self.send_write(|respond| WriteCommand::AppendAudit { record, respond })
            .await
    }

    /// Delete orphan windows last accessed before `cutoff_ms`, cascading to
    /// their tabs and groups. Returns deleted window count.
    pub async fn delete_aged_orphan_windows(&self, cutoff_ms: i64) -> Result<usize> {
        self.send_write(|respond| WriteCommand::DeleteAgedOrphanWindows { cutoff_ms, respond })
            .await
    }

    pub async fn add_tab_time(&self, tab_id: i64, delta_ms: i64, last_accessed: i64) -> Result<()> {
        self.send_write(|respond| WriteCommand::AddTabTime {
            tab_id,
            delta_ms,
            last_accessed,
            respond,
        })
        .await
    }

    pub async fn set_tab_time(&self, tab_id: i64, time_accumulated: i64) -> Result<()> {
        self.send_write(|respond| WriteCommand::SetTabTime {
            tab_id,
            time_accumulated,
            respond,
        })
        .await
    }

    pub async fn reset_tab_time(&self, tab_id: i64, last_accessed: i64) -> Result<()> {
        self.send_write(|respond| WriteCommand::ResetTabTime {
            tab_id,
            last_accessed,
            respond,
        })
        .await
    }

    pub async fn touch_tab(&self, tab_id: i64, last_accessed: i64) -> Result<()> {
        self.send_write(|respond| WriteCommand::TouchTab {
            tab_id,
            last_accessed,
            respond,
        })
        .await
    }

    pub async fn set_tab_pinned(&self, tab_id: i64, pinned: bool) -> Result<()> {
        self.send_write(|respond| WriteCommand::SetTabPinned {
            tab_id,
            pinned,
            respond,
        })
        .await
    }

    pub async fn set_window_title(&self, window_id: i64, title: &str) -> Result<()> {
        let title = title.to_string();
        self.send_write(|respond| WriteCommand::SetWindowTitle {
            window_id,
            title,
            respond,
        })
        .await
    }

    pub async fn set_window_signature(
        &self,
        window_id: i64,
        signature: &str,
        last_accessed: i64,
    ) -> Result<()> {
        let signature = signature.to_string();
        self.send_write(|respond| WriteCommand::SetWindowSignature {
            window_id,
            signature,
            last_accessed,
            respond,
        })
        .await
    }

    /// Shutdown the writer thread, flushing pending writes.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteCommand::Shutdown { respond: tx })
            .await
            .map_err(|_| StorageError::Database("Writer thread not available".to_string()))?;
        rx.await
            .map_err(|_| StorageError::Database("Writer response channel closed".to_string()))?;
        let handle = self.writer_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    // -- reads ----------------------------------------------------------

    pub async fn get_tab(&self, tab_id: i64) -> Result<Option<TabRecord>> {
        self.read(move |conn| query_tab(conn, tab_id)).await
    }

    pub async fn get_window(&self, window_id: i64) -> Result<Option<WindowRecord>> {
        self.read(move |conn| query_window(conn, window_id)).await
    }

    pub async fn get_group(&self, group_id: i64) -> Result<Option<TabGroupRecord>> {
        self.read(move |conn| query_group(conn, group_id)).await
    }

    /// All windows with the given orphan flag.
    pub async fn windows(&self, is_orphan: bool) -> Result<Vec<WindowRecord>> {
        self.read(move |conn| query_windows(conn, is_orphan)).await
    }

    /// All tabs with the given orphan flag.
    pub async fn tabs(&self, is_orphan: bool) -> Result<Vec<TabRecord>> {
        self.read(move |conn| query_tabs(conn, is_orphan, None)).await
    }

    /// Tabs in one window with the given orphan flag, ordered by index.
    pub async fn tabs_for_window(&self, window_id: i64, is_orphan: bool) -> Result<Vec<TabRecord>> {
        self.read(move |conn| query_tabs(conn, is_orphan, Some(window_id)))
            .await
    }

    /// All groups with the given orphan flag.
    pub async fn groups(&self, is_orphan: bool) -> Result<Vec<TabGroupRecord>> {
        self.read(move |conn| query_groups(conn, is_orphan, None))
            .await
    }

    /// Groups in one window with the given orphan flag.
    pub async fn groups_for_window(
        &self,
        window_id: i64,
        is_orphan: bool,
    ) -> Result<Vec<TabGroupRecord>> {
        self.read(move |conn| query_groups(conn, is_orphan, Some(window_id)))
            .await
    }

    pub async fn get_active_session(&self) -> Result<Option<SessionRecord>> {
        self.read(query_active_session).await
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.read(move |conn| query_setting(conn, &key)).await
    }

    /// All settings whose key starts with `prefix`, as (key, value) pairs.
    pub async fn settings_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let prefix = prefix.to_string();
        self.read(move |conn| query_settings_prefix(conn, &prefix))
            .await
    }

    pub async fn get_anchor(&self) -> Result<Option<AnchorWindowConfig>> {
        self.read(query_anchor).await
    }

    /// Pending recovery entries, oldest first.
    pub async fn pending_recovery(&self) -> Result<Vec<PendingRecoveryRecord>> {
        self.read(query_pending_recovery).await
    }

    /// Audit entries with `from <= at < to`, oldest first.
    pub async fn audit_range(&self, from: i64, to: i64) -> Result<Vec<AuditRecord>> {
        self.read(move |conn| query_audit_range(conn, from, to))
            .await
    }

    /// Count tabs with the given orphan flag (badge, status).
    pub async fn count_tabs(&self, is_orphan: bool) -> Result<usize> {
        self.read(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM tabs WHERE is_orphan = ?1",
                    [i64::from(is_orphan)],
                    |row| row.get(0),
                )
                .map_err(|e| StorageError::Database(format!("Failed to count tabs: {e}")))?;
            Ok(count as usize)
        })
        .await
    }

    /// Per-table counts of orphan rows older than `cutoff_ms` (cleanup
    /// preview): (windows, tabs, groups).
    pub async fn count_aged_orphans(&self, cutoff_ms: i64) -> Result<(usize, usize, usize)> {
        self.read(move |conn| count_aged_orphans_sync(conn, cutoff_ms))
            .await
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

fn writer_loop(conn: &mut Connection, rx: &mut mpsc::Receiver<WriteCommand>) {
    while let Some(first_cmd) = rx.blocking_recv() {
        // Drain any additional pending commands for batching
        let mut batch = Vec::with_capacity(8);
        batch.push(first_cmd);
        while batch.len() < WRITER_BATCH_CAP {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        // Multi-command batches run inside one transaction; single commands
        // rely on SQLite's per-statement auto-commit.
        let use_txn = batch.len() > 1 && !batch.iter().all(is_control_command);
        let mut txn_open = false;
        if use_txn && conn.execute_batch("BEGIN IMMEDIATE").is_ok() {
            txn_open = true;
        }

        let mut should_break = false;
        for cmd in batch {
            // Control commands must run outside a transaction
            if is_control_command(&cmd) && txn_open {
                let _ = conn.execute_batch("COMMIT");
                txn_open = false;
            }
            dispatch_write_command(conn, cmd, &mut should_break);
        }

        if txn_open {
            let _ = conn.execute_batch("COMMIT");
        }

        if should_break {
            break;
        }
    }
}

fn dispatch_write_command(conn: &mut Connection, cmd: WriteCommand, should_break: &mut bool) {
    match cmd {
        WriteCommand::UpsertTab { tab, respond } => {
            let _ = respond.send(upsert_tab_sync(conn, &tab));
        }
        WriteCommand::UpsertWindow { window, respond } => {
            let _ = respond.send(upsert_window_sync(conn, &window));
        }
        WriteCommand::UpsertGroup { group, respond } => {
            let _ = respond.send(upsert_group_sync(conn, &group));
        }
        WriteCommand::DeleteTab { tab_id, respond } => {
            let _ = respond.send(delete_row_sync(conn, "tabs", tab_id));
        }
        WriteCommand::DeleteGroup { group_id, respond } => {
            let _ = respond.send(delete_row_sync(conn, "tab_groups", group_id));
        }
        WriteCommand::DeleteWindowCascade { window_id, respond } => {
            let _ = respond.send(delete_window_cascade_sync(conn, window_id));
        }
        WriteCommand::MarkAllOrphaned { respond } => {
            let _ = respond.send(mark_all_orphaned_sync(conn));
        }
        WriteCommand::CreateSession {
            started_at,
            respond,
        } => {
            let _ = respond.send(create_session_sync(conn, started_at));
        }
        WriteCommand::SetSetting {
            key,
            value,
            respond,
        } => {
            let _ = respond.send(set_setting_sync(conn, &key, &value));
        }
        WriteCommand::DeleteSetting { key, respond } => {
            let result = conn
                .execute("DELETE FROM settings WHERE key = ?1", [&key])
                .map(|n| n > 0)
                .map_err(|e| StorageError::Database(format!("Failed to delete setting: {e}")).into());
            let _ = respond.send(result);
        }
        WriteCommand::SetAnchor { config, respond } => {
            let _ = respond.send(set_anchor_sync(conn, &config));
        }
        WriteCommand::ClearAnchor { respond } => {
            let result = conn
                .execute("DELETE FROM anchor_window", [])
                .map(|n| n > 0)
                .map_err(|e| StorageError::Database(format!("Failed to clear anchor: {e}")).into());
            let _ = respond.send(result);
        }
        WriteCommand::UpsertPendingRecovery { record, respond } => {
            let _ = respond.send(upsert_pending_recovery_sync(conn, &record));
        }
        WriteCommand::DeletePendingRecovery { window_id, respond } => {
            let result = conn
                .execute(
                    "DELETE FROM pending_recovery WHERE window_id = ?1",
                    [window_id],
                )
                .map(|n| n > 0)
                .map_err(|e| {
                    StorageError::Database(format!("Failed to delete pending entry: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::ClearPendingRecovery { respond } => {
            let result = conn
                .execute("DELETE FROM pending_recovery", [])
                .map(|n| n as usize)
                .map_err(|e| {
                    StorageError::Database(format!("Failed to clear pending entries: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::AppendAudit { record, respond } => {
            let _ = respond.send(append_audit_sync(conn, &record));
        }
        WriteCommand::DeleteAgedOrphanWindows { cutoff_ms, respond } => {
            let _ = respond.send(delete_aged_orphan_windows_sync(conn, cutoff_ms));
        }
        WriteCommand::AddTabTime {
            tab_id,
            delta_ms,
            last_accessed,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE tabs SET time_accumulated = time_accumulated + ?2, last_accessed = ?3
                     WHERE id = ?1",
                    params![tab_id, delta_ms, last_accessed],
                )
                .map(|_| ())
                .map_err(|e| StorageError::Database(format!("Failed to add tab time: {e}")).into());
            let _ = respond.send(result);
        }
        WriteCommand::SetTabTime {
            tab_id,
            time_accumulated,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE tabs SET time_accumulated = ?2 WHERE id = ?1",
                    params![tab_id, time_accumulated],
                )
                .map(|_| ())
                .map_err(|e| StorageError::Database(format!("Failed to set tab time: {e}")).into());
            let _ = respond.send(result);
        }
        WriteCommand::ResetTabTime {
            tab_id,
            last_accessed,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE tabs SET time_accumulated = 0, last_accessed = ?2 WHERE id = ?1",
                    params![tab_id, last_accessed],
                )
                .map(|_| ())
                .map_err(|e| {
                    StorageError::Database(format!("Failed to reset tab time: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::TouchTab {
            tab_id,
            last_accessed,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE tabs SET last_accessed = ?2 WHERE id = ?1",
                    params![tab_id, last_accessed],
                )
                .map(|_| ())
                .map_err(|e| StorageError::Database(format!("Failed to touch tab: {e}")).into());
            let _ = respond.send(result);
        }
        WriteCommand::SetTabPinned {
            tab_id,
            pinned,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE tabs SET pinned = ?2 WHERE id = ?1",
                    params![tab_id, i64::from(pinned)],
                )
                .map(|_| ())
                .map_err(|e| {
                    StorageError::Database(format!("Failed to set tab pinned: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::SetWindowTitle {
            window_id,
            title,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE windows SET title = ?2 WHERE id = ?1",
                    params![window_id, title],
                )
                .map(|_| ())
                .map_err(|e| {
                    StorageError::Database(format!("Failed to set window title: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::SetWindowSignature {
            window_id,
            signature,
            last_accessed,
            respond,
        } => {
            let result = conn
                .execute(
                    "UPDATE windows SET url_signature = ?2, last_accessed = ?3 WHERE id = ?1",
                    params![window_id, signature, last_accessed],
                )
                .map(|_| ())
                .map_err(|e| {
                    StorageError::Database(format!("Failed to set window signature: {e}")).into()
                });
            let _ = respond.send(result);
        }
        WriteCommand::Shutdown { respond } => {
            let _ = respond.send(());
            *should_break = true;
        }
    }
}

// =============================================================================
// Synchronous Database Operations
// =============================================================================

fn upsert_tab_sync(conn: &Connection, tab: &TabRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO tabs (id, window_id, session_id, is_orphan, title, url, favicon_url,
                           last_accessed, time_accumulated, tab_index, group_id, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             window_id = excluded.window_id,
             session_id = excluded.session_id,
             is_orphan = excluded.is_orphan,
             title = excluded.title,
             url = excluded.url,
             favicon_url = excluded.favicon_url,
             last_accessed = excluded.last_accessed,
             time_accumulated = excluded.time_accumulated,
             tab_index = excluded.tab_index,
             group_id = excluded.group_id,
             pinned = excluded.pinned",
        params![
            tab.id,
            tab.window_id,
            tab.session_id,
            i64::from(tab.is_orphan),
            tab.title,
            tab.url,
            tab.favicon_url,
            tab.last_accessed,
            tab.time_accumulated,
            tab.index,
            tab.group_id,
            i64::from(tab.pinned),
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to upsert tab: {e}")))?;
    Ok(())
}

fn upsert_window_sync(conn: &Connection, window: &WindowRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO windows (id, session_id, is_orphan, title, url_signature, created_at, last_accessed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             session_id = excluded.session_id,
             is_orphan = excluded.is_orphan,
             title = excluded.title,
             url_signature = excluded.url_signature,
             last_accessed = excluded.last_accessed",
        params![
            window.id,
            window.session_id,
            i64::from(window.is_orphan),
            window.title,
            window.url_signature,
            window.created_at,
            window.last_accessed,
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to upsert window: {e}")))?;
    Ok(())
}

fn upsert_group_sync(conn: &Connection, group: &TabGroupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO tab_groups (id, window_id, session_id, is_orphan, title, color, collapsed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             window_id = excluded.window_id,
             session_id = excluded.session_id,
             is_orphan = excluded.is_orphan,
             title = excluded.title,
             color = excluded.color,
             collapsed = excluded.collapsed",
        params![
            group.id,
            group.window_id,
            group.session_id,
            i64::from(group.is_orphan),
            group.title,
            group.color,
            i64::from(group.collapsed),
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to upsert group: {e}")))?;
    Ok(())
}

fn delete_row_sync(conn: &Connection, table: &str, id: i64) -> Result<bool> {
    let n = conn
        .execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])
        .map_err(|e| StorageError::Database(format!("Failed to delete from {table}: {e}")))?;
    Ok(n > 0)
}

/// Run `f` atomically. When the writer loop already holds a batch
/// transaction, the statements simply join it; otherwise a transaction is
/// opened around them.
fn in_txn<T>(conn: &mut Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    if !conn.is_autocommit() {
        return f(conn);
    }
    let txn = conn
        .transaction()
        .map_err(|e| StorageError::Database(format!("Failed to begin transaction: {e}")))?;
    let value = f(&txn)?;
    txn.commit()
        .map_err(|e| StorageError::Database(format!("Failed to commit transaction: {e}")))?;
    Ok(value)
}

fn delete_window_cascade_sync(conn: &mut Connection, window_id: i64) -> Result<()> {
    in_txn(conn, |c| {
        c.execute("DELETE FROM tabs WHERE window_id = ?1", [window_id])
            .map_err(|e| StorageError::Database(format!("Failed to delete window tabs: {e}")))?;
        c.execute("DELETE FROM tab_groups WHERE window_id = ?1", [window_id])
            .map_err(|e| StorageError::Database(format!("Failed to delete window groups: {e}")))?;
        c.execute("DELETE FROM windows WHERE id = ?1", [window_id])
            .map_err(|e| StorageError::Database(format!("Failed to delete window: {e}")))?;
        Ok(())
    })
}

/// Single-transaction sweep; rows inserted after commit are unaffected.
fn mark_all_orphaned_sync(conn: &mut Connection) -> Result<usize> {
    in_txn(conn, |c| {
        let mut total = 0usize;
        for table in ["tabs", "windows", "tab_groups"] {
            total += c
                .execute(
                    &format!("UPDATE {table} SET is_orphan = 1 WHERE is_orphan = 0"),
                    [],
                )
                .map_err(|e| StorageError::Database(format!("Failed to orphan {table}: {e}")))?;
        }
        Ok(total)
    })
}

fn create_session_sync(conn: &mut Connection, started_at: i64) -> Result<i64> {
    in_txn(conn, |c| {
        c.execute("UPDATE sessions SET active = 0 WHERE active = 1", [])
            .map_err(|e| StorageError::Database(format!("Failed to deactivate session: {e}")))?;
        c.execute(
            "INSERT INTO sessions (started_at, active) VALUES (?1, 1)",
            [started_at],
        )
        .map_err(|e| StorageError::Database(format!("Failed to insert session: {e}")))?;
        Ok(c.last_insert_rowid())
    })
}

fn set_setting_sync(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(|e| StorageError::Database(format!("Failed to set setting: {e}")))?;
    Ok(())
}

fn set_anchor_sync(conn: &mut Connection, config: &AnchorWindowConfig) -> Result<()> {
    let tabs_json = serde_json::to_string(&config.tabs)
        .map_err(|e| StorageError::Database(format!("Failed to serialize anchor tabs: {e}")))?;
    let groups_json = serde_json::to_string(&config.tab_groups)
        .map_err(|e| StorageError::Database(format!("Failed to serialize anchor groups: {e}")))?;
    in_txn(conn, |c| {
        // set clears the prior row first: at most one anchor ever exists
        c.execute("DELETE FROM anchor_window", [])
            .map_err(|e| StorageError::Database(format!("Failed to clear prior anchor: {e}")))?;
        c.execute(
            "INSERT INTO anchor_window (id, window_title, tabs_json, tab_groups_json, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![config.window_title, tabs_json, groups_json, now_ms()],
        )
        .map_err(|e| StorageError::Database(format!("Failed to insert anchor: {e}")))?;
        Ok(())
    })
}

fn upsert_pending_recovery_sync(conn: &Connection, record: &PendingRecoveryRecord) -> Result<()> {
    let preview_json = serde_json::to_string(&record.tab_preview)
        .map_err(|e| StorageError::Database(format!("Failed to serialize tab preview: {e}")))?;
    conn.execute(
        "INSERT INTO pending_recovery (window_id, title, confidence, tab_preview_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(window_id) DO UPDATE SET
             title = excluded.title,
             confidence = excluded.confidence,
             tab_preview_json = excluded.tab_preview_json",
        params![
            record.window_id,
            record.title,
            record.confidence,
            preview_json,
            record.created_at,
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to upsert pending entry: {e}")))?;
    Ok(())
}

fn append_audit_sync(conn: &Connection, record: &AuditRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (kind, tab_url, tab_title, detail, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.kind,
            record.tab_url,
            record.tab_title,
            record.detail,
            record.at,
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to append audit entry: {e}")))?;
    Ok(conn.last_insert_rowid())
}

fn delete_aged_orphan_windows_sync(conn: &mut Connection, cutoff_ms: i64) -> Result<usize> {
    in_txn(conn, |c| {
        c.execute(
            "DELETE FROM tabs WHERE window_id IN
                 (SELECT id FROM windows WHERE is_orphan = 1 AND last_accessed < ?1)",
            [cutoff_ms],
        )
        .map_err(|e| StorageError::Database(format!("Failed to delete aged orphan tabs: {e}")))?;
        c.execute(
            "DELETE FROM tab_groups WHERE window_id IN
                 (SELECT id FROM windows WHERE is_orphan = 1 AND last_accessed < ?1)",
            [cutoff_ms],
        )
        .map_err(|e| StorageError::Database(format!("Failed to delete aged orphan groups: {e}")))?;
        let deleted = c
            .execute(
                "DELETE FROM windows WHERE is_orphan = 1 AND last_accessed < ?1",
                [cutoff_ms],
            )
            .map_err(|e| {
                StorageError::Database(format!("Failed to delete aged orphan windows: {e}"))
            })?;
        Ok(deleted)
    })
}

// =============================================================================
// Synchronous Queries
// =============================================================================

fn tab_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TabRecord> {
    Ok(TabRecord {
        id: row.get(0)?,
        window_id: row.get(1)?,
        session_id: row.get(2)?,
        is_orphan: row.get::<_, i64>(3)? != 0,
        title: row.get(4)?,
        url: row.get(5)?,
        favicon_url: row.get(6)?,
        last_accessed: row.get(7)?,
        time_accumulated: row.get(8)?,
        index: row.get(9)?,
        group_id: row.get(10)?,
        pinned: row.get::<_, i64>(11)? != 0,
    })
}

const TAB_COLUMNS: &str = "id, window_id, session_id, is_orphan, title, url, favicon_url,
                           last_accessed, time_accumulated, tab_index, group_id, pinned";

fn query_tab(conn: &Connection, tab_id: i64) -> Result<Option<TabRecord>> {
    conn.query_row(
        &format!("SELECT {TAB_COLUMNS} FROM tabs WHERE id = ?1"),
        [tab_id],
        tab_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Failed to query tab: {e}")).into())
}

fn query_tabs(conn: &Connection, is_orphan: bool, window_id: Option<i64>) -> Result<Vec<TabRecord>> {
    let (sql, params): (String, Vec<i64>) = match window_id {
        Some(wid) => (
            format!(
                "SELECT {TAB_COLUMNS} FROM tabs
                 WHERE is_orphan = ?1 AND window_id = ?2 ORDER BY tab_index"
            ),
            vec![i64::from(is_orphan), wid],
        ),
        None => (
            format!("SELECT {TAB_COLUMNS} FROM tabs WHERE is_orphan = ?1 ORDER BY id"),
            vec![i64::from(is_orphan)],
        ),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("Failed to prepare tab query: {e}")))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), tab_from_row)
        .map_err(|e| StorageError::Database(format!("Failed to query tabs: {e}")))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StorageError::Database(format!("Failed to read tab rows: {e}")).into())
}

fn window_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WindowRecord> {
    Ok(WindowRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        is_orphan: row.get::<_, i64>(2)? != 0,
        title: row.get(3)?,
        url_signature: row.get(4)?,
        created_at: row.get(5)?,
        last_accessed: row.get(6)?,
    })
}

const WINDOW_COLUMNS: &str =
    "id, session_id, is_orphan, title, url_signature, created_at, last_accessed";

fn query_window(conn: &Connection, window_id: i64) -> Result<Option<WindowRecord>> {
    conn.query_row(
        &format!("SELECT {WINDOW_COLUMNS} FROM windows WHERE id = ?1"),
        [window_id],
        window_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Failed to query window: {e}")).into())
}

fn query_windows(conn: &Connection, is_orphan: bool) -> Result<Vec<WindowRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {WINDOW_COLUMNS} FROM windows WHERE is_orphan = ?1 ORDER BY id"
        ))
        .map_err(|e| StorageError::Database(format!("Failed to prepare window query: {e}")))?;
    let rows = stmt
        .query_map([i64::from(is_orphan)], window_from_row)
        .map_err(|e| StorageError::Database(format!("Failed to query windows: {e}")))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StorageError::Database(format!("Failed to read window rows: {e}")).into())
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TabGroupRecord> {
    Ok(TabGroupRecord {
        id: row.get(0)?,
        window_id: row.get(1)?,
        session_id: row.get(2)?,
        is_orphan: row.get::<_, i64>(3)? != 0,
        title: row.get(4)?,
        color: row.get(5)?,
        collapsed: row.get::<_, i64>(6)? != 0,
    })
}

const GROUP_COLUMNS: &str = "id, window_id, session_id, is_orphan, title, color, collapsed";

fn query_group(conn: &Connection, group_id: i64) -> Result<Option<TabGroupRecord>> {
    conn.query_row(
        &format!("SELECT {GROUP_COLUMNS} FROM tab_groups WHERE id = ?1"),
        [group_id],
        group_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Failed to query group: {e}")).into())
}

fn query_groups(
    conn: &Connection,
    is_orphan: bool,
    window_id: Option<i64>,
) -> Result<Vec<TabGroupRecord>> {
    let (sql, params): (String, Vec<i64>) = match window_id {
        Some(wid) => (
            format!(
                "SELECT {GROUP_COLUMNS} FROM tab_groups
                 WHERE is_orphan = ?1 AND window_id = ?2 ORDER BY id"
            ),
            vec![i64::from(is_orphan), wid],
        ),
        None => (
            format!("SELECT {GROUP_COLUMNS} FROM tab_groups WHERE is_orphan = ?1 ORDER BY id"),
            vec![i64::from(is_orphan)],
        ),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("Failed to prepare group query: {e}")))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), group_from_row)
        .map_err(|e| StorageError::Database(format!("Failed to query groups: {e}")))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StorageError::Database(format!("Failed to read group rows: {e}")).into())
}

fn query_active_session(conn: &Connection) -> Result<Option<SessionRecord>> {
    conn.query_row(
        "SELECT id, started_at, active FROM sessions WHERE active = 1",
        [],
        |row| {
            Ok(SessionRecord {
                id: row.get(0)?,
                started_at: row.get(1)?,
                active: row.get::<_, i64>(2)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Failed to query active session: {e}")).into())
}

fn query_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(|e| StorageError::Database(format!("Failed to query setting: {e}")).into())
}

fn query_settings_prefix(conn: &Connection, prefix: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM settings WHERE key LIKE ?1 || '%' ORDER BY key")
        .map_err(|e| StorageError::Database(format!("Failed to prepare settings query: {e}")))?;
    let rows = stmt
        .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| StorageError::Database(format!("Failed to query settings: {e}")))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StorageError::Database(format!("Failed to read settings rows: {e}")).into())
}

fn query_anchor(conn: &Connection) -> Result<Option<AnchorWindowConfig>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT window_title, tabs_json, tab_groups_json FROM anchor_window WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| StorageError::Database(format!("Failed to query anchor: {e}")))?;

    let Some((window_title, tabs_json, groups_json)) = row else {
        return Ok(None);
    };
    let tabs = serde_json::from_str(&tabs_json)
        .map_err(|e| StorageError::Database(format!("Failed to parse anchor tabs: {e}")))?;
    let tab_groups = serde_json::from_str(&groups_json)
        .map_err(|e| StorageError::Database(format!("Failed to parse anchor groups: {e}")))?;
    Ok(Some(AnchorWindowConfig {
        window_title,
        tabs,
        tab_groups,
    }))
}

fn query_pending_recovery(conn: &Connection) -> Result<Vec<PendingRecoveryRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT window_id, title, confidence, tab_preview_json, created_at
             FROM pending_recovery ORDER BY created_at, window_id",
        )
        .map_err(|e| StorageError::Database(format!("Failed to prepare pending query: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .map_err(|e| StorageError::Database(format!("Failed to query pending entries: {e}")))?;

    let mut out = Vec::new();
    for row in rows {
        let (window_id, title, confidence, preview_json, created_at) =
            row.map_err(|e| StorageError::Database(format!("Failed to read pending row: {e}")))?;
        // Parse failures degrade to an empty preview, never a crash.
        let tab_preview = serde_json::from_str(&preview_json).unwrap_or_default();
        out.push(PendingRecoveryRecord {
            window_id,
            title,
            confidence,
            tab_preview,
            created_at,
        });
    }
    Ok(out)
}

fn query_audit_range(conn: &Connection, from: i64, to: i64) -> Result<Vec<AuditRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, tab_url, tab_title, detail, at FROM audit_log
             WHERE at >= ?1 AND at < ?2 ORDER BY at, id",
        )
        .map_err(|e| StorageError::Database(format!("Failed to prepare audit query: {e}")))?;
    let rows = stmt
        .query_map(params![from, to], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                tab_url: row.get(2)?,
                tab_title: row.get(3)?,
                detail: row.get(4)?,
                at: row.get(5)?,
            })
        })
        .map_err(|e| StorageError::Database(format!("Failed to query audit log: {e}")))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StorageError::Database(format!("Failed to read audit rows: {e}")).into())
}

fn count_aged_orphans_sync(conn: &Connection, cutoff_ms: i64) -> Result<(usize, usize, usize)> {
    let windows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM windows WHERE is_orphan = 1 AND last_accessed < ?1",
            [cutoff_ms],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(format!("Failed to count aged windows: {e}")))?;
    let tabs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tabs WHERE window_id IN
                 (SELECT id FROM windows WHERE is_orphan = 1 AND last_accessed < ?1)",
            [cutoff_ms],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(format!("Failed to count aged tabs: {e}")))?;
    let groups: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tab_groups WHERE window_id IN
                 (SELECT id FROM windows WHERE is_orphan = 1 AND last_accessed < ?1)",
            [cutoff_ms],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(format!("Failed to count aged groups: {e}")))?;
    Ok((windows as usize, tabs as usize, groups as usize))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: i64, window_id: i64, url: &str) -> TabRecord {
        TabRecord {
            id,
            window_id,
            session_id: 1,
            is_orphan: false,
            title: format!("tab-{id}"),
            url: url.to_string(),
            favicon_url: None,
            last_accessed: now_ms(),
            time_accumulated: 0,
            index: 0,
            group_id: -1,
            pinned: false,
        }
    }

    fn window(id: i64) -> WindowRecord {
        WindowRecord {
            id,
            session_id: 1,
            is_orphan: false,
            title: String::new(),
            url_signature: String::new(),
            created_at: now_ms(),
            last_accessed: now_ms(),
        }
    }

    async fn open_temp() -> (tempfile::TempDir, StorageHandle) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tw.db");
        let handle = StorageHandle::new(&db_path.to_string_lossy()).await.unwrap();
        (dir, handle)
    }

    #[test]
    fn schema_initializes_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        for table in [
            "sessions",
            "windows",
            "tabs",
            "tab_groups",
            "settings",
            "anchor_window",
            "pending_recovery",
            "audit_log",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {table} should exist");
        }
    }

    #[tokio::test]
    async fn tab_roundtrip_and_updates() {
        let (_dir, handle) = open_temp().await;
        handle.upsert_window(window(5)).await.unwrap();
        handle.upsert_tab(tab(1, 5, "https://a.com")).await.unwrap();

        let stored = handle.get_tab(1).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://a.com");
        assert_eq!(stored.window_id, 5);

        handle.add_tab_time(1, 1500, 42).await.unwrap();
        let stored = handle.get_tab(1).await.unwrap().unwrap();
        assert_eq!(stored.time_accumulated, 1500);
        assert_eq!(stored.last_accessed, 42);

        handle.reset_tab_time(1, 43).await.unwrap();
        let stored = handle.get_tab(1).await.unwrap().unwrap();
        assert_eq!(stored.time_accumulated, 0);

        assert!(handle.delete_tab(1).await.unwrap());
        assert!(handle.get_tab(1).await.unwrap().is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn orphan_sweep_flags_everything_and_spares_later_inserts() {
        let (_dir, handle) = open_temp().await;
        handle.upsert_window(window(1)).await.unwrap();
        handle.upsert_tab(tab(10, 1, "https://a.com")).await.unwrap();
        handle
            .upsert_group(TabGroupRecord {
                id: 100,
                window_id: 1,
                session_id: 1,
                is_orphan: false,
                title: "g".to_string(),
                color: "blue".to_string(),
                collapsed: false,
            })
            .await
            .unwrap();

        let affected = handle.mark_all_orphaned().await.unwrap();
        assert_eq!(affected, 3);

        assert!(handle.get_window(1).await.unwrap().unwrap().is_orphan);
        assert!(handle.get_tab(10).await.unwrap().unwrap().is_orphan);
        assert!(handle.get_group(100).await.unwrap().unwrap().is_orphan);

        // A record inserted after the sweep is untouched by it.
        handle.upsert_window(window(2)).await.unwrap();
        assert!(!handle.get_window(2).await.unwrap().unwrap().is_orphan);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn session_create_deactivates_prior() {
        let (_dir, handle) = open_temp().await;
        let first = handle.create_session(100).await.unwrap();
        let second = handle.create_session(200).await.unwrap();
        assert_ne!(first, second);

        let active = handle.get_active_session().await.unwrap().unwrap();
        assert_eq!(active.id, second);
        assert_eq!(active.started_at, 200);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn anchor_singleton_replaces_prior_row() {
        let (_dir, handle) = open_temp().await;
        let first = AnchorWindowConfig {
            window_title: "Work".to_string(),
            tabs: vec![AnchorTab {
                url: "https://x.com".to_string(),
                title: "X".to_string(),
                favicon_url: None,
                index: 0,
                pinned: false,
                group_id: -1,
                time_accumulated: 60_000,
            }],
            tab_groups: vec![],
        };
        handle.set_anchor(first).await.unwrap();
        handle
            .set_anchor(AnchorWindowConfig {
                window_title: "Play".to_string(),
                tabs: vec![],
                tab_groups: vec![],
            })
            .await
            .unwrap();

        let anchor = handle.get_anchor().await.unwrap().unwrap();
        assert_eq!(anchor.window_title, "Play");
        assert!(anchor.tabs.is_empty());

        assert!(handle.clear_anchor().await.unwrap());
        assert!(handle.get_anchor().await.unwrap().is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn window_cascade_delete_removes_children() {
        let (_dir, handle) = open_temp().await;
        handle.upsert_window(window(1)).await.unwrap();
        handle.upsert_tab(tab(10, 1, "https://a.com")).await.unwrap();
        handle.upsert_tab(tab(11, 1, "https://b.com")).await.unwrap();
        handle
            .upsert_group(TabGroupRecord {
                id: 100,
                window_id: 1,
                session_id: 1,
                is_orphan: false,
                title: String::new(),
                color: "grey".to_string(),
                collapsed: false,
            })
            .await
            .unwrap();

        handle.delete_window_cascade(1).await.unwrap();
        assert!(handle.get_window(1).await.unwrap().is_none());
        assert!(handle.get_tab(10).await.unwrap().is_none());
        assert!(handle.get_tab(11).await.unwrap().is_none());
        assert!(handle.get_group(100).await.unwrap().is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn aged_orphan_gc_only_touches_old_orphans() {
        let (_dir, handle) = open_temp().await;
        let mut old = window(1);
        old.is_orphan = true;
        old.last_accessed = 1_000;
        handle.upsert_window(old).await.unwrap();
        let mut old_tab = tab(10, 1, "https://a.com");
        old_tab.is_orphan = true;
        handle.upsert_tab(old_tab).await.unwrap();

        let mut fresh = window(2);
        fresh.is_orphan = true;
        fresh.last_accessed = 5_000_000;
        handle.upsert_window(fresh).await.unwrap();

        let (w, t, _g) = handle.count_aged_orphans(2_000_000).await.unwrap();
        assert_eq!((w, t), (1, 1));

        let deleted = handle.delete_aged_orphan_windows(2_000_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(handle.get_window(1).await.unwrap().is_none());
        assert!(handle.get_tab(10).await.unwrap().is_none());
        assert!(handle.get_window(2).await.unwrap().is_some());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn settings_and_prefix_listing() {
        let (_dir, handle) = open_temp().await;
        handle.set_setting("filter:news", "{}").await.unwrap();
        handle.set_setting("filter:work", "{}").await.unwrap();
        handle.set_setting("other", "1").await.unwrap();

        let filters = handle.settings_with_prefix("filter:").await.unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].0, "filter:news");

        assert!(handle.delete_setting("filter:news").await.unwrap());
        assert!(!handle.delete_setting("filter:news").await.unwrap());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn audit_log_range_query() {
        let (_dir, handle) = open_temp().await;
        for (at, kind) in [(100, "automoved"), (200, "autoclosed"), (300, "automoved")] {
            handle
                .append_audit(AuditRecord {
                    id: 0,
                    kind: kind.to_string(),
                    tab_url: "https://a.com".to_string(),
                    tab_title: String::new(),
                    detail: None,
                    at,
                })
                .await
                .unwrap();
        }

        let entries = handle.audit_range(100, 300).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].at, 100);
        assert_eq!(entries[1].kind, "autoclosed");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pending_recovery_rows_are_independent() {
        let (_dir, handle) = open_temp().await;
        for id in [1, 2] {
            handle
                .upsert_pending_recovery(PendingRecoveryRecord {
                    window_id: id,
                    title: format!("w{id}"),
                    confidence: None,
                    tab_preview: vec!["https://a.com".to_string()],
                    created_at: id,
                })
                .await
                .unwrap();
        }

        assert!(handle.delete_pending_recovery(1).await.unwrap());
        let remaining = handle.pending_recovery().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].window_id, 2);

        assert_eq!(handle.clear_pending_recovery().await.unwrap(), 1);

        handle.shutdown().await.unwrap();
    }
}
