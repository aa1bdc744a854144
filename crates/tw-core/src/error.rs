//! Error types for tabwarden.

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage layer failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Browser interface failure.
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    /// Configuration load/parse failure.
    #[error("config error: {0}")]
    Config(String),

    /// Orchestration failure outside storage/browser.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the SQLite storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Generic database error with context.
    #[error("database error: {0}")]
    Database(String),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

/// Errors raised by the browser interface.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    /// Window does not exist (closed or never created).
    #[error("window {0} not found")]
    WindowNotFound(i64),

    /// Tab does not exist.
    #[error("tab {0} not found")]
    TabNotFound(i64),

    /// Tab group does not exist.
    #[error("tab group {0} not found")]
    GroupNotFound(i64),

    /// Underlying browser call failed.
    #[error("browser call failed: {0}")]
    Call(String),
}
