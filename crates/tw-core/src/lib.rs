//! tw-core: Core library for TabWarden
//!
//! Session-recovery and window-reconciliation engine for browser tab
//! management. When the browser restarts, every window/tab/group ID is
//! reassigned; this crate reconciles the persisted state against the new
//! browser state with fuzzy similarity matching, no stable foreign key
//! required.
//!
//! # Architecture
//!
//! ```text
//! Browser events → Event Registrar → Storage (SQLite)
//!                        ↓
//!                 Session Manager → Similarity Matcher
//!                        ↓
//!                 Anchor Force-Sync / Recovery Actions
//! ```
//!
//! # Modules
//!
//! - `browser`: browser abstraction and in-memory mock
//! - `storage`: SQLite storage with a dedicated writer thread
//! - `matcher`: pure similarity scoring and greedy window matching
//! - `session`: restart detection, recovery, orphan actions
//! - `anchor`: anchor-window force sync
//! - `time_tracker`: focused-time accounting
//! - `events`: lifecycle event wiring and deferred actions
//! - `dispatch`: UI request/response surface
//! - `cleanup`: aged-orphan retention sweeps
//! - `wait`: deadline-aware polling primitive
//! - `runtime`: engine assembly and lifecycle
//! - `config`: configuration management
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod anchor;
pub mod browser;
pub mod cleanup;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod matcher;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod time_tracker;
pub mod wait;

pub use error::{BrowserError, Error, Result, StorageError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
