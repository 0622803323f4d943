//! Sync orchestration: one serialized three-phase pass (sessions, sets,
//! queue) plus the triggers that schedule it.

mod engine;

pub use engine::SyncEngine;

use std::time::Duration;

/// Queue items past this many failed attempts are left in place, visible for
/// diagnostics, and never retried.
pub const MAX_RETRIES: i64 = 3;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
}

/// Published over the status channel for the UI's sync indicator; never used
/// to surface blocking errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing(Option<SyncProgress>),
    Error,
}
