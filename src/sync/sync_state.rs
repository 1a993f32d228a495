//! # Sync State
//!
//! What the background service knows about the last cycles, and the
//! snapshot it hands out through `SyncService::status`.

use crate::tenant::TenantId;
use chrono::{DateTime, Utc};

/// Mutable state owned by the background service
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Cycles in a row that left writes deferred or failed outright
    pub consecutive_failures: u32,
    /// The last pass dead-lettered writes nobody has looked at yet
    pub incomplete: bool,
}

/// Point-in-time sync status for the active tenant
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    pub tenant: Option<TenantId>,
    pub syncing: bool,
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending: u64,
    pub dead_letters: u64,
    pub incomplete: bool,
}

impl SyncStatus {
    /// Nothing is waiting and nothing failed
    pub fn is_settled(&self) -> bool {
        !self.syncing && self.pending == 0 && self.dead_letters == 0
    }
}
