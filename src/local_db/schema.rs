//! Database Schema Definitions
//!
//! Schema version bookkeeping and row-level encodings shared by the buffer.

use crate::shared::BufferError;
use chrono::{DateTime, SecondsFormat, Utc};

/// Table definitions, applied idempotently on every open
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Schema migration versions
pub const MIGRATION_VERSIONS: &[i64] = &[1];

/// Check if database needs migration
pub fn needs_migration(current_version: i64) -> bool {
    current_version < CURRENT_SCHEMA_VERSION
}

/// Get pending migrations
pub fn pending_migrations(current_version: i64) -> Vec<i64> {
    MIGRATION_VERSIONS
        .iter()
        .filter(|&&v| v > current_version)
        .copied()
        .collect()
}

/// Encode a timestamp for storage.
///
/// Fixed width so that text comparison in SQL orders chronologically.
pub fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn decode_time(text: &str) -> Result<DateTime<Utc>, BufferError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BufferError::corrupt(format!("bad timestamp {:?}: {}", text, e)))
}
