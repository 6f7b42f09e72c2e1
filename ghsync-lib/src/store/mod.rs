//! Durable storage for collected data.
//!
//! Three tables live in one embedded SQLite database:
//!
//! - `raw_records` holds every payload exactly as the API returned it, scoped by raw table
//!   name and [`CollectionParams`], and unique on `(raw_table, params, dedup_key)`.
//! - `tool_rows` holds the typed rows produced by extraction. Their count drives the
//!   full-vs-incremental decision of the next collection run.
//! - `collector_state` holds the start time of the latest successful run per scope.
//!
//! Writes report duplicate keys through the typed [`StoreError::ConstraintViolation`] so callers
//! can treat "already stored" as success without inspecting error text.

mod error;
mod raw_record;
mod sqlite;

pub use error::StoreError;
pub use raw_record::{CollectionParams, NewRawRecord, PayloadEncoding, RawRecord};
pub use sqlite::{FromRow, RowQuery, SqliteStore, api_timestamp, sql_timestamp};

/// How a raw record write treats an existing row with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the stored payload.
    Replace,

    /// Keep the first payload; a second write reports [`StoreError::ConstraintViolation`].
    InsertOnce,
}

/// Result of a successful raw record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
}
