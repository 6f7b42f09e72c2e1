use crate::Result;
use crate::store::SqliteStore;
use chrono::{DateTime, Utc};
use strum::Display;

/// Whether a run re-collects everything or only what changed since the last success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Where the "already collected" count of a task comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingRows {
    /// Rows extracted into this tool table.
    Tool(&'static str),

    /// Raw records of the task itself, for tasks without an extractor.
    Raw,
}

/// The sync decision of one collection run, fixed when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub mode: SyncMode,
    /// Lower bound for incremental runs; `None` for full runs.
    pub since: Option<DateTime<Utc>>,
    pub existing_record_count: u64,
}

impl SyncState {
    /// Incremental only when rows were already collected, a previous run succeeded, and a full
    /// sync was not requested.
    #[must_use]
    pub fn decide(existing_record_count: u64, cursor: Option<DateTime<Utc>>, force_full: bool) -> Self {
        match cursor {
            Some(since) if existing_record_count > 0 && !force_full => Self {
                mode: SyncMode::Incremental,
                since: Some(since),
                existing_record_count,
            },
            _ => Self {
                mode: SyncMode::Full,
                since: None,
                existing_record_count,
            },
        }
    }

    /// Read the existing-row count and the saved cursor for a scope, then decide.
    pub fn resolve(store: &SqliteStore, raw_table: &str, existing: ExistingRows, params: &str, force_full: bool) -> Result<Self> {
        let existing_record_count = match existing {
            ExistingRows::Tool(table) => store.count_tool_rows(table, params)?,
            ExistingRows::Raw => store.count_raw(raw_table, params)?,
        };

        let cursor = store.latest_state(raw_table, params)?;
        Ok(Self::decide(existing_record_count, cursor, force_full))
    }

    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        matches!(self.mode, SyncMode::Incremental)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(1_704_067_200, 0)
    }

    #[test]
    fn incremental_requires_rows_cursor_and_no_override() {
        let state = SyncState::decide(12, cursor(), false);
        assert_eq!(state.mode, SyncMode::Incremental);
        assert_eq!(state.since, cursor());
        assert_eq!(state.existing_record_count, 12);
    }

    #[test]
    fn no_existing_rows_means_full() {
        let state = SyncState::decide(0, cursor(), false);
        assert_eq!(state.mode, SyncMode::Full);
        assert!(state.since.is_none());
    }

    #[test]
    fn no_cursor_means_full() {
        let state = SyncState::decide(12, None, false);
        assert_eq!(state.mode, SyncMode::Full);
    }

    #[test]
    fn forced_full_sync_wins() {
        let state = SyncState::decide(12, cursor(), true);
        assert_eq!(state.mode, SyncMode::Full);
        assert!(!state.is_incremental());
    }

    #[test]
    fn resolve_reads_tool_rows_and_cursor() {
        let store = SqliteStore::open_in_memory().unwrap();
        let decided = SyncState::resolve(&store, "raw", ExistingRows::Tool("tool"), "p", false).unwrap();
        assert_eq!(decided.mode, SyncMode::Full);

        store.upsert_tool_row("tool", "p", "1", "{}").unwrap();
        store.save_state("raw", "p", cursor().unwrap()).unwrap();

        let decided = SyncState::resolve(&store, "raw", ExistingRows::Tool("tool"), "p", false).unwrap();
        assert_eq!(decided.mode, SyncMode::Incremental);
        assert_eq!(decided.since, cursor());

        let other_scope = SyncState::resolve(&store, "raw", ExistingRows::Tool("tool"), "q", false).unwrap();
        assert_eq!(other_scope.mode, SyncMode::Full);
    }
}
