use super::cursor::RowCursor;
use crate::Result;
use crate::store::{FromRow, RowQuery, SqliteStore};
use ohno::IntoAppError;
use rusqlite::Row;
use serde::Serialize;

/// A unit of collection work, such as one commit SHA or one workflow run.
///
/// Work items are materialized from stored rows and supply the values for the placeholders
/// of an endpoint's URL template. They are serialized into the `input` column of every raw
/// record they produce.
pub trait WorkItem: FromRow + Serialize + Send + Sync + 'static {
    /// Placeholder names this item can fill.
    const FIELDS: &'static [&'static str];

    /// The value for one placeholder.
    fn field(&self, name: &str) -> Option<String>;

    /// Identifies the item among the other items of its run.
    fn key(&self) -> String {
        Self::FIELDS
            .iter()
            .filter_map(|name| self.field(name))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// The JSON context stored with each record collected for this item.
    fn input(&self) -> Result<Option<String>> {
        if Self::FIELDS.is_empty() {
            return Ok(None);
        }

        serde_json::to_string(self).into_app_err("serializing work item").map(Some)
    }
}

/// The single work item of a repository-level endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RepoScope;

impl FromRow for RepoScope {
    fn from_row(_row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self)
    }
}

impl WorkItem for RepoScope {
    const FIELDS: &'static [&'static str] = &[];

    fn field(&self, _name: &str) -> Option<String> {
        None
    }
}

/// The sequence of work items for one collection run.
#[derive(Debug)]
pub enum WorkItems<T> {
    Query(RowCursor<T>),
    Fixed(std::vec::IntoIter<T>),
}

impl<T: WorkItem> WorkItems<T> {
    /// Items produced lazily by a query over stored rows.
    pub fn from_query(store: &SqliteStore, query: RowQuery, batch_size: u32) -> Result<Self> {
        RowCursor::new(store.clone(), query, batch_size).map(Self::Query)
    }

    #[must_use]
    pub fn fixed(items: Vec<T>) -> Self {
        Self::Fixed(items.into_iter())
    }
}

impl WorkItems<RepoScope> {
    #[must_use]
    pub fn repo_scope() -> Self {
        Self::fixed(vec![RepoScope])
    }
}

impl<T: WorkItem> Iterator for WorkItems<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Query(cursor) => cursor.next(),
            Self::Fixed(items) => items.next().map(Ok),
        }
    }
}
