//! Work items of the GitHub sub-tasks.

use crate::Result;
use crate::collect::{RepoScope, SyncState, WorkItem, WorkItems};
use crate::store::{CollectionParams, FromRow, SqliteStore};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Work items of repository-level endpoints.
pub fn repo_scope(_store: &SqliteStore, _params: &CollectionParams, _sync: &SyncState, _batch_size: u32) -> Result<WorkItems<RepoScope>> {
    Ok(WorkItems::repo_scope())
}

/// A commit, for per-commit endpoints such as statuses and check runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSha {
    pub commit_sha: String,
}

impl FromRow for CommitSha {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            commit_sha: row.get("commit_sha")?,
        })
    }
}

impl WorkItem for CommitSha {
    const FIELDS: &'static [&'static str] = &["commit_sha"];

    fn field(&self, name: &str) -> Option<String> {
        (name == "commit_sha").then(|| self.commit_sha.clone())
    }
}

/// A workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId {
    pub id: u64,
}

impl FromRow for RunId {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { id: row.get("id")? })
    }
}

impl WorkItem for RunId {
    const FIELDS: &'static [&'static str] = &["id"];

    fn field(&self, name: &str) -> Option<String> {
        (name == "id").then(|| self.id.to_string())
    }
}

/// A pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullNumber {
    pub number: u64,
}

impl FromRow for PullNumber {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            number: row.get("number")?,
        })
    }
}

impl WorkItem for PullNumber {
    const FIELDS: &'static [&'static str] = &["number"];

    fn field(&self, name: &str) -> Option<String> {
        (name == "number").then(|| self.number.to_string())
    }
}
