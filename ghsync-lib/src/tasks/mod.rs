//! The GitHub sub-tasks.
//!
//! Each sub-task either collects one endpoint into a raw table or extracts a raw table into
//! a tool table. [`TaskTable::github`] lists them in dependency order: later collectors read
//! their work items from the raw records written by earlier ones, so running the table top
//! to bottom lets one invocation fill the whole store.

use crate::Result;
use crate::collect::{CollectContext, CollectSummary};
use crate::extract::ExtractSummary;
use core::fmt::{Display, Formatter};
use futures_util::future::BoxFuture;
use ohno::bail;
use strum::Display as StrumDisplay;

mod check_runs;
mod commit_statuses;
mod items;
mod jobs;
mod pull_request_commits;
mod pull_requests;
mod secret_scanning_alerts;
mod workflow_runs;

pub use check_runs::CheckRun;
pub use commit_statuses::CommitStatus;
pub use items::{CommitSha, PullNumber, RunId};
pub use secret_scanning_alerts::SecretScanningAlert;

/// Raw and tool table names.
pub mod tables {
    pub use super::check_runs::{RAW_TABLE as RAW_CHECK_RUNS, TOOL_TABLE as CHECK_RUNS};
    pub use super::commit_statuses::{RAW_TABLE as RAW_COMMIT_STATUSES, TOOL_TABLE as COMMIT_STATUSES};
    pub use super::jobs::RAW_TABLE as RAW_JOBS;
    pub use super::pull_request_commits::RAW_TABLE as RAW_PULL_REQUEST_COMMITS;
    pub use super::pull_requests::RAW_TABLE as RAW_PULL_REQUESTS;
    pub use super::secret_scanning_alerts::{RAW_TABLE as RAW_SECRET_SCANNING_ALERTS, TOOL_TABLE as SECRET_SCANNING_ALERTS};
    pub use super::workflow_runs::RAW_TABLE as RAW_WORKFLOW_RUNS;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum SubtaskKind {
    Collect,
    Extract,
}

/// What a sub-task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskOutcome {
    Collected(CollectSummary),
    Extracted(ExtractSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtaskReport {
    pub name: &'static str,
    pub outcome: SubtaskOutcome,
}

impl SubtaskReport {
    #[must_use]
    pub const fn collected(name: &'static str, summary: CollectSummary) -> Self {
        Self {
            name,
            outcome: SubtaskOutcome::Collected(summary),
        }
    }

    #[must_use]
    pub const fn extracted(name: &'static str, summary: ExtractSummary) -> Self {
        Self {
            name,
            outcome: SubtaskOutcome::Extracted(summary),
        }
    }
}

impl Display for SubtaskReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match &self.outcome {
            SubtaskOutcome::Collected(summary) => write!(f, "{}: {summary}", self.name),
            SubtaskOutcome::Extracted(summary) => write!(f, "{}: {summary}", self.name),
        }
    }
}

pub type EntryPoint = for<'a> fn(&'a CollectContext) -> BoxFuture<'a, Result<SubtaskReport>>;

/// Static description of one sub-task.
#[derive(Debug, Clone, Copy)]
pub struct SubtaskMeta {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: SubtaskKind,
    pub enabled_by_default: bool,
    pub entry_point: EntryPoint,
}

/// The ordered list of sub-tasks.
#[derive(Debug, Clone)]
pub struct TaskTable {
    subtasks: Vec<SubtaskMeta>,
}

impl TaskTable {
    #[must_use]
    pub fn github() -> Self {
        Self {
            subtasks: vec![
                pull_requests::COLLECT,
                pull_request_commits::COLLECT,
                workflow_runs::COLLECT,
                jobs::COLLECT,
                commit_statuses::COLLECT,
                commit_statuses::EXTRACT,
                check_runs::COLLECT,
                check_runs::EXTRACT,
                secret_scanning_alerts::COLLECT,
                secret_scanning_alerts::EXTRACT,
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubtaskMeta> {
        self.subtasks.iter()
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&SubtaskMeta> {
        self.subtasks.iter().find(|meta| meta.name == name)
    }

    /// The sub-tasks to run, in table order.
    ///
    /// With no names, every sub-task enabled by default (optionally limited to one kind).
    /// Otherwise exactly the named sub-tasks; unknown names are an error.
    pub fn select(&self, names: &[String], kind: Option<SubtaskKind>) -> Result<Vec<&SubtaskMeta>> {
        for name in names {
            if self.find(name).is_none() {
                let known: Vec<_> = self.subtasks.iter().map(|meta| meta.name).collect();
                bail!("unknown task '{name}', expected one of: {}", known.join(", "));
            }
        }

        Ok(self
            .subtasks
            .iter()
            .filter(|meta| kind.is_none_or(|kind| meta.kind == kind))
            .filter(|meta| {
                if names.is_empty() {
                    meta.enabled_by_default
                } else {
                    names.iter().any(|name| name == meta.name)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_in_dependency_order() {
        let table = TaskTable::github();
        let names: Vec<_> = table.iter().map(|meta| meta.name).collect();
        assert_eq!(
            names,
            [
                "collect_pull_requests",
                "collect_pull_request_commits",
                "collect_runs",
                "collect_jobs",
                "collect_commit_statuses",
                "extract_commit_statuses",
                "collect_check_runs",
                "extract_check_runs",
                "collect_secret_scanning_alerts",
                "extract_secret_scanning_alerts",
            ]
        );
    }

    #[test]
    fn default_selection_skips_disabled_tasks() {
        let table = TaskTable::github();
        let selected = table.select(&[], None).unwrap();
        assert_eq!(selected.len(), 8);
        assert!(selected.iter().all(|meta| !meta.name.contains("secret")));

        let extractors = table.select(&[], Some(SubtaskKind::Extract)).unwrap();
        assert_eq!(extractors.len(), 2);
    }

    #[test]
    fn named_selection_keeps_table_order() {
        let table = TaskTable::github();
        let names = vec!["extract_secret_scanning_alerts".to_string(), "collect_runs".to_string()];
        let selected = table.select(&names, None).unwrap();

        assert_eq!(selected[0].name, "collect_runs");
        assert_eq!(selected[1].name, "extract_secret_scanning_alerts");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let table = TaskTable::github();
        let err = table.select(&["collect_everything".to_string()], None).unwrap_err();
        assert!(format!("{err}").contains("collect_everything"));
    }
}
