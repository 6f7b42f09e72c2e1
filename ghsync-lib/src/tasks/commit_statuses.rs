use super::items::CommitSha;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport, pull_request_commits};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, StatefulCollector, SyncState,
    WorkItems, skip_missing_commit,
};
use crate::extract::{ExtractSpec, ToolRow, parse_model, run_extractor};
use crate::store::{CollectionParams, RawRecord, RowQuery, SqliteStore, WriteMode, sql_timestamp};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ohno::{IntoAppError, app_err};
use serde::{Deserialize, Serialize};

pub const RAW_TABLE: &str = "github_api_commit_statuses";
pub const TOOL_TABLE: &str = "github_commit_statuses";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/commits/{commit_sha}/statuses",
    query: &[],
    shape: ResponseShape::Array,
    page_hint: PageHint::LinkHeader,
    record_key: RecordKey::Field("id"),
    write_mode: WriteMode::Replace,
    accept: None,
    since_param: None,
    after_response: skip_missing_commit,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_commit_statuses",
    description: "Collect commit statuses for the commits of collected pull requests",
    kind: SubtaskKind::Collect,
    enabled_by_default: true,
    entry_point: collect,
};

pub const EXTRACT: SubtaskMeta = SubtaskMeta {
    name: "extract_commit_statuses",
    description: "Extract raw commit statuses into the github_commit_statuses table",
    kind: SubtaskKind::Extract,
    enabled_by_default: true,
    entry_point: extract,
};

const EXTRACT_SPEC: ExtractSpec = ExtractSpec {
    name: EXTRACT.name,
    raw_table: RAW_TABLE,
    tool_table: TOOL_TABLE,
    convert,
};

/// A commit status, as stored in the tool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub connection_id: u64,
    pub github_id: i64,
    pub repo: String,
    pub commit_sha: String,
    pub context: String,
    pub state: String,
    pub description: String,
    pub target_url: String,
    pub avatar_url: String,
    pub creator_id: i64,
    pub creator_login: String,
    pub github_created_at: Option<DateTime<Utc>>,
    pub github_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiCommitStatus {
    id: i64,
    state: String,
    description: Option<String>,
    target_url: Option<String>,
    #[serde(default)]
    context: String,
    avatar_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    creator: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    login: String,
}

/// Distinct commits of collected pull requests; incremental runs keep commits stored since the cursor.
fn work_items(store: &SqliteStore, params: &CollectionParams, sync: &SyncState, batch_size: u32) -> Result<WorkItems<CommitSha>> {
    let mut sql = String::from(
        "SELECT DISTINCT json_extract(CAST(data AS TEXT), '$.sha') AS commit_sha
         FROM raw_records
         WHERE raw_table = ? AND params = ? AND encoding = 'json'
           AND json_extract(CAST(data AS TEXT), '$.sha') IS NOT NULL",
    );

    let mut query_params = vec![pull_request_commits::RAW_TABLE.to_string(), params.to_key()?];
    if let Some(since) = sync.since {
        sql.push_str(" AND created_at >= ?");
        query_params.push(sql_timestamp(since));
    }
    sql.push_str(" ORDER BY commit_sha");

    let query = query_params.into_iter().fold(RowQuery::new(sql), RowQuery::bind);
    WorkItems::from_query(store, query, batch_size)
}

fn convert(record: &RawRecord, payload: &[u8], params: &CollectionParams) -> Result<Option<ToolRow>> {
    let status: ApiCommitStatus = parse_model(record, payload)?;

    let input = record
        .input
        .as_deref()
        .ok_or_else(|| app_err!("raw record {} has no commit input", record.id))?;
    let commit: CommitSha = serde_json::from_str(input).into_app_err_with(|| format!("parsing input of raw record {}", record.id))?;

    let (creator_id, creator_login) = status.creator.map_or((0, String::new()), |user| (user.id, user.login));
    let row = CommitStatus {
        connection_id: params.connection_id,
        github_id: status.id,
        repo: params.name.clone(),
        commit_sha: commit.commit_sha,
        context: status.context,
        state: status.state,
        description: status.description.unwrap_or_default(),
        target_url: status.target_url.unwrap_or_default(),
        avatar_url: status.avatar_url.unwrap_or_default(),
        creator_id,
        creator_login,
        github_created_at: status.created_at,
        github_updated_at: status.updated_at,
    };

    Ok(Some(ToolRow {
        key: row.github_id.to_string(),
        data: serde_json::to_value(&row).into_app_err("serializing commit status")?,
    }))
}

fn collect(ctx: &CollectContext) -> BoxFuture<'_, Result<SubtaskReport>> {
    async move {
        let spec = CollectSpec {
            name: COLLECT.name,
            endpoint: ENDPOINT,
            existing_rows: ExistingRows::Tool(TOOL_TABLE),
            work_items,
        };

        let summary = StatefulCollector::new(ctx, spec).execute().await?;
        Ok(SubtaskReport::collected(COLLECT.name, summary))
    }
    .boxed()
}

fn extract(ctx: &CollectContext) -> BoxFuture<'_, Result<SubtaskReport>> {
    async move {
        let summary = run_extractor(
            ctx.store.clone(),
            ctx.params.clone(),
            EXTRACT_SPEC,
            ctx.options.batch_size,
            ctx.cancel.clone(),
        )
        .await?;
        Ok(SubtaskReport::extracted(EXTRACT.name, summary))
    }
    .boxed()
}
