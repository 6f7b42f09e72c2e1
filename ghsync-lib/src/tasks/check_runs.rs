use super::items::CommitSha;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport, pull_request_commits, pull_requests};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, StatefulCollector, SyncState,
    WorkItems, skip_missing_commit,
};
use crate::extract::{ExtractSpec, ToolRow, parse_model, run_extractor};
use crate::store::{CollectionParams, RawRecord, RowQuery, SqliteStore, WriteMode, api_timestamp};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ohno::IntoAppError;
use serde::{Deserialize, Serialize};

pub const RAW_TABLE: &str = "github_api_check_runs";
pub const TOOL_TABLE: &str = "github_check_runs";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/commits/{commit_sha}/check-runs",
    query: &[],
    shape: ResponseShape::Envelope("check_runs"),
    page_hint: PageHint::TotalCount("total_count"),
    record_key: RecordKey::Field("id"),
    write_mode: WriteMode::Replace,
    accept: None,
    since_param: None,
    after_response: skip_missing_commit,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_check_runs",
    description: "Collect check runs for the commits of open or recently updated pull requests",
    kind: SubtaskKind::Collect,
    enabled_by_default: true,
    entry_point: collect,
};

pub const EXTRACT: SubtaskMeta = SubtaskMeta {
    name: "extract_check_runs",
    description: "Extract raw check runs into the github_check_runs table",
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

/// A check run, as stored in the tool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub connection_id: u64,
    pub github_id: i64,
    pub repo: String,
    pub head_sha: String,
    pub external_id: String,
    pub name: String,
    pub status: String,
    pub conclusion: String,
    pub details_url: String,
    pub html_url: String,
    pub check_suite_id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub app_slug: String,
    pub github_started_at: Option<DateTime<Utc>>,
    pub github_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    id: i64,
    #[serde(default)]
    head_sha: String,
    external_id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    conclusion: Option<String>,
    details_url: Option<String>,
    html_url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    check_suite: Option<ApiId>,
    app: Option<ApiApp>,
}

#[derive(Debug, Deserialize)]
struct ApiId {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiApp {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
}

/// Commits of open pull requests; incremental runs also keep pull requests updated since the cursor.
fn work_items(store: &SqliteStore, params: &CollectionParams, sync: &SyncState, batch_size: u32) -> Result<WorkItems<CommitSha>> {
    let mut sql = String::from(
        "SELECT DISTINCT json_extract(CAST(c.data AS TEXT), '$.sha') AS commit_sha
         FROM raw_records c
         JOIN raw_records p
           ON p.raw_table = ? AND p.params = c.params AND p.encoding = 'json'
          AND json_extract(CAST(p.data AS TEXT), '$.number') = json_extract(c.input, '$.number')
         WHERE c.raw_table = ? AND c.params = ? AND c.encoding = 'json'
           AND json_extract(CAST(c.data AS TEXT), '$.sha') IS NOT NULL",
    );

    let mut query_params = vec![
        pull_requests::RAW_TABLE.to_string(),
        pull_request_commits::RAW_TABLE.to_string(),
        params.to_key()?,
    ];

    if let Some(since) = sync.since {
        sql.push_str(
            " AND (json_extract(CAST(p.data AS TEXT), '$.state') = 'open'
                   OR json_extract(CAST(p.data AS TEXT), '$.updated_at') > ?)",
        );
        query_params.push(api_timestamp(since));
    } else {
        sql.push_str(" AND json_extract(CAST(p.data AS TEXT), '$.state') = 'open'");
    }
    sql.push_str(" ORDER BY commit_sha");

    let query = query_params.into_iter().fold(RowQuery::new(sql), RowQuery::bind);
    WorkItems::from_query(store, query, batch_size)
}

fn convert(record: &RawRecord, payload: &[u8], params: &CollectionParams) -> Result<Option<ToolRow>> {
    let run: ApiCheckRun = parse_model(record, payload)?;
    let app = run.app.unwrap_or(ApiApp {
        id: 0,
        name: String::new(),
        slug: String::new(),
    });

    let row = CheckRun {
        connection_id: params.connection_id,
        github_id: run.id,
        repo: params.name.clone(),
        head_sha: run.head_sha,
        external_id: run.external_id.unwrap_or_default(),
        name: run.name,
        status: run.status,
        conclusion: run.conclusion.unwrap_or_default(),
        details_url: run.details_url.unwrap_or_default(),
        html_url: run.html_url.unwrap_or_default(),
        check_suite_id: run.check_suite.map_or(0, |suite| suite.id),
        app_id: app.id,
        app_name: app.name,
        app_slug: app.slug,
        github_started_at: run.started_at,
        github_completed_at: run.completed_at,
    };

    Ok(Some(ToolRow {
        key: row.github_id.to_string(),
        data: serde_json::to_value(&row).into_app_err("serializing check run")?,
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
