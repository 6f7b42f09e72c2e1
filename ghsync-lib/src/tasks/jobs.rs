use super::items::RunId;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport, workflow_runs};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, StatefulCollector, SyncState,
    WorkItems, skip_not_found,
};
use crate::store::{CollectionParams, RowQuery, SqliteStore, WriteMode, sql_timestamp};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

pub const RAW_TABLE: &str = "github_api_jobs";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/actions/runs/{id}/jobs",
    query: &[],
    shape: ResponseShape::Envelope("jobs"),
    page_hint: PageHint::TotalCount("total_count"),
    record_key: RecordKey::Field("id"),
    write_mode: WriteMode::Replace,
    accept: None,
    since_param: None,
    // runs expire and disappear from the API
    after_response: skip_not_found,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_jobs",
    description: "Collect the jobs of every collected workflow run",
    kind: SubtaskKind::Collect,
    enabled_by_default: true,
    entry_point: collect,
};

/// Every collected workflow run; incremental runs keep runs stored or refreshed since the cursor.
fn work_items(store: &SqliteStore, params: &CollectionParams, sync: &SyncState, batch_size: u32) -> Result<WorkItems<RunId>> {
    let mut sql = String::from(
        "SELECT DISTINCT CAST(json_extract(CAST(data AS TEXT), '$.id') AS INTEGER) AS id
         FROM raw_records
         WHERE raw_table = ? AND params = ? AND encoding = 'json'
           AND json_extract(CAST(data AS TEXT), '$.id') IS NOT NULL",
    );

    let mut query_params = vec![workflow_runs::RAW_TABLE.to_string(), params.to_key()?];
    if let Some(since) = sync.since {
        sql.push_str(" AND updated_at >= ?");
        query_params.push(sql_timestamp(since));
    }
    sql.push_str(" ORDER BY id");

    let query = query_params.into_iter().fold(RowQuery::new(sql), RowQuery::bind);
    WorkItems::from_query(store, query, batch_size)
}

fn collect(ctx: &CollectContext) -> BoxFuture<'_, Result<SubtaskReport>> {
    async move {
        let spec = CollectSpec {
            name: COLLECT.name,
            endpoint: ENDPOINT,
            existing_rows: ExistingRows::Raw,
            work_items,
        };

        let summary = StatefulCollector::new(ctx, spec).execute().await?;
        Ok(SubtaskReport::collected(COLLECT.name, summary))
    }
    .boxed()
}
