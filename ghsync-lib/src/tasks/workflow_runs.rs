use super::items::repo_scope;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, SinceParam, StatefulCollector,
    skip_not_found,
};
use crate::store::WriteMode;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

pub const RAW_TABLE: &str = "github_api_runs";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/actions/runs",
    query: &[],
    shape: ResponseShape::Envelope("workflow_runs"),
    page_hint: PageHint::TotalCount("total_count"),
    record_key: RecordKey::Field("id"),
    write_mode: WriteMode::Replace,
    accept: None,
    // GitHub's search syntax: only runs created at or after the cursor.
    since_param: Some(SinceParam {
        name: "created",
        prefix: ">=",
    }),
    after_response: skip_not_found,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_runs",
    description: "Collect GitHub Actions workflow runs",
    kind: SubtaskKind::Collect,
    enabled_by_default: true,
    entry_point: collect,
};

fn collect(ctx: &CollectContext) -> BoxFuture<'_, Result<SubtaskReport>> {
    async move {
        let spec = CollectSpec {
            name: COLLECT.name,
            endpoint: ENDPOINT,
            existing_rows: ExistingRows::Raw,
            work_items: repo_scope,
        };

        let summary = StatefulCollector::new(ctx, spec).execute().await?;
        Ok(SubtaskReport::collected(COLLECT.name, summary))
    }
    .boxed()
}
