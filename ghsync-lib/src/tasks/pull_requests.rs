use super::items::repo_scope;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, StatefulCollector, skip_not_found,
};
use crate::store::WriteMode;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

pub const RAW_TABLE: &str = "github_api_pull_requests";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/pulls",
    query: &[("state", "all")],
    shape: ResponseShape::Array,
    page_hint: PageHint::LinkHeader,
    record_key: RecordKey::Field("id"),
    write_mode: WriteMode::Replace,
    accept: None,
    since_param: None,
    after_response: skip_not_found,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_pull_requests",
    description: "Collect pull requests of the repository, open and closed",
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
