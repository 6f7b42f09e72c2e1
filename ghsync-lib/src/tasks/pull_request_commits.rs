use super::items::PullNumber;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport, pull_requests};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, StatefulCollector, SyncState,
    WorkItems, skip_not_found,
};
use crate::store::{CollectionParams, RowQuery, SqliteStore, WriteMode, api_timestamp};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

pub const RAW_TABLE: &str = "github_api_pull_request_commits";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/pulls/{number}/commits",
    query: &[],
    shape: ResponseShape::Array,
    page_hint: PageHint::LinkHeader,
    record_key: RecordKey::ItemField("sha"),
    write_mode: WriteMode::Replace,
    accept: None,
    since_param: None,
    after_response: skip_not_found,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_pull_request_commits",
    description: "Collect the commits of every collected pull request",
    kind: SubtaskKind::Collect,
    enabled_by_default: true,
    entry_point: collect,
};

/// Every collected pull request; incremental runs keep open ones and ones updated since the cursor.
fn work_items(store: &SqliteStore, params: &CollectionParams, sync: &SyncState, batch_size: u32) -> Result<WorkItems<PullNumber>> {
    let mut sql = String::from(
        "SELECT DISTINCT json_extract(CAST(data AS TEXT), '$.number') AS number
         FROM raw_records
         WHERE raw_table = ? AND params = ? AND encoding = 'json'
           AND json_extract(CAST(data AS TEXT), '$.number') IS NOT NULL",
    );

    let mut query_params = vec![pull_requests::RAW_TABLE.to_string(), params.to_key()?];
    if let Some(since) = sync.since {
        sql.push_str(
            " AND (json_extract(CAST(data AS TEXT), '$.state') = 'open'
                   OR json_extract(CAST(data AS TEXT), '$.updated_at') >= ?)",
        );
        query_params.push(api_timestamp(since));
    }
    sql.push_str(" ORDER BY number");

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::SyncMode;
    use crate::store::{NewRawRecord, PayloadEncoding};
    use chrono::DateTime;

    fn store_pull(store: &SqliteStore, params: &str, number: u64, state: &str, updated_at: &str) {
        let payload = format!(r#"{{"id":{},"number":{number},"state":"{state}","updated_at":"{updated_at}"}}"#, number + 1000);
        let key = number.to_string();
        let record = NewRawRecord {
            raw_table: pull_requests::RAW_TABLE,
            params,
            payload: payload.as_bytes(),
            encoding: PayloadEncoding::Json,
            source_url: "u",
            input: None,
            dedup_key: &key,
        };
        let _ = store.insert_raw(&record, WriteMode::Replace).unwrap();
    }

    #[test]
    fn incremental_keeps_open_and_recently_updated_pulls() {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = CollectionParams::new(1, "o/r");
        let key = params.to_key().unwrap();

        store_pull(&store, &key, 1, "closed", "2023-06-01T00:00:00Z");
        store_pull(&store, &key, 2, "open", "2023-06-01T00:00:00Z");
        store_pull(&store, &key, 3, "closed", "2024-02-01T00:00:00Z");

        let full = SyncState::decide(0, None, false);
        let all: Vec<_> = work_items(&store, &params, &full, 10).unwrap().map(|item| item.unwrap().number).collect();
        assert_eq!(all, [1, 2, 3]);

        let incremental = SyncState::decide(3, DateTime::from_timestamp(1_704_067_200, 0), false);
        assert_eq!(incremental.mode, SyncMode::Incremental);
        let changed: Vec<_> = work_items(&store, &params, &incremental, 10)
            .unwrap()
            .map(|item| item.unwrap().number)
            .collect();
        assert_eq!(changed, [2, 3]);
    }
}
