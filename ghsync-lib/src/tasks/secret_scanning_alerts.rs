use super::items::repo_scope;
use super::{SubtaskKind, SubtaskMeta, SubtaskReport};
use crate::Result;
use crate::collect::{
    CollectContext, CollectSpec, Endpoint, ExistingRows, PageHint, RecordKey, ResponseShape, SinceParam, StatefulCollector,
    skip_not_found,
};
use crate::extract::{ExtractSpec, ToolRow, parse_model, run_extractor};
use crate::store::{CollectionParams, RawRecord, WriteMode};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ohno::IntoAppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const RAW_TABLE: &str = "github_api_secret_scanning_alerts";
pub const TOOL_TABLE: &str = "github_secret_scanning_alerts";

pub const ENDPOINT: Endpoint = Endpoint {
    raw_table: RAW_TABLE,
    url_template: "repos/{name}/secret-scanning/alerts",
    query: &[],
    shape: ResponseShape::Array,
    page_hint: PageHint::LinkHeader,
    record_key: RecordKey::AlertUrl,
    write_mode: WriteMode::InsertOnce,
    accept: Some("application/vnd.github+json"),
    since_param: Some(SinceParam { name: "since", prefix: "" }),
    after_response: skip_not_found,
};

pub const COLLECT: SubtaskMeta = SubtaskMeta {
    name: "collect_secret_scanning_alerts",
    description: "Collect secret scanning alerts (needs a token with security_events scope)",
    kind: SubtaskKind::Collect,
    enabled_by_default: false,
    entry_point: collect,
};

pub const EXTRACT: SubtaskMeta = SubtaskMeta {
    name: "extract_secret_scanning_alerts",
    description: "Extract raw secret scanning alerts into the github_secret_scanning_alerts table",
    kind: SubtaskKind::Extract,
    enabled_by_default: false,
    entry_point: extract,
};

const EXTRACT_SPEC: ExtractSpec = ExtractSpec {
    name: EXTRACT.name,
    raw_table: RAW_TABLE,
    tool_table: TOOL_TABLE,
    convert,
};

const UNKNOWN_REPO: &str = "unknown";

/// A secret scanning alert, as stored in the tool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[expect(clippy::struct_excessive_bools, reason = "mirrors the flags GitHub reports per alert")]
pub struct SecretScanningAlert {
    pub connection_id: u64,
    pub repo_id: String,
    /// `-1` when GitHub did not report a number.
    pub alert_number: i64,
    pub secret_type: String,
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: String,
    pub resolution: String,
    /// The first detected location, as a JSON string.
    pub location: String,
    pub secret: String,
    pub url: String,
    pub html_url: String,
    pub locations_url: String,
    pub secret_type_display_name: String,
    pub validity: String,
    pub multi_repo: bool,
    pub is_base64_encoded: bool,
    pub has_more_locations: bool,
    pub publicly_leaked: bool,
    pub resolution_comment: String,
    pub push_protection_bypassed: bool,
    pub push_protection_bypassed_by: String,
    pub push_protection_bypassed_at: Option<DateTime<Utc>>,
    pub push_protection_bypass_request_reviewer: String,
    pub push_protection_bypass_request_reviewer_comment: String,
    pub push_protection_bypass_request_comment: String,
    pub push_protection_bypass_request_html_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
#[expect(clippy::struct_excessive_bools, reason = "mirrors the GitHub payload")]
struct ApiAlert {
    number: Option<i64>,
    secret_type: Option<String>,
    state: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Value>,
    resolution: Option<String>,
    first_location_detected: Option<Value>,
    secret: Option<String>,
    url: Option<String>,
    alert_url: Option<String>,
    html_url: Option<String>,
    locations_url: Option<String>,
    secret_type_display_name: Option<String>,
    validity: Option<String>,
    multi_repo: bool,
    is_base64_encoded: bool,
    has_more_locations: bool,
    publicly_leaked: bool,
    resolution_comment: Option<String>,
    push_protection_bypassed: bool,
    push_protection_bypassed_by: Option<Value>,
    push_protection_bypassed_at: Option<DateTime<Utc>>,
    push_protection_bypass_request_reviewer: Option<Value>,
    push_protection_bypass_request_reviewer_comment: Option<String>,
    push_protection_bypass_request_comment: Option<String>,
    push_protection_bypass_request_html_url: Option<String>,
}

/// The `owner/repo` part of an alert URL such as `https://api.github.com/repos/o/r/secret-scanning/alerts/4`.
fn repo_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let mut segments = url.path_segments()?.skip_while(|segment| *segment != "repos").skip(1);
    let owner = segments.next().filter(|s| !s.is_empty())?;
    let repo = segments.next().filter(|s| !s.is_empty())?;
    Some(format!("{owner}/{repo}"))
}

/// A user reference, which GitHub reports either as a login or as a user object.
fn login(value: Option<Value>) -> String {
    match value {
        Some(Value::String(login)) => login,
        Some(Value::Object(user)) => user.get("login").and_then(Value::as_str).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

fn convert(record: &RawRecord, payload: &[u8], params: &CollectionParams) -> Result<Option<ToolRow>> {
    let alert: ApiAlert = parse_model(record, payload)?;

    let repo_id = alert
        .url
        .as_deref()
        .and_then(repo_from_url)
        .or_else(|| alert.alert_url.as_deref().and_then(repo_from_url))
        .unwrap_or_else(|| UNKNOWN_REPO.to_string());

    let location = match &alert.first_location_detected {
        Some(location @ Value::Object(_)) => serde_json::to_string(location).into_app_err("serializing alert location")?,
        _ => String::new(),
    };

    let key = alert.number.map_or_else(|| record.dedup_key.clone(), |number| number.to_string());

    let row = SecretScanningAlert {
        connection_id: params.connection_id,
        repo_id,
        alert_number: alert.number.unwrap_or(-1),
        secret_type: alert.secret_type.unwrap_or_default(),
        state: alert.state.unwrap_or_default(),
        created_at: alert.created_at,
        updated_at: alert.updated_at,
        resolved_at: alert.resolved_at,
        resolved_by: login(alert.resolved_by),
        resolution: alert.resolution.unwrap_or_default(),
        location,
        secret: alert.secret.unwrap_or_default(),
        url: alert.url.unwrap_or_default(),
        html_url: alert.html_url.unwrap_or_default(),
        locations_url: alert.locations_url.unwrap_or_default(),
        secret_type_display_name: alert.secret_type_display_name.unwrap_or_default(),
        validity: alert.validity.unwrap_or_default(),
        multi_repo: alert.multi_repo,
        is_base64_encoded: alert.is_base64_encoded,
        has_more_locations: alert.has_more_locations,
        publicly_leaked: alert.publicly_leaked,
        resolution_comment: alert.resolution_comment.unwrap_or_default(),
        push_protection_bypassed: alert.push_protection_bypassed,
        push_protection_bypassed_by: login(alert.push_protection_bypassed_by),
        push_protection_bypassed_at: alert.push_protection_bypassed_at,
        push_protection_bypass_request_reviewer: login(alert.push_protection_bypass_request_reviewer),
        push_protection_bypass_request_reviewer_comment: alert.push_protection_bypass_request_reviewer_comment.unwrap_or_default(),
        push_protection_bypass_request_comment: alert.push_protection_bypass_request_comment.unwrap_or_default(),
        push_protection_bypass_request_html_url: alert.push_protection_bypass_request_html_url.unwrap_or_default(),
    };

    Ok(Some(ToolRow {
        key,
        data: serde_json::to_value(&row).into_app_err("serializing secret scanning alert")?,
    }))
}

fn collect(ctx: &CollectContext) -> BoxFuture<'_, Result<SubtaskReport>> {
    async move {
        let spec = CollectSpec {
            name: COLLECT.name,
            endpoint: ENDPOINT,
            existing_rows: ExistingRows::Tool(TOOL_TABLE),
            work_items: repo_scope,
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
