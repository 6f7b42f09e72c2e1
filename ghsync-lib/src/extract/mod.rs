//! Decoding raw records into typed tool-layer rows.
//!
//! An extractor walks every raw record of one `(raw_table, params)` scope, decodes the
//! payload according to its stored [`PayloadEncoding`], converts it into a typed model, and
//! upserts the result into `tool_rows`. The count of tool rows is what the next collection
//! run uses to decide between a full and an incremental sync.

use crate::Result;
use crate::collect::RowCursor;
use crate::store::{CollectionParams, PayloadEncoding, RawRecord, SqliteStore};
use core::fmt::{Display, Formatter};
use ohno::{EnrichableExt, IntoAppError, app_err};
use serde_json::Value;
use std::borrow::Cow;
use tokio::sync::watch;

const LOG_TARGET: &str = "   extract";

/// One row of a tool table.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRow {
    pub key: String,
    pub data: Value,
}

/// Converts one decoded payload; `None` skips the record.
pub type ConvertFn = fn(&RawRecord, &[u8], &CollectionParams) -> Result<Option<ToolRow>>;

/// An extraction sub-task.
#[derive(Debug, Clone, Copy)]
pub struct ExtractSpec {
    pub name: &'static str,
    pub raw_table: &'static str,
    pub tool_table: &'static str,
    pub convert: ConvertFn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub read: u64,
    pub written: u64,
    pub skipped: u64,
}

impl Display for ExtractSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} raw records read, {} rows written, {} skipped", self.read, self.written, self.skipped)
    }
}

/// The JSON bytes of a raw record.
pub fn decode_payload(record: &RawRecord) -> Result<Cow<'_, [u8]>> {
    match record.encoding {
        PayloadEncoding::Json => Ok(Cow::Borrowed(&record.payload)),
        PayloadEncoding::Hex => {
            let text = record.payload.trim_ascii();
            let digits = text
                .strip_prefix(b"0x")
                .or_else(|| text.strip_prefix(b"0X"))
                .unwrap_or(text);
            hex::decode(digits)
                .map(Cow::Owned)
                .into_app_err_with(|| format!("decoding hex payload of raw record {}", record.id))
        }
    }
}

/// Whether a payload is GitHub's "Not Found" error body rather than a record.
#[must_use]
pub fn is_not_found_body(payload: &[u8]) -> bool {
    serde_json::from_slice::<Value>(payload).is_ok_and(|body| {
        body.get("message").and_then(Value::as_str) == Some("Not Found") && body.get("id").is_none()
    })
}

/// Deserialize a decoded payload into a model, naming the record on failure.
pub fn parse_model<T: serde::de::DeserializeOwned>(record: &RawRecord, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).into_app_err_with(|| format!("parsing raw record {} of '{}'", record.id, record.raw_table))
}

/// Run one extractor over a scope.
///
/// Extraction is synchronous database work, so it runs on the blocking pool. Cancellation
/// is checked between records.
pub async fn run_extractor(
    store: SqliteStore,
    params: CollectionParams,
    spec: ExtractSpec,
    batch_size: u32,
    cancel: watch::Receiver<bool>,
) -> Result<ExtractSummary> {
    log::info!(target: LOG_TARGET, "Extracting {} for {params}", spec.name);

    let summary = tokio::task::spawn_blocking(move || extract_scope(&store, &params, &spec, batch_size, &cancel))
        .await
        .into_app_err("extraction task panicked")?
        .map_err(|e| e.enrich_with(|| format!("extracting {}", spec.name)))?;

    log::info!(target: LOG_TARGET, "Finished {}: {summary}", spec.name);
    Ok(summary)
}

fn extract_scope(
    store: &SqliteStore,
    params: &CollectionParams,
    spec: &ExtractSpec,
    batch_size: u32,
    cancel: &watch::Receiver<bool>,
) -> Result<ExtractSummary> {
    let params_key = params.to_key()?;
    let query = SqliteStore::raw_records_query(spec.raw_table, &params_key);
    let cursor: RowCursor<RawRecord> = RowCursor::new(store.clone(), query, batch_size)?;

    let mut summary = ExtractSummary::default();
    for record in cursor {
        if *cancel.borrow() {
            return Err(app_err!("extraction was cancelled after {} records", summary.read));
        }

        let record = record?;
        summary.read += 1;

        let payload = decode_payload(&record)?;
        if is_not_found_body(&payload) {
            summary.skipped += 1;
            continue;
        }

        let Some(row) = (spec.convert)(&record, &payload, params)? else {
            summary.skipped += 1;
            continue;
        };

        let data = serde_json::to_string(&row.data).into_app_err("serializing tool row")?;
        store.upsert_tool_row(spec.tool_table, &params_key, &row.key, &data)?;
        summary.written += 1;
    }

    Ok(summary)
}
