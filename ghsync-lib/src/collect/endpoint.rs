//! Static description of one GitHub endpoint and how its pages are read.

use super::executor::{AfterResponse, ApiPage};
use crate::Result;
use crate::store::WriteMode;
use ohno::{IntoAppError, app_err};
use reqwest::header::LINK;
use serde_json::Value;
use url::Url;

/// Where the records sit in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// The body is a JSON array of records.
    Array,

    /// The body is an object holding the records in this field.
    Envelope(&'static str),
}

/// How the first page reveals the total number of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHint {
    None,

    /// The `Link` header's `rel="last"` URL carries the last page number.
    LinkHeader,

    /// The envelope carries a total record count in this field.
    TotalCount(&'static str),
}

/// How a record's dedup key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey {
    /// A stable top-level field, such as `id` or `sha`.
    Field(&'static str),

    /// A top-level field prefixed with the work item's key, for records that several
    /// items return, such as a commit reachable from two pull requests.
    ItemField(&'static str),

    /// A synthetic secret-scanning alert URL built from the alert `number`.
    AlertUrl,
}

/// The query parameter that narrows incremental runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinceParam {
    pub name: &'static str,

    /// Prepended to the timestamp, for search-style filters such as `created=>=...`.
    pub prefix: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    /// The raw table the records are written to.
    pub raw_table: &'static str,
    pub url_template: &'static str,
    /// Fixed query parameters sent with every page.
    pub query: &'static [(&'static str, &'static str)],
    pub shape: ResponseShape,
    pub page_hint: PageHint,
    pub record_key: RecordKey,
    pub write_mode: WriteMode,
    pub accept: Option<&'static str>,
    pub since_param: Option<SinceParam>,
    pub after_response: AfterResponse,
}

/// The records of one page, plus the total page count if the page revealed it.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub records: Vec<Value>,
    pub total_pages: Option<u32>,
}

impl Endpoint {
    /// Parse one page of this endpoint.
    pub fn parse_page(&self, page: &ApiPage, page_size: u32) -> Result<ParsedPage> {
        let body: Value =
            serde_json::from_slice(&page.body).into_app_err_with(|| format!("parsing response body from '{}'", page.url))?;

        let records = match (self.shape, body) {
            (ResponseShape::Array, Value::Array(records)) => records,
            (ResponseShape::Envelope(field), Value::Object(mut envelope)) => match envelope.remove(field) {
                Some(Value::Array(records)) => records,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => return Err(app_err!("field '{field}' of the response from '{}' is not an array", page.url)),
            },
            (ResponseShape::Array, _) => return Err(app_err!("expected a JSON array from '{}'", page.url)),
            (ResponseShape::Envelope(_), _) => return Err(app_err!("expected a JSON object from '{}'", page.url)),
        };

        let total_pages = match self.page_hint {
            PageHint::None => None,
            PageHint::LinkHeader => page
                .headers
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(last_page_from_link),
            PageHint::TotalCount(field) => total_count(&page.body, field).map(|count| pages_for(count, page_size)),
        };

        Ok(ParsedPage { records, total_pages })
    }
}

fn total_count(body: &[u8], field: &str) -> Option<u64> {
    let body: Value = serde_json::from_slice(body).ok()?;
    body.get(field)?.as_u64()
}

fn pages_for(count: u64, page_size: u32) -> u32 {
    let pages = count.div_ceil(u64::from(page_size.max(1)));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// The `page` parameter of the `rel="last"` entry of a `Link` header.
#[must_use]
pub fn last_page_from_link(link: &str) -> Option<u32> {
    link.split(',').find_map(|entry| {
        let (target, rels) = entry.split_once(';')?;
        let is_last = rels.split(';').any(|attr| {
            let attr = attr.trim();
            attr == r#"rel="last""# || attr == "rel=last"
        });
        if !is_last {
            return None;
        }

        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(name, _)| name == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::executor::skip_not_found;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use reqwest::header::{HeaderMap, HeaderValue};

    const RUNS: Endpoint = Endpoint {
        raw_table: "runs",
        url_template: "repos/{name}/actions/runs",
        query: &[],
        shape: ResponseShape::Envelope("workflow_runs"),
        page_hint: PageHint::TotalCount("total_count"),
        record_key: RecordKey::Field("id"),
        write_mode: WriteMode::Replace,
        accept: None,
        since_param: None,
        after_response: skip_not_found,
    };

    fn page(body: &'static str, headers: HeaderMap) -> ApiPage {
        ApiPage {
            url: Url::parse("https://api.github.com/x").unwrap(),
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn envelope_with_total_count() {
        let parsed = RUNS
            .parse_page(&page(r#"{"total_count":250,"workflow_runs":[{"id":1},{"id":2}]}"#, HeaderMap::new()), 100)
            .unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.total_pages, Some(3));
    }

    #[test]
    fn zero_total_count_means_zero_pages() {
        let parsed = RUNS
            .parse_page(&page(r#"{"total_count":0,"workflow_runs":[]}"#, HeaderMap::new()), 100)
            .unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.total_pages, Some(0));
    }

    #[test]
    fn array_with_link_header() {
        let endpoint = Endpoint {
            shape: ResponseShape::Array,
            page_hint: PageHint::LinkHeader,
            ..RUNS
        };

        let mut headers = HeaderMap::new();
        let _ = headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/x?page=2&per_page=100>; rel="next", <https://api.github.com/x?page=7&per_page=100>; rel="last""#,
            ),
        );

        let parsed = endpoint.parse_page(&page(r#"[{"id":1}]"#, headers), 100).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.total_pages, Some(7));
    }

    #[test]
    fn wrong_shape_is_an_error() {
        assert!(RUNS.parse_page(&page("[]", HeaderMap::new()), 100).is_err());
        assert!(RUNS.parse_page(&page("not json", HeaderMap::new()), 100).is_err());
    }

    #[test]
    fn link_without_last() {
        assert_eq!(last_page_from_link(r#"<https://api.github.com/x?page=2>; rel="next""#), None);
        assert_eq!(last_page_from_link(""), None);
    }
}
