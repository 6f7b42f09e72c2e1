use super::work_items::WorkItem;
use crate::Result;
use crate::store::CollectionParams;
use ohno::{app_err, bail};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters escaped inside one path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Placeholder filled from the collection scope rather than the work item.
const REPO_NAME: &str = "name";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A relative endpoint path with `{placeholder}` slots, such as
/// `repos/{name}/commits/{commit_sha}/statuses`.
///
/// `{name}` is the repository's `owner/repo`; every other placeholder is filled from the work
/// item and percent-encoded as a single path segment.
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    source: &'static str,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    #[expect(clippy::string_slice, reason = "indices come from find() on ASCII braces")]
    pub fn parse(source: &'static str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while !rest.is_empty() {
            let open = rest.find('{');
            let close = rest.find('}');

            match (open, close) {
                (None, None) => {
                    segments.push(Segment::Literal(rest.to_string()));
                    break;
                }
                (Some(open), Some(close)) if open < close => {
                    let (literal, tail) = rest.split_at(open);
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(literal.to_string()));
                    }

                    let name = &tail[1..close - open];
                    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
                        bail!("invalid placeholder '{{{name}}}' in URL template '{source}'");
                    }

                    segments.push(Segment::Placeholder(name.to_string()));
                    rest = &tail[close - open + 1..];
                }
                _ => bail!("unbalanced braces in URL template '{source}'"),
            }
        }

        Ok(Self { source, segments })
    }

    #[must_use]
    pub const fn source(&self) -> &'static str {
        self.source
    }

    fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Fail unless every placeholder can be filled by a `T`.
    pub fn check_fields<T: WorkItem>(&self) -> Result<()> {
        for name in self.placeholders() {
            if name != REPO_NAME && !T::FIELDS.contains(&name) {
                bail!(
                    "URL template '{}' references '{{{name}}}', which its work items do not provide",
                    self.source
                );
            }
        }

        Ok(())
    }

    /// Produce the relative path for one work item.
    pub fn render<T: WorkItem>(&self, params: &CollectionParams, item: &T) -> Result<String> {
        let mut path = String::with_capacity(self.source.len() + 32);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => path.push_str(text),
                Segment::Placeholder(name) if name == REPO_NAME => {
                    let encoded: Vec<String> = params
                        .name
                        .split('/')
                        .map(|part| utf8_percent_encode(part, PATH_SEGMENT).to_string())
                        .collect();
                    path.push_str(&encoded.join("/"));
                }
                Segment::Placeholder(name) => {
                    let value = item
                        .field(name)
                        .ok_or_else(|| app_err!("work item has no value for '{{{name}}}' in '{}'", self.source))?;
                    path.extend(utf8_percent_encode(&value, PATH_SEGMENT));
                }
            }
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::RepoScope;
    use crate::store::FromRow;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sha {
        commit_sha: String,
    }

    impl FromRow for Sha {
        fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self { commit_sha: row.get(0)? })
        }
    }

    impl WorkItem for Sha {
        const FIELDS: &'static [&'static str] = &["commit_sha"];

        fn field(&self, name: &str) -> Option<String> {
            (name == "commit_sha").then(|| self.commit_sha.clone())
        }
    }

    fn params() -> CollectionParams {
        CollectionParams::new(1, "octo/hello-world")
    }

    #[test]
    fn renders_scope_and_item_placeholders() {
        let template = UrlTemplate::parse("repos/{name}/commits/{commit_sha}/statuses").unwrap();
        template.check_fields::<Sha>().unwrap();

        let item = Sha {
            commit_sha: "abc123".into(),
        };
        assert_eq!(
            template.render(&params(), &item).unwrap(),
            "repos/octo/hello-world/commits/abc123/statuses"
        );
    }

    #[test]
    fn item_values_are_encoded_as_one_segment() {
        let template = UrlTemplate::parse("x/{commit_sha}").unwrap();
        let item = Sha {
            commit_sha: "a/b c".into(),
        };
        assert_eq!(template.render(&params(), &item).unwrap(), "x/a%2Fb%20c");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(UrlTemplate::parse("repos/{name/pulls").is_err());
        assert!(UrlTemplate::parse("repos/name}/pulls").is_err());
        assert!(UrlTemplate::parse("repos/{}/pulls").is_err());
        assert!(UrlTemplate::parse("repos/{Name}/pulls").is_err());
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        let template = UrlTemplate::parse("repos/{name}/runs/{run_id}/jobs").unwrap();
        assert!(template.check_fields::<Sha>().is_err());
        assert!(template.check_fields::<RepoScope>().is_err());

        let repo_level = UrlTemplate::parse("repos/{name}/pulls").unwrap();
        repo_level.check_fields::<RepoScope>().unwrap();
    }
}
