use crate::Result;
use chrono::{DateTime, Utc};
use core::fmt::{Display, Formatter};
use ohno::IntoAppError;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

/// The scope of a collection run: which connection and which repository.
///
/// Serialized as canonical JSON (`{"ConnectionId":1,"Name":"owner/repo"}`) into every row
/// the run writes, so later stages can select exactly the rows of that scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CollectionParams {
    pub connection_id: u64,
    pub name: String,
}

impl CollectionParams {
    #[must_use]
    pub fn new(connection_id: u64, name: impl Into<String>) -> Self {
        Self {
            connection_id,
            name: name.into(),
        }
    }

    /// The canonical JSON key stored alongside every row of this scope.
    pub fn to_key(&self) -> Result<String> {
        serde_json::to_string(self).into_app_err("serializing collection parameters")
    }
}

impl Display for CollectionParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.name, self.connection_id)
    }
}

/// How a raw payload is encoded at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PayloadEncoding {
    /// UTF-8 JSON text.
    Json,

    /// JSON text stored as a hexadecimal string, optionally `0x`-prefixed.
    Hex,
}

/// A raw record ready to be written.
#[derive(Debug, Clone)]
pub struct NewRawRecord<'a> {
    pub raw_table: &'a str,
    pub params: &'a str,
    pub payload: &'a [u8],
    pub encoding: PayloadEncoding,
    pub source_url: &'a str,
    pub input: Option<&'a str>,
    pub dedup_key: &'a str,
}

/// A raw record as stored.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: i64,
    pub raw_table: String,
    pub params: String,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub source_url: String,
    pub input: Option<String>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn params_key_is_canonical() {
        let params = CollectionParams::new(1, "octo/hello");
        assert_eq!(params.to_key().unwrap(), r#"{"ConnectionId":1,"Name":"octo/hello"}"#);
    }

    #[test]
    fn encoding_tags_round_trip_through_text() {
        assert_eq!(PayloadEncoding::Hex.to_string(), "hex");
        assert_eq!(PayloadEncoding::from_str("json").unwrap(), PayloadEncoding::Json);
        assert!(PayloadEncoding::from_str("base64").is_err());
    }
}
