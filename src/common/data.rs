use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::common::util::random_hex;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("missing identifier")]
    MissingIdentifier,
}

/// Upload error codes stored in failed file entries. The values follow the numeric codes
/// that web servers traditionally report for broken uploads, so records stay comparable.
pub mod upload_error {
    /// The file exceeded the configured maximum upload size.
    pub const TOO_LARGE: u16 = 1;
    /// A file part was sent without a file name and without content.
    pub const NO_FILE: u16 = 4;
    /// The blob could not be written to storage.
    pub const CANT_WRITE: u16 = 7;
}

/// An opaque token that scopes a set of captured requests. Only `[A-Za-z0-9_-]` is allowed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Sanitizes the raw input by dropping every character that is not allowed in an
    /// identifier. Fails if nothing is left.
    pub fn new(raw: &str) -> Result<Self, Error> {
        let id: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();

        if id.is_empty() {
            return Err(Error::MissingIdentifier);
        }

        Ok(Identifier(id))
    }

    /// Creates a fresh random identifier of 16 hex characters.
    pub fn generate() -> Self {
        Identifier(random_hex(8))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identifier::new(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// A header or query parameter value. Repeated names collapse into a list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MultiValue {
    Single(String),
    Multiple(Vec<String>),
}

impl MultiValue {
    pub fn push(&mut self, value: String) {
        match self {
            MultiValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = MultiValue::Multiple(vec![first, value]);
            }
            MultiValue::Multiple(values) => values.push(value),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            MultiValue::Single(value) => vec![value.as_str()],
            MultiValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }

    pub fn joined(&self, separator: &str) -> String {
        self.values().join(separator)
    }
}

/// Inserts a value under `name`, turning an existing entry into a list.
pub(crate) fn append_value(map: &mut IndexMap<String, MultiValue>, name: String, value: String) {
    match map.get_mut(&name) {
        Some(existing) => existing.push(value),
        None => {
            map.insert(name, MultiValue::Single(value));
        }
    }
}

/// A file entry of a captured request. Successfully stored uploads reference a blob in the
/// identifier's uploads directory, failed ones carry the upload error code instead.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StoredFile {
    Saved {
        field: String,
        name: String,
        path: String,
        #[serde(rename = "type", default)]
        content_type: String,
        #[serde(default)]
        size: u64,
    },
    Failed {
        field: String,
        #[serde(default)]
        name: String,
        error: u16,
    },
}

impl StoredFile {
    pub fn field(&self) -> &str {
        match self {
            StoredFile::Saved { field, .. } | StoredFile::Failed { field, .. } => field,
        }
    }
}

/// A file part received during capture, before the store assigned it a blob name.
#[derive(Debug, Clone, PartialEq)]
pub enum Upload {
    Received {
        field: String,
        name: String,
        content_type: String,
        data: Bytes,
    },
    Failed {
        field: String,
        name: String,
        error: u16,
    },
}

/// The normalized, persisted representation of one inbound HTTP request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CapturedRequest {
    pub id: String,
    pub timestamp: Option<String>,
    pub remote_addr: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    #[serde(default, deserialize_with = "map_or_empty_seq")]
    pub query: IndexMap<String, MultiValue>,
    #[serde(default, deserialize_with = "map_or_empty_seq")]
    pub headers: IndexMap<String, MultiValue>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub raw: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub raw_base64: bool,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default, deserialize_with = "map_or_empty_seq")]
    pub form: Map<String, Value>,
    #[serde(default)]
    pub files: Vec<StoredFile>,
    pub ua: Option<String>,
}

impl CapturedRequest {
    /// Looks up a recorded header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&MultiValue> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Stores the body as text when it is valid UTF-8 and as base64 otherwise.
    pub fn set_raw_body(&mut self, body: &[u8]) {
        match std::str::from_utf8(body) {
            Ok(text) => {
                self.raw = text.to_string();
                self.raw_base64 = false;
            }
            Err(_) => {
                self.raw = BASE64.encode(body);
                self.raw_base64 = true;
            }
        }
    }

    /// Returns the verbatim body bytes.
    pub fn raw_body(&self) -> Bytes {
        if !self.raw_base64 {
            return Bytes::from(self.raw.clone());
        }

        match BASE64.decode(self.raw.as_bytes()) {
            Ok(decoded) => Bytes::from(decoded),
            Err(err) => {
                tracing::warn!("raw body of record is not valid base64, using it as text: {}", err);
                Bytes::from(self.raw.clone())
            }
        }
    }

    /// A structured JSON body, i.e. an object or an array. Scalars are treated as raw content.
    pub fn structured_json(&self) -> Option<&Value> {
        self.json.as_ref().filter(|v| v.is_object() || v.is_array())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Accepts either a map or an empty list. Empty maps are written as `[]` by some producers.
fn map_or_empty_seq<'de, D, M>(deserializer: D) -> Result<M, D::Error>
where
    D: Deserializer<'de>,
    M: Deserialize<'de> + Default,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrSeq<M> {
        Map(M),
        Seq(Vec<de::IgnoredAny>),
    }

    match MapOrSeq::<M>::deserialize(deserializer)? {
        MapOrSeq::Map(map) => Ok(map),
        MapOrSeq::Seq(seq) if seq.is_empty() => Ok(M::default()),
        MapOrSeq::Seq(_) => Err(de::Error::custom("expected a map or an empty list")),
    }
}

/// Selects which header policy a relay follows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Server-side relay: forwards the filtered recorded headers and a product user agent.
    #[default]
    Server,
    /// Emulates a client-side send: browser-controlled headers are dropped and stored files
    /// cannot be attached.
    Browser,
}

impl std::str::FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "server" => Ok(RelayMode::Server),
            "browser" => Ok(RelayMode::Browser),
            other => Err(format!("unknown relay mode: {}", other)),
        }
    }
}

/// Caller input for a relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    #[serde(rename = "url", default)]
    pub target_url: String,
    #[serde(rename = "f", default)]
    pub record: String,
    #[serde(default)]
    pub mode: RelayMode,
}

/// An echo of what was actually sent to the relay target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub url: String,
    pub method: String,
    pub content_type: Option<String>,
    pub forwarded_headers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub ok: bool,
    pub status: u16,
    pub bytes: usize,
    pub time_ms: u64,
    pub sent: SentRequest,
    pub response_preview: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayFailure {
    pub ok: bool,
    pub error: String,
}

/// The outcome of a relay as reported to the caller. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RelaySummary {
    Delivered(RelayReport),
    Failed(RelayFailure),
}

impl RelaySummary {
    pub fn failed<E: fmt::Display>(err: E) -> Self {
        RelaySummary::Failed(RelayFailure {
            ok: false,
            error: err.to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RelaySummary::Delivered(_))
    }
}
