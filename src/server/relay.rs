use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use indexmap::IndexMap;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::{
    common::{
        data::{
            CapturedRequest, Identifier, MultiValue, RelayMode, RelayReport, RelayRequest,
            RelaySummary, SentRequest, StoredFile,
        },
        form::{encode_urlencoded, flatten},
        http::RelayClient,
        util::preview,
    },
    server::{
        relay::Error::{InvalidReference, InvalidScheme, InvalidTarget, MissingTarget},
        store,
        store::RecordStore,
    },
};

/// Only this many bytes of a relay target's response are echoed back to the caller.
pub const PREVIEW_LIMIT: usize = 4000;

pub const PRODUCT_USER_AGENT: &str = concat!("hookrelay/", env!("CARGO_PKG_VERSION"));

/// Recorded headers that are never forwarded, compared in lower case.
const EXCLUDED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "accept-encoding",
    "content-encoding",
    "expect",
    "origin",
    "referer",
    "cookie",
    "cookie2",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("URL is required")]
    MissingTarget,
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
    #[error("invalid URL scheme: {0}")]
    InvalidScheme(String),
    #[error("invalid or missing record reference: {0}")]
    InvalidReference(String),
}

/// A stored upload, loaded and ready to be attached to a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFile {
    pub key: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// The body of a relayed request. Exactly one encoding is chosen per record.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    /// The content type including the boundary is set by the multipart encoder.
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<OutboundFile>,
    },
    Form(String),
    Json(Bytes),
    Raw { body: Bytes, content_type: String },
}

impl OutboundBody {
    /// The content type that has to be sent as a header. `None` for multipart bodies.
    pub fn explicit_content_type(&self) -> Option<&str> {
        match self {
            OutboundBody::Multipart { .. } => None,
            OutboundBody::Form(_) => Some("application/x-www-form-urlencoded"),
            OutboundBody::Json(_) => Some("application/json"),
            OutboundBody::Raw { content_type, .. } => Some(content_type),
        }
    }

    pub fn content_type_label(&self) -> &str {
        self.explicit_content_type().unwrap_or("multipart/form-data")
    }
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: OutboundBody,
}

/// Loads the referenced record and builds the outbound request for it.
///
/// The target is validated before the record is touched. A record that cannot be parsed is
/// relayed as an empty record, anything that fails path resolution is rejected.
pub fn load_and_build<S>(
    store: &S,
    id: &Identifier,
    request: &RelayRequest,
) -> Result<OutboundRequest, Error>
where
    S: RecordStore + ?Sized,
{
    let url = parse_target(&request.target_url)?;

    let record = match store.get(id, &request.record) {
        Ok(record) => record,
        Err(store::Error::CorruptRecord(name, err)) => {
            tracing::warn!("relaying unparsable record '{}' as empty: {}", name, err);
            CapturedRequest::default()
        }
        Err(err) => return Err(InvalidReference(err.to_string())),
    };

    Ok(build(store, id, &record, url, request.mode))
}

/// Reconstructs an outbound request from a record. The method is always `POST`.
pub fn build<S>(
    store: &S,
    id: &Identifier,
    record: &CapturedRequest,
    target: Url,
    mode: RelayMode,
) -> OutboundRequest
where
    S: RecordStore + ?Sized,
{
    let url = merge_query(target, &record.query);
    let body = select_body(store, id, record, mode);
    let headers = forward_headers(record, &body, mode);

    tracing::debug!(
        "built relay request to {} with content type {}",
        url,
        body.content_type_label()
    );

    OutboundRequest {
        url,
        method: Method::POST,
        headers,
        body,
    }
}

/// Parses and validates a caller supplied target URL.
pub fn parse_target(target: &str) -> Result<Url, Error> {
    let target = target.trim();
    if target.is_empty() {
        return Err(MissingTarget);
    }

    let url = Url::parse(target).map_err(|err| match err {
        url::ParseError::RelativeUrlWithoutBase => InvalidScheme(String::new()),
        err => InvalidTarget(format!("{}: {}", target, err)),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(InvalidScheme(other.to_string())),
    }
}

/// Appends recorded query parameters the target does not define itself. The target's own
/// query string is kept verbatim.
pub fn merge_query(mut url: Url, recorded: &IndexMap<String, MultiValue>) -> Url {
    let defined: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();

    let additions: Vec<(&str, &str)> = recorded
        .iter()
        .filter(|(key, _)| !defined.contains(key.as_str()))
        .flat_map(|(key, value)| {
            value
                .values()
                .into_iter()
                .map(move |v| (key.as_str(), v))
        })
        .collect();

    if !additions.is_empty() {
        url.query_pairs_mut().extend_pairs(additions);
    }

    url
}

/// Evaluates the encoding precedence: files, then form fields, then JSON, then the raw body.
fn select_body<S>(
    store: &S,
    id: &Identifier,
    record: &CapturedRequest,
    mode: RelayMode,
) -> OutboundBody
where
    S: RecordStore + ?Sized,
{
    if !record.files.is_empty() {
        let files = match mode {
            RelayMode::Server => attach_files(store, id, &record.files),
            RelayMode::Browser => Vec::new(),
        };

        return OutboundBody::Multipart {
            fields: flatten(&record.form),
            files,
        };
    }

    if !record.form.is_empty() {
        return OutboundBody::Form(encode_urlencoded(&flatten(&record.form)));
    }

    if let Some(Ok(body)) = record.structured_json().map(serde_json::to_vec) {
        return OutboundBody::Json(Bytes::from(body));
    }

    OutboundBody::Raw {
        body: record.raw_body(),
        content_type: record
            .content_type
            .clone()
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| "text/plain".to_string()),
    }
}

/// Loads stored uploads grouped by field. A field with several files uses indexed keys.
/// Files that cannot be resolved are skipped.
fn attach_files<S>(store: &S, id: &Identifier, files: &[StoredFile]) -> Vec<OutboundFile>
where
    S: RecordStore + ?Sized,
{
    let mut grouped: IndexMap<&str, Vec<&StoredFile>> = IndexMap::new();
    for file in files {
        grouped.entry(file.field()).or_default().push(file);
    }

    let mut result = Vec::new();
    for (field, list) in grouped {
        let indexed = list.len() > 1;

        for (idx, file) in list.into_iter().enumerate() {
            let StoredFile::Saved {
                name,
                path,
                content_type,
                ..
            } = file
            else {
                continue;
            };

            let data = match store.read_upload(id, path) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!("skipping stored file '{}': {}", path, err);
                    continue;
                }
            };

            result.push(OutboundFile {
                key: if indexed {
                    format!("{}[{}]", field, idx)
                } else {
                    field.to_string()
                },
                file_name: if name.is_empty() {
                    "file".to_string()
                } else {
                    name.clone()
                },
                content_type: content_type.clone(),
                data,
            });
        }
    }

    result
}

fn is_forwarded(name: &str, mode: RelayMode) -> bool {
    if EXCLUDED_HEADERS.contains(&name) || name == "content-type" || name == "user-agent" {
        return false;
    }

    match mode {
        RelayMode::Server => true,
        RelayMode::Browser => !name.starts_with("sec-"),
    }
}

fn forward_headers(record: &CapturedRequest, body: &OutboundBody, mode: RelayMode) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if mode == RelayMode::Server {
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(PRODUCT_USER_AGENT),
        );
    }

    for (name, value) in &record.headers {
        if !is_forwarded(&name.to_ascii_lowercase(), mode) {
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value.joined(", ")),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!("skipping header '{}' that is not valid HTTP", name),
        }
    }

    if let Some(content_type) = body.explicit_content_type() {
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                headers.insert(header::CONTENT_TYPE, value);
            }
            Err(_) => tracing::debug!("skipping invalid content type '{}'", content_type),
        }
    }

    headers
}

/// Relays a stored record and summarizes the outcome. Every failure is reported in the
/// summary, nothing is retried.
pub async fn relay<S, C>(
    store: &S,
    client: &C,
    id: &Identifier,
    request: &RelayRequest,
    preview_limit: usize,
) -> RelaySummary
where
    S: RecordStore + ?Sized,
    C: RelayClient + ?Sized,
{
    let outbound = match load_and_build(store, id, request) {
        Ok(outbound) => outbound,
        Err(err) => {
            tracing::warn!("cannot relay '{}' of '{}': {}", request.record, id, err);
            return RelaySummary::failed(err);
        }
    };

    let sent = SentRequest {
        url: outbound.url.to_string(),
        method: outbound.method.to_string(),
        content_type: Some(outbound.body.content_type_label().to_string()),
        forwarded_headers: outbound.headers.len(),
    };

    match client.send(outbound).await {
        Ok(response) => {
            tracing::info!(
                "relayed '{}' to {} with status {}",
                request.record,
                sent.url,
                response.status
            );
            RelaySummary::Delivered(RelayReport {
                ok: true,
                status: response.status,
                bytes: response.body.len(),
                time_ms: response.elapsed.as_millis() as u64,
                sent,
                response_preview: preview(&response.body, preview_limit),
            })
        }
        Err(err) => {
            tracing::warn!("relay of '{}' to {} failed: {}", request.record, sent.url, err);
            RelaySummary::failed(err)
        }
    }
}
