use bytes::Bytes;
use chrono::{Local, SecondsFormat};
use http::{header, HeaderMap, Method, Request, Uri};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::{convert::Infallible, net::SocketAddr};

use crate::{
    common::{
        data::{append_value, upload_error, CapturedRequest, Identifier, MultiValue, Upload},
        form::{parse_bracketed, parse_query, parse_urlencoded},
        util::{contains_ignore_ascii_case, sanitize_file_name, title_case},
    },
    server::store::{Error, RecordStore},
};

/// Limits applied while capturing a request.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Uploads larger than this are recorded as failed and not stored.
    pub max_upload_size: Option<usize>,
}

/// One fully buffered inbound request, as handed over by the routing layer.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl InboundRequest {
    pub fn from_request(req: Request<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
        }
    }
}

/// Normalizes the request and persists it, returning the record file name.
pub async fn capture<S>(
    store: &S,
    id: &Identifier,
    req: InboundRequest,
    config: &CaptureConfig,
) -> Result<String, Error>
where
    S: RecordStore + ?Sized,
{
    let (record, uploads) = normalize(id, req, config).await;
    store.put(id, record, uploads)
}

/// Turns an inbound request into a record plus the file parts that still need storing.
pub async fn normalize(
    id: &Identifier,
    req: InboundRequest,
    config: &CaptureConfig,
) -> (CapturedRequest, Vec<Upload>) {
    let mut record = CapturedRequest {
        id: id.to_string(),
        timestamp: Some(Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)),
        remote_addr: req.remote_addr.map(|addr| addr.ip().to_string()),
        method: Some(req.method.to_string()),
        path: Some(
            req.uri
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string(),
        ),
        query: parse_query(req.uri.query().unwrap_or("")),
        headers: collect_headers(&req.headers, req.body.len()),
        ..Default::default()
    };
    record.content_type = first_value(&record, header::CONTENT_TYPE.as_str());
    record.ua = first_value(&record, header::USER_AGENT.as_str());

    let mut uploads = Vec::new();
    let content_type = record.content_type.clone().unwrap_or_default();

    if contains_ignore_ascii_case(&content_type, "multipart/form-data") {
        match multer::parse_boundary(&content_type) {
            Ok(boundary) => {
                let (form, parts, intact) =
                    read_multipart(req.body.clone(), boundary, config).await;
                record.form = form;
                uploads = parts;
                if !intact {
                    record.set_raw_body(&req.body);
                }
            }
            Err(err) => {
                tracing::warn!("cannot parse multipart boundary, keeping raw body: {}", err);
                record.set_raw_body(&req.body);
            }
        }
    } else {
        record.set_raw_body(&req.body);

        if contains_ignore_ascii_case(&content_type, "application/json") {
            record.json = match serde_json::from_slice::<Value>(&req.body) {
                Ok(Value::Null) => None,
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!("body declared as JSON does not parse: {}", err);
                    None
                }
            };
        } else if contains_ignore_ascii_case(&content_type, "application/x-www-form-urlencoded") {
            record.form = parse_urlencoded(&req.body);
        }
    }

    (record, uploads)
}

/// Copies all headers into display form and synthesizes `Content-Length` when the transport
/// did not send one.
fn collect_headers(headers: &HeaderMap, body_len: usize) -> IndexMap<String, MultiValue> {
    let mut result = IndexMap::new();

    for (name, value) in headers {
        append_value(
            &mut result,
            title_case(name.as_str()),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    if body_len > 0 && !headers.contains_key(header::CONTENT_LENGTH) {
        result.insert("Content-Length".to_string(), MultiValue::Single(body_len.to_string()));
    }

    result
}

fn first_value(record: &CapturedRequest, name: &str) -> Option<String> {
    record
        .header(name)
        .and_then(|v| v.values().first().map(|s| s.to_string()))
}

async fn read_multipart(
    body: Bytes,
    boundary: String,
    config: &CaptureConfig,
) -> (Map<String, Value>, Vec<Upload>, bool) {
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    let mut uploads = Vec::new();
    let mut intact = true;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("malformed multipart body, keeping raw body: {}", err);
                intact = false;
                break;
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_default();

        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("cannot read multipart field '{}': {}", name, err);
                intact = false;
                break;
            }
        };

        match file_name {
            Some(file_name) => {
                uploads.push(to_upload(&name, &file_name, content_type, data, config))
            }
            None => fields.push((name, String::from_utf8_lossy(&data).into_owned())),
        }
    }

    if fields.is_empty() && uploads.is_empty() {
        intact = false;
    }

    (parse_bracketed(fields), uploads, intact)
}

fn to_upload(
    field_name: &str,
    file_name: &str,
    content_type: String,
    data: Bytes,
    config: &CaptureConfig,
) -> Upload {
    // `docs[]` and `docs[0]` are grouped under `docs`.
    let field = match field_name.split('[').next() {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => "file".to_string(),
    };
    let name = sanitize_file_name(file_name);

    if file_name.is_empty() && data.is_empty() {
        return Upload::Failed {
            field,
            name,
            error: upload_error::NO_FILE,
        };
    }

    if config.max_upload_size.is_some_and(|max| data.len() > max) {
        tracing::warn!(
            "upload '{}' exceeds the maximum size of {} bytes",
            name,
            config.max_upload_size.unwrap_or_default()
        );
        return Upload::Failed {
            field,
            name,
            error: upload_error::TOO_LARGE,
        };
    }

    Upload::Received {
        field,
        name,
        content_type,
        data,
    }
}
