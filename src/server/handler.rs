use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use hyper::{body::Bytes, Method, Request, Response};
use path_tree::{Path, PathTree};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    common::{
        data,
        data::{Identifier, RelayRequest, RelaySummary},
        http::RelayClient,
        util::contains_ignore_ascii_case,
    },
    server::{
        capture,
        capture::{CaptureConfig, InboundRequest},
        handler::Error::{
            RequestBodyDeserializeError, ResponseBodyConversionError, ResponseBodySerializeError,
        },
        relay, store,
        store::RecordStore,
        RequestMetadata,
    },
};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    DataError(#[from] data::Error),
    #[error(transparent)]
    StoreError(#[from] store::Error),
    #[error("cannot deserialize request body: {0}")]
    RequestBodyDeserializeError(String),
    #[error("cannot serialize response body: {0}")]
    ResponseBodySerializeError(serde_json::Error),
    #[error("cannot convert response body: {0}")]
    ResponseBodyConversionError(http::Error),
    #[error("route not found: {0} {1}")]
    RouteNotFound(Method, String),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::DataError(data::Error::MissingIdentifier) => StatusCode::BAD_REQUEST,
            Error::StoreError(err) => match err {
                store::Error::PathEscape(_) => StatusCode::BAD_REQUEST,
                store::Error::NotFound(_) => StatusCode::NOT_FOUND,
                store::Error::CorruptRecord(_, _) => StatusCode::UNPROCESSABLE_ENTITY,
                store::Error::StorageWriteFailed(_) | store::Error::ReadFailed(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Error::RequestBodyDeserializeError(_) => StatusCode::BAD_REQUEST,
            Error::RouteNotFound(_, _) => StatusCode::NOT_FOUND,
            Error::ResponseBodySerializeError(_) | Error::ResponseBodyConversionError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

enum RoutePath {
    Ping,
    NewIdentifier,
    Hook,
    RecordCollection,
    SingleRecord,
    SingleUpload,
    Relay,
}

#[async_trait]
pub trait Handler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error>;
}

pub struct HandlerConfig {
    pub capture: CaptureConfig,
    pub preview_limit: usize,
}

/// Routes requests to capture, listing, retrieval and relay.
pub struct HookHandler<S>
where
    S: RecordStore + Send + Sync + 'static,
{
    path_tree: PathTree<RoutePath>,
    store: Arc<S>,
    http_client: Arc<dyn RelayClient + Send + Sync + 'static>,
    config: HandlerConfig,
}

#[async_trait]
impl<S> Handler for HookHandler<S>
where
    S: RecordStore + Send + Sync + 'static,
{
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        tracing::trace!("Routing incoming request: {} {}", req.method(), req.uri());

        match self.route(req).await {
            Ok(response) => Ok(response),
            Err(err @ (ResponseBodySerializeError(_) | ResponseBodyConversionError(_))) => Err(err),
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    tracing::error!("request failed: {}", err);
                } else {
                    tracing::debug!("request rejected with {}: {}", status, err);
                }
                response(status, &json!({"ok": false, "error": err.to_string()}))
            }
        }
    }
}

impl<S> HookHandler<S>
where
    S: RecordStore + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        http_client: Arc<dyn RelayClient + Send + Sync + 'static>,
        config: HandlerConfig,
    ) -> Self {
        let mut path_tree: PathTree<RoutePath> = PathTree::new();
        #[allow(unused_must_use)]
        {
            path_tree.insert("/__hookrelay__/ping", RoutePath::Ping);
            path_tree.insert("/new", RoutePath::NewIdentifier);
            path_tree.insert("/hook", RoutePath::Hook);
            path_tree.insert("/hook/:id", RoutePath::Hook);
            path_tree.insert("/view/:id", RoutePath::RecordCollection);
            path_tree.insert("/view/:id/records/:file", RoutePath::SingleRecord);
            path_tree.insert("/view/:id/uploads/:file", RoutePath::SingleUpload);
            path_tree.insert("/view/:id/relay", RoutePath::Relay);
        }

        Self {
            path_tree,
            store,
            http_client,
            config,
        }
    }

    async fn route(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if let Some((route, params)) = self.path_tree.find(&path) {
            match (route, &method) {
                (RoutePath::Ping, &Method::GET) => return response(StatusCode::OK, &json!({"ok": true})),
                (RoutePath::NewIdentifier, &Method::GET) => return self.handle_new_identifier(),
                (RoutePath::Hook, _) => {
                    let id = param("id", &params).or_else(|| query_param("id", &req));
                    return self.handle_capture(id.unwrap_or_default(), req).await;
                }
                (RoutePath::RecordCollection, &Method::GET) => {
                    return self.handle_list(&identifier(&params)?)
                }
                (RoutePath::SingleRecord, &Method::GET) => {
                    let file = param("file", &params).unwrap_or_default();
                    return self.handle_read_record(&identifier(&params)?, &file);
                }
                (RoutePath::SingleUpload, &Method::GET) => {
                    let file = param("file", &params).unwrap_or_default();
                    return self.handle_read_upload(&identifier(&params)?, &file);
                }
                (RoutePath::Relay, &Method::POST) => {
                    return self.handle_relay(&identifier(&params)?, req).await
                }
                _ => {}
            }
        }

        Err(Error::RouteNotFound(method, path))
    }

    fn handle_new_identifier(&self) -> Result<Response<Bytes>, Error> {
        let id = Identifier::generate();
        tracing::debug!("issued identifier '{}'", id);
        response(
            StatusCode::OK,
            &json!({
                "id": id,
                "hook": format!("/hook/{}", id),
                "view": format!("/view/{}", id),
            }),
        )
    }

    async fn handle_capture(&self, raw_id: String, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let id = Identifier::new(&raw_id)?;
        let remote_addr = req
            .extensions()
            .get::<RequestMetadata>()
            .map(|meta| meta.remote_addr);

        let inbound = InboundRequest::from_request(req, remote_addr);
        let record = capture::capture(self.store.as_ref(), &id, inbound, &self.config.capture).await?;

        response(
            StatusCode::OK,
            &json!({"ok": true, "id": id, "record": record}),
        )
    }

    fn handle_list(&self, id: &Identifier) -> Result<Response<Bytes>, Error> {
        let records = self.store.list(id)?;
        response(StatusCode::OK, &json!({"id": id, "records": records}))
    }

    fn handle_read_record(&self, id: &Identifier, file: &str) -> Result<Response<Bytes>, Error> {
        let record = self.store.get(id, file)?;
        response(StatusCode::OK, &record)
    }

    fn handle_read_upload(&self, id: &Identifier, file: &str) -> Result<Response<Bytes>, Error> {
        let content = self.store.read_upload(id, file)?;
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CACHE_CONTROL, "no-store")
            .body(content)
            .map_err(ResponseBodyConversionError)
    }

    async fn handle_relay(&self, id: &Identifier, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let summary = match parse_relay_request(&req) {
            Ok(relay_request) => {
                relay::relay(
                    self.store.as_ref(),
                    self.http_client.as_ref(),
                    id,
                    &relay_request,
                    self.config.preview_limit,
                )
                .await
            }
            Err(err) => {
                tracing::debug!("rejected relay request for '{}': {}", id, err);
                RelaySummary::failed(err)
            }
        };

        response(StatusCode::OK, &summary)
    }
}

/// Accepts a JSON body or the form fields `url`, `f` and `mode`.
fn parse_relay_request(req: &Request<Bytes>) -> Result<RelayRequest, Error> {
    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| contains_ignore_ascii_case(ct, "application/json"));

    if is_json {
        return serde_json::from_slice(req.body())
            .map_err(|e| RequestBodyDeserializeError(e.to_string()));
    }

    let mut request = RelayRequest {
        target_url: String::new(),
        record: String::new(),
        mode: Default::default(),
    };

    for (key, value) in form_urlencoded::parse(req.body()) {
        match key.as_ref() {
            "url" => request.target_url = value.into_owned(),
            "f" => request.record = value.into_owned(),
            "mode" => request.mode = value.parse().map_err(RequestBodyDeserializeError)?,
            _ => {}
        }
    }

    Ok(request)
}

fn identifier(params: &Path) -> Result<Identifier, Error> {
    Ok(Identifier::new(&param("id", params).unwrap_or_default())?)
}

fn param(name: &str, tree_path: &Path) -> Option<String> {
    tree_path
        .params()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| percent_decode(v))
}

fn query_param(name: &str, req: &Request<Bytes>) -> Option<String> {
    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn percent_decode(value: &str) -> String {
    form_urlencoded::parse(format!("v={}", value.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

fn response<T>(status: StatusCode, body: &T) -> Result<Response<Bytes>, Error>
where
    T: Serialize,
{
    let body_bytes = serde_json::to_vec(body).map_err(ResponseBodySerializeError)?;

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .body(Bytes::from(body_bytes))
        .map_err(ResponseBodyConversionError)
}
