use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hookrelay::server::HookServerBuilder;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// A running hook server backed by a temporary storage directory.
pub struct HookRelayEnv {
    pub addr: SocketAddr,
    pub storage: TempDir,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HookRelayEnv {
    pub async fn start() -> Self {
        Self::start_with(|builder| builder).await
    }

    pub async fn start_with<F>(configure: F) -> Self
    where
        F: FnOnce(HookServerBuilder) -> HookServerBuilder,
    {
        let storage = TempDir::new().unwrap();
        let server = configure(
            HookServerBuilder::new()
                .storage_dir(storage.path())
                .relay_timeout(Duration::from_secs(2)),
        )
        .build()
        .unwrap();

        let (addr_sender, addr_receiver) = oneshot::channel();
        let (shutdown, shutdown_receiver) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .start_with_signals(Some(addr_sender), shutdown_receiver.map(|_| ()))
                .await
                .unwrap();
        });

        HookRelayEnv {
            addr: addr_receiver.await.unwrap(),
            storage,
            client: reqwest::Client::new(),
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get_json(&self, path: &str) -> (u16, Value) {
        let res = self.client.get(self.url(path)).send().await.unwrap();
        let status = res.status().as_u16();
        let body = res.bytes().await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    /// Captures a request and returns the record file name.
    pub async fn capture(&self, req: reqwest::RequestBuilder) -> String {
        let res = req.send().await.unwrap();
        assert_eq!(res.status(), 200);
        let body: Value = serde_json::from_slice(&res.bytes().await.unwrap()).unwrap();
        body["record"].as_str().unwrap().to_string()
    }

    pub async fn relay(&self, id: &str, payload: Value) -> Value {
        let res = self
            .client
            .post(self.url(&format!("/view/{}/relay", id)))
            .header("content-type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        serde_json::from_slice(&res.bytes().await.unwrap()).unwrap()
    }
}

impl Drop for HookRelayEnv {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// One request as seen by a [`TargetServer`].
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct TargetResponse {
    pub status: u16,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl TargetResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A relay target that records every request and answers with a fixed response.
/// `GET|POST /redirect` answers with a redirect to `/final`, `/loop` redirects to itself.
pub struct TargetServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: JoinHandle<()>,
}

impl TargetServer {
    pub async fn start(response: TargetResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let state = received.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| respond(req, state.clone(), response.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        TargetServer {
            addr,
            received,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TargetServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(
    req: Request<Incoming>,
    state: Arc<Mutex<Vec<ReceivedRequest>>>,
    response: TargetResponse,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let location = match parts.uri.path() {
        "/redirect" => Some("/final"),
        "/loop" => Some("/loop"),
        _ => None,
    };
    if let Some(location) = location {
        return Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header("location", location)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    state.lock().unwrap().push(ReceivedRequest {
        method: parts.method,
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    });

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    Ok(Response::builder()
        .status(response.status)
        .body(Full::new(response.body))
        .unwrap())
}

/// A part of a multipart body as received by a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPart {
    pub name: String,
    pub file_name: Option<String>,
    pub data: Bytes,
}

pub async fn parse_multipart(req: &ReceivedRequest) -> Vec<ReceivedPart> {
    let content_type = req.headers["content-type"].to_str().unwrap();
    let boundary = multer::parse_boundary(content_type).unwrap();
    let body = req.body.clone();
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.unwrap();
        parts.push(ReceivedPart {
            name,
            file_name,
            data,
        });
    }
    parts
}
