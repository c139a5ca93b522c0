use futures_util::FutureExt;
use http::{Request, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1::Builder as ConnectionBuilder,
    service::service_fn,
    Response,
};
use hyper_util::rt::TokioIo;
use std::{
    future::{pending, Future},
    io,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot::Sender,
    task::spawn,
};

use crate::server::{
    handler,
    handler::Handler,
    server::Error::{
        BufferError, LocalSocketAddrError, PublishSocketAddrError, RouterError,
        ServerConnectionError, SocketBindError,
    },
    RequestMetadata,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, io::Error),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local address: {0}")]
    LocalSocketAddrError(io::Error),
    #[error("cannot publish bound address {0}")]
    PublishSocketAddrError(SocketAddr),
    #[error("buffering error: {0}")]
    BufferError(hyper::Error),
    #[error("HTTP error: {0}")]
    HTTPError(#[from] http::Error),
    #[error("cannot process request: {0}")]
    RouterError(#[from] handler::Error),
    #[error("connection error: {0}")]
    ServerConnectionError(hyper::Error),
}

pub struct HookServerConfig {
    pub static_port: Option<u16>,
    pub expose: bool,
    pub print_access_log: bool,
}

/// Accepts TCP connections and hands every buffered request to its [`Handler`].
pub struct HookServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    handler: Box<H>,
    config: HookServerConfig,
}

impl<H> HookServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    pub fn new(handler: Box<H>, config: HookServerConfig) -> Self {
        HookServer { handler, config }
    }

    /// Runs until the process is terminated.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Binds the listener and serves until `shutdown` resolves.
    ///
    /// If `socket_addr_sender` is given, the bound address is published through it before the
    /// first connection is accepted. This is how callers learn about a random port.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<Sender<SocketAddr>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let host = if self.config.expose {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        let addr: SocketAddr =
            format!("{}:{}", host, self.config.static_port.unwrap_or(0)).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SocketBindError(addr, e))?;
        let local_addr = listener.local_addr().map_err(LocalSocketAddrError)?;

        if let Some(sender) = socket_addr_sender {
            sender.send(local_addr).map_err(PublishSocketAddrError)?;
        }

        tracing::info!("Listening on {}", local_addr);
        self.run_accept_loop(listener, shutdown).await
    }

    pub async fn run_accept_loop<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let shutdown = shutdown.shared();
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            let server = server.clone();
                            spawn(async move {
                                if let Err(err) = server.handle_tcp_stream(tcp_stream, remote_address).await {
                                    tracing::debug!("connection from {} closed with error: {}", remote_address, err);
                                }
                            });
                        },
                        Err(err) => {
                            tracing::error!("TCP error: {:?}", err);
                        },
                    };
                }
                _ = shutdown.clone() => {
                    tracing::info!("shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        tracing::trace!("New HTTP request received: {}", req.uri());

        let mut req = match buffer_request(req).await {
            Ok(req) => req,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, BufferError(err));
            }
        };
        req.extensions_mut().insert(RequestMetadata { remote_addr });

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = Instant::now();

        let response = match self.handler.handle(req).await {
            Ok(response) => response,
            Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, RouterError(err)),
        };

        if self.config.print_access_log {
            tracing::info!(
                "{} {} {} {} {}ms",
                remote_addr,
                method,
                path,
                response.status().as_u16(),
                start.elapsed().as_millis()
            );
        }

        to_service_response(response)
    }

    async fn handle_tcp_stream(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        remote_address: SocketAddr,
    ) -> Result<(), Error> {
        tracing::trace!("new TCP connection from {}", remote_address);

        ConnectionBuilder::new()
            .serve_connection(
                TokioIo::new(tcp_stream),
                service_fn(|req| self.clone().service(req, remote_address)),
            )
            .await
            .map_err(ServerConnectionError)
    }
}

async fn buffer_request(req: Request<Incoming>) -> Result<Request<Bytes>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, body))
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(
    code: StatusCode,
    err: Error,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    tracing::error!("failed to process request: {}", err);
    Ok(Response::builder().status(code).body(full(err.to_string()))?)
}

fn to_service_response(
    response: Response<Bytes>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, full(body)))
}
