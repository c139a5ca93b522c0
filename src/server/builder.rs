use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    common::http::{Error, HttpRelayClient, RelayClient, DEFAULT_RELAY_TIMEOUT},
    server::{
        capture::CaptureConfig,
        handler::{HandlerConfig, HookHandler},
        relay::PREVIEW_LIMIT,
        server::{HookServer, HookServerConfig},
        store::{FsRecordStore, RecordStore},
        FsHookServer,
    },
};

const DEFAULT_STORAGE_DIR: &str = "storage";

/// Collects the server configuration and wires up the record store, the relay client and
/// the request handler. Every setting has a default, so `HookServerBuilder::new().build()`
/// yields a working server on a random local port that stores into `./storage`.
#[derive(Default)]
pub struct HookServerBuilder {
    port: Option<u16>,
    expose: Option<bool>,
    print_access_log: Option<bool>,
    storage_dir: Option<PathBuf>,
    relay_timeout: Option<Duration>,
    preview_limit: Option<usize>,
    max_upload_size: Option<usize>,
    http_client: Option<Arc<dyn RelayClient + Send + Sync + 'static>>,
}

impl HookServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the port to listen on. Without a port a random free one is chosen.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn port_option(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Listens on all interfaces instead of only on `127.0.0.1`.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    pub fn expose_option(mut self, expose: Option<bool>) -> Self {
        self.expose = expose;
        self
    }

    /// Logs one line per handled request.
    pub fn print_access_log(mut self, enabled: bool) -> Self {
        self.print_access_log = Some(enabled);
        self
    }

    pub fn print_access_log_option(mut self, enabled: Option<bool>) -> Self {
        self.print_access_log = enabled;
        self
    }

    /// Sets the directory records and uploads are written to.
    pub fn storage_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage_dir = Some(path.into());
        self
    }

    pub fn storage_dir_option(mut self, path: Option<PathBuf>) -> Self {
        self.storage_dir = path;
        self
    }

    /// Total time a relay may take, including redirects and reading the response.
    pub fn relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = Some(timeout);
        self
    }

    pub fn relay_timeout_option(mut self, timeout: Option<Duration>) -> Self {
        self.relay_timeout = timeout;
        self
    }

    /// Number of response bytes echoed back in a relay summary.
    pub fn preview_limit(mut self, limit: usize) -> Self {
        self.preview_limit = Some(limit);
        self
    }

    /// Uploaded files larger than this are recorded as failed uploads.
    pub fn max_upload_size(mut self, bytes: usize) -> Self {
        self.max_upload_size = Some(bytes);
        self
    }

    pub fn max_upload_size_option(mut self, bytes: Option<usize>) -> Self {
        self.max_upload_size = bytes;
        self
    }

    /// Replaces the client used to send relay requests.
    pub fn http_client(mut self, client: Arc<dyn RelayClient + Send + Sync + 'static>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(mut self) -> Result<FsHookServer, Error> {
        let dir = self
            .storage_dir
            .take()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
        let store = FsRecordStore::new(dir);
        tracing::info!("Storing captured requests in '{}'", store.root().display());

        self.build_with_store(Arc::new(store))
    }

    pub fn build_with_store<S>(self, store: Arc<S>) -> Result<HookServer<HookHandler<S>>, Error>
    where
        S: RecordStore + Send + Sync + 'static,
    {
        let http_client: Arc<dyn RelayClient + Send + Sync + 'static> = match self.http_client {
            Some(client) => client,
            None => Arc::new(HttpRelayClient::new(
                self.relay_timeout.unwrap_or(DEFAULT_RELAY_TIMEOUT),
            )?),
        };

        let handler = HookHandler::new(
            store,
            http_client,
            HandlerConfig {
                capture: CaptureConfig {
                    max_upload_size: self.max_upload_size,
                },
                preview_limit: self.preview_limit.unwrap_or(PREVIEW_LIMIT),
            },
        );

        Ok(HookServer::new(
            Box::new(handler),
            HookServerConfig {
                static_port: self.port,
                expose: self.expose.unwrap_or(false),
                print_access_log: self.print_access_log.unwrap_or(false),
            },
        ))
    }
}
