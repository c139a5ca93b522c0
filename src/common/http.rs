use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, LOCATION, PROXY_AUTHORIZATION},
    multipart::{Form, Part},
    redirect::Policy,
    Client, Method, Response, StatusCode, Url,
};
use std::{
    error::Error as StdError,
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::server::relay::{OutboundBody, OutboundFile, OutboundRequest};

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_REDIRECTS: usize = 10;

#[derive(Error, Debug)]
pub enum Error {
    #[error("relay timed out after {0:?}")]
    RelayTimeout(Duration),
    #[error("cannot send request: {0}")]
    RelayTransportError(String),
    #[error("cannot build HTTP client: {0}")]
    ClientBuildError(String),
    #[error("cannot build request: {0}")]
    RequestBuildError(String),
    #[error("cannot send request: more than {0} redirects")]
    TooManyRedirects(usize),
}

/// What came back from a relay target.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Bytes,
    pub elapsed: Duration,
}

#[async_trait]
pub trait RelayClient {
    async fn send(&self, req: OutboundRequest) -> Result<RelayResponse, Error>;
}

/// Sends relay requests with a bounded timeout for the whole exchange. Redirects are followed
/// by hand and every hop repeats the original method and body.
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    client: Client,
    timeout: Duration,
}

impl HttpRelayClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| Error::ClientBuildError(describe(&err)))?;

        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::RelayTimeout(self.timeout)
        } else if err.is_builder() {
            Error::RequestBuildError(describe(&err))
        } else {
            Error::RelayTransportError(describe(&err))
        }
    }

    async fn send_once(
        &self,
        url: Url,
        method: Method,
        headers: HeaderMap,
        body: OutboundBody,
    ) -> Result<Response, Error> {
        let builder = self.client.request(method, url).headers(headers);
        let builder = match body {
            OutboundBody::Multipart { fields, files } => builder.multipart(multipart_form(fields, files)),
            OutboundBody::Form(body) => builder.body(body),
            OutboundBody::Json(body) => builder.body(body),
            OutboundBody::Raw { body, .. } => builder.body(body),
        };

        builder.send().await.map_err(|err| self.map_error(err))
    }

    async fn exchange(&self, req: OutboundRequest) -> Result<(StatusCode, Bytes), Error> {
        let OutboundRequest {
            mut url,
            method,
            mut headers,
            body,
        } = req;

        let mut hops = 0;
        loop {
            let response = self
                .send_once(url.clone(), method.clone(), headers.clone(), body.clone())
                .await?;

            let next = match redirect_target(&url, &response) {
                Some(next) => next,
                None => {
                    let status = response.status();
                    let body = response
                        .bytes()
                        .await
                        .map_err(|err| self.map_error(err))?;
                    return Ok((status, body));
                }
            };

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(Error::TooManyRedirects(MAX_REDIRECTS));
            }

            if next.host_str() != url.host_str()
                || next.port_or_known_default() != url.port_or_known_default()
            {
                headers.remove(AUTHORIZATION);
                headers.remove(PROXY_AUTHORIZATION);
            }

            tracing::debug!("following {} redirect to {}", response.status(), next);
            url = next;
        }
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn send(&self, req: OutboundRequest) -> Result<RelayResponse, Error> {
        let start = Instant::now();
        let (status, body) = tokio::time::timeout(self.timeout, self.exchange(req))
            .await
            .map_err(|_| Error::RelayTimeout(self.timeout))??;

        Ok(RelayResponse {
            status: status.as_u16(),
            body,
            elapsed: start.elapsed(),
        })
    }
}

/// Resolves the `Location` of a redirect response against the URL that produced it.
fn redirect_target(current: &Url, response: &Response) -> Option<Url> {
    if !response.status().is_redirection() || response.status() == StatusCode::NOT_MODIFIED {
        return None;
    }

    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    match current.join(location) {
        Ok(next) if matches!(next.scheme(), "http" | "https") => Some(next),
        Ok(next) => {
            tracing::debug!("not following redirect to non-HTTP location {}", next);
            None
        }
        Err(err) => {
            tracing::debug!("not following redirect to invalid location '{}': {}", location, err);
            None
        }
    }
}

fn multipart_form(fields: Vec<(String, String)>, files: Vec<OutboundFile>) -> Form {
    let form = fields
        .into_iter()
        .fold(Form::new(), |form, (key, value)| form.text(key, value));

    files.into_iter().fold(form, |form, file| {
        let key = file.key.clone();
        form.part(key, file_part(file))
    })
}

fn file_part(file: OutboundFile) -> Part {
    let part = || Part::bytes(file.data.to_vec()).file_name(file.file_name.clone());

    if file.content_type.is_empty() {
        return part();
    }

    part().mime_str(&file.content_type).unwrap_or_else(|err| {
        tracing::debug!(
            "sending '{}' without its invalid content type '{}': {}",
            file.file_name,
            file.content_type,
            err
        );
        part()
    })
}

/// Joins an error with all of its sources, since reqwest keeps the interesting part
/// (refused connection, DNS failure) in the chain.
fn describe(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
