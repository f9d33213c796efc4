//! Generic HTTP sender seam and the reqwest-backed fleet client.

use std::io;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::FleetError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Transport-level failures of [`Sender::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The request URL could not be built; `source` is the underlying cause.
    #[error("invalid url '{url}': {source}")]
    Url { url: String, source: BoxError },
    /// A socket-level operation failed (dial, read, write).
    #[error("network operation failed: {0}")]
    Network(#[source] io::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("http: {0}")]
    Other(BoxError),
}

/// Sends one request relative to a fleet server base URL.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        headers: Option<HeaderMap>,
        body: Bytes,
    ) -> Result<Response<Bytes>, SendError>;

    /// Base URI requests are resolved against.
    fn uri(&self) -> String;
}

/// Structured error returned by fleet-server in non-200 bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("status code: {status_code}, fleet-server returned an error: {error}, message: {message}")]
pub struct ApiError {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    status_code: Option<u16>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Turn a non-200 response body into an error. Falls back to the raw text
/// when the body is not the structured error shape.
pub fn extract_error(status: u16, body: &[u8]) -> FleetError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(b) if !b.error.is_empty() || !b.message.is_empty() => FleetError::Api(ApiError {
            status_code: b.status_code.unwrap_or(status),
            error: b.error,
            message: b.message,
        }),
        _ => FleetError::UnexpectedResponse { status, body: String::from_utf8_lossy(body).trim().to_string() },
    }
}

/// Connection options for [`FleetClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Sent as `Authorization: ApiKey <key>`.
    pub api_key: Option<String>,
    /// Ignore `HTTP(S)_PROXY` from the environment.
    pub proxy_disable: bool,
}

/// reqwest-backed [`Sender`].
#[derive(Debug, Clone)]
pub struct FleetClient {
    base: Url,
    http: reqwest::Client,
}

impl FleetClient {
    pub fn new(base_url: &str, opts: &ClientOptions) -> Result<Self, SendError> {
        let mut base = Url::parse(base_url).map_err(|e| SendError::Url { url: base_url.to_string(), source: Box::new(e) })?;
        if !base.path().ends_with('/') {
            let p = format!("{}/", base.path());
            base.set_path(&p);
        }
        let mut headers = HeaderMap::new();
        headers.insert("kbn-xsrf", HeaderValue::from_static("true"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = opts.api_key.as_deref() {
            let mut v = HeaderValue::from_str(&format!("ApiKey {}", key)).map_err(|e| SendError::Other(Box::new(e)))?;
            v.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, v);
        }
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("autodisco/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);
        if opts.proxy_disable {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| SendError::Other(Box::new(e)))?;
        Ok(Self { base, http })
    }

    fn url_for(&self, path: &str, params: &[(String, String)]) -> Result<Url, SendError> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| SendError::Url { url: format!("{}{}", self.base, path), source: Box::new(e) })?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }
}

/// Find an I/O error somewhere in the source chain.
fn io_error_in_chain(err: &(dyn std::error::Error + 'static)) -> Option<io::Error> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(ioe) = e.downcast_ref::<io::Error>() {
            return Some(io::Error::new(ioe.kind(), ioe.to_string()));
        }
        cur = e.source();
    }
    None
}

fn classify(err: reqwest::Error, url: &Url) -> SendError {
    if err.is_builder() {
        SendError::Url { url: url.to_string(), source: Box::new(err) }
    } else if err.is_connect() {
        let ioe = io_error_in_chain(&err).unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()));
        SendError::Network(ioe)
    } else {
        SendError::Other(Box::new(err))
    }
}

#[async_trait::async_trait]
impl Sender for FleetClient {
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        headers: Option<HeaderMap>,
        body: Bytes,
    ) -> Result<Response<Bytes>, SendError> {
        let url = self.url_for(path, params)?;
        debug!(%method, url = %url, bytes = body.len(), "fleet request");
        let mut req = self.http.request(method, url.clone()).body(body);
        if let Some(h) = headers {
            req = req.headers(h);
        }
        let resp = req.send().await.map_err(|e| classify(e, &url))?;
        let status = resp.status();
        let resp_headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(|e| classify(e, &url))?;
        let mut out = Response::builder().status(status);
        if let Some(h) = out.headers_mut() {
            *h = resp_headers;
        }
        out.body(bytes).map_err(|e| SendError::Other(Box::new(e)))
    }

    fn uri(&self) -> String { self.base.to_string() }
}
