//! Device-service protocol client: custom-verb HTTP requests to a local MDS port.

use async_trait::async_trait;
use mdstest_core::{ComposedRequest, FailureKind, Port};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Which fixed probe to send to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Enumerate the device behind the port.
    Discover,
    /// Fetch the device descriptor.
    Info,
}

impl ProbeKind {
    pub fn verb(self) -> &'static str {
        match self {
            ProbeKind::Discover => "MOSIPDISC",
            ProbeKind::Info => "MOSIPDINFO",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            ProbeKind::Discover => "/device",
            ProbeKind::Info => "/info",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("device at {url} timed out")]
    Timeout { url: String },
    #[error("protocol error from {url}: {reason}")]
    Protocol { url: String, reason: String },
    #[error("http client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::Unreachable { .. } | DispatchError::Client(_) => FailureKind::Unreachable,
            DispatchError::Timeout { .. } => FailureKind::Timeout,
            DispatchError::Protocol { .. } => FailureKind::ProtocolError,
        }
    }

    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DispatchError::Timeout { url: url.to_string() }
        } else if e.is_builder() || e.is_decode() || e.is_body() {
            DispatchError::Protocol { url: url.to_string(), reason: e.to_string() }
        } else {
            DispatchError::Unreachable { url: url.to_string(), reason: e.to_string() }
        }
    }
}

/// The seam the scanner and run executor talk to devices through.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Send a fixed DISCOVER/INFO probe and return the JSON body.
    async fn probe(&self, kind: ProbeKind, port: Port) -> Result<Value, DispatchError>;

    /// Send an arbitrary composed request and return the raw body text.
    async fn dispatch(&self, request: &ComposedRequest) -> Result<String, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub host: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        DispatchOptions {
            host: DEFAULT_HOST.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: format!("mdstest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// reqwest-backed transport. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    host: String,
}

impl Dispatcher {
    pub fn new(opts: DispatchOptions) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(opts.timeout_ms))
            .user_agent(opts.user_agent)
            .no_proxy()
            .build()
            .map_err(DispatchError::Client)?;
        Ok(Dispatcher { client, host: opts.host })
    }

    pub fn probe_url(&self, kind: ProbeKind, port: Port) -> String {
        format!("http://{}:{}{}", self.host, port, kind.path())
    }

    async fn send(&self, verb: &str, url: &str, body: String, headers: &[(&str, &str)]) -> Result<String, DispatchError> {
        let method = Method::from_bytes(verb.as_bytes()).map_err(|e| DispatchError::Protocol {
            url: url.to_string(),
            reason: format!("invalid verb '{verb}': {e}"),
        })?;
        let parsed = Url::parse(url)
            .map_err(|e| DispatchError::Protocol { url: url.to_string(), reason: format!("invalid url: {e}") })?;

        let mut req = self.client.request(method, parsed);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if !body.is_empty() {
            req = req.body(body);
        }
        let resp = req.send().await.map_err(|e| DispatchError::from_reqwest(url, e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| DispatchError::from_reqwest(url, e))?;
        debug!(%url, verb, status = status.as_u16(), bytes = text.len(), "device responded");
        if !status.is_success() {
            return Err(DispatchError::Protocol { url: url.to_string(), reason: format!("status {}", status.as_u16()) });
        }
        Ok(text)
    }
}

#[async_trait]
impl DeviceTransport for Dispatcher {
    async fn probe(&self, kind: ProbeKind, port: Port) -> Result<Value, DispatchError> {
        let url = self.probe_url(kind, port);
        let text = self.send(kind.verb(), &url, String::new(), &[]).await?;
        serde_json::from_str(&text).map_err(|e| DispatchError::Protocol { url, reason: format!("malformed body: {e}") })
    }

    async fn dispatch(&self, request: &ComposedRequest) -> Result<String, DispatchError> {
        let headers: Vec<(&str, &str)> = request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.send(&request.verb, &request.url, request.body.clone(), &headers).await
    }
}
