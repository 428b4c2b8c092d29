use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

use crate::runtime::BoxFuture;
use crate::{Body, Method, RequestConfig, RequestError, Response, Result};

/// What the transport needs to perform one HTTP exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl From<&RequestConfig> for TransportRequest {
    fn from(config: &RequestConfig) -> Self {
        Self {
            url: config.url.clone(),
            method: config.method,
            headers: config.headers.clone(),
            body: config.body.clone(),
        }
    }
}

/// Performs a single HTTP exchange.
///
/// Implementations return the response for any status code; the orchestrator
/// classifies non-success statuses. A failure to obtain a response should be
/// reported as [`RequestError::Transport`]. `signal` is cancelled when the
/// attempt is aborted or times out; the returned future is also dropped at
/// that point, so observing the signal is optional.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: TransportRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Response>>;
}

impl<F> Transport for F
where
    F: Fn(TransportRequest, CancellationToken) -> BoxFuture<'static, Result<Response>>
        + Send
        + Sync
        + 'static,
{
    fn send(
        &self,
        request: TransportRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Response>> {
        self(request, signal)
    }
}

#[derive(Clone)]
/// [`Transport`] backed by `reqwest`.
///
/// Sends `Content-Type: application/json` unless the request overrides it,
/// and never attaches a body to GET requests.
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: Option<reqwest::Url>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url.as_ref().map(|url| url.as_str()))
            .finish()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Wraps a preconfigured `reqwest::Client`.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: None,
        }
    }

    /// Resolves relative request URLs against `base_url`.
    ///
    /// Example: base `"https://api.example.com/v1/"` and request URL
    /// `"orders"` → `"https://api.example.com/v1/orders"`.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Result<Self> {
        let parsed = reqwest::Url::parse(base_url.as_ref().trim()).map_err(|err| {
            RequestError::Validation(format!("invalid base url '{}': {err}", base_url.as_ref()))
        })?;
        self.base_url = Some(parsed);
        Ok(self)
    }

    fn resolve_url(&self, url: &str) -> Result<reqwest::Url> {
        let resolved = match &self.base_url {
            Some(base) => base.join(url),
            None => reqwest::Url::parse(url),
        };
        resolved.map_err(|err| RequestError::Validation(format!("invalid url '{url}': {err}")))
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| RequestError::Validation(format!("invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| RequestError::Validation(format!("invalid value for header '{name}': {err}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
        _signal: CancellationToken,
    ) -> BoxFuture<'static, Result<Response>> {
        let http = self.http.clone();
        let url = self.resolve_url(&request.url);
        Box::pin(async move {
            let url = url?;
            let headers = build_headers(&request.headers)?;
            let mut builder = http.request(request.method.into(), url).headers(headers);
            if request.method != Method::Get {
                if let Some(payload) = request.body.payload() {
                    builder = builder.body(payload);
                }
            }

            let response = builder.send().await.map_err(RequestError::transport)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(RequestError::transport)?;
            Ok(Response { status, body })
        })
    }
}
