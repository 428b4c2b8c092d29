use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::{RequestError, Result, RetryPolicy};

/// HTTP method of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }

    /// Only GET responses are stored in the response cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Opaque request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    Text(String),
}

impl Body {
    /// Serializes any value into a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|err| RequestError::Validation(format!("body is not serializable: {err}")))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Canonical form used for request identity.
    ///
    /// Text is rendered as a JSON string literal so `Text("{}")` and
    /// `Json({})` never share an identity.
    pub(crate) fn identity(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Json(value) => value.to_string(),
            Self::Text(text) => serde_json::Value::String(text.clone()).to_string(),
        }
    }

    /// Bytes placed on the wire, if any.
    pub(crate) fn payload(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Json(value) => Some(value.to_string()),
            Self::Text(text) => Some(text.clone()),
        }
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

/// Description of one logical request.
///
/// Submitted by value; the orchestrator never mutates a config after it has
/// been handed over.
#[derive(Clone, Debug, Default)]
pub struct RequestConfig {
    pub url: String,
    pub method: Method,
    /// Sent with the request but excluded from request identity.
    pub headers: BTreeMap<String, String>,
    pub body: Body,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retry policy for this request; the orchestrator default applies when unset.
    pub retry: Option<RetryPolicy>,
    pub priority: Priority,
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            ..Self::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::Put, url).with_body(body)
    }

    pub fn patch(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::Patch, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Rejects configs that can never be dispatched.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(RequestError::Validation("url must not be empty".to_owned()));
        }
        if self.timeout_ms == Some(0) {
            return Err(RequestError::Validation(
                "timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}
