use std::fmt;

use crate::RequestConfig;

/// Identity of a logical request, shared by the cache, the pending registry
/// and the cancellation handles.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the identity of `config` from its method, URL and body.
///
/// Headers, timeout, retry policy and priority do not participate.
pub fn generate_key(config: &RequestConfig) -> RequestKey {
    RequestKey(format!(
        "{}:{}:{}",
        config.method,
        config.url,
        config.body.identity()
    ))
}
