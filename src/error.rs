/// Error type returned by this crate.
///
/// Errors are `Clone` because a single settled outcome is handed to every
/// caller that was coalesced onto the same in-flight request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No response was received (connection refused, DNS failure, reset).
    #[error("transport error: {message}")]
    Transport { message: String },
    /// A response arrived with a non-success status code.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// The per-attempt timer fired before the transport completed.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The request was cancelled by the caller.
    #[error("request aborted")]
    Aborted,
    /// The request configuration was rejected before dispatch.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RequestError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// HTTP status carried by the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Whether a retry can ever be attempted for this error.
    ///
    /// Aborted and invalid requests are terminal regardless of the retry
    /// predicate in effect.
    pub fn is_retry_eligible(&self) -> bool {
        !matches!(self, Self::Aborted | Self::Validation(_))
    }

    /// Classification used by the default retry predicate: transport
    /// failures, timeouts, 5xx, 408 and 429 are retried.
    pub fn is_default_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Aborted | Self::Validation(_) | Self::Decode(_) => false,
        }
    }
}
