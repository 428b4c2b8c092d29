//! `request-orchestrator` issues outbound requests reliably over an
//! unreliable link.
//!
//! [`RequestOrchestrator`] wraps an injected [`Transport`] with:
//! - request identity derived from method, URL and body ([`generate_key`])
//! - a TTL response cache for GET requests
//! - coalescing of concurrent identical requests onto one outcome
//! - bounded exponential backoff with jitter ([`RetryPolicy`])
//! - per-request and bulk cancellation
//! - an offline queue replayed in FIFO order when connectivity returns
//! - cumulative [`NetworkStats`]

mod cache;
mod cancel;
mod client;
mod connectivity;
mod error;
mod key;
mod offline;
mod options;
mod pending;
mod request;
pub mod retry;
pub mod runtime;
mod stats;
mod transport;
mod types;

pub use client::RequestOrchestrator;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, Subscription};
pub use error::RequestError;
pub use key::{generate_key, RequestKey};
pub use options::OrchestratorOptions;
pub use request::{Body, Method, Priority, RequestConfig};
pub use retry::{RetryOverride, RetryPolicy};
pub use stats::NetworkStats;
pub use transport::{ReqwestTransport, Transport, TransportRequest};
pub use types::{LinkQuality, PendingRequest, ReplayReport, Response};

pub type Result<T> = std::result::Result<T, RequestError>;
