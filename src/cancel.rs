use std::collections::HashMap;
use std::future::Future;

use futures::future::{self, Either};
use futures::pin_mut;
use tokio_util::sync::CancellationToken;

use crate::{RequestError, RequestKey, Result};

#[derive(Debug)]
struct Handle {
    dispatch_id: u64,
    token: CancellationToken,
}

/// One cancellation handle per in-flight request key.
#[derive(Debug, Default)]
pub(crate) struct CancellationManager {
    handles: HashMap<RequestKey, Handle>,
}

impl CancellationManager {
    /// Allocates a fresh handle for a dispatch.
    pub(crate) fn register(&mut self, key: RequestKey, dispatch_id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles.insert(
            key,
            Handle {
                dispatch_id,
                token: token.clone(),
            },
        );
        token
    }

    /// Signals and removes the handle for `key`. Returns `false` when nothing
    /// was in flight.
    pub(crate) fn cancel(&mut self, key: &RequestKey) -> bool {
        match self.handles.remove(key) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signals every handle and empties the map, returning the cancelled keys.
    pub(crate) fn cancel_all(&mut self) -> Vec<RequestKey> {
        self.handles
            .drain()
            .map(|(key, handle)| {
                handle.token.cancel();
                key
            })
            .collect()
    }

    /// Drops the handle for a settled dispatch without signalling it.
    ///
    /// A handle registered by a later dispatch of the same key is left alone.
    pub(crate) fn release(&mut self, key: &RequestKey, dispatch_id: u64) {
        if self
            .handles
            .get(key)
            .is_some_and(|handle| handle.dispatch_id == dispatch_id)
        {
            self.handles.remove(key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Drives `future` until it completes or `token` is cancelled.
pub(crate) async fn or_cancelled<F>(token: &CancellationToken, future: F) -> Result<F::Output>
where
    F: Future,
{
    if token.is_cancelled() {
        return Err(RequestError::Aborted);
    }
    let cancelled = token.cancelled();
    pin_mut!(future);
    pin_mut!(cancelled);
    match future::select(future, cancelled).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(RequestError::Aborted),
    }
}
