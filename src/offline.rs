use std::collections::VecDeque;

use futures::channel::oneshot;

use crate::{generate_key, RequestConfig, RequestKey, Response, Result, RetryPolicy};

/// Receives the outcome of a request diverted to the offline queue.
pub(crate) type Waiter = oneshot::Receiver<Result<Response>>;

/// A request awaiting dispatch until connectivity returns.
pub(crate) struct QueuedRequest {
    pub(crate) config: RequestConfig,
    pub(crate) policy: RetryPolicy,
    /// Failed replays so far.
    pub(crate) replay_failures: u32,
    notify: Option<oneshot::Sender<Result<Response>>>,
}

impl QueuedRequest {
    /// A queued request nobody is waiting on.
    pub(crate) fn detached(config: RequestConfig, policy: RetryPolicy) -> Self {
        Self {
            config,
            policy,
            replay_failures: 0,
            notify: None,
        }
    }

    /// A queued request whose outcome is delivered to the returned waiter.
    pub(crate) fn waiting(config: RequestConfig, policy: RetryPolicy) -> (Self, Waiter) {
        let (sender, receiver) = oneshot::channel();
        let request = Self {
            config,
            policy,
            replay_failures: 0,
            notify: Some(sender),
        };
        (request, receiver)
    }

    /// Delivers the final outcome to the waiting caller, if any.
    pub(crate) fn settle(mut self, result: Result<Response>) {
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(result);
        }
    }
}

/// FIFO buffer of requests deferred while offline.
///
/// No deduplication happens here; identical requests are coalesced only once
/// they are replayed through the dispatch pipeline.
#[derive(Default)]
pub(crate) struct OfflineQueue {
    items: VecDeque<QueuedRequest>,
}

impl OfflineQueue {
    pub(crate) fn enqueue(&mut self, request: QueuedRequest) {
        self.items.push_back(request);
    }

    /// Takes the whole queue in submission order, leaving it empty.
    pub(crate) fn take_all(&mut self) -> VecDeque<QueuedRequest> {
        std::mem::take(&mut self.items)
    }

    /// Puts `requests` back ahead of anything queued since they were taken,
    /// preserving their relative order.
    pub(crate) fn restore_front(&mut self, requests: VecDeque<QueuedRequest>) {
        for request in requests.into_iter().rev() {
            self.items.push_front(request);
        }
    }

    /// Removes every queued request whose key is `key`, in queue order.
    pub(crate) fn take_matching(&mut self, key: &RequestKey) -> Vec<QueuedRequest> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|request| generate_key(&request.config) == *key);
        self.items = rest;
        matching.into()
    }

    pub(crate) fn configs(&self) -> Vec<RequestConfig> {
        self.items.iter().map(|item| item.config.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{OfflineQueue, QueuedRequest};
    use crate::{generate_key, RequestConfig, Response, RetryPolicy};

    fn detached(url: &str) -> QueuedRequest {
        QueuedRequest::detached(RequestConfig::get(url), RetryPolicy::default())
    }

    fn urls(queue: &OfflineQueue) -> Vec<String> {
        queue.configs().into_iter().map(|config| config.url).collect()
    }

    #[test]
    fn enqueue_preserves_submission_order() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(detached("/1"));
        queue.enqueue(detached("/2"));
        queue.enqueue(detached("/3"));
        assert_eq!(urls(&queue), ["/1", "/2", "/3"]);
    }

    #[test]
    fn take_all_empties_queue() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(detached("/1"));
        let taken = queue.take_all();
        assert_eq!(taken.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_front_keeps_remainder_ahead_of_newcomers() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(detached("/1"));
        queue.enqueue(detached("/2"));
        let taken = queue.take_all();
        queue.enqueue(detached("/3"));

        queue.restore_front(taken);
        assert_eq!(urls(&queue), ["/1", "/2", "/3"]);
    }

    #[test]
    fn take_matching_leaves_other_requests_in_order() {
        let mut queue = OfflineQueue::default();
        queue.enqueue(detached("/1"));
        queue.enqueue(detached("/2"));
        queue.enqueue(detached("/1"));
        queue.enqueue(detached("/3"));

        let taken = queue.take_matching(&generate_key(&RequestConfig::get("/1")));
        assert_eq!(taken.len(), 2);
        assert_eq!(urls(&queue), ["/2", "/3"]);
        assert!(queue
            .take_matching(&generate_key(&RequestConfig::get("/4")))
            .is_empty());
    }

    #[tokio::test]
    async fn settle_delivers_to_waiter() {
        let (request, waiter) =
            QueuedRequest::waiting(RequestConfig::get("/a"), RetryPolicy::default());
        request.settle(Ok(Response::new(200, "done")));
        assert_eq!(
            waiter.await.expect("sender must deliver"),
            Ok(Response::new(200, "done"))
        );
    }

    #[tokio::test]
    async fn dropping_request_cancels_waiter() {
        let (request, waiter) =
            QueuedRequest::waiting(RequestConfig::get("/a"), RetryPolicy::default());
        drop(request);
        assert!(waiter.await.is_err());
    }
}
