use std::collections::HashMap;

use futures::future::Shared;

use crate::runtime::BoxFuture;
use crate::{RequestConfig, RequestKey, Response, Result};

/// Settlement future shared by every caller attached to one dispatch.
pub(crate) type SharedOutcome = Shared<BoxFuture<'static, Result<Response>>>;

pub(crate) struct PendingEntry {
    pub(crate) dispatch_id: u64,
    pub(crate) outcome: SharedOutcome,
    pub(crate) started_at: u64,
    pub(crate) config: RequestConfig,
}

/// In-flight requests by key.
///
/// At most one entry exists per key; callers arriving while it exists attach
/// to its outcome instead of dispatching again.
#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: HashMap<RequestKey, PendingEntry>,
    next_dispatch_id: u64,
}

impl PendingRegistry {
    pub(crate) fn next_dispatch_id(&mut self) -> u64 {
        self.next_dispatch_id += 1;
        self.next_dispatch_id
    }

    pub(crate) fn attach(&self, key: &RequestKey) -> Option<SharedOutcome> {
        self.entries.get(key).map(|entry| entry.outcome.clone())
    }

    pub(crate) fn register(&mut self, key: RequestKey, entry: PendingEntry) {
        self.entries.insert(key, entry);
    }

    /// Removes the entry for `key` if it still belongs to `dispatch_id`.
    pub(crate) fn remove(&mut self, key: &RequestKey, dispatch_id: u64) -> bool {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.dispatch_id == dispatch_id)
        {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Removes the entry for `key` whichever dispatch owns it.
    pub(crate) fn forget(&mut self, key: &RequestKey) -> Option<PendingEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }
}
