use std::collections::HashMap;

use crate::{RequestKey, Response};

#[derive(Clone, Debug)]
struct CachedEntry {
    data: Response,
    stored_at: u64,
    ttl_ms: u64,
}

impl CachedEntry {
    fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at) < self.ttl_ms
    }
}

/// Time-bounded store of successful GET responses.
///
/// Expired entries are evicted lazily when looked up; there is no sweeper.
#[derive(Debug, Default)]
pub(crate) struct ResponseCache {
    entries: HashMap<RequestKey, CachedEntry>,
}

impl ResponseCache {
    pub(crate) fn get(&mut self, key: &RequestKey, now_ms: u64) -> Option<Response> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now_ms) => Some(entry.data.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn put(&mut self, key: RequestKey, data: Response, now_ms: u64, ttl_ms: u64) {
        self.entries.insert(
            key,
            CachedEntry {
                data,
                stored_at: now_ms,
                ttl_ms,
            },
        );
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
