//! Outstanding SNAC request correlation.
//!
//! Every outgoing SNAC carries a request id; some replies (errors, acks)
//! reference it instead of any payload context. The cache remembers what
//! each id was about so the reply can be attributed. Entries are swept
//! opportunistically after sends — replies that matter arrive well inside
//! a minute.

use std::time::{Duration, Instant};

/// Context saved for one outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub family: u16,
    pub subtype: u16,
    /// Destination screen name, when the request had one.
    pub target: Option<String>,
}

#[derive(Debug)]
struct Entry {
    id: u32,
    request: PendingRequest,
    added: Instant,
}

#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Vec<Entry>,
    next_id: u32,
}

impl RequestCache {
    /// Default sweep age, matching how long a reply is worth attributing.
    pub const MAX_AGE: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        RequestCache {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Allocate the next request id (monotonically increasing).
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    pub fn cache(&mut self, id: u32, request: PendingRequest) {
        self.entries.push(Entry {
            id,
            request,
            added: Instant::now(),
        });
    }

    /// Take the context for a reply's request id, if we remember it.
    pub fn take(&mut self, id: u32) -> Option<PendingRequest> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx).request)
    }

    pub fn sweep(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|e| now.duration_since(e.added) < max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let mut cache = RequestCache::new();
        let a = cache.next_id();
        let b = cache.next_id();
        assert!(b > a);
    }

    #[test]
    fn take_is_once() {
        let mut cache = RequestCache::new();
        let id = cache.next_id();
        let req = PendingRequest {
            family: 4,
            subtype: 6,
            target: Some("bob".into()),
        };
        cache.cache(id, req.clone());
        assert_eq!(cache.take(id), Some(req));
        assert_eq!(cache.take(id), None);
    }

    #[test]
    fn sweep_zero_clears() {
        let mut cache = RequestCache::new();
        let id = cache.next_id();
        cache.cache(id, PendingRequest { family: 1, subtype: 2, target: None });
        cache.sweep(Duration::ZERO);
        assert_eq!(cache.len(), 0);
    }
}
