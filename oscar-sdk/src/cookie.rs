//! The message cookie cache.
//!
//! Every rendezvous negotiation is correlated by an 8-byte cookie chosen by
//! the initiator and echoed by the peer. The cache holds the pending state
//! for each negotiation in flight; a later channel-2 message with no payload
//! (an accept or cancel) resolves through it. Entries expire by age so an
//! abandoned negotiation does not leak forever.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::warn;

/// What a cached cookie belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookieKind {
    Message,
    ChatInvite,
    DirectIm,
    FileGet,
    FileSend,
    Voice,
    BuddyIcon,
}

/// Pending state owned by the module that cached the cookie. `remove`
/// transfers ownership out; there is no way to leak a borrow of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieData {
    None,
    /// Destination screen name of an outstanding message (for error reports).
    Message { to: String },
    /// Peer and address of a pending direct-IM negotiation.
    DirectIm { peer: String, addr: SocketAddrV4 },
    /// Pending file transfer descriptor.
    FileTransfer {
        peer: String,
        addr: SocketAddrV4,
        file_name: String,
        total_size: u32,
    },
    /// Pending voice chat.
    Voice { peer: String },
}

#[derive(Debug)]
pub struct CookieEntry {
    pub cookie: [u8; 8],
    pub kind: CookieKind,
    pub data: CookieData,
    added: Instant,
}

/// Session-scoped cookie table.
#[derive(Debug, Default)]
pub struct CookieCache {
    entries: Vec<CookieEntry>,
}

impl CookieCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a cookie. At most one entry may exist per (cookie, kind) at a
    /// time; re-caching before the first entry is consumed is a logic error
    /// in the calling module, which the cache surfaces by evicting and
    /// returning the stale entry.
    pub fn cache(
        &mut self,
        cookie: [u8; 8],
        kind: CookieKind,
        data: CookieData,
    ) -> Option<CookieEntry> {
        let stale = self.take(&cookie, kind);
        if stale.is_some() {
            warn!(?kind, "cookie re-cached while a previous entry was live");
        }
        self.entries.push(CookieEntry {
            cookie,
            kind,
            data,
            added: Instant::now(),
        });
        stale
    }

    /// Borrow the entry for (cookie, kind), if any.
    pub fn find(&self, cookie: &[u8; 8], kind: CookieKind) -> Option<&CookieEntry> {
        self.entries
            .iter()
            .find(|e| e.cookie == *cookie && e.kind == kind)
    }

    /// Remove the entry for `cookie` regardless of kind, transferring
    /// ownership of its data to the caller.
    pub fn remove(&mut self, cookie: &[u8; 8]) -> Option<CookieEntry> {
        let idx = self.entries.iter().position(|e| e.cookie == *cookie)?;
        Some(self.entries.remove(idx))
    }

    fn take(&mut self, cookie: &[u8; 8], kind: CookieKind) -> Option<CookieEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.cookie == *cookie && e.kind == kind)?;
        Some(self.entries.remove(idx))
    }

    /// Drop entries older than `max_age`. `sweep(Duration::ZERO)` empties
    /// the cache entirely.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|e| now.duration_since(e.added) < max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOKIE: [u8; 8] = *b"\x01\x02\x03\x04\x05\x06\x07\x08";

    #[test]
    fn cache_find_remove_miss() {
        let mut cache = CookieCache::new();
        let data = CookieData::Voice { peer: "bob".into() };
        assert!(cache.cache(COOKIE, CookieKind::Voice, data.clone()).is_none());

        let found = cache.find(&COOKIE, CookieKind::Voice).unwrap();
        assert_eq!(found.data, data);
        // same cookie, wrong kind: miss
        assert!(cache.find(&COOKIE, CookieKind::FileSend).is_none());

        let removed = cache.remove(&COOKIE).unwrap();
        assert_eq!(removed.data, data);
        assert!(cache.find(&COOKIE, CookieKind::Voice).is_none());
        assert!(cache.remove(&COOKIE).is_none());
    }

    #[test]
    fn recache_evicts_and_returns_stale_entry() {
        let mut cache = CookieCache::new();
        cache.cache(COOKIE, CookieKind::Message, CookieData::Message { to: "a".into() });
        let stale = cache
            .cache(COOKIE, CookieKind::Message, CookieData::Message { to: "b".into() })
            .unwrap();
        assert_eq!(stale.data, CookieData::Message { to: "a".into() });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_zero_empties_everything() {
        let mut cache = CookieCache::new();
        cache.cache(COOKIE, CookieKind::Voice, CookieData::None);
        cache.cache(*b"AAAAAAAA", CookieKind::FileGet, CookieData::None);
        assert_eq!(cache.sweep(Duration::ZERO), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_young_entries() {
        let mut cache = CookieCache::new();
        cache.cache(COOKIE, CookieKind::Voice, CookieData::None);
        assert_eq!(cache.sweep(Duration::from_secs(60)), 0);
        assert_eq!(cache.len(), 1);
    }
}
