//! Cache table: digest-to-entry map, LRU order, accounting
//!
//! The LRU is kept as a map from a monotone token to the digest; the
//! largest token is the most recently used entry and the smallest is next
//! in line for purge. Only valid, clean entries are on it.
//!
//! Accounting counters change in exactly three places: `fill`,
//! `clear_dirty`, and `remove`. Debug builds re-derive the counters and
//! every structural invariant after each mutating operation.

use crate::entry::{CacheEntry, Payload};
use cascade_common::Digest;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

pub(crate) struct CacheTable {
    entries: HashMap<Digest, CacheEntry>,
    /// token -> digest; smallest token is the coldest entry
    lru: BTreeMap<u64, Digest>,
    next_token: u64,
    acct_size: u64,
    acct_valid: u32,
    acct_dirty: u32,
}

impl CacheTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_token: 0,
            acct_size: 0,
            acct_valid: 0,
            acct_dirty: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn acct_size(&self) -> u64 {
        self.acct_size
    }

    pub(crate) fn acct_valid(&self) -> u32 {
        self.acct_valid
    }

    pub(crate) fn acct_dirty(&self) -> u32 {
        self.acct_dirty
    }

    pub(crate) fn get(&self, hash: &Digest) -> Option<&CacheEntry> {
        self.entries.get(hash)
    }

    pub(crate) fn get_mut(&mut self, hash: &Digest) -> Option<&mut CacheEntry> {
        self.entries.get_mut(hash)
    }

    /// Install a fresh invalid entry. The caller must have checked the
    /// digest is not already present.
    pub(crate) fn insert(&mut self, hash: Digest, now: Instant) {
        let prev = self.entries.insert(hash, CacheEntry::new(hash, now));
        assert!(prev.is_none(), "insert: entry already exists");
    }

    /// Look up an entry, refreshing its LRU position when valid and clean
    ///
    /// Returns whether the entry is present.
    pub(crate) fn lookup(&mut self, hash: &Digest, now: Instant) -> bool {
        let Some(e) = self.entries.get_mut(hash) else {
            return false;
        };
        if e.valid() && !e.dirty {
            if let Some(old) = e.lru_token.take() {
                self.lru.remove(&old);
            }
            let token = self.next_token;
            self.next_token += 1;
            e.lru_token = Some(token);
            e.last_used = now;
            self.lru.insert(token, *hash);
        }
        true
    }

    /// Transition an invalid entry to valid
    ///
    /// Dirty fills stay off the LRU; clean fills go to the LRU head. Every
    /// parked load request is answered with the payload and ephemeral bit.
    pub(crate) fn fill(
        &mut self,
        hash: &Digest,
        payload: Payload,
        dirty: bool,
        ephemeral: bool,
        now: Instant,
    ) {
        let e = self.entries.get_mut(hash).expect("fill: entry must exist");
        assert!(!e.valid(), "fill: entry already valid");
        assert!(!e.dirty);

        let len = payload.len() as u64;
        e.payload = Some(payload);
        e.dirty = dirty;
        e.ephemeral = ephemeral;
        self.acct_valid += 1;
        self.acct_size += len;
        if dirty {
            self.acct_dirty += 1;
        } else {
            let token = self.next_token;
            self.next_token += 1;
            e.lru_token = Some(token);
            e.last_used = now;
            self.lru.insert(token, *hash);
        }

        let reply = Ok((e.payload_bytes(), e.ephemeral));
        e.respond_loads(&reply);
        self.audit();
    }

    /// Transition a dirty entry to clean
    ///
    /// The entry joins the LRU head and every parked store request is
    /// answered with the digest.
    pub(crate) fn clear_dirty(&mut self, hash: &Digest, now: Instant) {
        let e = self
            .entries
            .get_mut(hash)
            .expect("clear_dirty: entry must exist");
        assert!(e.dirty, "clear_dirty: entry is not dirty");
        assert!(e.valid());

        e.dirty = false;
        self.acct_dirty -= 1;
        let token = self.next_token;
        self.next_token += 1;
        e.lru_token = Some(token);
        e.last_used = now;
        self.lru.insert(token, *hash);

        let result = Ok(e.hash);
        e.respond_stores(&result);
        self.audit();
    }

    /// Unlink and destroy an entry
    ///
    /// Destroying an entry with parked waiters or unpropagated data is a
    /// programming error, fatal by design contract.
    pub(crate) fn remove(&mut self, hash: &Digest) {
        let e = self.entries.get_mut(hash).expect("remove: entry must exist");
        assert!(e.load_waiters.is_empty(), "remove: parked load requests");
        assert!(e.store_waiters.is_empty(), "remove: parked store requests");
        assert!(!e.dirty, "remove: entry is dirty");

        if let Some(token) = e.lru_token.take() {
            self.lru.remove(&token);
        }
        if e.valid() {
            self.acct_size -= e.payload_len() as u64;
            self.acct_valid -= 1;
        }
        self.entries.remove(hash);
        self.audit();
    }

    /// The purge-eligible end of the LRU
    pub(crate) fn lru_coldest(&self) -> Option<Digest> {
        self.lru.iter().next().map(|(_, hash)| *hash)
    }

    /// Remove every valid, clean entry; returns how many were dropped
    pub(crate) fn drop_clean(&mut self) -> usize {
        let hashes: Vec<Digest> = self.lru.values().copied().collect();
        let count = hashes.len();
        for hash in &hashes {
            self.remove(hash);
        }
        count
    }

    /// Re-derive the accounting and check every structural invariant
    #[cfg(debug_assertions)]
    pub(crate) fn audit(&self) {
        let mut size = 0u64;
        let mut valid = 0u32;
        let mut dirty = 0u32;
        for (hash, e) in &self.entries {
            assert_eq!(e.hash, *hash);
            if e.valid() {
                valid += 1;
                size += e.payload_len() as u64;
            }
            if e.dirty {
                assert!(e.valid(), "dirty implies valid: {hash}");
                dirty += 1;
            }
            let on_lru = e
                .lru_token
                .is_some_and(|token| self.lru.get(&token) == Some(hash));
            assert_eq!(
                on_lru,
                e.valid() && !e.dirty,
                "LRU membership must equal valid && clean: {hash}"
            );
            if !e.load_waiters.is_empty() {
                assert!(!e.valid() && e.load_pending, "parked loads on {hash}");
            }
            if !e.store_waiters.is_empty() {
                assert!(e.store_pending, "parked stores on {hash}");
            }
            if e.mmapped() {
                assert!(e.ephemeral && !e.dirty, "mmapped entry state: {hash}");
            }
        }
        assert_eq!(valid, self.acct_valid);
        assert_eq!(dirty, self.acct_dirty);
        assert_eq!(size, self.acct_size);
        assert_eq!(self.lru.len() as u32, valid - dirty);
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn audit(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cascade_common::HashAlgorithm;
    use tokio::sync::oneshot;

    const ALGO: HashAlgorithm = HashAlgorithm::Sha1;

    fn payload(data: &'static [u8]) -> Payload {
        Payload::Message(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_fill_clean_accounting() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");

        table.insert(hash, now);
        assert_eq!(table.acct_valid(), 0);

        table.fill(&hash, payload(b"abc"), false, false, now);
        assert_eq!(table.acct_valid(), 1);
        assert_eq!(table.acct_dirty(), 0);
        assert_eq!(table.acct_size(), 3);
        assert_eq!(table.lru_coldest(), Some(hash));
    }

    #[tokio::test]
    async fn test_fill_dirty_stays_off_lru() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");

        table.insert(hash, now);
        table.fill(&hash, payload(b"abc"), true, false, now);
        assert_eq!(table.acct_dirty(), 1);
        assert!(table.lru_coldest().is_none());

        table.clear_dirty(&hash, now);
        assert_eq!(table.acct_dirty(), 0);
        assert_eq!(table.lru_coldest(), Some(hash));
    }

    #[tokio::test]
    async fn test_fill_answers_parked_loads() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");
        table.insert(hash, now);

        let (tx, mut rx) = oneshot::channel();
        {
            let e = table.get_mut(&hash).unwrap();
            e.load_pending = true;
            e.load_waiters.push(tx);
        }
        table.fill(&hash, payload(b"abc"), false, false, now);

        let (data, ephemeral) = rx.try_recv().unwrap().unwrap();
        assert_eq!(&data[..], b"abc");
        assert!(!ephemeral);
    }

    #[tokio::test]
    async fn test_clear_dirty_answers_parked_stores() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");
        table.insert(hash, now);
        table.fill(&hash, payload(b"abc"), true, false, now);

        let (tx, mut rx) = oneshot::channel();
        {
            let e = table.get_mut(&hash).unwrap();
            e.store_pending = true;
            e.store_waiters.push(tx);
        }
        table.get_mut(&hash).unwrap().store_pending = false;
        table.clear_dirty(&hash, now);

        assert_eq!(rx.try_recv().unwrap().unwrap(), hash);
    }

    #[tokio::test]
    async fn test_lookup_refreshes_lru_order() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let a = ALGO.digest(b"a");
        let b = ALGO.digest(b"b");

        table.insert(a, now);
        table.fill(&a, payload(b"a"), false, false, now);
        table.insert(b, now);
        table.fill(&b, payload(b"b"), false, false, now);
        assert_eq!(table.lru_coldest(), Some(a));

        // Touching `a` makes `b` the coldest
        assert!(table.lookup(&a, now));
        assert_eq!(table.lru_coldest(), Some(b));
    }

    #[tokio::test]
    async fn test_lookup_does_not_touch_dirty() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");
        table.insert(hash, now);
        table.fill(&hash, payload(b"abc"), true, false, now);

        assert!(table.lookup(&hash, now));
        assert!(table.lru_coldest().is_none());
    }

    #[tokio::test]
    async fn test_remove_updates_accounting() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abcd");
        table.insert(hash, now);
        table.fill(&hash, payload(b"abcd"), false, false, now);

        table.remove(&hash);
        assert_eq!(table.len(), 0);
        assert_eq!(table.acct_valid(), 0);
        assert_eq!(table.acct_size(), 0);
        assert!(table.lru_coldest().is_none());
    }

    #[tokio::test]
    async fn test_drop_clean_spares_dirty_and_invalid() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let clean = ALGO.digest(b"clean");
        let dirty = ALGO.digest(b"dirty");
        let invalid = ALGO.digest(b"invalid");

        table.insert(clean, now);
        table.fill(&clean, payload(b"clean"), false, false, now);
        table.insert(dirty, now);
        table.fill(&dirty, payload(b"dirty"), true, false, now);
        table.insert(invalid, now);

        assert_eq!(table.drop_clean(), 1);
        assert!(table.get(&clean).is_none());
        assert!(table.get(&dirty).is_some());
        assert!(table.get(&invalid).is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "remove: entry is dirty")]
    async fn test_remove_dirty_is_fatal() {
        let mut table = CacheTable::new();
        let now = Instant::now();
        let hash = ALGO.digest(b"abc");
        table.insert(hash, now);
        table.fill(&hash, payload(b"abc"), true, false, now);
        table.remove(&hash);
    }
}
