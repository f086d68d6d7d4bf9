//! Cache entries and payload ownership

use crate::region::Region;
use bytes::Bytes;
use cascade_common::{Digest, Error};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Answer to a load: payload bytes plus the ephemeral flag
pub type LoadReply = (Bytes, bool);

/// Channel end a parked load request is answered on
pub type LoadResponder = oneshot::Sender<Result<LoadReply, Error>>;

/// Channel end a parked store request is answered on
pub type StoreResponder = oneshot::Sender<Result<Digest, Error>>;

/// Channel end a parked flush request is answered on
pub type FlushResponder = oneshot::Sender<Result<(), Error>>;

/// The object whose lifetime keeps an entry's payload bytes alive
///
/// `Bytes` is refcounted, so holding the message payload here is the
/// no-copy equivalent of keeping the request or response message pinned.
/// Region payloads hold the mapping itself; the `Arc` defers munmap until
/// the entry is gone.
pub enum Payload {
    /// Bytes supplied by a store request or delivered by a load response
    Message(Bytes),
    /// One blob-sized slice of a memory-mapped file
    Region { region: Arc<Region>, index: usize },
}

impl Payload {
    /// Borrow the payload bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Message(data) => data,
            Self::Region { region, index } => region.slice(*index),
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload as sendable bytes; region slices are copied out here, at
    /// response time, never earlier
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Message(data) => data.clone(),
            Self::Region { .. } => Bytes::copy_from_slice(self.as_slice()),
        }
    }
}

/// One cache entry per unique digest
///
/// Created invalid by a load miss, or valid+dirty by a store. State bits
/// and waiter stacks are mutated only through `CacheTable` and the engine
/// code in `cache.rs`, all on the service task.
pub(crate) struct CacheEntry {
    pub(crate) hash: Digest,
    /// `Some` exactly when the entry is valid
    pub(crate) payload: Option<Payload>,
    /// Payload not yet propagated upstream or to backing
    pub(crate) dirty: bool,
    /// Payload is not, and will not be, held by the backing store
    pub(crate) ephemeral: bool,
    pub(crate) load_pending: bool,
    pub(crate) store_pending: bool,
    /// Parked load requests, answered LIFO at fill time
    pub(crate) load_waiters: Vec<LoadResponder>,
    /// Parked store requests, answered LIFO when the entry turns clean
    pub(crate) store_waiters: Vec<StoreResponder>,
    pub(crate) last_used: Instant,
    /// Key into the LRU order map; `Some` iff valid and clean
    pub(crate) lru_token: Option<u64>,
    pub(crate) in_flush_queue: bool,
}

impl CacheEntry {
    pub(crate) fn new(hash: Digest, now: Instant) -> Self {
        Self {
            hash,
            payload: None,
            dirty: false,
            ephemeral: false,
            load_pending: false,
            store_pending: false,
            load_waiters: Vec::new(),
            store_waiters: Vec::new(),
            last_used: now,
            lru_token: None,
            in_flush_queue: false,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.payload.is_some()
    }

    pub(crate) fn mmapped(&self) -> bool {
        matches!(self.payload, Some(Payload::Region { .. }))
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Payload::len)
    }

    /// Clone out the payload for a response
    pub(crate) fn payload_bytes(&self) -> Bytes {
        self.payload
            .as_ref()
            .map_or_else(Bytes::new, Payload::to_bytes)
    }

    /// The region backing this entry, if mmapped
    pub(crate) fn region_ref(&self) -> Option<(Arc<Region>, usize)> {
        match &self.payload {
            Some(Payload::Region { region, index }) => Some((Arc::clone(region), *index)),
            _ => None,
        }
    }

    /// Answer and drain every parked load request, LIFO
    ///
    /// A requester that disconnected dropped its receiver; the failed send
    /// is a no-op.
    pub(crate) fn respond_loads(&mut self, result: &Result<LoadReply, Error>) {
        while let Some(waiter) = self.load_waiters.pop() {
            let _ = waiter.send(result.clone());
        }
    }

    /// Answer and drain every parked store request, LIFO
    pub(crate) fn respond_stores(&mut self, result: &Result<Digest, Error>) {
        while let Some(waiter) = self.store_waiters.pop() {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_common::HashAlgorithm;

    #[tokio::test]
    async fn test_entry_starts_invalid() {
        let hash = HashAlgorithm::Sha1.digest(b"x");
        let e = CacheEntry::new(hash, Instant::now());
        assert!(!e.valid());
        assert!(!e.dirty);
        assert!(!e.mmapped());
        assert_eq!(e.payload_len(), 0);
    }

    #[tokio::test]
    async fn test_respond_loads_is_lifo() {
        let hash = HashAlgorithm::Sha1.digest(b"x");
        let mut e = CacheEntry::new(hash, Instant::now());
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        e.load_waiters.push(tx1);
        e.load_waiters.push(tx2);

        // Second waiter is answered first; both get the same payload
        e.respond_loads(&Ok((Bytes::from_static(b"data"), false)));
        assert!(e.load_waiters.is_empty());
        let (data1, _) = rx1.try_recv().unwrap().unwrap();
        let (data2, _) = rx2.try_recv().unwrap().unwrap();
        assert_eq!(data1, data2);
    }

    #[tokio::test]
    async fn test_respond_to_disconnected_waiter() {
        let hash = HashAlgorithm::Sha1.digest(b"x");
        let mut e = CacheEntry::new(hash, Instant::now());
        let (tx, rx) = oneshot::channel();
        drop(rx);
        e.store_waiters.push(tx);
        // Must not panic
        e.respond_stores(&Ok(hash));
    }
}
