//! Cache engines: load, store, flush, purge, backing lifecycle
//!
//! `ContentCache` owns every piece of cache state and is only ever driven
//! from one task. Upstream/backing RPCs are spawned off and complete as
//! `Event`s injected back through the same channel the service loop polls,
//! so completion handling is just another synchronous state transition.
//!
//! Propagation differs by role: a non-root cache write-throughs dirty
//! entries to its TBON parent and answers the requester only once the
//! parent has them; the root answers immediately and write-backs to the
//! backing store through a bounded flush window.

use crate::config::CacheConfig;
use crate::entry::{FlushResponder, LoadResponder, Payload, StoreResponder};
use crate::peer::BlobPeer;
use crate::region::RegionTable;
use crate::table::CacheTable;
use bytes::Bytes;
use cascade_common::{Digest, Error, Result};
use cascade_proto::CacheStats;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

/// Completion of an upstream/backing RPC, delivered back to the cache task
pub enum Event {
    LoadDone {
        hash: Digest,
        result: Result<(Bytes, bool)>,
    },
    StoreDone {
        hash: Digest,
        result: Result<Digest>,
    },
}

pub struct ContentCache {
    config: CacheConfig,
    rank: u32,
    table: CacheTable,
    regions: RegionTable,
    /// TBON parent; present exactly when rank > 0
    upstream: Option<Arc<dyn BlobPeer>>,
    /// Registered backing store; root only
    backing: Option<Arc<dyn BlobPeer>>,
    /// Latched backing store name; immutable once set
    backing_name: Option<String>,
    /// Dirty entries waiting for a slot in the batch window
    flush_queue: VecDeque<Digest>,
    flush_waiters: Vec<FlushResponder>,
    /// Upstream/backing stores currently in flight
    flush_batch_count: u32,
    /// Last store failure, cleared when a store succeeds again
    flush_err: Option<Error>,
    events: mpsc::UnboundedSender<Event>,
}

impl ContentCache {
    /// Create a cache for one overlay node
    ///
    /// Non-root nodes must have an upstream parent.
    pub fn new(
        config: CacheConfig,
        rank: u32,
        upstream: Option<Arc<dyn BlobPeer>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        assert!(rank == 0 || upstream.is_some(), "non-root requires upstream");
        let regions = RegionTable::new(config.hash);
        let backing_name = config.backing_name.clone();
        Self {
            config,
            rank,
            table: CacheTable::new(),
            regions,
            upstream,
            backing: None,
            backing_name,
            flush_queue: VecDeque::new(),
            flush_waiters: Vec::new(),
            flush_batch_count: 0,
            flush_err: None,
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Whether a backing store is currently registered
    pub fn backing_registered(&self) -> bool {
        self.backing.is_some()
    }

    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::LoadDone { hash, result } => self.on_load_done(&hash, result),
            Event::StoreDone { hash, result } => self.on_store_done(&hash, result),
        }
    }

    fn now() -> Instant {
        Instant::now()
    }

    /// The peer this node propagates through
    fn peer(&self) -> Option<Arc<dyn BlobPeer>> {
        if self.rank == 0 {
            self.backing.clone()
        } else {
            self.upstream.clone()
        }
    }

    // ---- load engine ----

    /// Handle a load-by-digest request
    pub fn handle_load(&mut self, raw: &[u8], resp: LoadResponder) {
        let now = Self::now();
        if raw.len() != self.config.hash.digest_size() {
            let _ = resp.send(Err(Error::protocol("invalid digest width")));
            return;
        }
        let hash = Digest::from_slice(raw).expect("width checked");

        if !self.table.lookup(&hash, now) {
            // Miss. The root first consults the mmap regions; with neither
            // a region hit nor a backing store there is nowhere to go.
            let region_hit = if self.rank == 0 {
                self.regions.lookup(&hash)
            } else {
                None
            };
            if self.rank == 0 && region_hit.is_none() && self.backing.is_none() {
                let _ = resp.send(Err(Error::NotFound));
                return;
            }
            self.table.insert(hash, now);
            if let Some((region, index)) = region_hit {
                self.table
                    .fill(&hash, Payload::Region { region, index }, false, true, now);
            }
        }

        let valid = self.table.get(&hash).is_some_and(|e| e.valid());
        if !valid {
            if let Err(err) = self.start_load(hash) {
                let err = if self.rank == 0 && err == Error::NoBackingService {
                    Error::NotFound
                } else {
                    err
                };
                let _ = resp.send(Err(err));
                return;
            }
            self.table
                .get_mut(&hash)
                .expect("entry present")
                .load_waiters
                .push(resp);
            self.table.audit();
            return;
        }

        let (data, ephemeral, mmapped) = {
            let e = self.table.get(&hash).expect("entry present");
            (e.payload_bytes(), e.ephemeral, e.region_ref())
        };
        // Mapped files can change on disk behind the cache; re-validate
        // before serving the bytes.
        if let Some((region, index)) = mmapped
            && !region.validate(index, &hash)
        {
            let _ = resp.send(Err(Error::invalid("mapped file content has changed")));
            return;
        }
        let _ = resp.send(Ok((data, ephemeral)));
    }

    /// Start the upstream/backing fetch for an invalid entry
    ///
    /// At most one load per digest is ever in flight.
    fn start_load(&mut self, hash: Digest) -> Result<()> {
        if self.table.get(&hash).expect("entry present").load_pending {
            return Ok(());
        }
        let peer = self.peer().ok_or(Error::NoBackingService)?;
        self.table.get_mut(&hash).expect("entry present").load_pending = true;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peer.load(hash).await;
            let _ = events.send(Event::LoadDone { hash, result });
        });
        Ok(())
    }

    fn on_load_done(&mut self, hash: &Digest, result: Result<(Bytes, bool)>) {
        let now = Self::now();
        let Some(e) = self.table.get_mut(hash) else {
            debug_assert!(false, "load completion for unknown entry");
            return;
        };
        e.load_pending = false;

        match result {
            Ok((data, ephemeral)) => {
                // The entry may have become valid while the load was in
                // flight: a store filled it and already answered any
                // parked loads. Nothing to do then.
                if !e.valid() {
                    debug_assert!(!e.dirty);
                    self.table
                        .fill(hash, Payload::Message(data), false, ephemeral, now);
                }
            }
            Err(err) => {
                let err = if self.rank == 0 && err == Error::NoBackingService {
                    Error::NotFound
                } else {
                    err
                };
                if !err.is_not_found() {
                    error!(%hash, %err, "load failed");
                }
                if e.valid() {
                    // A concurrent store filled the entry; its payload is
                    // authoritative and the waiters are long answered.
                    debug_assert!(e.load_waiters.is_empty());
                    return;
                }
                e.respond_loads(&Err(err));
                self.table.remove(hash);
            }
        }
    }

    // ---- store engine ----

    /// Handle a store request carrying a raw payload
    pub fn handle_store(&mut self, data: Bytes, resp: StoreResponder) {
        let now = Self::now();
        if data.len() as u64 > self.config.blob_size_limit {
            let _ = resp.send(Err(Error::PayloadTooLarge {
                limit: self.config.blob_size_limit,
            }));
            return;
        }
        let hash = self.config.hash.digest(&data);

        // An ephemeral entry is about to be superseded by a first-class
        // payload; drop it so the new entry propagates normally.
        let mut present = self.table.lookup(&hash, now);
        if present && self.table.get(&hash).expect("entry present").ephemeral {
            self.table.remove(&hash);
            present = false;
        }
        if !present {
            self.table.insert(hash, now);
        }

        // Fill an invalid entry, created just above or left by a load that
        // still awaits its response. Parked loads are answered here.
        if !self.table.get(&hash).expect("entry present").valid() {
            self.table
                .fill(&hash, Payload::Message(data), true, false, now);
        }

        if self.table.get(&hash).expect("entry present").dirty {
            if self.rank > 0 || self.backing.is_some() {
                if let Err(err) = self.start_store(hash) {
                    let _ = resp.send(Err(err));
                    return;
                }
                if self.rank > 0 {
                    // Write-through: answered by clear_dirty once the
                    // parent confirms.
                    self.table
                        .get_mut(&hash)
                        .expect("entry present")
                        .store_waiters
                        .push(resp);
                    self.table.audit();
                    return;
                }
            }
            // Root without backing: park on the flush queue so the entry
            // is attempted if a backing store registers later.
            if self.rank == 0 && self.backing.is_none() {
                self.flush_append(hash);
            }
        }
        let _ = resp.send(Ok(hash));
    }

    /// Start propagating a valid entry upstream or to backing
    ///
    /// At the root, stores beyond the batch window defer to the flush
    /// queue instead.
    fn start_store(&mut self, hash: Digest) -> Result<()> {
        let e = self.table.get(&hash).expect("entry present");
        assert!(e.valid());
        if e.store_pending {
            return Ok(());
        }
        if self.rank == 0 && self.flush_batch_count >= self.config.flush_batch_limit {
            self.flush_append(hash);
            return Ok(());
        }
        let peer = self.peer().ok_or(Error::NoBackingService)?;
        let data = e.payload_bytes();
        self.table.get_mut(&hash).expect("entry present").store_pending = true;
        self.flush_batch_count += 1;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peer.store(data).await;
            let _ = events.send(Event::StoreDone { hash, result });
        });
        Ok(())
    }

    fn on_store_done(&mut self, hash: &Digest, result: Result<Digest>) {
        let now = Self::now();
        let Some(e) = self.table.get_mut(hash) else {
            debug_assert!(false, "store completion for unknown entry");
            return;
        };
        e.store_pending = false;
        assert!(self.flush_batch_count > 0);
        self.flush_batch_count -= 1;

        // The peer hashing the payload differently from us means the blob
        // is retrievable under the wrong key; that is corruption.
        let outcome = match result {
            Ok(remote) if remote == *hash => Ok(()),
            Ok(_) => Err(Error::Integrity),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                self.table.clear_dirty(hash, now);
                self.flush_err = None;
                self.resume_flush();
            }
            Err(err) => {
                if self.rank == 0 && err == Error::NoBackingService {
                    debug!("store: backing store service unavailable");
                } else {
                    error!(%hash, %err, "store failed");
                }
                let e = self.table.get_mut(hash).expect("entry present");
                e.respond_stores(&Err(err.clone()));
                // Outstanding flushes are assumed to fail the same way
                self.fail_flush_waiters(&err);
                self.flush_err = Some(err);
                self.resume_flush();
            }
        }
    }

    // ---- flush engine ----

    /// Append to the flush queue, removing any stale position first
    fn flush_append(&mut self, hash: Digest) {
        let queued = self
            .table
            .get(&hash)
            .is_some_and(|e| e.in_flush_queue);
        if queued {
            self.flush_queue.retain(|h| *h != hash);
        }
        self.flush_queue.push_back(hash);
        if let Some(e) = self.table.get_mut(&hash) {
            e.in_flush_queue = true;
        }
    }

    /// Start queued stores until the batch window is full
    ///
    /// Store-start failures other than the unrecoverable ones are latched
    /// and surfaced to the caller; draining continues.
    fn cache_flush(&mut self) -> Result<()> {
        let mut last_err = None;
        while self.flush_batch_count < self.config.flush_batch_limit {
            let Some(hash) = self.flush_queue.pop_front() else {
                break;
            };
            if let Some(e) = self.table.get_mut(&hash) {
                e.in_flush_queue = false;
            }
            if let Err(err) = self.start_store(hash) {
                let fatal = err.is_flush_fatal();
                last_err = Some(err);
                if fatal {
                    break;
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// After a store completes: answer flush requests if the cache is
    /// clean (or cannot drain), otherwise keep the window full.
    fn resume_flush(&mut self) {
        if self.table.acct_dirty() == 0 || (self.rank == 0 && self.backing.is_none()) {
            self.flush_respond();
        } else {
            let _ = self.cache_flush();
        }
    }

    /// Answer every parked flush request according to the dirty count
    fn flush_respond(&mut self) {
        let waiters = std::mem::take(&mut self.flush_waiters);
        if waiters.is_empty() {
            return;
        }
        if self.table.acct_dirty() == 0 {
            for waiter in waiters.into_iter().rev() {
                let _ = waiter.send(Ok(()));
            }
        } else {
            let err = if self.rank == 0 && self.backing.is_none() {
                Error::NotImplemented
            } else {
                Error::Io("dirty entries remain".into())
            };
            for waiter in waiters.into_iter().rev() {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }

    fn fail_flush_waiters(&mut self, err: &Error) {
        for waiter in std::mem::take(&mut self.flush_waiters).into_iter().rev() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Handle a flush request: block the requester until no dirty entries
    /// remain
    pub fn handle_flush(&mut self, resp: FlushResponder) {
        if self.rank == 0 && self.backing.is_none() {
            let _ = resp.send(Err(Error::NotImplemented));
            return;
        }
        if self.table.acct_dirty() > 0 {
            if let Err(err) = self.cache_flush() {
                let _ = resp.send(Err(err));
                return;
            }
            // With nothing in flight a latched store error is the primary
            // failure; report it rather than parking forever.
            if self.flush_batch_count == 0
                && let Some(err) = self.flush_err.clone()
            {
                let _ = resp.send(Err(err));
                return;
            }
            self.flush_waiters.push(resp);
            return;
        }
        let _ = resp.send(Ok(()));
    }

    // ---- backing store lifecycle ----

    /// Register a backing store service (root only)
    ///
    /// The first registered name is latched for the process lifetime;
    /// registration drains dirty entries accumulated while unbacked.
    pub fn handle_register_backing(
        &mut self,
        name: &str,
        peer: Arc<dyn BlobPeer>,
        resp: oneshot::Sender<Result<()>>,
    ) {
        if self.rank != 0 {
            let _ = resp.send(Err(Error::InvalidRole));
            return;
        }
        if self.backing.is_some() {
            let _ = resp.send(Err(Error::Busy));
            return;
        }
        match &self.backing_name {
            None => self.backing_name = Some(name.to_string()),
            Some(bound) if bound != name => {
                let _ = resp.send(Err(Error::NameMismatch {
                    bound: bound.clone(),
                }));
                return;
            }
            Some(_) => {}
        }
        self.backing = Some(peer);
        debug!(name, "backing store enabled");
        let _ = resp.send(Ok(()));
        let _ = self.cache_flush();
    }

    /// Withdraw the backing store service (root only)
    pub fn handle_unregister_backing(&mut self, resp: oneshot::Sender<Result<()>>) {
        if self.rank != 0 {
            let _ = resp.send(Err(Error::InvalidRole));
            return;
        }
        if self.backing.is_none() {
            let _ = resp.send(Err(Error::invalid("backing store is not active")));
            return;
        }
        self.backing = None;
        debug!("backing store disabled");
        let _ = resp.send(Ok(()));
        if self.table.acct_dirty() > 0 {
            error!(count = self.table.acct_dirty(), "unflushable dirty entries");
        }
        self.fail_flush_waiters(&Error::NotImplemented);
    }

    // ---- dropcache / stats / mmap surface ----

    /// Evict everything that can go without data loss: exactly the valid,
    /// clean entries, which is exactly the LRU
    pub fn handle_dropcache(&mut self, resp: oneshot::Sender<Result<()>>) {
        let total = self.table.len();
        let dropped = self.table.drop_clean();
        debug!(dropped, total, "dropcache");
        let _ = resp.send(Ok(()));
    }

    pub fn handle_stats(&mut self, resp: oneshot::Sender<CacheStats>) {
        let _ = resp.send(CacheStats {
            count: self.table.len() as u64,
            valid: self.table.acct_valid(),
            dirty: self.table.acct_dirty(),
            size: self.table.acct_size(),
            flush_batch_count: self.flush_batch_count,
            mmap: self.regions.stats(),
        });
    }

    /// Map a file into the region store (root only)
    pub fn handle_map(
        &mut self,
        path: &str,
        blob_size: u64,
        resp: oneshot::Sender<Result<Vec<String>>>,
    ) {
        if self.rank != 0 {
            let _ = resp.send(Err(Error::NotImplemented));
            return;
        }
        let result = self
            .regions
            .map(Path::new(path), blob_size as usize)
            .map(|region| region.blobrefs());
        let _ = resp.send(result);
    }

    /// Drop a file mapping (root only)
    pub fn handle_unmap(&mut self, path: &str, resp: oneshot::Sender<Result<()>>) {
        if self.rank != 0 {
            let _ = resp.send(Err(Error::NotImplemented));
            return;
        }
        let _ = resp.send(self.regions.unmap(Path::new(path)));
    }

    // ---- heartbeat ----

    /// Periodic tick: refresh gauges, purge the LRU tail
    pub fn handle_heartbeat(&mut self) {
        self.update_gauges();
        self.purge(Self::now());
    }

    /// Evict LRU-tail entries while the cache is over its purge target,
    /// sparing anything used more recently than the age threshold
    ///
    /// The LRU holds only valid, clean entries, so the walk stops at the
    /// first entry failing either condition.
    fn purge(&mut self, now: Instant) {
        while let Some(hash) = self.table.lru_coldest() {
            let e = self.table.get(&hash).expect("entry present");
            if self.table.acct_size() <= self.config.purge_target_size
                || now.duration_since(e.last_used) < self.config.purge_old_entry
            {
                break;
            }
            assert!(e.valid() && !e.dirty);
            self.table.remove(&hash);
        }
    }

    fn update_gauges(&self) {
        metrics::gauge!("cascade_cache_count").set(self.table.len() as f64);
        metrics::gauge!("cascade_cache_valid").set(f64::from(self.table.acct_valid()));
        metrics::gauge!("cascade_cache_dirty").set(f64::from(self.table.acct_dirty()));
        metrics::gauge!("cascade_cache_size").set(self.table.acct_size() as f64);
        metrics::gauge!("cascade_cache_flush_batch_count").set(f64::from(self.flush_batch_count));
    }

    /// Service teardown: parked flush requests are answered with a
    /// shutdown error. Entry waiter channels close when the table drops,
    /// which requesters observe as the same.
    pub fn shutdown(&mut self) {
        self.fail_flush_waiters(&Error::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn table_audit(&self) {
        self.table.audit();
    }

    #[cfg(test)]
    pub(crate) fn flush_batch_count(&self) -> u32 {
        self.flush_batch_count
    }
}
