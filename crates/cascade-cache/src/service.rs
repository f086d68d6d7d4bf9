//! Cache service actor and handle
//!
//! `CacheService::spawn` starts the single task that owns a
//! `ContentCache` and drives it from three sources: the command channel
//! fed by `CacheHandle`s, the completion events of upstream/backing RPCs,
//! and the heartbeat interval. `CacheHandle` is the cloneable async API;
//! it also implements `BlobPeer`, so a child cache can use another cache's
//! handle as its TBON parent.

use crate::cache::{ContentCache, Event};
use crate::config::CacheConfig;
use crate::entry::{FlushResponder, LoadResponder, StoreResponder};
use crate::peer::BlobPeer;
use async_trait::async_trait;
use bytes::Bytes;
use cascade_common::{Digest, Error, Result};
use cascade_proto::CacheStats;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Requests dispatched to the cache task
pub enum Command {
    Load {
        hash: Bytes,
        resp: LoadResponder,
    },
    Store {
        data: Bytes,
        resp: StoreResponder,
    },
    Flush {
        resp: FlushResponder,
    },
    DropCache {
        resp: oneshot::Sender<Result<()>>,
    },
    Stats {
        resp: oneshot::Sender<CacheStats>,
    },
    RegisterBacking {
        name: String,
        peer: Arc<dyn BlobPeer>,
        resp: oneshot::Sender<Result<()>>,
    },
    UnregisterBacking {
        resp: oneshot::Sender<Result<()>>,
    },
    Map {
        path: String,
        blob_size: u64,
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    Unmap {
        path: String,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// The service task wrapper
pub struct CacheService;

impl CacheService {
    /// Spawn the cache task for one overlay node and return its handle
    ///
    /// The task exits when every handle is dropped; parked flush requests
    /// are then answered with `Shutdown` and waiter channels close.
    pub fn spawn(config: CacheConfig, rank: u32, upstream: Option<Arc<dyn BlobPeer>>) -> CacheHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let heartbeat_period = config.heartbeat_period_clamped();
        let mut cache = ContentCache::new(config, rank, upstream, event_tx);

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_period);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; swallow it so the first
            // purge happens one full period in.
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => dispatch(&mut cache, cmd),
                        None => break,
                    },
                    Some(event) = event_rx.recv() => cache.on_event(event),
                    _ = heartbeat.tick() => cache.handle_heartbeat(),
                }
            }
            debug!(rank, "cache service stopping");
            cache.shutdown();
        });

        CacheHandle { tx: cmd_tx }
    }
}

fn dispatch(cache: &mut ContentCache, cmd: Command) {
    match cmd {
        Command::Load { hash, resp } => cache.handle_load(&hash, resp),
        Command::Store { data, resp } => cache.handle_store(data, resp),
        Command::Flush { resp } => cache.handle_flush(resp),
        Command::DropCache { resp } => cache.handle_dropcache(resp),
        Command::Stats { resp } => cache.handle_stats(resp),
        Command::RegisterBacking { name, peer, resp } => {
            cache.handle_register_backing(&name, peer, resp);
        }
        Command::UnregisterBacking { resp } => cache.handle_unregister_backing(resp),
        Command::Map {
            path,
            blob_size,
            resp,
        } => cache.handle_map(&path, blob_size, resp),
        Command::Unmap { path, resp } => cache.handle_unmap(&path, resp),
    }
}

/// Cloneable async API to a running cache service
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CacheHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::Shutdown)
    }

    /// Fetch a blob by wire digest bytes
    pub async fn load_raw(&self, hash: Bytes) -> Result<(Bytes, bool)> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Load { hash, resp })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Fetch a blob by digest; returns payload and the ephemeral flag
    pub async fn load(&self, hash: &Digest) -> Result<(Bytes, bool)> {
        self.load_raw(Bytes::copy_from_slice(hash.as_bytes())).await
    }

    /// Store a blob; returns its digest
    pub async fn store(&self, data: Bytes) -> Result<Digest> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Store { data, resp })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Block until no dirty entries remain
    pub async fn flush(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Flush { resp })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Evict every valid, clean entry
    pub async fn drop_cache(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::DropCache { resp })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Accounting snapshot
    pub async fn stats(&self) -> Result<CacheStats> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Stats { resp })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Announce a backing store service (root only)
    pub async fn register_backing(&self, name: &str, peer: Arc<dyn BlobPeer>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::RegisterBacking {
            name: name.to_string(),
            peer,
            resp,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Withdraw the backing store service (root only)
    pub async fn unregister_backing(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::UnregisterBacking { resp })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Map a file into the cache; returns its blobrefs (root only)
    pub async fn map(&self, path: &str, blob_size: u64) -> Result<Vec<String>> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Map {
            path: path.to_string(),
            blob_size,
            resp,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Drop a file mapping (root only)
    pub async fn unmap(&self, path: &str) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Unmap {
            path: path.to_string(),
            resp,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }
}

/// A cache handle is itself a blob peer, so caches chain into a tree
#[async_trait]
impl BlobPeer for CacheHandle {
    async fn load(&self, hash: Digest) -> Result<(Bytes, bool)> {
        CacheHandle::load(self, &hash).await
    }

    async fn store(&self, data: Bytes) -> Result<Digest> {
        CacheHandle::store(self, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_common::HashAlgorithm;

    const ALGO: HashAlgorithm = HashAlgorithm::Sha1;

    /// Root cache without backing, child chained through the root handle:
    /// the smallest overlay tree.
    fn spawn_tree() -> (CacheHandle, CacheHandle) {
        let root = CacheService::spawn(CacheConfig::default(), 0, None);
        let child = CacheService::spawn(CacheConfig::default(), 1, Some(Arc::new(root.clone())));
        (root, child)
    }

    #[tokio::test]
    async fn test_chained_store_reaches_root() {
        let (root, child) = spawn_tree();

        let hash = child.store(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(hash, ALGO.digest(b"abc"));

        // Write-through: by the time the child answered, the root has it
        let stats = root.stats().await.unwrap();
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.dirty, 1, "root is unbacked; entry stays dirty");

        let child_stats = child.stats().await.unwrap();
        assert_eq!(child_stats.dirty, 0, "child turned clean on confirm");
    }

    #[tokio::test]
    async fn test_chained_load_climbs_to_root() {
        let (root, child) = spawn_tree();

        let hash = root.store(Bytes::from_static(b"payload")).await.unwrap();
        let (data, ephemeral) = child.load(&hash).await.unwrap();
        assert_eq!(&data[..], b"payload");
        assert!(!ephemeral);

        // Second load is served from the child's own cache
        let (data, _) = child.load(&hash).await.unwrap();
        assert_eq!(&data[..], b"payload");
        assert_eq!(child.stats().await.unwrap().valid, 1);
    }

    #[tokio::test]
    async fn test_chained_load_miss_propagates_not_found() {
        let (_root, child) = spawn_tree();
        let missing = ALGO.digest(b"never stored");
        assert_eq!(child.load(&missing).await, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_ephemeral_flag_propagates_down_the_tree() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let (root, child) = spawn_tree();
        let blobrefs = root
            .map(&file.path().display().to_string(), 4)
            .await
            .unwrap();
        assert_eq!(blobrefs.len(), 3);

        let (_, d1) = cascade_common::parse_blobref(&blobrefs[1]).unwrap();
        let (data, ephemeral) = child.load(&d1).await.unwrap();
        assert_eq!(&data[..], b"4567");
        assert!(ephemeral, "ephemeral bit survives the hop");
    }

    #[tokio::test]
    async fn test_flush_end_to_end() {
        let backing = CacheService::spawn(CacheConfig::default(), 0, None);
        let root = CacheService::spawn(CacheConfig::default(), 0, None);
        root.register_backing("cache-peer", Arc::new(backing.clone()))
            .await
            .unwrap();

        for data in [&b"one"[..], b"two", b"three"] {
            root.store(Bytes::copy_from_slice(data)).await.unwrap();
        }
        root.flush().await.unwrap();

        assert_eq!(root.stats().await.unwrap().dirty, 0);
        assert_eq!(backing.stats().await.unwrap().valid, 3);
    }

    #[tokio::test]
    async fn test_drop_cache_via_handle() {
        let (root, _child) = spawn_tree();
        let hash = root.store(Bytes::from_static(b"abc")).await.unwrap();
        // Unbacked root keeps the entry dirty; dropcache spares it
        root.drop_cache().await.unwrap();
        let (data, _) = root.load(&hash).await.unwrap();
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn test_register_backing_via_handle_enforces_role() {
        let (_root, child) = spawn_tree();
        let peer = CacheService::spawn(CacheConfig::default(), 0, None);
        let result = child.register_backing("store", Arc::new(peer)).await;
        assert_eq!(result, Err(Error::InvalidRole));
    }
}
