//! The peer interface a cache propagates through
//!
//! A non-root cache points at its TBON parent; the root points at whatever
//! backing store is registered. `CacheHandle` implements this trait too,
//! so caches chain into a tree in-process.

use async_trait::async_trait;
use bytes::Bytes;
use cascade_common::{Digest, Result};

/// Upstream parent or backing store
#[async_trait]
pub trait BlobPeer: Send + Sync {
    /// Fetch a blob by digest; the flag reports whether the peer considers
    /// the blob ephemeral (not held by the backing store)
    async fn load(&self, hash: Digest) -> Result<(Bytes, bool)>;

    /// Store a blob; returns the digest computed by the peer
    async fn store(&self, data: Bytes) -> Result<Digest>;
}
