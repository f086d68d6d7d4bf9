//! Request and response message definitions
//!
//! Digests travel as raw bytes; the receiving cache validates the width
//! against its configured hash algorithm and fails `Protocol` on mismatch.

use bytes::Bytes;
use cascade_common::Error;
use serde::{Deserialize, Serialize};

/// A request envelope: sequence number plus body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Echoed in the matching response
    pub seq: u64,
    pub body: Request,
}

/// A response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub body: Response,
}

/// Requests accepted by a cache node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Fetch a blob by digest
    Load { hash: Bytes },
    /// Insert a blob; the response carries its digest
    Store { data: Bytes },
    /// Block until no dirty entries remain
    Flush,
    /// Evict every valid, clean entry
    DropCache,
    /// Cache accounting snapshot
    StatsGet,
    /// Announce a backing store service (root only)
    RegisterBacking { name: String },
    /// Withdraw the backing store service (root only)
    UnregisterBacking,
    /// Map a file into the cache; responds with its blobrefs (root only)
    Map { path: String, blob_size: u64 },
    /// Drop a file mapping (root only)
    Unmap { path: String },
}

/// Responses produced by a cache node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Load { data: Bytes, ephemeral: bool },
    Store { hash: Bytes },
    /// Success with no payload (flush, dropcache, register, unmap, ...)
    Ok,
    Stats(CacheStats),
    Map { blobrefs: Vec<String> },
    Error(Error),
}

impl Response {
    /// Wrap a core result whose success carries no payload
    #[must_use]
    pub fn from_empty(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::Error(e),
        }
    }
}

/// Cache accounting snapshot, as responded to `stats-get`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total entries, valid or not
    pub count: u64,
    /// Entries holding a payload
    pub valid: u32,
    /// Entries not yet propagated upstream or to backing
    pub dirty: u32,
    /// Sum of valid payload lengths in bytes
    pub size: u64,
    /// Upstream/backing stores currently in flight
    #[serde(rename = "flush-batch-count")]
    pub flush_batch_count: u32,
    pub mmap: MmapStats,
}

/// Mmap region store snapshot, nested under stats
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MmapStats {
    pub regions: u64,
    pub blobs: u64,
    pub size: u64,
}
