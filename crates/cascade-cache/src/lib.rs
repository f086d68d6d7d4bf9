//! Cascade Cache - hierarchical content-addressed blob cache
//!
//! This crate implements the in-memory storage and propagation layer that
//! sits at each node of the tree-based overlay:
//! - Content-addressed cache table with LRU accounting
//! - Load/store engines with request coalescing and asynchronous fills
//! - Write-through (non-root) / write-back (root) propagation
//! - Batched flush engine with backpressure
//! - Memory-mapped file regions served as ephemeral entries
//! - Heartbeat-driven purge of least-recently-used entries
//!
//! All cache state is owned by a single service task; upstream and backing
//! RPCs complete as events delivered back onto that task, so no state is
//! ever touched from two tasks at once.

pub mod cache;
pub mod config;
pub mod peer;
pub mod region;
pub mod service;

mod entry;
mod table;

pub use cache::{ContentCache, Event};
pub use config::CacheConfig;
pub use entry::{FlushResponder, LoadReply, LoadResponder, Payload, StoreResponder};
pub use peer::BlobPeer;
pub use region::{Region, RegionTable};
pub use service::{CacheHandle, CacheService, Command};
