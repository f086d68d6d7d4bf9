//! Cascade Protocol - wire messages and framing
//!
//! The cache surface is a small set of tagged request/response messages
//! carried in length-prefixed bincode frames. Every request carries a
//! sequence number echoed by its response, so a single connection can
//! pipeline requests whose responses complete out of order (a parked load
//! must not block later traffic).

pub mod codec;
pub mod message;

pub use codec::{DEFAULT_MAX_FRAME, read_frame, write_frame};
pub use message::{CacheStats, MmapStats, Request, RequestFrame, Response, ResponseFrame};
