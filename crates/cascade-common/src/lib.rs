//! Cascade Common - Shared types and utilities
//!
//! This crate provides the error definitions, hash algorithm selection,
//! and digest types used across all Cascade components.

pub mod error;
pub mod hash;

pub use error::{Error, Result};
pub use hash::{Digest, HashAlgorithm, MAX_DIGEST_SIZE, parse_blobref};
