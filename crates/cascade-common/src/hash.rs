//! Hash algorithms and digests for Cascade
//!
//! A Cascade instance picks one hash algorithm at init; every digest in the
//! cache and mmap index has that algorithm's width. Digests of different
//! widths never mix within one instance.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Widest digest any supported algorithm produces
pub const MAX_DIGEST_SIZE: usize = 32;

/// Hash algorithm selected at instance init
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Look up an algorithm by its canonical name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Canonical name, as used in blobref strings and config
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Fixed digest width in bytes
    #[must_use]
    pub const fn digest_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hash a payload into a digest of this algorithm's width
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Digest {
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        let len = self.digest_size();
        match self {
            Self::Sha1 => bytes[..len].copy_from_slice(&Sha1::digest(data)),
            Self::Sha256 => bytes[..len].copy_from_slice(&Sha256::digest(data)),
        }
        Digest {
            len: len as u8,
            bytes,
        }
    }

    /// Render a digest as a blobref string, e.g. `sha1-0123abcd...`
    #[must_use]
    pub fn blobref(self, digest: &Digest) -> String {
        format!("{}-{}", self.name(), hex::encode(digest.as_bytes()))
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::invalid(format!("unknown hash algorithm: {s}")))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-width hash digest; the cache key
///
/// Width is set by the algorithm that produced it. Unused trailing bytes are
/// zero so derived equality and hashing are well defined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    len: u8,
    bytes: [u8; MAX_DIGEST_SIZE],
}

impl Digest {
    /// Construct from raw bytes; fails on widths no algorithm produces
    #[must_use]
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() || raw.len() > MAX_DIGEST_SIZE {
            return None;
        }
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// The digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Digest width in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.len as usize
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Parse a blobref string into its algorithm and digest
///
/// The digest width must match the named algorithm.
pub fn parse_blobref(s: &str) -> Result<(HashAlgorithm, Digest)> {
    let (name, hexpart) = s
        .split_once('-')
        .ok_or_else(|| Error::protocol(format!("malformed blobref: {s}")))?;
    let algo = HashAlgorithm::from_name(name)
        .ok_or_else(|| Error::protocol(format!("unknown blobref hash: {name}")))?;
    let raw = hex::decode(hexpart).map_err(|_| Error::protocol("malformed blobref hex"))?;
    if raw.len() != algo.digest_size() {
        return Err(Error::protocol(format!(
            "blobref digest width {} does not match {}",
            raw.len(),
            algo.name()
        )));
    }
    Ok((algo, Digest::from_slice(&raw).expect("width checked")))
}
