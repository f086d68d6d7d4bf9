//! File-backed backing store
//!
//! One file per blob, named by the hex digest. This is the development
//! backing store a root node registers when `--backing-dir` is set; a
//! production deployment would register a real service instead.

use async_trait::async_trait;
use bytes::Bytes;
use cascade_cache::BlobPeer;
use cascade_common::{Digest, Error, HashAlgorithm, Result};
use std::path::PathBuf;

pub struct FsStore {
    dir: PathBuf,
    algo: HashAlgorithm,
}

impl FsStore {
    /// Open (creating if needed) a blob directory
    pub fn open(dir: impl Into<PathBuf>, algo: HashAlgorithm) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, algo })
    }

    fn blob_path(&self, hash: &Digest) -> PathBuf {
        self.dir.join(hash.to_string())
    }
}

#[async_trait]
impl BlobPeer for FsStore {
    async fn load(&self, hash: Digest) -> Result<(Bytes, bool)> {
        match tokio::fs::read(self.blob_path(&hash)).await {
            Ok(data) => Ok((Bytes::from(data), false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, data: Bytes) -> Result<Digest> {
        let hash = self.algo.digest(&data);
        tokio::fs::write(self.blob_path(&hash), &data).await?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path(), HashAlgorithm::Sha1).unwrap();

        let hash = store.store(Bytes::from_static(b"blob body")).await.unwrap();
        assert_eq!(hash, HashAlgorithm::Sha1.digest(b"blob body"));

        let (data, ephemeral) = store.load(hash).await.unwrap();
        assert_eq!(&data[..], b"blob body");
        assert!(!ephemeral);
    }

    #[tokio::test]
    async fn test_load_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path(), HashAlgorithm::Sha1).unwrap();
        let missing = HashAlgorithm::Sha1.digest(b"never stored");
        assert_eq!(store.load(missing).await, Err(Error::NotFound));
    }
}
