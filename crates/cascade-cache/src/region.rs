//! Memory-mapped file regions
//!
//! A region maps one file read-only and indexes it as `blob_size`-sized
//! slices, each addressed by its digest (the last slice may be short).
//! The root cache consults the region table before the backing store, so
//! a mapped file can be broadcast through the overlay without ever being
//! copied into the cache.
//!
//! Regions are shared: the table registration and any cache entry filled
//! from the region each hold an `Arc`. The file is unmapped when the last
//! holder drops, so unmapping a path with live entries merely defers the
//! release.

use cascade_common::{Digest, Error, HashAlgorithm, Result};
use cascade_proto::MmapStats;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One file mapped into memory at a fixed blob size
pub struct Region {
    path: PathBuf,
    map: Mmap,
    blob_size: usize,
    algo: HashAlgorithm,
    /// Per-slice digests, in file order
    hashes: Vec<Digest>,
    /// digest -> slice index; duplicate digests keep the first slice
    index: HashMap<Digest, usize>,
}

impl Region {
    /// Map `path` and hash its slices
    #[allow(unsafe_code)]
    fn map(path: &Path, blob_size: usize, algo: HashAlgorithm) -> Result<Arc<Self>> {
        if blob_size == 0 {
            return Err(Error::invalid("blob size must be > 0"));
        }
        let file = File::open(path)?;
        let file_size = file.metadata()?.len() as usize;
        if file_size == 0 {
            return Err(Error::invalid("cannot map an empty file"));
        }
        // SAFETY: the mapping is read-only and shared; a file mutated
        // behind our back yields bytes whose digest no longer matches,
        // which the load path detects by revalidation before responding.
        let map = unsafe { Mmap::map(&file) }?;

        let blob_count = file_size.div_ceil(blob_size);
        let mut region = Self {
            path: path.to_path_buf(),
            map,
            blob_size,
            algo,
            hashes: Vec::with_capacity(blob_count),
            index: HashMap::with_capacity(blob_count),
        };
        for i in 0..blob_count {
            let digest = algo.digest(region.slice(i));
            region.hashes.push(digest);
            region.index.entry(digest).or_insert(i);
        }
        Ok(Arc::new(region))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn file_size(&self) -> usize {
        self.map.len()
    }

    /// The bytes of one blob-sized slice
    #[must_use]
    pub fn slice(&self, index: usize) -> &[u8] {
        let offset = index * self.blob_size;
        let len = self.blob_size.min(self.map.len() - offset);
        &self.map[offset..offset + len]
    }

    /// Find the slice recorded for a digest
    #[must_use]
    pub fn lookup(&self, hash: &Digest) -> Option<usize> {
        self.index.get(hash).copied()
    }

    /// Recompute the slice digest and compare against the recorded one
    ///
    /// Returns false when the file content has changed since mapping.
    #[must_use]
    pub fn validate(&self, index: usize, expect: &Digest) -> bool {
        self.algo.digest(self.slice(index)) == *expect
    }

    /// Blobref strings for every slice, in file order
    #[must_use]
    pub fn blobrefs(&self) -> Vec<String> {
        self.hashes
            .iter()
            .map(|digest| self.algo.blobref(digest))
            .collect()
    }
}

/// The set of active regions, keyed by path
pub struct RegionTable {
    algo: HashAlgorithm,
    regions: HashMap<PathBuf, Arc<Region>>,
}

impl RegionTable {
    #[must_use]
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            algo,
            regions: HashMap::new(),
        }
    }

    /// Map a file; fails `AlreadyExists` when the path is already mapped
    pub fn map(&mut self, path: &Path, blob_size: usize) -> Result<Arc<Region>> {
        if self.regions.contains_key(path) {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        let region = Region::map(path, blob_size, self.algo)?;
        debug!(
            path = %path.display(),
            blobs = region.blob_count(),
            size = region.file_size(),
            "mapped file"
        );
        self.regions.insert(path.to_path_buf(), Arc::clone(&region));
        Ok(region)
    }

    /// Drop a mapping registration
    ///
    /// Cache entries still referencing the region keep it alive; the
    /// actual munmap happens when the last of them is removed.
    pub fn unmap(&mut self, path: &Path) -> Result<()> {
        if self.regions.remove(path).is_none() {
            return Err(Error::invalid(format!(
                "path is not mapped: {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "unmapped file");
        Ok(())
    }

    /// Probe every region for a digest
    #[must_use]
    pub fn lookup(&self, hash: &Digest) -> Option<(Arc<Region>, usize)> {
        self.regions
            .values()
            .find_map(|region| region.lookup(hash).map(|i| (Arc::clone(region), i)))
    }

    #[must_use]
    pub fn stats(&self) -> MmapStats {
        MmapStats {
            regions: self.regions.len() as u64,
            blobs: self.regions.values().map(|r| r.blob_count() as u64).sum(),
            size: self.regions.values().map(|r| r.file_size() as u64).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ALGO: HashAlgorithm = HashAlgorithm::Sha1;

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_map_slices_and_short_tail() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();

        assert_eq!(region.blob_count(), 3);
        assert_eq!(region.file_size(), 10);
        assert_eq!(region.slice(0), b"0123");
        assert_eq!(region.slice(1), b"4567");
        assert_eq!(region.slice(2), b"89");
    }

    #[test]
    fn test_map_digests_match_slices() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();

        let d1 = ALGO.digest(b"4567");
        assert_eq!(region.lookup(&d1), Some(1));
        let (found, index) = table.lookup(&d1).unwrap();
        assert_eq!(index, 1);
        assert!(found.validate(index, &d1));
    }

    #[test]
    fn test_map_duplicate_slices_first_wins() {
        // Two identical 4-byte slices, then a distinct tail
        let file = temp_file(b"aaaaaaaabb");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();

        assert_eq!(region.blob_count(), 3);
        let dup = ALGO.digest(b"aaaa");
        assert_eq!(region.lookup(&dup), Some(0));
    }

    #[test]
    fn test_map_empty_file_fails() {
        let file = temp_file(b"");
        let mut table = RegionTable::new(ALGO);
        assert!(matches!(
            table.map(file.path(), 4),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_map_zero_blob_size_fails() {
        let file = temp_file(b"abc");
        let mut table = RegionTable::new(ALGO);
        assert!(matches!(
            table.map(file.path(), 0),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_map_duplicate_path_fails() {
        let file = temp_file(b"abcdef");
        let mut table = RegionTable::new(ALGO);
        table.map(file.path(), 4).unwrap();
        assert!(matches!(
            table.map(file.path(), 4),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_unmap_unknown_path_fails() {
        let mut table = RegionTable::new(ALGO);
        assert!(matches!(
            table.unmap(Path::new("/no/such/file")),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_unmap_defers_release_to_last_holder() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();

        table.unmap(file.path()).unwrap();
        assert!(table.lookup(&ALGO.digest(b"0123")).is_none());
        // The clone stands in for a cache entry still holding the region
        assert_eq!(region.slice(0), b"0123");
    }

    #[test]
    fn test_validate_detects_mutation() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();
        let d0 = ALGO.digest(b"0123");
        assert!(region.validate(0, &d0));

        std::fs::write(file.path(), b"XXXX456789").unwrap();
        assert!(!region.validate(0, &d0));
    }

    #[test]
    fn test_blobrefs_in_file_order() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        let region = table.map(file.path(), 4).unwrap();

        let refs = region.blobrefs();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0], ALGO.blobref(&ALGO.digest(b"0123")));
        assert_eq!(refs[2], ALGO.blobref(&ALGO.digest(b"89")));
    }

    #[test]
    fn test_stats() {
        let file = temp_file(b"0123456789");
        let mut table = RegionTable::new(ALGO);
        table.map(file.path(), 4).unwrap();

        let stats = table.stats();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.blobs, 3);
        assert_eq!(stats.size, 10);
    }
}
