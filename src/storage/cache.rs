use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Digest;

/// Local content cache keyed by digest. Entries hold decoded content.
pub trait LocalCache: Send + Sync + 'static {
    fn contains(&self, digest: &Digest) -> bool;

    fn read(&self, digest: &Digest) -> io::Result<Vec<u8>>;

    /// Stores `content`. A reader never sees a partially written entry.
    fn write(&self, digest: &Digest, content: &[u8]) -> io::Result<()>;
}

impl<C: LocalCache + ?Sized> LocalCache for Arc<C> {
    fn contains(&self, digest: &Digest) -> bool {
        (**self).contains(digest)
    }

    fn read(&self, digest: &Digest) -> io::Result<Vec<u8>> {
        (**self).read(digest)
    }

    fn write(&self, digest: &Digest, content: &[u8]) -> io::Result<()> {
        (**self).write(digest, content)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Digest, Arc<[u8]>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalCache for MemoryCache {
    fn contains(&self, digest: &Digest) -> bool {
        self.entries.lock().unwrap().contains_key(digest)
    }

    fn read(&self, digest: &Digest) -> io::Result<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(digest)
            .map(|content| content.to_vec())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{digest} not cached")))
    }

    fn write(&self, digest: &Digest, content: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(digest.clone(), content.into());
        Ok(())
    }
}

/// One file per digest in a flat directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: Utf8PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, digest: &Digest) -> Utf8PathBuf {
        self.root.join(digest.as_str())
    }
}

impl LocalCache for DiskCache {
    fn contains(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    fn read(&self, digest: &Digest) -> io::Result<Vec<u8>> {
        fs::read(self.path(digest))
    }

    fn write(&self, digest: &Digest, content: &[u8]) -> io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path(digest)).map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HashAlgo, digest};

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        let key = digest(b"x", HashAlgo::Sha1);

        assert!(!cache.contains(&key));
        assert_eq!(cache.read(&key).unwrap_err().kind(), io::ErrorKind::NotFound);

        cache.write(&key, b"x").unwrap();
        assert!(cache.contains(&key));
        assert_eq!(cache.read(&key).unwrap(), b"x");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disk_cache_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("cache")).unwrap();
        let cache = DiskCache::new(&root).unwrap();
        let key = digest(b"content", HashAlgo::Sha1);

        cache.write(&key, b"content").unwrap();
        cache.write(&key, b"content").unwrap();

        assert!(cache.contains(&key));
        assert_eq!(cache.read(&key).unwrap(), b"content");
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);
    }
}
