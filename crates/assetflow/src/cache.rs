//! Durable byte-cache abstractions for fetched data.
//!
//! The durable layer is a performance optimization, never a correctness
//! dependency: a missing or failing store degrades transparently to
//! network-only fetches.
//!
//! # Implementations
//!
//! - [`MemoryByteCache`]: In-memory store for tests and short-lived sessions
//! - [`FsByteCache`]: Disk-based store namespaced by a cache version string
//! - [`NoCache`]: Passthrough implementation that caches nothing

use crate::error::{Error, Result};
use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, RwLock},
};

/// Future type for cache get operations.
pub type GetFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + 'a>>;

/// Future type for cache put/clear operations.
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A durable cache for raw fetched bytes, keyed by URL.
///
/// Implementations may store data in memory, on disk, or not at all.
pub trait ByteCache: Send + Sync {
    /// Get previously stored bytes for a URL.
    ///
    /// Returns `Ok(Some(data))` on a hit, `Ok(None)` on a miss, or an error
    /// if the cache operation itself failed (callers treat that as a miss).
    fn get(&self, url: &str) -> GetFuture<'_>;

    /// Store bytes for a URL.
    fn put(&self, url: &str, data: Vec<u8>) -> StoreFuture<'_>;

    /// Drop every entry in the active namespace.
    fn clear(&self) -> StoreFuture<'_>;
}

/// Whether a URL is eligible for the durable layer.
///
/// Only asset-tree-relative URLs are cached; absolute URLs, protocol-relative
/// URLs, and anything attempting to escape the tree bypass the durable layer
/// entirely.
#[must_use]
pub fn is_cacheable(url: &str) -> bool {
    !url.is_empty()
        && !url.contains("://")
        && !url.starts_with('/')
        && !url.split(['/', '\\']).any(|seg| seg == "..")
}

/// A cache that stores nothing (passthrough).
#[derive(Debug, Clone, Default)]
pub struct NoCache;

impl NoCache {
    /// Create a new no-op cache.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ByteCache for NoCache {
    fn get(&self, _url: &str) -> GetFuture<'_> {
        Box::pin(async { Ok(None) })
    }

    fn put(&self, _url: &str, _data: Vec<u8>) -> StoreFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> StoreFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// An in-memory byte cache.
///
/// Suitable for tests and short-lived sessions where disk persistence is
/// not needed. Entries survive until `clear` or process exit.
#[derive(Debug, Default)]
pub struct MemoryByteCache {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryByteCache {
    /// Create a new empty memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for MemoryByteCache {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl ByteCache for MemoryByteCache {
    fn get(&self, url: &str) -> GetFuture<'_> {
        let result = self.entries.read().unwrap().get(url).cloned();
        Box::pin(async move { Ok(result) })
    }

    fn put(&self, url: &str, data: Vec<u8>) -> StoreFuture<'_> {
        self.entries.write().unwrap().insert(url.to_string(), data);
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> StoreFuture<'_> {
        self.entries.write().unwrap().clear();
        Box::pin(async { Ok(()) })
    }
}

/// A disk-based byte cache namespaced by a cache version string.
///
/// Entries live under `{root}/{version}/`, one file per URL, named by a
/// 64-bit FNV-1a hash of the URL. Bumping the version string implicitly
/// invalidates everything stored before: the old namespace directory is
/// simply never read again. [`FsByteCache::clear_stale`] removes old
/// namespace directories as optional housekeeping.
#[derive(Debug, Clone)]
pub struct FsByteCache {
    root: PathBuf,
    version: String,
}

impl FsByteCache {
    /// Create a cache rooted at `root` using `version` as the namespace.
    ///
    /// The namespace directory is created lazily on first store.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
        }
    }

    /// The active namespace version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    fn namespace_dir(&self) -> PathBuf {
        self.root.join(&self.version)
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        self.namespace_dir().join(format!("{:016x}", fnv1a_64(url.as_bytes())))
    }

    /// Remove namespace directories left behind by previous cache versions.
    ///
    /// Failures are reported but are safe to ignore; stale namespaces only
    /// cost disk space.
    pub fn clear_stale(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::Cache {
                    operation: "clear_stale",
                    message: e.to_string(),
                });
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && entry.file_name() != std::ffi::OsStr::new(&self.version) {
                tracing::debug!(namespace = %entry.file_name().to_string_lossy(), "removing stale cache namespace");
                fs::remove_dir_all(&path).map_err(|e| Error::Cache {
                    operation: "clear_stale",
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

impl ByteCache for FsByteCache {
    fn get(&self, url: &str) -> GetFuture<'_> {
        let path = self.entry_path(url);
        Box::pin(async move {
            match fs::read(&path) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Cache {
                    operation: "get",
                    message: e.to_string(),
                }),
            }
        })
    }

    fn put(&self, url: &str, data: Vec<u8>) -> StoreFuture<'_> {
        let dir = self.namespace_dir();
        let path = self.entry_path(url);
        Box::pin(async move {
            let write = || -> io::Result<()> {
                fs::create_dir_all(&dir)?;
                fs::write(&path, &data)
            };
            write().map_err(|e| Error::Cache {
                operation: "put",
                message: e.to_string(),
            })
        })
    }

    fn clear(&self) -> StoreFuture<'_> {
        let dir = self.namespace_dir();
        Box::pin(async move {
            match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Cache {
                    operation: "clear",
                    message: e.to_string(),
                }),
            }
        })
    }
}

/// 64-bit FNV-1a hash, used to derive stable filenames from URLs.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cacheability_policy() {
        assert!(is_cacheable("meshes/00ab.json"));
        assert!(is_cacheable("manifest.json"));
        assert!(!is_cacheable("https://other-origin.example/m.json"));
        assert!(!is_cacheable("/absolute/path.json"));
        assert!(!is_cacheable("../escape.json"));
        assert!(!is_cacheable("meshes/../../escape.json"));
        assert!(!is_cacheable(""));
    }

    #[tokio::test]
    async fn test_no_cache_is_passthrough() {
        let cache = NoCache::new();
        cache.put("a", vec![1, 2, 3]).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryByteCache::new();
        assert!(cache.is_empty());

        cache.put("meshes/a.bin", vec![1, 2, 3]).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("meshes/a.bin").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(cache.get("meshes/b.bin").await.unwrap(), None);

        cache.clear().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_fs_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsByteCache::new(dir.path(), "v1");

        assert_eq!(cache.get("meshes/a.bin").await.unwrap(), None);
        cache.put("meshes/a.bin", vec![9, 8, 7]).await.unwrap();
        assert_eq!(
            cache.get("meshes/a.bin").await.unwrap(),
            Some(vec![9, 8, 7])
        );

        cache.clear().await.unwrap();
        assert_eq!(cache.get("meshes/a.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_version_bump_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let old = FsByteCache::new(dir.path(), "v1");
        old.put("meshes/a.bin", vec![1]).await.unwrap();

        // Same root, new namespace: the old entry is invisible.
        let new = FsByteCache::new(dir.path(), "v2");
        assert_eq!(new.get("meshes/a.bin").await.unwrap(), None);

        // Housekeeping removes the stale namespace.
        new.clear_stale().unwrap();
        assert!(!dir.path().join("v1").exists());
    }
}
