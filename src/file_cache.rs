//! C11: open-file cache.
//!
//! LRU + path-hash index (§4.10). Re-expressed per Design Notes §9: the
//! red-black tree keyed by path hash collapses to a `HashMap<PathBuf, _>`
//! (exact lookup by path is all this cache ever does — no range queries),
//! and the LRU queue is a `VecDeque<PathBuf>` reordered on touch rather than
//! an intrusive link.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::FileCacheConfig;

struct CacheEntry {
    file: File,
    inode: u64,
    mtime: i64,
    size: u64,
    uses: u32,
    refcount: u32,
    last_used: Instant,
}

/// A lookup result: either a borrow of the cache's own open fd (valid until
/// [`FileCache::release`] drops its refcount to zero and it's evicted), or,
/// before `min_uses` has been reached, a freshly opened file this caller
/// owns outright and must close themselves (by dropping it).
pub struct CachedFile {
    pub fd: RawFd,
    pub size: u64,
    owned: Option<File>,
}

pub struct FileCache {
    entries: HashMap<PathBuf, CacheEntry>,
    lru: VecDeque<PathBuf>,
    pending: HashMap<PathBuf, u32>,
    config: FileCacheConfig,
}

impl FileCache {
    pub fn new(config: FileCacheConfig) -> FileCache {
        FileCache {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            pending: HashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `open_cached_file(cache, name, info, pool)`: find or create an entry.
    /// A hit whose `stat` still matches reuses the cached fd; a stale or
    /// absent entry opens fresh. Below `min_uses` requests for a path are
    /// served uncached (§4.10).
    pub fn open_cached_file(&mut self, path: &Path) -> io::Result<CachedFile> {
        let meta = std::fs::metadata(path)?;
        let inode = meta.ino();
        let mtime = meta.mtime();
        let size = meta.size();

        if let Some(entry) = self.entries.get_mut(path) {
            if entry.inode == inode && entry.mtime == mtime {
                entry.uses += 1;
                entry.refcount += 1;
                entry.last_used = Instant::now();
                let fd = entry.file.as_raw_fd();
                self.touch_lru(path);
                return Ok(CachedFile {
                    fd,
                    size: entry.size,
                    owned: None,
                });
            }
            // Stale: `stat` moved on, the entry's fd no longer reflects the
            // file at this path. Evict it; the code below reopens fresh.
            self.entries.remove(path);
            self.lru.retain(|p| p != path);
        }

        let count = self.pending.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        if *count < self.config.min_uses {
            let file = File::open(path)?;
            let fd = file.as_raw_fd();
            return Ok(CachedFile {
                fd,
                size,
                owned: Some(file),
            });
        }

        self.pending.remove(path);
        let file = File::open(path)?;
        let entry = CacheEntry {
            file,
            inode,
            mtime,
            size,
            uses: 1,
            refcount: 1,
            last_used: Instant::now(),
        };
        let fd = entry.file.as_raw_fd();
        self.entries.insert(path.to_path_buf(), entry);
        self.lru.push_back(path.to_path_buf());
        self.enforce_max();

        Ok(CachedFile {
            fd,
            size,
            owned: None,
        })
    }

    /// Decrement a cache hit's refcount once the caller (per-pool cleanup,
    /// §4.10) is done with the fd.
    pub fn release(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    fn touch_lru(&mut self, path: &Path) {
        if let Some(pos) = self.lru.iter().position(|p| p == path) {
            let moved = self.lru.remove(pos).unwrap();
            self.lru.push_back(moved);
        }
    }

    fn enforce_max(&mut self) {
        while self.entries.len() > self.config.max {
            let evictable = self
                .lru
                .iter()
                .position(|p| self.entries.get(p).map(|e| e.refcount == 0).unwrap_or(true));
            match evictable {
                Some(pos) => {
                    let path = self.lru.remove(pos).unwrap();
                    self.entries.remove(&path);
                }
                // Every entry is still referenced; cannot shrink further
                // right now.
                None => break,
            }
        }
    }

    /// Evict entries idle longer than `inactive` with no active referrers.
    pub fn evict_inactive(&mut self, now: Instant) {
        let inactive = self.config.inactive;
        let stale: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refcount == 0 && now.duration_since(e.last_used) >= inactive)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            self.entries.remove(&path);
            self.lru.retain(|p| p != &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(contents: &[u8]) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(contents)
    }

    /// A tiny scratch-file helper, grounded in the same "write to a temp
    /// path, clean up on drop" pattern the teacher's own tests use for
    /// filesystem-touching cases.
    mod tempfile_path {
        use std::io::Write;
        use std::path::{Path, PathBuf};

        pub struct TempFile {
            path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &[u8]) -> TempFile {
                let mut path = std::env::temp_dir();
                path.push(format!("veyrond-file-cache-test-{}", unique_suffix()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents).unwrap();
                TempFile { path }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }

            pub fn touch_mtime(&self) {
                let now = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
                let _ = filetime_touch(&self.path, now);
            }
        }

        fn filetime_touch(path: &Path, time: std::time::SystemTime) -> std::io::Result<()> {
            let f = std::fs::OpenOptions::new().write(true).open(path)?;
            f.set_modified(time)
        }

        fn unique_suffix() -> u64 {
            use rand::Rng;
            rand::rng().random()
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn below_min_uses_serves_uncached_copies() {
        let tmp = scratch_file(b"hello");
        let mut cache = FileCache::new(FileCacheConfig {
            max: 16,
            inactive: std::time::Duration::from_secs(60),
            min_uses: 3,
        });

        let first = cache.open_cached_file(tmp.path()).unwrap();
        assert!(first.owned.is_some());
        assert_eq!(cache.len(), 0);

        let _second = cache.open_cached_file(tmp.path()).unwrap();
        assert_eq!(cache.len(), 0);

        let third = cache.open_cached_file(tmp.path()).unwrap();
        assert!(third.owned.is_none(), "third request reaches min_uses and gets cached");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_mtime_reopens_rather_than_reusing_fd() {
        let tmp = scratch_file(b"v1");
        let mut cache = FileCache::new(FileCacheConfig {
            max: 16,
            inactive: std::time::Duration::from_secs(60),
            min_uses: 1,
        });

        let first = cache.open_cached_file(tmp.path()).unwrap();
        let first_fd = first.fd;
        assert_eq!(cache.len(), 1);

        tmp.touch_mtime();
        let second = cache.open_cached_file(tmp.path()).unwrap();
        assert_ne!(second.fd, first_fd, "a changed mtime must produce a fresh fd");
    }

    #[test]
    fn enforce_max_evicts_unreferenced_entries_first() {
        let tmp_a = scratch_file(b"a");
        let tmp_b = scratch_file(b"b");
        let mut cache = FileCache::new(FileCacheConfig {
            max: 1,
            inactive: std::time::Duration::from_secs(60),
            min_uses: 1,
        });

        let _a = cache.open_cached_file(tmp_a.path()).unwrap();
        cache.release(tmp_a.path());
        let _b = cache.open_cached_file(tmp_b.path()).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(!cache.entries.contains_key(tmp_a.path()));
    }
}
