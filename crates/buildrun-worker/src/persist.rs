//! Size-bounded store of persisted build artifacts.
//!
//! Tracks one entry per file in the persist directory and deletes the least
//! recently used files when the total size goes over the quota. A quota of
//! 0 disables eviction on reserve/commit.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

/// Extension of in-progress download files; never tracked.
pub const PART_EXTENSION: &str = "part";

/// Answer to a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Room was made for the artifact.
    Admit,
    /// The artifact alone is larger than the quota.
    Deny,
}

#[derive(Debug, Clone)]
struct Entry {
    size: u64,
    /// Recency stamp; larger is more recent.
    last_access: u64,
}

/// LRU-evicting store of persisted files.
#[derive(Debug)]
pub struct PersistStore {
    quota: u64,
    entries: HashMap<PathBuf, Entry>,
    total: u64,
    clock: u64,
}

impl PersistStore {
    /// Create an empty store with a byte quota (0 = unlimited).
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            entries: HashMap::new(),
            total: 0,
            clock: 0,
        }
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Total size of all tracked entries.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Size recorded for `path`, if tracked.
    pub fn size_of(&self, path: &Path) -> Option<u64> {
        self.entries.get(path).map(|e| e.size)
    }

    /// Track every file already present in `dir`, oldest modification first,
    /// then evict down to the quota. Returns the number of files registered.
    pub fn register_dir_content(&mut self, dir: &Path) -> io::Result<usize> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() || is_part_file(&path) {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path, metadata.len()));
        }
        files.sort();

        let count = files.len();
        for (_, path, size) in files {
            self.insert(path, size);
        }
        debug!(dir = %dir.display(), files = count, total = self.total, "Registered persisted builds");

        if self.quota > 0 {
            self.evict_lru(self.quota, None, 0);
        }
        Ok(count)
    }

    /// Ask for room for an artifact of `expected_size` bytes about to be
    /// written at `path`. Evicts other entries to make room when admitted.
    pub fn reserve(&mut self, path: &Path, expected_size: u64) -> Admission {
        if self.quota == 0 {
            return Admission::Admit;
        }
        if expected_size > self.quota {
            warn!(
                path = %path.display(),
                expected_size,
                quota = self.quota,
                "Artifact is larger than the persist quota"
            );
            return Admission::Deny;
        }

        // An older copy of the same path is about to be replaced.
        let replaced = self.entries.get(path).map_or(0, |e| e.size);
        let limit = self.quota.saturating_add(replaced);
        self.evict_lru(limit, Some(path), expected_size);
        Admission::Admit
    }

    /// Record a fully written artifact, then evict older entries until the
    /// total fits the quota. The committed entry itself is never evicted.
    pub fn commit(&mut self, path: &Path, actual_size: u64) {
        self.insert(path.to_path_buf(), actual_size);
        debug!(path = %path.display(), size = actual_size, total = self.total, "Committed artifact");

        if self.quota > 0 {
            self.evict_lru(self.quota, Some(path), 0);
        }
    }

    /// Mark `path` as most recently used. Returns false if it is not tracked.
    pub fn touch(&mut self, path: &Path) -> bool {
        self.clock += 1;
        let stamp = self.clock;
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.last_access = stamp;
                true
            }
            None => false,
        }
    }

    /// Evict least recently used entries until the total is within `quota`.
    /// Returns the evicted paths, oldest first.
    pub fn evict_until_fits(&mut self, quota: u64) -> Vec<PathBuf> {
        self.evict_lru(quota, None, 0)
    }

    fn insert(&mut self, path: PathBuf, size: u64) {
        self.clock += 1;
        let entry = Entry {
            size,
            last_access: self.clock,
        };
        if let Some(old) = self.entries.insert(path, entry) {
            self.total -= old.size;
        }
        self.total += size;
    }

    /// Evict until `total + incoming <= limit`, sparing `exempt`.
    fn evict_lru(&mut self, limit: u64, exempt: Option<&Path>, incoming: u64) -> Vec<PathBuf> {
        let mut evicted = Vec::new();

        while self.total.saturating_add(incoming) > limit {
            let victim = self
                .entries
                .iter()
                .filter(|(path, _)| Some(path.as_path()) != exempt)
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(path, _)| path.clone());

            let Some(victim) = victim else {
                break;
            };

            if let Some(entry) = self.entries.remove(&victim) {
                self.total -= entry.size;
                match fs::remove_file(&victim) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        // the entry is forgotten regardless
                        warn!(path = %victim.display(), error = %e, "Failed to delete evicted build");
                    }
                }
                info!(path = %victim.display(), size = entry.size, total = self.total, "Evicted build");
            }
            evicted.push(victim);
        }

        evicted
    }
}

/// Returns true for in-progress download files.
pub fn is_part_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(PART_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_commit_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(100);
        let a = write(dir.path(), "a", 40);
        let b = write(dir.path(), "b", 40);
        let c = write(dir.path(), "c", 40);

        store.commit(&a, 40);
        store.commit(&b, 40);
        store.commit(&c, 40);

        assert!(!store.contains(&a));
        assert!(!a.exists());
        assert!(store.contains(&b));
        assert!(store.contains(&c));
        assert_eq!(store.total_bytes(), 80);
    }

    #[test]
    fn test_touch_changes_eviction_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(100);
        let a = write(dir.path(), "a", 40);
        let b = write(dir.path(), "b", 40);
        let c = write(dir.path(), "c", 40);

        store.commit(&a, 40);
        store.commit(&b, 40);
        assert!(store.touch(&a));
        store.commit(&c, 40);

        assert!(store.contains(&a));
        assert!(!store.contains(&b));
        assert_eq!(store.total_bytes(), 80);
    }

    #[test]
    fn test_total_never_exceeds_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(1000);

        for i in 0..50u64 {
            let size = 37 + (i * 53) % 300;
            let path = write(dir.path(), &format!("build-{}", i), size as usize);
            assert_eq!(store.reserve(&path, size), Admission::Admit);
            store.commit(&path, size);
            assert!(store.total_bytes() <= 1000, "total {} after {}", store.total_bytes(), i);
            assert!(store.contains(&path));
        }
    }

    #[test]
    fn test_oversized_entry_is_denied_but_kept_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(100);
        let a = write(dir.path(), "a", 50);
        let big = write(dir.path(), "big", 150);

        store.commit(&a, 50);
        assert_eq!(store.reserve(&big, 150), Admission::Deny);
        store.commit(&big, 150);

        assert_eq!(store.len(), 1);
        assert!(store.contains(&big));
        assert!(!a.exists());
    }

    #[test]
    fn test_reserve_makes_room_ahead_of_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(100);
        let a = write(dir.path(), "a", 60);
        let b = dir.path().join("b");

        store.commit(&a, 60);
        assert_eq!(store.reserve(&b, 60), Admission::Admit);

        assert!(store.is_empty());
        assert!(!a.exists());
    }

    #[test]
    fn test_recommit_same_path_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(0);
        let a = write(dir.path(), "a", 10);

        store.commit(&a, 10);
        store.commit(&a, 25);

        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 25);
    }

    #[test]
    fn test_unlimited_quota_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(0);
        for i in 0..5 {
            let path = write(dir.path(), &format!("b{}", i), 1000);
            store.commit(&path, 1000);
        }
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_delete_failure_still_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(10);
        // a directory cannot be removed with remove_file
        let stuck = dir.path().join("stuck");
        fs::create_dir(&stuck).unwrap();
        let b = write(dir.path(), "b", 10);

        store.commit(&stuck, 10);
        store.commit(&b, 10);

        assert!(!store.contains(&stuck));
        assert!(stuck.exists());
        assert_eq!(store.total_bytes(), 10);
    }

    #[test]
    fn test_register_dir_content_skips_part_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.zip", 10);
        write(dir.path(), "b.zip", 20);
        write(dir.path(), "c.zip.1234.part", 30);
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut store = PersistStore::new(0);
        let count = store.register_dir_content(dir.path()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(store.total_bytes(), 30);
    }

    #[test]
    fn test_evict_until_fits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PersistStore::new(0);
        let a = write(dir.path(), "a", 10);
        let b = write(dir.path(), "b", 10);
        store.commit(&a, 10);
        store.commit(&b, 10);

        let evicted = store.evict_until_fits(15);

        assert_eq!(evicted, vec![a]);
        assert_eq!(store.total_bytes(), 10);
    }
}
