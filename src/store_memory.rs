//! In-memory [`DestinationStore`] implementation for tests and dry runs.
//!
//! Files live in a `BTreeMap` behind `std::sync::RwLock`. Directories are
//! tracked explicitly so that writing into a missing directory fails the
//! way a WebDAV server answers `409 Conflict`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::DestinationError;
use crate::traits::DestinationStore;

/// In-memory destination.
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Snapshot of all files, keyed by path.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.files.read().map(|f| f.clone()).unwrap_or_default()
    }

    /// File content as UTF-8 text, if present.
    pub fn text(&self, path: &str) -> Option<String> {
        let files = self.files.read().ok()?;
        files
            .get(&normalize(path))
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    /// Place a file directly, bypassing counters (test setup, manual edits).
    pub fn put(&self, path: &str, content: impl Into<Vec<u8>>) {
        let path = normalize(path);
        if let Ok(mut dirs) = self.dirs.write() {
            for parent in parents(&path) {
                dirs.insert(parent);
            }
        }
        if let Ok(mut files) = self.files.write() {
            files.insert(path, content.into());
        }
    }

    /// Remove a file directly, bypassing counters.
    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.files.write().ok()?.remove(&normalize(path))
    }

    /// Number of successful `write` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful `delete` calls.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// Every ancestor directory of `path`, including `/`.
fn parents(path: &str) -> Vec<String> {
    let mut out = vec!["/".to_string()];
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

fn poisoned() -> DestinationError {
    DestinationError::Io("memory store lock poisoned".to_string())
}

#[async_trait]
impl DestinationStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, path: &str) -> Result<bool, DestinationError> {
        let path = normalize(path);
        let in_files = self.files.read().map_err(|_| poisoned())?.contains_key(&path);
        let in_dirs = self.dirs.read().map_err(|_| poisoned())?.contains(&path);
        Ok(in_files || in_dirs)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, DestinationError> {
        let path = normalize(path);
        self.files
            .read()
            .map_err(|_| poisoned())?
            .get(&path)
            .cloned()
            .ok_or(DestinationError::NotFound(path))
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), DestinationError> {
        let path = normalize(path);
        let parent = parents(&path).pop().unwrap_or_else(|| "/".to_string());
        if !self.dirs.read().map_err(|_| poisoned())?.contains(&parent) {
            return Err(DestinationError::Http {
                status: 409,
                path,
            });
        }

        let mut files = self.files.write().map_err(|_| poisoned())?;
        if !overwrite && files.contains_key(&path) {
            return Err(DestinationError::AlreadyExists(path));
        }
        files.insert(path, bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DestinationError> {
        let path = normalize(path);
        let removed = self.files.write().map_err(|_| poisoned())?.remove(&path);
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(DestinationError::NotFound(path)),
        }
    }

    async fn ensure_directory(&self, path: &str) -> Result<(), DestinationError> {
        let path = normalize(path);
        let mut dirs = self.dirs.write().map_err(|_| poisoned())?;
        for parent in parents(&path) {
            dirs.insert(parent);
        }
        dirs.insert(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_requires_directory() {
        let store = MemoryStore::new();
        let err = store.write("/notes/a.md", b"x".to_vec(), false).await;
        assert!(matches!(err, Err(DestinationError::Http { status: 409, .. })));

        store.ensure_directory("/notes").await.unwrap();
        store.write("/notes/a.md", b"x".to_vec(), false).await.unwrap();
        assert_eq!(store.read("/notes/a.md").await.unwrap(), b"x");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_write_without_overwrite_refuses_existing() {
        let store = MemoryStore::new();
        store.put("/notes/a.md", "old");
        let err = store.write("/notes/a.md", b"new".to_vec(), false).await;
        assert!(matches!(err, Err(DestinationError::AlreadyExists(_))));
        assert_eq!(store.text("/notes/a.md").as_deref(), Some("old"));

        store.write("/notes/a.md", b"new".to_vec(), true).await.unwrap();
        assert_eq!(store.text("/notes/a.md").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let store = MemoryStore::new();
        store.put("/notes/a.md", "x");
        store.delete("/notes/a.md").await.unwrap();
        assert!(!store.exists("/notes/a.md").await.unwrap());
        assert!(store.delete("/notes/a.md").await.unwrap_err().is_not_found());
        assert!(store.read("/notes/a.md").await.unwrap_err().is_not_found());
        assert_eq!(store.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_directory_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_directory("/a/b/c").await.unwrap();
        store.ensure_directory("/a/b/c/").await.unwrap();
        assert!(store.exists("/a/b").await.unwrap());
        assert!(store.exists("/a/b/c").await.unwrap());
    }
}
