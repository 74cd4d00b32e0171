//! Durable sync state.
//!
//! [`SyncState`] records, for every conversation we have mirrored, the
//! fingerprint of the content last written and the filename it was written
//! to. It is the single source of truth for what we believe exists on the
//! destination.
//!
//! The whole state is written on every save: serialize to a temporary file
//! in the same directory, `fsync` it, then atomically rename it over the
//! canonical path. A crash at any point leaves either the old or the new
//! file, never a torn one.
//!
//! Loading never fails. A missing, unreadable, corrupt, or
//! wrong-version file degrades to empty state: the next cycle re-uploads
//! everything, which is safe.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::fingerprint::Fingerprint;

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 1;

/// Per-conversation sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    #[serde(alias = "omi_hash")]
    pub content_hash: Fingerprint,
    pub filename: String,
}

/// Everything we know about the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversations: BTreeMap<String, SyncEntry>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_sync: None,
            conversations: BTreeMap::new(),
        }
    }
}

impl SyncState {
    pub fn entry(&self, id: &str) -> Option<&SyncEntry> {
        self.conversations.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: SyncEntry) {
        self.conversations.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<SyncEntry> {
        self.conversations.remove(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Filenames owned by live entries, lowercased for collision checks.
    pub fn filenames(&self) -> HashSet<String> {
        self.conversations
            .values()
            .map(|e| e.filename.to_lowercase())
            .collect()
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.last_sync = Some(now);
    }
}

/// Reads and writes [`SyncState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state, degrading to empty state on any problem.
    pub fn load(&self) -> SyncState {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no state file, starting fresh");
            return SyncState::default();
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state file, starting fresh");
                return SyncState::default();
            }
        };

        match serde_json::from_str::<SyncState>(&content) {
            Ok(state) if state.version == STATE_VERSION => {
                info!(
                    path = %self.path.display(),
                    conversations = state.len(),
                    "loaded sync state"
                );
                state
            }
            Ok(state) => {
                warn!(
                    path = %self.path.display(),
                    found = state.version,
                    expected = STATE_VERSION,
                    "state schema version mismatch, starting fresh"
                );
                SyncState::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                SyncState::default()
            }
        }
    }

    /// Write the full state atomically.
    ///
    /// On error the previous file at [`path`](Self::path) is untouched.
    pub fn save(&self, state: &SyncState) -> Result<()> {
        self.save_with(state, replace_file)
    }

    /// Write `state` to a synced temporary file, then hand it to `commit`
    /// to move it over [`path`](Self::path). The temporary file is removed
    /// when `commit` fails.
    fn save_with<F>(&self, state: &SyncState, commit: F) -> Result<()>
    where
        F: FnOnce(NamedTempFile, &Path) -> std::io::Result<()>,
    {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(state).context("Failed to serialize sync state")?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&json)
            .context("Failed to write temporary state file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush temporary state file")?;
        commit(tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        debug!(path = %self.path.display(), conversations = state.len(), "state saved");
        Ok(())
    }
}

fn replace_file(tmp: NamedTempFile, path: &Path) -> std::io::Result<()> {
    tmp.persist(path).map(|_| ()).map_err(|e| e.error)
}
