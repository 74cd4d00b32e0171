//! Gateway traits for the two remote systems.
//!
//! The engine only talks to the outside world through these traits, so the
//! same reconciliation logic runs against the real HTTP gateways, the
//! in-memory store, and test doubles.
//!
//! ```text
//! ┌──────────────┐   fetch_page    ┌────────────┐   exists/read/write/delete   ┌──────────────────┐
//! │ RecordSource │ ──────────────▶ │   Engine   │ ───────────────────────────▶ │ DestinationStore │
//! │ (Omi API)    │                 │            │                              │ (WebDAV, memory) │
//! └──────────────┘                 └────────────┘                              └──────────────────┘
//! ```

use async_trait::async_trait;

use crate::error::{DestinationError, SourceError};
use crate::models::Record;

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

/// A paginated, read-only listing of conversation records.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use omi_sync::error::SourceError;
/// use omi_sync::models::Record;
/// use omi_sync::traits::RecordSource;
///
/// pub struct Fixed(Vec<Record>);
///
/// #[async_trait]
/// impl RecordSource for Fixed {
///     fn name(&self) -> &str { "fixed" }
///
///     async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError> {
///         Ok(self.0.iter().skip(offset).take(limit).cloned().collect())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Short label used in log lines.
    fn name(&self) -> &str;

    /// Fetch up to `limit` records starting at `offset`.
    ///
    /// An empty page marks the end of the listing. Throttling is reported
    /// as [`SourceError::RateLimited`]; the caller decides whether to wait
    /// and retry.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Destination
// ═══════════════════════════════════════════════════════════════════════

/// A hierarchical file store addressed by `/`-separated paths.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Short label used in log lines.
    fn name(&self) -> &str;

    async fn exists(&self, path: &str) -> Result<bool, DestinationError>;

    /// Read a file. Missing files are [`DestinationError::NotFound`].
    async fn read(&self, path: &str) -> Result<Vec<u8>, DestinationError>;

    /// Write a file. With `overwrite = false` an existing file is left alone
    /// and [`DestinationError::AlreadyExists`] is returned.
    async fn write(&self, path: &str, bytes: Vec<u8>, overwrite: bool)
        -> Result<(), DestinationError>;

    /// Delete a file. Missing files are [`DestinationError::NotFound`].
    async fn delete(&self, path: &str) -> Result<(), DestinationError>;

    /// Create a directory and its parents. Existing directories are fine.
    async fn ensure_directory(&self, path: &str) -> Result<(), DestinationError>;
}

/// Join a directory and a filename with exactly one `/` between them.
pub fn join_path(dir: &str, filename: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", filename.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir, filename.trim_start_matches('/'))
    }
}
