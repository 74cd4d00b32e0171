//! Reconciliation engine.
//!
//! One call to [`Engine::run_cycle`] converges the destination with the
//! source:
//!
//! ```text
//! Preparing ──▶ Fetching ──▶ Diffing ──▶ Applying ──▶ Persisting ──▶ Done
//!     │             │
//!     └─────────────┴──▶ FailedFetch   (nothing applied, state untouched)
//! ```
//!
//! - **Fetching** pages through the source until an empty page. Any page
//!   failure aborts the cycle: a partial listing must never be read as
//!   "these conversations were deleted".
//! - **Diffing** classifies every fetched record as create, update, or
//!   unchanged by comparing fingerprints with the sync state; state entries
//!   missing from the listing become deletes. New filenames are reserved
//!   here, before anything runs.
//! - **Applying** runs the actions concurrently (bounded). Each success
//!   updates the shared state and saves it immediately, so a crash never
//!   causes already-synced records to be uploaded again. A failed action is
//!   logged and left for the next cycle.
//! - **Persisting** stamps `last_sync` and saves once more.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DestinationError, SourceError};
use crate::filename::{allocate, date_suffix};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::models::Record;
use crate::render::{parse_document, render, user_fields_from, FrontMatter};
use crate::state::{StateStore, SyncEntry, SyncState};
use crate::traits::{join_path, DestinationStore, RecordSource};

/// How many times a create may find its reserved path taken by an
/// unrelated file before giving up for this cycle.
const MAX_CREATE_ATTEMPTS: usize = 10;

/// Phase of a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Preparing,
    Fetching,
    Diffing,
    Applying,
    Persisting,
    Done,
    FailedFetch,
}

/// Counts reported at the end of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Actions not started because shutdown was requested.
    pub skipped: usize,
}

impl CycleSummary {
    /// Number of destination writes and deletes performed.
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Result of [`Engine::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// The cycle stopped before applying anything.
    Aborted { phase: CyclePhase, reason: String },
}

impl CycleOutcome {
    pub fn summary(&self) -> Option<&CycleSummary> {
        match self {
            CycleOutcome::Completed(s) => Some(s),
            CycleOutcome::Aborted { .. } => None,
        }
    }
}

/// Why a full listing could not be obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("fetch cancelled by shutdown")]
    Cancelled,
}

/// One planned change.
#[derive(Debug, Clone)]
pub enum Action {
    Create {
        record: Record,
        fingerprint: Fingerprint,
        filename: String,
    },
    Update {
        record: Record,
        fingerprint: Fingerprint,
        filename: String,
    },
    Delete {
        id: String,
        filename: String,
    },
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::Create { record, .. } | Action::Update { record, .. } => &record.id,
            Action::Delete { id, .. } => id,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Action::Create { filename, .. }
            | Action::Update { filename, .. }
            | Action::Delete { filename, .. } => filename,
        }
    }
}

/// Output of the diffing phase.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub unchanged: usize,
    /// Lowercased filenames owned by state entries or reserved by creates.
    pub reserved: HashSet<String>,
}

/// Classify a complete listing against the sync state.
///
/// Must only be called with a listing that was fetched in full.
pub fn plan(records: Vec<Record>, state: &SyncState) -> Plan {
    let mut reserved = state.filenames();
    let mut actions = Vec::new();
    let mut unchanged = 0;
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());

    for record in records {
        seen.insert(record.id.clone());
        let fp = fingerprint(&record);
        match state.entry(&record.id) {
            None => {
                let filename = allocate(
                    record.title(),
                    &reserved,
                    &date_suffix(record.created_date()),
                    &record.id,
                );
                reserved.insert(filename.to_lowercase());
                actions.push(Action::Create {
                    record,
                    fingerprint: fp,
                    filename,
                });
            }
            Some(entry) if entry.content_hash != fp => {
                actions.push(Action::Update {
                    filename: entry.filename.clone(),
                    record,
                    fingerprint: fp,
                });
            }
            Some(_) => unchanged += 1,
        }
    }

    for (id, entry) in &state.conversations {
        if !seen.contains(id) {
            actions.push(Action::Delete {
                id: id.clone(),
                filename: entry.filename.clone(),
            });
        }
    }

    Plan {
        actions,
        unchanged,
        reserved,
    }
}

/// Tunables for a cycle.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub output_dir: String,
    pub page_size: usize,
    pub request_delay: Duration,
    pub max_rate_limit_retries: u32,
    pub default_retry_after: Duration,
    pub concurrency: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.destination.output_dir.clone(),
            page_size: config.source.page_size,
            request_delay: config.source.request_delay(),
            max_rate_limit_retries: config.source.max_rate_limit_retries,
            default_retry_after: config.source.default_retry_after(),
            concurrency: config.sync.concurrency,
        }
    }
}

enum Applied {
    Created,
    Updated,
    Deleted,
    Failed,
    Skipped,
}

/// State shared by concurrently applied actions.
struct Shared {
    state: SyncState,
    reserved: HashSet<String>,
}

/// Drives sync cycles between a source and a destination.
pub struct Engine {
    source: Arc<dyn RecordSource>,
    destination: Arc<dyn DestinationStore>,
    state_store: Option<StateStore>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        destination: Arc<dyn DestinationStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            source,
            destination,
            state_store: None,
            options,
        }
    }

    /// Persist state to `store` at every checkpoint. Without a store the
    /// engine keeps state in memory only (dry runs).
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Load persisted state, or empty state without a store.
    pub fn load_state(&self) -> SyncState {
        self.state_store
            .as_ref()
            .map(StateStore::load)
            .unwrap_or_default()
    }

    /// Save state, logging instead of failing.
    pub fn persist(&self, state: &SyncState) {
        if let Some(store) = &self.state_store {
            if let Err(e) = store.save(state) {
                error!(
                    path = %store.path().display(),
                    error = %format!("{:#}", e),
                    "failed to save sync state, keeping in-memory state"
                );
            }
        }
    }

    /// Run one full cycle against `state`.
    ///
    /// On abort `state` is left exactly as it was.
    pub async fn run_cycle(&self, state: &mut SyncState, cancel: &CancellationToken) -> CycleOutcome {
        info!(source = self.source.name(), destination = self.destination.name(), "starting sync cycle");

        debug!(phase = ?CyclePhase::Preparing, dir = %self.options.output_dir);
        if let Err(e) = self
            .destination
            .ensure_directory(&self.options.output_dir)
            .await
        {
            error!(dir = %self.options.output_dir, error = %e, "cannot prepare output directory, skipping cycle");
            return CycleOutcome::Aborted {
                phase: CyclePhase::Preparing,
                reason: e.to_string(),
            };
        }

        debug!(phase = ?CyclePhase::Fetching);
        let records = match self.fetch_all(cancel).await {
            Ok(r) => r,
            Err(e) => {
                warn!(phase = ?CyclePhase::FailedFetch, error = %e, "fetch incomplete, skipping cycle without changes");
                return CycleOutcome::Aborted {
                    phase: CyclePhase::FailedFetch,
                    reason: e.to_string(),
                };
            }
        };

        debug!(phase = ?CyclePhase::Diffing, records = records.len());
        let plan = plan(records, state);
        let mut summary = CycleSummary {
            unchanged: plan.unchanged,
            ..Default::default()
        };
        info!(
            actions = plan.actions.len(),
            unchanged = plan.unchanged,
            "planned sync actions"
        );

        debug!(phase = ?CyclePhase::Applying);
        let shared = Mutex::new(Shared {
            state: state.clone(),
            reserved: plan.reserved,
        });
        let results: Vec<Applied> = stream::iter(plan.actions)
            .map(|action| self.apply(action, &shared, cancel))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Applied::Created => summary.created += 1,
                Applied::Updated => summary.updated += 1,
                Applied::Deleted => summary.deleted += 1,
                Applied::Failed => summary.failed += 1,
                Applied::Skipped => summary.skipped += 1,
            }
        }

        debug!(phase = ?CyclePhase::Persisting);
        *state = shared.into_inner().state;
        // A cycle cut short by shutdown is not a completed sync.
        if summary.skipped == 0 {
            state.mark_synced(Utc::now());
        }
        self.persist(state);

        info!(
            phase = ?CyclePhase::Done,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            unchanged = summary.unchanged,
            failed = summary.failed,
            skipped = summary.skipped,
            "sync cycle complete"
        );
        CycleOutcome::Completed(summary)
    }

    /// Page through the source until an empty page.
    ///
    /// Throttled pages are retried after the server's `Retry-After` (or the
    /// configured default) up to `max_rate_limit_retries` times in a row.
    pub async fn fetch_all(&self, cancel: &CancellationToken) -> Result<Vec<Record>, FetchError> {
        let limit = self.options.page_size.max(1);
        let mut records = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset = 0;
        let mut throttled = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let page = match self.source.fetch_page(offset, limit).await {
                Ok(page) => page,
                Err(SourceError::RateLimited { retry_after }) => {
                    throttled += 1;
                    if throttled > self.options.max_rate_limit_retries {
                        return Err(SourceError::RateLimited { retry_after }.into());
                    }
                    let wait = retry_after.unwrap_or(self.options.default_retry_after);
                    warn!(offset, wait_secs = wait.as_secs_f64(), attempt = throttled, "rate limited, waiting");
                    sleep_or_cancel(wait, cancel).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            throttled = 0;

            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let mut repeated = 0;
            for record in page {
                if record.id.is_empty() {
                    warn!(offset, "conversation without id, skipping");
                    continue;
                }
                if !seen.insert(record.id.clone()) {
                    debug!(id = %record.id, "duplicate conversation in listing, keeping first");
                    repeated += 1;
                    continue;
                }
                records.push(record);
            }
            if repeated == page_len {
                return Err(SourceError::MalformedResponse(format!(
                    "page at offset {} repeated earlier conversations, pagination is not advancing",
                    offset
                ))
                .into());
            }

            offset += page_len;
            debug!(fetched = page_len, total = records.len(), "fetched page");

            if !self.options.request_delay.is_zero() {
                sleep_or_cancel(self.options.request_delay, cancel).await?;
            }
        }

        info!(total = records.len(), "fetched conversations");
        Ok(records)
    }

    async fn apply(&self, action: Action, shared: &Mutex<Shared>, cancel: &CancellationToken) -> Applied {
        if cancel.is_cancelled() {
            return Applied::Skipped;
        }

        let id = action.id().to_string();
        let filename = action.filename().to_string();
        let result = match action {
            Action::Create {
                record,
                fingerprint,
                filename,
            } => self
                .apply_create(&record, &fingerprint, filename, shared)
                .await
                .map(|_| Applied::Created),
            Action::Update {
                record,
                fingerprint,
                filename,
            } => self
                .apply_update(&record, &fingerprint, &filename, shared)
                .await
                .map(|_| Applied::Updated),
            Action::Delete { id, filename } => self
                .apply_delete(&id, &filename, shared)
                .await
                .map(|_| Applied::Deleted),
        };

        result.unwrap_or_else(|e| {
            error!(id = %id, filename = %filename, error = %format!("{:#}", e), "sync action failed, will retry next cycle");
            Applied::Failed
        })
    }

    async fn apply_create(
        &self,
        record: &Record,
        fp: &Fingerprint,
        mut filename: String,
        shared: &Mutex<Shared>,
    ) -> anyhow::Result<()> {
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = join_path(&self.options.output_dir, &filename);

            let mut preserved = FrontMatter::new();
            let mut overwrite = false;
            if self.destination.exists(&path).await? {
                match self.destination.read(&path).await {
                    Ok(bytes) => {
                        let owner = std::str::from_utf8(&bytes)
                            .ok()
                            .and_then(|t| parse_document(t).ok())
                            .and_then(|d| d.record_id().map(str::to_string));
                        if owner.as_deref() == Some(record.id.as_str()) {
                            info!(id = %record.id, filename = %filename, "adopting file left by an earlier interrupted sync");
                            preserved = user_fields_from(&bytes, &path);
                            overwrite = true;
                        } else {
                            filename = self.reallocate(record, &filename, shared).await;
                            continue;
                        }
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let doc = render(record, fp, Utc::now(), preserved);
            let bytes = doc.to_markdown()?.into_bytes();
            match self.destination.write(&path, bytes, overwrite).await {
                Ok(()) => {}
                // Appeared between the existence check and the write; look again.
                Err(DestinationError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            info!(id = %record.id, filename = %filename, "created");
            let mut guard = shared.lock().await;
            guard.state.insert(
                record.id.clone(),
                SyncEntry {
                    content_hash: fp.clone(),
                    filename,
                },
            );
            self.persist(&guard.state);
            return Ok(());
        }

        Err(DestinationError::AlreadyExists(filename))
            .with_context(|| format!("no free filename after {} attempts", MAX_CREATE_ATTEMPTS))
    }

    /// The reserved filename is held by a file we do not own. Keep it
    /// reserved and pick another.
    async fn reallocate(&self, record: &Record, taken: &str, shared: &Mutex<Shared>) -> String {
        let mut guard = shared.lock().await;
        guard.reserved.insert(taken.to_lowercase());
        let next = allocate(
            record.title(),
            &guard.reserved,
            &date_suffix(record.created_date()),
            &record.id,
        );
        guard.reserved.insert(next.to_lowercase());
        warn!(id = %record.id, taken, filename = %next, "filename held by an unrelated file, reallocated");
        next
    }

    async fn apply_update(
        &self,
        record: &Record,
        fp: &Fingerprint,
        filename: &str,
        shared: &Mutex<Shared>,
    ) -> anyhow::Result<()> {
        let path = join_path(&self.options.output_dir, filename);

        let preserved = match self.destination.read(&path).await {
            Ok(bytes) => user_fields_from(&bytes, &path),
            Err(e) if e.is_not_found() => {
                info!(id = %record.id, filename, "destination file missing, recreating");
                FrontMatter::new()
            }
            Err(e) => {
                warn!(id = %record.id, filename, error = %e, "could not read existing file, user fields not preserved");
                FrontMatter::new()
            }
        };

        let doc = render(record, fp, Utc::now(), preserved);
        self.destination
            .write(&path, doc.to_markdown()?.into_bytes(), true)
            .await?;

        info!(id = %record.id, filename, "updated");
        let mut guard = shared.lock().await;
        guard.state.insert(
            record.id.clone(),
            SyncEntry {
                content_hash: fp.clone(),
                filename: filename.to_string(),
            },
        );
        self.persist(&guard.state);
        Ok(())
    }

    async fn apply_delete(&self, id: &str, filename: &str, shared: &Mutex<Shared>) -> anyhow::Result<()> {
        let path = join_path(&self.options.output_dir, filename);
        match self.destination.delete(&path).await {
            Ok(()) => info!(id, filename, "deleted, conversation no longer exists upstream"),
            Err(e) if e.is_not_found() => info!(id, filename, "already gone from destination"),
            Err(e) => return Err(e.into()),
        }

        let mut guard = shared.lock().await;
        guard.state.remove(id);
        self.persist(&guard.state);
        Ok(())
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), FetchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Structured;

    fn record(id: &str, title: &str, overview: &str) -> Record {
        Record {
            id: id.to_string(),
            created_at: Some("2026-02-03T10:00:00Z".to_string()),
            structured: Structured {
                title: title.to_string(),
                overview: overview.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn state_with(entries: &[(&Record, &str)]) -> SyncState {
        let mut state = SyncState::default();
        for (r, filename) in entries {
            state.insert(
                r.id.clone(),
                SyncEntry {
                    content_hash: fingerprint(r),
                    filename: filename.to_string(),
                },
            );
        }
        state
    }

    #[test]
    fn test_plan_classifies_records() {
        let same = record("a", "Alpha", "one");
        let changed_old = record("b", "Beta", "two");
        let changed_new = record("b", "Beta", "two, revised");
        let gone = record("c", "Gamma", "three");
        let fresh = record("d", "Delta", "four");

        let state = state_with(&[(&same, "Alpha.md"), (&changed_old, "Beta.md"), (&gone, "Gamma.md")]);
        let plan = plan(vec![same, changed_new, fresh], &state);

        assert_eq!(plan.unchanged, 1);
        let kinds: Vec<(&str, &str, &str)> = plan
            .actions
            .iter()
            .map(|a| {
                let kind = match a {
                    Action::Create { .. } => "create",
                    Action::Update { .. } => "update",
                    Action::Delete { .. } => "delete",
                };
                (kind, a.id(), a.filename())
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("update", "b", "Beta.md"),
                ("create", "d", "Delta.md"),
                ("delete", "c", "Gamma.md"),
            ]
        );
    }

    #[test]
    fn test_plan_reserves_distinct_filenames_for_duplicate_titles() {
        let existing = record("a", "Meeting Notes", "x");
        let state = state_with(&[(&existing, "Meeting Notes.md")]);
        let plan = plan(
            vec![
                existing.clone(),
                record("b", "Meeting Notes", "y"),
                record("c", "Meeting Notes", "z"),
            ],
            &state,
        );

        let names: Vec<&str> = plan.actions.iter().map(Action::filename).collect();
        assert_eq!(names, vec!["Meeting Notes_02032026.md", "Meeting Notes_02032026-2.md"]);
    }

    #[test]
    fn test_plan_does_not_reuse_filename_of_pending_delete() {
        let gone = record("a", "Standup", "x");
        let state = state_with(&[(&gone, "Standup.md")]);
        let plan = plan(vec![record("b", "Standup", "y")], &state);

        let create = plan
            .actions
            .iter()
            .find(|a| matches!(a, Action::Create { .. }))
            .unwrap();
        assert_eq!(create.filename(), "Standup_02032026.md");
    }
}
