//! # omi-sync
//!
//! Mirrors Omi conversations into a WebDAV folder of Markdown files.
//!
//! Each conversation becomes one document with YAML front matter and a
//! summary/transcript body. The sync is one-way and convergent: new
//! conversations are created, changed ones rewritten (keeping any front
//! matter fields a user added by hand), and deleted ones removed, but only
//! after a complete, successful listing of the source.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────────────────┐   ┌──────────────┐
//! │ Omi API     │──▶│ Engine                  │──▶│ WebDAV       │
//! │ (paginated) │   │ fetch → diff → apply    │   │ *.md files   │
//! └─────────────┘   └───────────┬─────────────┘   └──────────────┘
//!                               │
//!                        ┌──────▼──────┐
//!                        │ state.json  │
//!                        │ id → hash,  │
//!                        │   filename  │
//!                        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OMI_API_KEY=... WEBDAV_URL=... WEBDAV_USER=... WEBDAV_PASS=...
//! omi-sync check                # verify both endpoints
//! omi-sync sync --dry-run       # show what a cycle would do
//! omi-sync run                  # sync every interval until SIGTERM
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Conversation record types |
//! | [`error`] | Source and destination error taxonomy |
//! | [`fingerprint`] | Canonical content hashing |
//! | [`state`] | Durable sync state with atomic saves |
//! | [`filename`] | Safe, collision-free filenames |
//! | [`render`] | Markdown + front matter rendering and merging |
//! | [`traits`] | Source and destination gateway traits |
//! | [`connector_omi`] | Omi API source |
//! | [`store_webdav`] | WebDAV destination |
//! | [`store_memory`] | In-memory destination |
//! | [`engine`] | Reconciliation cycle |
//! | [`scheduler`] | Interval loop with graceful shutdown |

pub mod config;
pub mod connector_omi;
pub mod engine;
pub mod error;
pub mod filename;
pub mod fingerprint;
pub mod models;
pub mod render;
pub mod scheduler;
pub mod state;
pub mod store_memory;
pub mod store_webdav;
pub mod traits;
