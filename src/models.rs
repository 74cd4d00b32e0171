//! Core data models used throughout omi-sync.
//!
//! A [`Record`] is one conversation as returned by the source API. Only the
//! fields the renderer needs are typed; everything else inside `structured`
//! and each transcript segment is carried verbatim so that the content
//! fingerprint sees the full payload.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single conversation record from the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub structured: Structured,
    #[serde(default)]
    pub transcript_segments: Vec<TranscriptSegment>,
}

/// Structured summary attached to a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Structured {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub category: String,
    /// Fields the engine does not interpret (emoji, action items, events...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One utterance in a conversation transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub speaker_id: Option<i64>,
    #[serde(default)]
    pub is_user: Option<bool>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Display title, falling back to `Untitled`.
    pub fn title(&self) -> &str {
        let title = self.structured.title.trim();
        if title.is_empty() {
            "Untitled"
        } else {
            title
        }
    }

    /// Calendar date of creation, if `created_at` parses.
    ///
    /// Accepts RFC 3339 (`2026-01-02T03:04:05Z`, `...+00:00`) and naive
    /// timestamps without an offset, which are taken as UTC.
    pub fn created_date(&self) -> Option<NaiveDate> {
        let raw = self.created_at.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc).date_naive());
        }
        chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|dt| dt.date())
    }
}

impl TranscriptSegment {
    /// Label used for this segment's paragraph in the rendered transcript.
    pub fn speaker_label(&self) -> String {
        format!("Speaker {}", self.speaker_id.unwrap_or(0))
    }
}
