//! Markdown rendering with YAML front matter.
//!
//! Front matter keys fall into three groups:
//!
//! | Group | Keys | On update |
//! |-------|------|-----------|
//! | Managed | anything starting with `_` (`_omi_id`, `_content_hash`, `_synced_at`) | always recomputed |
//! | Descriptive | `title`, `date`, `category` | always recomputed from the record |
//! | User | everything else | carried over from the existing file |
//!
//! [`FrontMatter::partition`] is the one place that decides whether a key is
//! managed. A user who adds `_whatever` by hand loses it on the next update.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::fingerprint::Fingerprint;
use crate::models::Record;

/// Prefix reserved for engine-owned front matter keys.
pub const MANAGED_PREFIX: &str = "_";

pub const KEY_ID: &str = "_omi_id";
pub const KEY_CONTENT_HASH: &str = "_content_hash";
pub const KEY_SYNCED_AT: &str = "_synced_at";

/// Non-prefixed keys the renderer owns.
pub const DESCRIPTIVE_KEYS: &[&str] = &["title", "date", "category"];

pub const EMPTY_SUMMARY: &str = "No summary available.";

const DELIMITER: &str = "---";

/// Ordered front matter mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter(Mapping);

impl FrontMatter {
    pub fn new() -> Self {
        Self(Mapping::new())
    }

    pub fn is_managed_key(key: &str) -> bool {
        key.starts_with(MANAGED_PREFIX)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(Value::String(key.to_string()), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.0.keys().map(key_to_string)
    }

    /// Split into `(managed, user)` fields. Descriptive keys count as user
    /// fields here; [`render`] overwrites them.
    pub fn partition(self) -> (FrontMatter, FrontMatter) {
        let mut managed = Mapping::new();
        let mut user = Mapping::new();
        for (k, v) in self.0 {
            if Self::is_managed_key(&key_to_string(&k)) {
                managed.insert(k, v);
            } else {
                user.insert(k, v);
            }
        }
        (FrontMatter(managed), FrontMatter(user))
    }

    /// User fields: the part of this mapping a re-render must preserve.
    pub fn user_fields(self) -> FrontMatter {
        let (_, user) = self.partition();
        FrontMatter(
            user.0
                .into_iter()
                .filter(|(k, _)| !DESCRIPTIVE_KEYS.contains(&key_to_string(k).as_str()))
                .collect(),
        )
    }
}

fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// A Markdown document split into front matter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub front_matter: FrontMatter,
    pub body: String,
}

impl RenderedDocument {
    /// Serialize as `---\n<yaml>---\n\n<body>\n`.
    pub fn to_markdown(&self) -> Result<String> {
        let yaml = if self.front_matter.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(&self.front_matter.0).context("Failed to encode front matter")?
        };
        Ok(format!(
            "{delim}\n{yaml}{delim}\n\n{body}\n",
            delim = DELIMITER,
            yaml = yaml,
            body = self.body.trim_end()
        ))
    }

    /// Identifier recorded in the managed `_omi_id` field, if any.
    pub fn record_id(&self) -> Option<&str> {
        self.front_matter.get_str(KEY_ID)
    }
}

/// Parse a Markdown document with optional front matter.
pub fn parse_document(text: &str) -> Result<RenderedDocument> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let Some(rest) = strip_delimiter_line(text) else {
        return Ok(RenderedDocument {
            front_matter: FrontMatter::new(),
            body: text.to_string(),
        });
    };

    let mut yaml_end = None;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            yaml_end = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }
    let (yaml_len, body_start) =
        yaml_end.context("Front matter block is not closed")?;

    let yaml = &rest[..yaml_len];
    let front_matter = if yaml.trim().is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(yaml).context("Failed to parse front matter")? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => anyhow::bail!("Front matter is not a mapping"),
        }
    };

    let body = rest[body_start..].trim_start_matches(['\r', '\n']).to_string();
    Ok(RenderedDocument {
        front_matter: FrontMatter(front_matter),
        body,
    })
}

fn strip_delimiter_line(text: &str) -> Option<&str> {
    let rest = text.strip_prefix(DELIMITER)?;
    rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))
}

/// Recover user fields from an existing destination file.
///
/// Anything unreadable yields no user fields; a broken file is not a
/// reason to skip an update.
pub fn user_fields_from(bytes: &[u8], path: &str) -> FrontMatter {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(e) => {
            warn!(path, error = %e, "existing document is not UTF-8, dropping its front matter");
            return FrontMatter::new();
        }
    };
    match parse_document(text) {
        Ok(doc) => doc.front_matter.user_fields(),
        Err(e) => {
            warn!(path, error = %e, "could not parse existing document, dropping its front matter");
            FrontMatter::new()
        }
    }
}

/// Render a record into a document.
///
/// `preserved` holds user fields recovered from the previous version of
/// the file; any managed or descriptive keys in it are ignored.
pub fn render(
    record: &Record,
    fingerprint: &Fingerprint,
    synced_at: DateTime<Utc>,
    preserved: FrontMatter,
) -> RenderedDocument {
    let mut fm = FrontMatter::new();
    fm.insert("title", record.title());
    fm.insert("date", record.created_at.clone().unwrap_or_default());
    fm.insert("category", record.structured.category.clone());

    for (k, v) in preserved.user_fields().0 {
        if !fm.0.contains_key(&k) {
            fm.0.insert(k, v);
        }
    }

    fm.insert(KEY_ID, record.id.as_str());
    fm.insert(KEY_CONTENT_HASH, fingerprint.as_str());
    fm.insert(
        KEY_SYNCED_AT,
        synced_at.to_rfc3339_opts(SecondsFormat::Micros, false),
    );

    RenderedDocument {
        front_matter: fm,
        body: render_body(record),
    }
}

fn render_body(record: &Record) -> String {
    let mut lines = vec!["## Summary".to_string(), String::new()];
    let overview = record.structured.overview.trim();
    lines.push(if overview.is_empty() {
        EMPTY_SUMMARY.to_string()
    } else {
        overview.to_string()
    });

    if !record.transcript_segments.is_empty() {
        lines.push(String::new());
        lines.push("## Transcript".to_string());
        for segment in &record.transcript_segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            lines.push(String::new());
            lines.push(format!("**{}:** {}", segment.speaker_label(), text));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::models::{Structured, TranscriptSegment};

    fn record() -> Record {
        Record {
            id: "conv_202".to_string(),
            created_at: Some("2026-05-01T09:00:00Z".to_string()),
            updated_at: None,
            structured: Structured {
                title: "Meeting Notes".to_string(),
                overview: "Quarterly planning".to_string(),
                category: "work".to_string(),
                ..Default::default()
            },
            transcript_segments: vec![
                TranscriptSegment {
                    text: "Hello".to_string(),
                    speaker_id: Some(0),
                    ..Default::default()
                },
                TranscriptSegment {
                    text: "  ".to_string(),
                    speaker_id: Some(1),
                    ..Default::default()
                },
                TranscriptSegment {
                    text: "Hi there".to_string(),
                    speaker_id: Some(1),
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_render_body_sections() {
        let r = record();
        let doc = render(&r, &fingerprint(&r), Utc::now(), FrontMatter::new());
        assert_eq!(
            doc.body,
            "## Summary\n\nQuarterly planning\n\n## Transcript\n\n**Speaker 0:** Hello\n\n**Speaker 1:** Hi there"
        );
    }

    #[test]
    fn test_render_empty_summary_no_transcript() {
        let mut r = record();
        r.structured.overview = "   ".to_string();
        r.transcript_segments.clear();
        let doc = render(&r, &fingerprint(&r), Utc::now(), FrontMatter::new());
        assert_eq!(doc.body, format!("## Summary\n\n{}", EMPTY_SUMMARY));
    }

    #[test]
    fn test_render_front_matter_fields() {
        let r = record();
        let fp = fingerprint(&r);
        let doc = render(&r, &fp, Utc::now(), FrontMatter::new());
        let fm = &doc.front_matter;
        assert_eq!(fm.get_str("title"), Some("Meeting Notes"));
        assert_eq!(fm.get_str("date"), Some("2026-05-01T09:00:00Z"));
        assert_eq!(fm.get_str("category"), Some("work"));
        assert_eq!(fm.get_str(KEY_ID), Some("conv_202"));
        assert_eq!(fm.get_str(KEY_CONTENT_HASH), Some(fp.as_str()));
        assert!(fm.get_str(KEY_SYNCED_AT).is_some());
    }

    #[test]
    fn test_partition_splits_on_prefix() {
        let mut fm = FrontMatter::new();
        fm.insert("tags", "x");
        fm.insert("_omi_id", "a");
        fm.insert("_custom", "b");
        fm.insert("title", "t");
        let (managed, user) = fm.partition();
        assert_eq!(managed.keys().collect::<Vec<_>>(), vec!["_omi_id", "_custom"]);
        assert_eq!(user.keys().collect::<Vec<_>>(), vec!["tags", "title"]);
    }

    #[test]
    fn test_round_trip_preserves_user_fields() {
        let r = record();
        let fp = fingerprint(&r);
        let first = render(&r, &fp, Utc::now(), FrontMatter::new());
        let text = first.to_markdown().unwrap();

        // Simulate a user editing the file on the destination.
        let mut edited = parse_document(&text).unwrap();
        edited
            .front_matter
            .insert("tags", Value::Sequence(vec![Value::String("x".into())]));
        edited
            .front_matter
            .insert("rating", Value::Number(5i64.into()));
        edited.front_matter.insert("title", "My own title");
        edited.front_matter.insert(KEY_ID, "forged");
        let edited = edited.to_markdown().unwrap();

        let preserved = user_fields_from(edited.as_bytes(), "Meeting Notes.md");
        let mut changed = r.clone();
        changed.transcript_segments[0].text = "Hello again".to_string();
        let fp2 = fingerprint(&changed);
        let second = render(&changed, &fp2, Utc::now(), preserved);

        let reparsed = parse_document(&second.to_markdown().unwrap()).unwrap();
        let fm = &reparsed.front_matter;
        assert_eq!(
            fm.get("tags"),
            Some(&Value::Sequence(vec![Value::String("x".into())]))
        );
        assert_eq!(fm.get("rating"), Some(&Value::Number(5i64.into())));
        assert_eq!(fm.get_str("title"), Some("Meeting Notes"));
        assert_eq!(fm.get_str(KEY_ID), Some("conv_202"));
        assert_eq!(fm.get_str(KEY_CONTENT_HASH), Some(fp2.as_str()));
        assert!(reparsed.body.contains("**Speaker 0:** Hello again"));
    }

    #[test]
    fn test_parse_document_without_front_matter() {
        let doc = parse_document("# Just a heading\n").unwrap();
        assert!(doc.front_matter.is_empty());
        assert_eq!(doc.body, "# Just a heading\n");
    }

    #[test]
    fn test_parse_document_unclosed_block_fails() {
        assert!(parse_document("---\ntitle: x\nno end").is_err());
        assert!(user_fields_from(b"---\ntitle: x\nno end", "x.md").is_empty());
    }

    #[test]
    fn test_user_fields_from_invalid_utf8() {
        assert!(user_fields_from(&[0xff, 0xfe, 0x00], "x.md").is_empty());
    }

    #[test]
    fn test_markdown_layout() {
        let r = record();
        let doc = render(&r, &fingerprint(&r), Utc::now(), FrontMatter::new());
        let text = doc.to_markdown().unwrap();
        assert!(text.starts_with("---\ntitle: Meeting Notes\n"));
        assert!(text.contains("\n---\n\n## Summary\n"));
        assert!(text.ends_with("**Speaker 1:** Hi there\n"));
    }
}
