//! Filename allocation for mirrored documents.
//!
//! Titles become filesystem-safe base names via [`sanitize_title`]. When the
//! base name is already owned by another conversation, [`allocate`] appends
//! a date-derived disambiguator (`_MMDDYYYY`), then a counter, and finally
//! falls back to embedding the identifier. The search is bounded, so
//! allocation always terminates.
//!
//! Once a conversation has a filename in the sync state it keeps it for
//! life; titles that drift later do not rename the file.

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use unicode_normalization::UnicodeNormalization;

/// Base name used when a title sanitizes to nothing.
pub const FALLBACK_NAME: &str = "Untitled";

/// Extension of every mirrored document.
pub const EXTENSION: &str = ".md";

/// Maximum byte length of a sanitized base name. Leaves room for the
/// disambiguator and extension under the usual 255-byte component limit.
pub const MAX_BASE_BYTES: usize = 200;

/// Counter suffixes tried after the bare date suffix (`-2` through `-8`).
const MAX_COUNTER: u32 = 8;

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turn a display title into a safe base name (without extension).
///
/// The title is NFC-normalized first, so composed and decomposed spellings
/// of the same text map to the same name.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = false;

    for c in title.nfc() {
        if c.is_control() {
            continue;
        }
        let c = if ILLEGAL_CHARS.contains(&c) { '-' } else { c };
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }

    let trimmed = trim_separators(&out);
    let mut name = truncate_bytes(trimmed, MAX_BASE_BYTES);
    // Truncation can expose a trailing separator again.
    name = trim_separators(&name).to_string();

    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    if is_reserved(&name) {
        name.push('_');
    }
    name
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c: char| c == ' ' || c == '.' || c == '-')
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem))
}

/// Disambiguator derived from a conversation's creation date (`MMDDYYYY`).
///
/// Falls back to today's date (UTC) when the creation date is unknown.
pub fn date_suffix(created: Option<NaiveDate>) -> String {
    created
        .unwrap_or_else(|| Utc::now().date_naive())
        .format("%m%d%Y")
        .to_string()
}

/// Pick a filename for a new conversation.
///
/// `existing` holds lowercased filenames already owned by other
/// conversations (see [`SyncState::filenames`](crate::state::SyncState::filenames)).
/// `disambiguator` is typically [`date_suffix`]; `id` is the conversation
/// identifier used as the last resort. If even the identifier form is
/// taken, a counter is appended to it; `existing` is finite, so a free name
/// is always found.
pub fn allocate(title: &str, existing: &HashSet<String>, disambiguator: &str, id: &str) -> String {
    let base = sanitize_title(title);
    let free = |name: &str| !existing.contains(&name.to_lowercase());

    let plain = format!("{}{}", base, EXTENSION);
    if free(&plain) {
        return plain;
    }

    let dated = format!("{}_{}{}", base, disambiguator, EXTENSION);
    if free(&dated) {
        return dated;
    }

    for n in 2..=MAX_COUNTER {
        let candidate = format!("{}_{}-{}{}", base, disambiguator, n, EXTENSION);
        if free(&candidate) {
            return candidate;
        }
    }

    let id_part = sanitize_title(id);
    let by_id = format!("{}_{}{}", base, id_part, EXTENSION);
    if free(&by_id) {
        return by_id;
    }

    let mut n = 2usize;
    loop {
        let candidate = format!("{}_{}-{}{}", base, id_part, n, EXTENSION);
        if free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_lowercase()).collect()
    }

    #[test]
    fn test_sanitize_plain_title() {
        assert_eq!(sanitize_title("Meeting Notes"), "Meeting Notes");
    }

    #[test]
    fn test_sanitize_illegal_and_control_chars() {
        assert_eq!(sanitize_title("Q3: plan/budget?"), "Q3- plan-budget");
        assert_eq!(sanitize_title("tab\there\u{0007}"), "tabhere");
        assert_eq!(sanitize_title("a   b \n c"), "a b c");
    }

    #[test]
    fn test_sanitize_trims_separators() {
        assert_eq!(sanitize_title("  ..notes..  "), "notes");
        assert_eq!(sanitize_title("-- draft --"), "draft");
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_title(""), FALLBACK_NAME);
        assert_eq!(sanitize_title("   "), FALLBACK_NAME);
        assert_eq!(sanitize_title("???"), FALLBACK_NAME);
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_title("CON"), "CON_");
        assert_eq!(sanitize_title("lpt1"), "lpt1_");
        assert_eq!(sanitize_title("nul.txt"), "nul.txt_");
        assert_eq!(sanitize_title("Console"), "Console");
    }

    #[test]
    fn test_sanitize_caps_length_on_char_boundary() {
        let long = "é".repeat(300);
        let name = sanitize_title(&long);
        assert!(name.len() <= MAX_BASE_BYTES);
        assert!(name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_allocate_unique_title() {
        let name = allocate("Meeting Notes", &taken(&[]), "01022026", "conv_1");
        assert_eq!(name, "Meeting Notes.md");
    }

    #[test]
    fn test_allocate_duplicate_title_gets_date_suffix() {
        let existing = taken(&["Meeting Notes.md"]);
        let name = allocate("Meeting Notes", &existing, "01022026", "conv_2");
        assert_eq!(name, "Meeting Notes_01022026.md");
    }

    #[test]
    fn test_allocate_collision_is_case_insensitive() {
        let existing = taken(&["meeting notes.md"]);
        let name = allocate("Meeting Notes", &existing, "01022026", "conv_2");
        assert_eq!(name, "Meeting Notes_01022026.md");
    }

    #[test]
    fn test_allocate_counter_then_identifier() {
        let mut names = vec![
            "Sync.md".to_string(),
            "Sync_01022026.md".to_string(),
        ];
        for n in 2..=MAX_COUNTER {
            names.push(format!("Sync_01022026-{}.md", n));
        }
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let mut existing = taken(&refs[..3]);
        assert_eq!(
            allocate("Sync", &existing, "01022026", "conv_7"),
            "Sync_01022026-3.md"
        );

        existing = taken(&refs);
        assert_eq!(
            allocate("Sync", &existing, "01022026", "conv_7"),
            "Sync_conv_7.md"
        );
    }

    #[test]
    fn test_allocate_identifier_form_taken() {
        let mut names = vec!["Sync.md".to_string(), "Sync_01022026.md".to_string()];
        for n in 2..=MAX_COUNTER {
            names.push(format!("Sync_01022026-{}.md", n));
        }
        names.push("Sync_conv_7.md".to_string());
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut existing = taken(&refs);

        let name = allocate("Sync", &existing, "01022026", "conv_7");
        assert_eq!(name, "Sync_conv_7-2.md");
        assert!(!existing.contains(&name.to_lowercase()));

        existing.insert(name.to_lowercase());
        assert_eq!(allocate("Sync", &existing, "01022026", "conv_7"), "Sync_conv_7-3.md");
    }

    #[test]
    fn test_sanitize_normalizes_to_nfc() {
        let decomposed = "Cafe\u{0301}";
        let composed = "Caf\u{00e9}";
        assert_eq!(sanitize_title(decomposed), composed);
        assert_eq!(sanitize_title(decomposed), sanitize_title(composed));

        let existing = taken(&["café.md"]);
        assert_eq!(
            allocate(decomposed, &existing, "01022026", "conv_1"),
            "Café_01022026.md"
        );
    }

    #[test]
    fn test_allocate_is_stable() {
        let existing = taken(&["Meeting Notes.md"]);
        let first = allocate("Meeting Notes", &existing, "01022026", "conv_2");
        let second = allocate("Meeting Notes", &existing, "01022026", "conv_2");
        assert_eq!(first, second);
    }

    #[test]
    fn test_date_suffix_format() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 2);
        assert_eq!(date_suffix(d), "01022026");
        assert_eq!(date_suffix(None).len(), 8);
    }
}
