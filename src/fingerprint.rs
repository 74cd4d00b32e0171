//! Content fingerprinting.
//!
//! A fingerprint covers only the content-relevant part of a record: the
//! `structured` payload and the transcript segments. Identifier and
//! timestamps are excluded, so re-fetching an unchanged conversation always
//! yields the same value.
//!
//! The payload is encoded as canonical JSON (object keys sorted at every
//! depth, no whitespace) and hashed with SHA-256. The hex digest is truncated
//! to 16 characters (64 bits). For n records the chance of any collision is
//! about n² / 2⁶⁵, i.e. below 10⁻¹⁰ at 50 000 records.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Record;

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Truncated content hash of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(s.to_string())
    }
}

/// Compute the fingerprint of a record's content.
pub fn fingerprint(record: &Record) -> Fingerprint {
    let content = serde_json::json!({
        "structured": record.structured,
        "transcript_segments": record.transcript_segments,
    });
    fingerprint_value(&content)
}

/// Fingerprint an arbitrary JSON value after canonicalization.
pub fn fingerprint_value(value: &Value) -> Fingerprint {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    Fingerprint(digest)
}

/// Encode a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars serialize infallibly.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}
