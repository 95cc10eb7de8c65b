//! Filename and metadata hygiene.
//!
//! [`SecurityValidator`] is the seam the file manager calls before any byte of
//! an upload is read. [`DefaultValidator`] covers the common cases:
//! - path traversal, control characters, reserved device names
//! - script injection in names and metadata values
//! - metadata key shape, key count and value size limits

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use thiserror::Error;

/// Maximum length of a sanitized file name, in characters
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length for metadata key names
pub const MAX_METADATA_KEY_LENGTH: usize = 64;

/// Maximum length of a metadata value once JSON serialized
pub const MAX_METADATA_VALUE_LENGTH: usize = 2048;

/// Maximum number of metadata keys accepted in one request
pub const MAX_METADATA_KEYS: usize = 50;

const RESERVED_PREFIXES: &[&str] = &["_system_", "_internal_"];

static MALICIOUS_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(^|[/\\])\.\.([/\\]|$)",
        r"[\x00-\x1f\x7f]",
        r"(?i)<\s*/?\s*(script|iframe|object|embed)\b",
        r"(?i)\bjavascript\s*:",
        r"(?i)\bon[a-z]+\s*=",
        r"(?i)^(con|prn|aux|nul|com[1-9]|lpt[1-9])(\.[^.]*)?$",
        r"(?i)\.[a-z0-9]{2,4}\.(exe|bat|cmd|scr|pif|vbs|msi)$",
    ])
    .expect("malicious content patterns are valid")
});

static METADATA_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_\-\.:]+$").expect("metadata key pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Hygiene checks applied to caller-supplied strings and metadata.
pub trait SecurityValidator: Send + Sync {
    fn sanitize_input(&self, input: &str) -> String;
    fn contains_malicious_content(&self, input: &str) -> bool;
    fn validate_request_body(
        &self,
        body: &HashMap<String, serde_json::Value>,
    ) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl SecurityValidator for DefaultValidator {
    /// Reduce `input` to a bare file name: strip directories, control
    /// characters and shell/path metacharacters, trim trailing dots and
    /// spaces, and cap the length. May return an empty string.
    fn sanitize_input(&self, input: &str) -> String {
        let base = input.rsplit(['/', '\\']).next().unwrap_or(input);

        let cleaned: String = base
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
                c => c,
            })
            .take(MAX_NAME_LENGTH)
            .collect();

        cleaned
            .trim()
            .trim_end_matches(['.', ' '])
            .to_string()
    }

    fn contains_malicious_content(&self, input: &str) -> bool {
        MALICIOUS_PATTERNS.is_match(input)
    }

    fn validate_request_body(
        &self,
        body: &HashMap<String, serde_json::Value>,
    ) -> Result<(), ValidationError> {
        if body.len() > MAX_METADATA_KEYS {
            return Err(ValidationError(format!(
                "metadata has {} keys, maximum is {MAX_METADATA_KEYS}",
                body.len()
            )));
        }

        for (key, value) in body {
            validate_metadata_key(key)?;

            let serialized = serde_json::to_string(value)
                .map_err(|e| ValidationError(format!("metadata value for '{key}': {e}")))?;
            if serialized.len() > MAX_METADATA_VALUE_LENGTH {
                return Err(ValidationError(format!(
                    "metadata value for '{key}' exceeds {MAX_METADATA_VALUE_LENGTH} characters"
                )));
            }
            if contains_script(value) {
                return Err(ValidationError(format!(
                    "metadata value for '{key}' contains disallowed content"
                )));
            }
        }
        Ok(())
    }
}

fn validate_metadata_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError("metadata key cannot be empty".to_string()));
    }
    if key.len() > MAX_METADATA_KEY_LENGTH {
        return Err(ValidationError(format!(
            "metadata key '{key}' exceeds {MAX_METADATA_KEY_LENGTH} characters"
        )));
    }
    if !METADATA_KEY.is_match(key) {
        return Err(ValidationError(format!(
            "metadata key '{key}' contains invalid characters"
        )));
    }
    if RESERVED_PREFIXES.iter().any(|p| key.starts_with(p)) {
        return Err(ValidationError(format!(
            "metadata key '{key}' uses a reserved prefix"
        )));
    }
    Ok(())
}

/// Walks nested values looking for markup or script URLs in strings.
fn contains_script(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            lower.contains("<script") || lower.contains("javascript:")
        }
        serde_json::Value::Array(items) => items.iter().any(contains_script),
        serde_json::Value::Object(map) => map.values().any(contains_script),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_directories_and_metacharacters() {
        let v = DefaultValidator;
        assert_eq!(v.sanitize_input("report.pdf"), "report.pdf");
        assert_eq!(v.sanitize_input("/tmp/uploads/photo.jpg"), "photo.jpg");
        assert_eq!(v.sanitize_input("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(v.sanitize_input("what?.txt"), "what_.txt");
        assert_eq!(v.sanitize_input("tab\there.txt"), "tabhere.txt");
        assert_eq!(v.sanitize_input("trailing... "), "trailing");
        assert_eq!(v.sanitize_input("   "), "");
        assert_eq!(v.sanitize_input("dir/"), "");
    }

    #[test]
    fn sanitize_caps_length() {
        let v = DefaultValidator;
        let long = "a".repeat(400);
        assert_eq!(v.sanitize_input(&long).chars().count(), MAX_NAME_LENGTH);
    }

    #[test]
    fn detects_malicious_names() {
        let v = DefaultValidator;
        assert!(v.contains_malicious_content("../../etc/passwd"));
        assert!(v.contains_malicious_content("<script>alert(1)</script>.txt"));
        assert!(v.contains_malicious_content("nul.txt"));
        assert!(v.contains_malicious_content("invoice.pdf.exe"));
        assert!(v.contains_malicious_content("bad\0name.txt"));
        assert!(!v.contains_malicious_content("holiday-photo_01.jpg"));
        assert!(!v.contains_malicious_content("archive.tar.gz"));
    }

    #[test]
    fn dot_runs_are_only_rejected_as_path_segments() {
        let v = DefaultValidator;
        assert!(v.contains_malicious_content(".."));
        assert!(v.contains_malicious_content("..\\windows\\win.ini"));
        assert!(v.contains_malicious_content("uploads/../secret.txt"));
        assert!(v.contains_malicious_content("uploads/.."));
        assert!(!v.contains_malicious_content("v1..2.txt"));
        assert!(!v.contains_malicious_content("notes...txt"));
        assert!(!v.contains_malicious_content("..hidden"));
    }

    #[test]
    fn metadata_rules() {
        let v = DefaultValidator;

        let ok: HashMap<_, _> = [
            ("camera".to_string(), json!("Canon EOS R5")),
            ("exif:iso".to_string(), json!(400)),
        ]
        .into();
        assert!(v.validate_request_body(&ok).is_ok());

        let bad_key: HashMap<_, _> = [("has space".to_string(), json!(1))].into();
        assert!(v.validate_request_body(&bad_key).is_err());

        let reserved: HashMap<_, _> = [("_system_owner".to_string(), json!(1))].into();
        assert!(v.validate_request_body(&reserved).is_err());

        let script: HashMap<_, _> = [(
            "caption".to_string(),
            json!({"nested": ["<SCRIPT>alert(1)</script>"]}),
        )]
        .into();
        assert!(v.validate_request_body(&script).is_err());

        let huge: HashMap<_, _> = [("blob".to_string(), json!("x".repeat(4096)))].into();
        assert!(v.validate_request_body(&huge).is_err());

        let many: HashMap<_, _> = (0..=MAX_METADATA_KEYS)
            .map(|i| (format!("k{i}"), json!(i)))
            .collect();
        assert!(v.validate_request_body(&many).is_err());
    }
}
