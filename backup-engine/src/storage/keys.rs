//! Object key layout and generation.
//!
//! Content objects are addressed by fingerprint, manifests by a generated key
//! that combines a timestamp, a random component and a sanitized name.

use super::StorageError;

const MAX_NAME_LEN: usize = 96;

/// Replace every character that is not ASCII alphanumeric, `.`, `-` or `_`
/// with `_`, and cap the length.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        "object".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `20261018T101500123Z-9f86d081-<sanitized name>`
pub fn generate_key(original_name: &str) -> String {
    let now = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let random: u32 = rand::random();
    format!("{}-{:08x}-{}", now, random, sanitize_name(original_name))
}

/// Join key segments with `/`, dropping empty segments and stray slashes.
pub fn join(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn objects_prefix(prefix: &str) -> String {
    format!("{}/", join(&[prefix, "objects"]))
}

/// Content objects fan out on the first two hex characters of the fingerprint.
pub fn object_key(prefix: &str, fingerprint: &str) -> String {
    let fanout = fingerprint.get(..2).unwrap_or("00");
    join(&[prefix, "objects", fanout, fingerprint])
}

pub fn manifest_key(prefix: &str, domain: &str, run_id: &str, extension: &str) -> String {
    let name = format!("{}-{}.{}", run_id, domain, extension);
    join(&[prefix, "manifests", domain, &generate_key(&name)])
}

/// Reject keys that could escape the backend root on path-based backends.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::Validation("empty object key".into()));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::Validation(format!("invalid object key: {key}")));
    }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(StorageError::Validation(format!("invalid object key: {key}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report 2024.tar.gz"), "report_2024.tar.gz");
        assert_eq!(sanitize_name("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_name("ünïcode"), "_n_code");
        assert_eq!(sanitize_name(".."), "object");
        assert_eq!(sanitize_name(""), "object");
        assert_eq!(sanitize_name(&"x".repeat(500)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_generate_key_is_unique_and_safe() {
        let keys: HashSet<String> = (0..200).map(|_| generate_key("my file.json")).collect();
        assert_eq!(keys.len(), 200);
        for key in &keys {
            assert!(key.ends_with("-my_file.json"));
            assert!(key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
        }
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key("site/prod/", "abcdef0123"),
            "site/prod/objects/ab/abcdef0123"
        );
        assert_eq!(object_key("", "ff00"), "objects/ff/ff00");
        assert_eq!(objects_prefix("p"), "p/objects/");
    }

    #[test]
    fn test_manifest_key_layout() {
        let key = manifest_key("p", "archives", "run-1", "yaml");
        assert!(key.starts_with("p/manifests/archives/"));
        assert!(key.ends_with("-run-1-archives.yaml"));
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a/b/c").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a\\b").is_err());
    }
}
