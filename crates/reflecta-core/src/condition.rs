//! Conditional-request state machine: `If-Match`/`If-None-Match` parsing and
//! matching against the current `ETag` or the literal `generation:N`.
//!
//! The wire ETags this runtime hands out are already opaque content hashes,
//! so strong and weak comparison collapse to the same tag equality here; both
//! entry points below exist to name the two request-header roles (read vs.
//! write) rather than to implement distinct comparison algorithms.

use crate::error::Error;

fn parse_tags(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(|part| {
            let part = part.trim();
            let part = part.strip_prefix("W/").unwrap_or(part);
            part.trim_matches('"').to_string()
        })
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn tag_matches(header: &str, etag: &str, generation: u64) -> bool {
    let header = header.trim();
    if header.is_empty() {
        return false;
    }
    if header == "*" {
        return true;
    }
    let generation_tag = format!("generation:{generation}");
    parse_tags(header)
        .iter()
        .any(|tag| tag == etag || *tag == generation_tag)
}

/// `If-None-Match` handling for reads: `true` means the client's cached copy
/// is still fresh and the caller should answer 304 with no body.
pub fn is_not_modified(if_none_match: Option<&str>, etag: &str, generation: u64) -> bool {
    match if_none_match {
        Some(header) => tag_matches(header, etag, generation),
        None => false,
    }
}

/// `If-Match` handling for writes: absent or empty header always proceeds;
/// otherwise the header must match the current ETag or `generation:N`.
pub fn check_if_match(if_match: Option<&str>, etag: &str, generation: u64) -> Result<(), Error> {
    match if_match {
        None => Ok(()),
        Some(header) if header.trim().is_empty() => Ok(()),
        Some(header) => {
            if tag_matches(header, etag, generation) {
                Ok(())
            } else {
                Err(Error::precondition_failed(format!(
                    "If-Match {header} does not match current ETag {etag} or generation:{generation}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_or_empty_if_match_proceeds() {
        assert!(check_if_match(None, "abc", 1).is_ok());
        assert!(check_if_match(Some(""), "abc", 1).is_ok());
        assert!(check_if_match(Some("   "), "abc", 1).is_ok());
    }

    #[test]
    fn if_match_accepts_etag_or_generation_tag() {
        assert!(check_if_match(Some("\"abc\""), "abc", 1).is_ok());
        assert!(check_if_match(Some("\"generation:1\""), "abc", 1).is_ok());
        assert!(check_if_match(Some("\"other\""), "abc", 1).is_err());
    }

    #[test]
    fn if_match_mismatch_is_precondition_failed() {
        let err = check_if_match(Some("\"wrong\""), "abc", 1).unwrap_err();
        assert_eq!(err.status(), 412);
    }

    #[test]
    fn if_none_match_weak_prefix_is_ignored() {
        assert!(is_not_modified(Some("W/\"abc\""), "abc", 1));
        assert!(!is_not_modified(Some("\"xyz\""), "abc", 1));
        assert!(!is_not_modified(None, "abc", 1));
    }

    #[test]
    fn if_none_match_accepts_generation_tag() {
        assert!(is_not_modified(Some("\"generation:5\""), "abc", 5));
    }
}
