//! Filesystem-safe identifier handling.
//!
//! Every id that is later used as a path segment (node ids, repo keys,
//! dataset keys) is sanitised to `[a-z0-9._-]+` before it touches the
//! filesystem, and any path read from a DAG input/output is rejected if
//! absolute. This is the single place that rule lives.

use regex::Regex;

/// Lowercase and replace any run of characters outside `[a-z0-9._-]` with `-`,
/// then trim leading/trailing `-`. Used for node ids, repo keys, dataset keys.
pub fn sanitize_id(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let re = Regex::new(r"[^a-z0-9._-]+").expect("valid regex");
    let cleaned = re.replace_all(&lowered, "-");
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn is_safe_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let re = Regex::new(r"^[a-z0-9._-]+$").expect("valid regex");
    re.is_match(s)
}

/// A path used as a DAG node input/output must be relative and must not
/// escape the plan root via `..`.
pub fn is_safe_relative_path(p: &str) -> bool {
    if p.is_empty() {
        return false;
    }
    let path = std::path::Path::new(p);
    if path.is_absolute() {
        return false;
    }
    !path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==== sanitize_id ====

    #[test]
    fn sanitize_replaces_slash_with_dash() {
        assert_eq!(sanitize_id("foo/bar"), "foo-bar");
    }

    #[test]
    fn sanitize_lowercases() {
        assert_eq!(sanitize_id("Foo/BAR"), "foo-bar");
    }

    #[test]
    fn sanitize_collapses_runs_and_trims() {
        assert_eq!(sanitize_id("--foo///bar--"), "foo-bar");
    }

    #[test]
    fn sanitize_empty_becomes_unnamed() {
        assert_eq!(sanitize_id("///"), "unnamed");
    }

    // ==== is_safe_id ====

    #[test]
    fn safe_id_accepts_sanitized_form() {
        assert!(is_safe_id("foo-bar.v1_2"));
    }

    #[test]
    fn safe_id_rejects_uppercase_and_slash() {
        assert!(!is_safe_id("Foo/Bar"));
    }

    // ==== is_safe_relative_path ====

    #[test]
    fn relative_path_ok() {
        assert!(is_safe_relative_path("cache/git/foo-bar"));
    }

    #[test]
    fn absolute_path_rejected() {
        assert!(!is_safe_relative_path("/etc/passwd"));
    }

    #[test]
    fn parent_dir_escape_rejected() {
        assert!(!is_safe_relative_path("../../etc/passwd"));
    }

    #[test]
    fn empty_path_rejected() {
        assert!(!is_safe_relative_path(""));
    }
}
