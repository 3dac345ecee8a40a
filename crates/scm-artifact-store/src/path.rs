//! Path normalization and validation shared by the local and `file://`
//! backends (spec §4.A).

use thiserror::Error;

const MAX_PATH_BYTES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty or whitespace-only")]
    Empty,
    #[error("path contains a '..' segment")]
    ParentTraversal,
    #[error("path exceeds {MAX_PATH_BYTES} bytes")]
    TooLong,
    #[error("path does not start with an allowed prefix")]
    PrefixNotAllowed,
    #[error("resolved path escapes the store root")]
    RootEscape,
}

/// Applies the backslash/slash and leading-slash rules but does not reject
/// `..`. Used both standalone and as the first pass of [`validate_path`].
pub fn normalize_path(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return Err(PathError::Empty);
    }

    let forward_slashed = trimmed.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in forward_slashed.split('/') {
        if segment.is_empty() {
            continue;
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return Err(PathError::Empty);
    }

    Ok(segments.join("/"))
}

/// Full validation: normalizes, rejects `..` segments, enforces the length
/// cap, and — if `allowed_prefixes` is non-empty — requires the path to
/// start with one of them.
pub fn validate_path(raw: &str, allowed_prefixes: &[String]) -> Result<String, PathError> {
    let normalized = normalize_path(raw)?;

    if normalized.split('/').any(|segment| segment == "..") {
        return Err(PathError::ParentTraversal);
    }

    if normalized.len() > MAX_PATH_BYTES {
        return Err(PathError::TooLong);
    }

    if !allowed_prefixes.is_empty()
        && !allowed_prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix.as_str()))
    {
        return Err(PathError::PrefixNotAllowed);
    }

    Ok(normalized)
}

/// Canonicalizes `candidate`'s parent directory and confirms the result is
/// still within `root`. Defeats a symlinked intermediate directory pointing
/// outside the store. The leaf file need not exist yet.
pub fn assert_within_root(root: &std::path::Path, candidate: &std::path::Path) -> Result<(), PathError> {
    let parent = candidate.parent().unwrap_or(candidate);
    std::fs::create_dir_all(parent).map_err(|_| PathError::RootEscape)?;
    let canonical_parent = parent.canonicalize().map_err(|_| PathError::RootEscape)?;
    let canonical_root = root.canonicalize().map_err(|_| PathError::RootEscape)?;
    if !canonical_parent.starts_with(&canonical_root) {
        return Err(PathError::RootEscape);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_dot_only() {
        assert_eq!(normalize_path(""), Err(PathError::Empty));
        assert_eq!(normalize_path("   "), Err(PathError::Empty));
        assert_eq!(normalize_path("."), Err(PathError::Empty));
        assert_eq!(normalize_path(".."), Err(PathError::Empty));
    }

    #[test]
    fn collapses_slashes_and_strips_leading() {
        assert_eq!(normalize_path("//a//b/c").unwrap(), "a/b/c");
        assert_eq!(normalize_path("a\\b\\c").unwrap(), "a/b/c");
    }

    #[test]
    fn rejects_parent_traversal_after_normalization() {
        assert_eq!(
            validate_path("a/../b", &[]),
            Err(PathError::ParentTraversal)
        );
    }

    #[test]
    fn enforces_allowed_prefixes() {
        let prefixes = vec!["git".to_string()];
        assert!(validate_path("git/abcd1234", &prefixes).is_ok());
        assert_eq!(
            validate_path("svn/r1", &prefixes),
            Err(PathError::PrefixNotAllowed)
        );
    }

    #[test]
    fn rejects_overlong_path() {
        let long = "a".repeat(MAX_PATH_BYTES + 1);
        assert_eq!(validate_path(&long, &[]), Err(PathError::TooLong));
    }
}
