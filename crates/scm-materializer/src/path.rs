//! Canonical and legacy artifact path construction (spec §4.H).

use scm_types::patch_blob::{PatchFormat, SourceType};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathBuildError {
    #[error("svn rev_or_sha must be 'r<decimal>', got: {0}")]
    InvalidSvnRev(String),
    #[error("git rev_or_sha must be hex, at least 7 characters, got: {0}")]
    InvalidGitSha(String),
}

/// Auto-prefixes a bare decimal revision with `r`, as the spec requires
/// at "helper entry" (the raw builder below stays strict).
pub fn normalize_svn_rev(input: &str) -> String {
    if input.starts_with('r') {
        input.to_string()
    } else if input.chars().all(|c| c.is_ascii_digit()) {
        format!("r{input}")
    } else {
        input.to_string()
    }
}

fn validate_rev_or_sha(source_type: SourceType, rev_or_sha: &str) -> Result<(), PathBuildError> {
    match source_type {
        SourceType::Svn => {
            let digits = rev_or_sha.strip_prefix('r').ok_or_else(|| {
                PathBuildError::InvalidSvnRev(rev_or_sha.to_string())
            })?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(PathBuildError::InvalidSvnRev(rev_or_sha.to_string()));
            }
            Ok(())
        }
        SourceType::Git => {
            if rev_or_sha.len() < 7 || !rev_or_sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(PathBuildError::InvalidGitSha(rev_or_sha.to_string()));
            }
            Ok(())
        }
    }
}

/// `scm/<project_key>/<repo_id>/<source_type>/<rev_or_sha>/<sha256>.<ext>`.
/// The raw builder rejects an unprefixed SVN revision; callers that accept
/// bare decimals should run them through [`normalize_svn_rev`] first.
pub fn build_canonical_path(
    project_key: &str,
    repo_id: i64,
    source_type: SourceType,
    rev_or_sha: &str,
    sha256: &str,
    format: PatchFormat,
) -> Result<String, PathBuildError> {
    validate_rev_or_sha(source_type, rev_or_sha)?;
    Ok(format!(
        "scm/{project_key}/{repo_id}/{}/{rev_or_sha}/{sha256}.{}",
        source_type.as_str(),
        format.ext(),
    ))
}

/// `scm/<repo_id>/svn/r<rev>.<ext>` or `scm/<repo_id>/git/commits/<sha>.<ext>`.
/// Readers probe the canonical path first, then this one, so pre-migration
/// artifacts remain reachable (spec §4.H "Legacy path fallback").
pub fn build_legacy_path(
    repo_id: i64,
    source_type: SourceType,
    rev_or_sha: &str,
    format: PatchFormat,
) -> String {
    match source_type {
        SourceType::Svn => format!(
            "scm/{repo_id}/svn/{}.{}",
            normalize_svn_rev(rev_or_sha),
            format.ext()
        ),
        SourceType::Git => format!("scm/{repo_id}/git/commits/{rev_or_sha}.{}", format.ext()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_for_git() {
        let path = build_canonical_path(
            "acme/svc",
            42,
            SourceType::Git,
            "abcdef1234",
            "deadbeef",
            PatchFormat::Diff,
        )
        .unwrap();
        assert_eq!(path, "scm/acme/svc/42/git/abcdef1234/deadbeef.diff");
    }

    #[test]
    fn canonical_path_for_svn_requires_prefix() {
        assert_eq!(
            build_canonical_path("acme/svc", 42, SourceType::Svn, "123", "hash", PatchFormat::Diff),
            Err(PathBuildError::InvalidSvnRev("123".to_string()))
        );
        let path = build_canonical_path("acme/svc", 42, SourceType::Svn, "r123", "hash", PatchFormat::Diffstat)
            .unwrap();
        assert_eq!(path, "scm/acme/svc/42/svn/r123/hash.diffstat");
    }

    #[test]
    fn git_sha_must_be_hex_and_long_enough() {
        assert_eq!(
            build_canonical_path("p", 1, SourceType::Git, "abc", "h", PatchFormat::Diff),
            Err(PathBuildError::InvalidGitSha("abc".to_string()))
        );
        assert_eq!(
            build_canonical_path("p", 1, SourceType::Git, "zzzzzzz", "h", PatchFormat::Diff),
            Err(PathBuildError::InvalidGitSha("zzzzzzz".to_string()))
        );
    }

    #[test]
    fn normalize_svn_rev_prefixes_bare_decimals() {
        assert_eq!(normalize_svn_rev("123"), "r123");
        assert_eq!(normalize_svn_rev("r123"), "r123");
    }

    #[test]
    fn legacy_paths_match_pre_migration_shape() {
        assert_eq!(
            build_legacy_path(7, SourceType::Svn, "42", PatchFormat::Diff),
            "scm/7/svn/r42.diff"
        );
        assert_eq!(
            build_legacy_path(7, SourceType::Git, "abcdef1", PatchFormat::Diff),
            "scm/7/git/commits/abcdef1.diff"
        );
    }
}
