//! Desired mount sets and their canonical signature.
//!
//! A VM's virtiofs shares can't be changed on an existing definition, so every
//! invocation compares the signature of the mounts it wants against the one
//! stored next to the disk. Any difference means the definition is recreated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::AgentVirtError;

pub const SETUP_TAG: &str = "setup";
pub const READ_TAG: &str = "read";
pub const WRITE_TAG: &str = "write";

/// One host directory shared into the VM under a virtiofs tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub tag: String,
    pub readonly: bool,
}

impl MountSpec {
    pub fn new(source: impl Into<PathBuf>, tag: impl Into<String>, readonly: bool) -> Self {
        Self {
            source: source.into(),
            tag: tag.into(),
            readonly,
        }
    }

    /// Guest-side mount point for this share.
    pub fn guest_path(&self) -> String {
        format!("/opt/{}", self.tag)
    }
}

/// The standard mount set: setup (ro), read (ro), write (rw).
pub fn standard_mounts(setup_dir: &Path, read_dir: &Path, write_dir: &Path) -> Vec<MountSpec> {
    vec![
        MountSpec::new(setup_dir, SETUP_TAG, true),
        MountSpec::new(read_dir, READ_TAG, true),
        MountSpec::new(write_dir, WRITE_TAG, false),
    ]
}

/// Tags must be non-empty, slash-free and unique.
pub fn validate_mounts(mounts: &[MountSpec]) -> Result<(), AgentVirtError> {
    let mut seen = HashSet::new();
    for m in mounts {
        if m.tag.is_empty() {
            return Err(AgentVirtError::Validation {
                message: format!("mount tag for {} must not be empty", m.source.display()),
            });
        }
        if m.tag.contains('/') {
            return Err(AgentVirtError::Validation {
                message: format!("mount tag '{}' must not contain '/'", m.tag),
            });
        }
        if !seen.insert(m.tag.as_str()) {
            return Err(AgentVirtError::Validation {
                message: format!("duplicate mount tag '{}'", m.tag),
            });
        }
    }
    Ok(())
}

/// Absolute form of `path` without trailing slashes. Symlinks are resolved
/// when the path exists.
pub fn normalize_source(path: &Path) -> String {
    let resolved = path
        .canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    let s = resolved.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Canonical signature: normalized `(path, tag)` pairs, sorted, one per line.
pub fn signature(mounts: &[MountSpec]) -> String {
    let mut pairs: Vec<(String, &str)> = mounts
        .iter()
        .map(|m| (normalize_source(&m.source), m.tag.as_str()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(path, tag)| format!("{path} {tag}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the desired signature differs from what was stored.
///
/// With nothing stored yet, only a non-empty desired set counts as a change.
pub fn mounts_changed(desired: &str, stored: Option<&str>) -> bool {
    match stored {
        Some(stored) => desired != stored,
        None => !desired.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(source: &str, tag: &str) -> MountSpec {
        MountSpec::new(source, tag, false)
    }

    #[test]
    fn signature_ignores_order() {
        let a = signature(&[spec("/a", "x"), spec("/b", "y")]);
        let b = signature(&[spec("/b", "y"), spec("/a", "x")]);
        assert_eq!(a, b);
        assert!(!mounts_changed(&b, Some(&a)));
    }

    #[test]
    fn signature_ignores_trailing_slashes() {
        let a = signature(&[spec("/nonexistent-av/a/", "x")]);
        let b = signature(&[spec("/nonexistent-av/a", "x")]);
        assert_eq!(a, b);
        assert_eq!(a, "/nonexistent-av/a x");
    }

    #[test]
    fn signature_ignores_readonly_flag() {
        let a = signature(&[MountSpec::new("/a", "x", true)]);
        let b = signature(&[MountSpec::new("/a", "x", false)]);
        assert_eq!(a, b);
    }

    #[test]
    fn added_mount_changes_signature() {
        let before = signature(&[spec("/a", "x")]);
        let after = signature(&[spec("/a", "x"), spec("/c", "z")]);
        assert!(mounts_changed(&after, Some(&before)));
    }

    #[test]
    fn retagged_mount_changes_signature() {
        let before = signature(&[spec("/a", "x")]);
        let after = signature(&[spec("/a", "y")]);
        assert!(mounts_changed(&after, Some(&before)));
    }

    #[test]
    fn first_run_changed_only_when_non_empty() {
        assert!(mounts_changed(&signature(&[spec("/a", "x")]), None));
        assert!(!mounts_changed(&signature(&[]), None));
    }

    #[test]
    fn relative_sources_become_absolute() {
        let sig = signature(&[spec("some-relative-dir", "x")]);
        assert!(sig.starts_with('/'), "got {sig}");
    }

    #[test]
    fn existing_paths_resolve_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert_eq!(normalize_source(&link), normalize_source(&real));
    }

    #[test]
    fn tags_validated() {
        validate_mounts(&[spec("/a", "x"), spec("/b", "y")]).unwrap();
        assert!(validate_mounts(&[spec("/a", "")]).is_err());
        assert!(validate_mounts(&[spec("/a", "x/y")]).is_err());
        assert!(validate_mounts(&[spec("/a", "x"), spec("/b", "x")]).is_err());
    }

    #[test]
    fn standard_set_has_fixed_tags() {
        let mounts = standard_mounts(Path::new("/s"), Path::new("/r"), Path::new("/w"));
        let tags: Vec<_> = mounts.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, ["setup", "read", "write"]);
        assert!(mounts[0].readonly && mounts[1].readonly && !mounts[2].readonly);
        assert_eq!(mounts[2].guest_path(), "/opt/write");
    }
}
