//! Relative-path validation shared by both ends of a link.
//!
//! A relative path is only acted on when it is canonical: non-empty, not
//! `.`, and made purely of normal components with no redundant separators.
//! Anything else is ignored at the event source and treated as a protocol
//! error when it arrives on the wire.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};

/// Reject a relative path that is empty, non-canonical, or would escape the
/// root it is joined to.
pub fn validate(rel: &str) -> Result<()> {
    if rel.is_empty() || rel == "." {
        bail!("empty relative path");
    }
    if rel.contains('\0') {
        bail!("path contains NUL byte");
    }

    let path = Path::new(rel);
    let mut rebuilt = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => rebuilt.push(part),
            other => bail!("path {rel:?} contains disallowed component: {other:?}"),
        }
    }

    // Components normalize away `.` and doubled separators; a canonical
    // input rebuilds to itself byte for byte.
    if rebuilt.as_os_str() != path.as_os_str() {
        bail!("path {rel:?} is not canonical");
    }
    Ok(())
}

/// Resolve a wire-supplied relative path beneath `root`, validating first.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    validate(rel)?;
    Ok(root.join(rel))
}

/// Relative form of a watched absolute path, if it lies inside `root` and is
/// canonical. `None` means the event must be dropped.
pub fn rel_under_root(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.to_str()?;
    if validate(rel).is_err() {
        return None;
    }
    Some(rel.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_paths() {
        for rel in ["a", "a.txt", "sub/b.txt", "sub/deeper/c", "with space/f"] {
            assert!(validate(rel).is_ok(), "rejected {rel:?}");
        }
    }

    #[test]
    fn rejects_non_canonical_paths() {
        for rel in [
            "",
            ".",
            "..",
            "../etc/passwd",
            "a/../b",
            "./a",
            "a/./b",
            "a//b",
            "a/",
            "/abs",
            "a\0b",
        ] {
            assert!(validate(rel).is_err(), "accepted {rel:?}");
        }
    }

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/sync/root");
        assert_eq!(resolve(root, "sub/a.txt").unwrap(), root.join("sub/a.txt"));
        assert!(resolve(root, "../a.txt").is_err());
    }

    #[test]
    fn rel_under_root_strips_and_validates() {
        let root = Path::new("/sync/root");
        assert_eq!(
            rel_under_root(root, Path::new("/sync/root/sub/a.txt")).as_deref(),
            Some("sub/a.txt")
        );
        // Outside the root entirely
        assert_eq!(rel_under_root(root, Path::new("/elsewhere/a.txt")), None);
        // The root itself carries no relative path
        assert_eq!(rel_under_root(root, root), None);
    }
}
