use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use filetime::FileTime;
use walkdir::WalkDir;
// Filesystem enumeration and timestamp helpers for the sync pipeline

/// Recursively list everything under `root` as root-relative paths.
/// Returns `(files, dirs)`. Directories come parent-before-child so a peer
/// can replay creates in order. Symlinks and special files are listed as
/// files. Unreadable entries and non-UTF-8 names are skipped.
pub fn list_items(root: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue, // the root itself
        };
        let Some(rel) = rel.to_str() else { continue };

        if entry.file_type().is_dir() {
            dirs.push(rel.to_string());
        } else {
            files.push(rel.to_string());
        }
    }

    Ok((files, dirs))
}

/// Last-modified time as nanoseconds since the Unix epoch. Pre-epoch and
/// unreadable times clamp to zero.
pub fn mod_time_nanos(md: &std::fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Apply a wire timestamp to a path (access and modification time both).
pub fn set_times(path: &Path, nanos: i64) -> Result<()> {
    let ft = FileTime::from_unix_time(
        nanos.div_euclid(1_000_000_000),
        nanos.rem_euclid(1_000_000_000) as u32,
    );
    filetime::set_file_times(path, ft, ft)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lists_files_and_dirs_relative_to_root() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub/inner")).unwrap();
        fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        fs::write(tmp.path().join("sub/b.txt"), b"b").unwrap();
        fs::write(tmp.path().join("sub/inner/c.txt"), b"c").unwrap();

        let (mut files, dirs) = list_items(tmp.path()).unwrap();
        files.sort();
        assert_eq!(files, ["a.txt", "sub/b.txt", "sub/inner/c.txt"]);

        // Parents strictly before children, whatever the sibling order.
        let sub = dirs.iter().position(|d| d == "sub").unwrap();
        let inner = dirs.iter().position(|d| d == "sub/inner").unwrap();
        assert!(sub < inner);
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn empty_root_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let (files, dirs) = list_items(tmp.path()).unwrap();
        assert!(files.is_empty());
        assert!(dirs.is_empty());
    }

    #[test]
    fn set_times_round_trips_through_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stamped.txt");
        fs::write(&path, b"x").unwrap();

        let stamp = 1_700_000_000_123_456_789i64;
        set_times(&path, stamp).unwrap();
        let md = fs::metadata(&path).unwrap();
        assert_eq!(mod_time_nanos(&md), stamp);
    }

    #[test]
    fn now_nanos_is_monotonic_enough() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
        assert!(a > 0);
    }
}
