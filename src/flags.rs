//! Deleteme-flag file protocol and root-directory bookkeeping
//!
//! A zero-byte `<base>.deleted` marker asserts that `<base>` and every
//! `<base>.*` companion are garbage. The flag is set before a file family
//! is created or removed from the visible lists, which makes both segment
//! creation and deletion crash-atomic: the startup sweep deletes every
//! flagged family before anything is opened.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

pub const BUFFER_PREFIX: &str = "buffer";
pub const SEGMENT_PREFIX: &str = "segment";
const FLAG_SUFFIX: &str = "deleted";
pub const DATA_SUFFIX: &str = "data";
pub const OFFSETS_SUFFIX: &str = "offsets";

/// Id parsed from the second dot-separated field of a file name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileId {
    /// `buffer.7` / `segment.7`
    Scalar(u64),
    /// `segment.3-9`: a compacted id span
    Pair(u64, u64),
}

impl FileId {
    pub fn max_id(&self) -> u64 {
        match *self {
            FileId::Scalar(n) => n,
            FileId::Pair(_, n) => n,
        }
    }
}

/// Parse the id field of `buffer.N` / `segment.N` / `segment.M-N`.
/// Hex-digest segment names have no numeric id and yield `None`.
pub fn parse_id(name: &str) -> Option<FileId> {
    let field = name.split('.').nth(1)?;
    if let Ok(n) = field.parse::<u64>() {
        return Some(FileId::Scalar(n));
    }
    let (lo, hi) = field.split_once('-')?;
    match (lo.parse::<u64>(), hi.parse::<u64>()) {
        (Ok(lo), Ok(hi)) => Some(FileId::Pair(lo, hi)),
        _ => None,
    }
}

/// The base (lock) name for a path, e.g. `segment.4` for `segment.4.data`:
/// everything before the second dot
pub fn base_name(name: &str) -> &str {
    let mut dots = name.match_indices('.');
    match (dots.next(), dots.next()) {
        (Some(_), Some((second, _))) => &name[..second],
        _ => name,
    }
}

fn flag_path(root: &Path, base: &str) -> PathBuf {
    root.join(format!("{}.{}", base, FLAG_SUFFIX))
}

/// Assert that `base` and its companions are garbage
pub fn set_flag(root: &Path, base: &str) -> Result<()> {
    fs::File::create(flag_path(root, base))?;
    Ok(())
}

/// Retract the garbage assertion; the family is about to become visible
pub fn clear_flag(root: &Path, base: &str) -> Result<()> {
    match fs::remove_file(flag_path(root, base)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn is_flagged(root: &Path, base: &str) -> bool {
    flag_path(root, base).exists()
}

/// Delete `base`, every `base.*` companion, and the flag itself
pub fn delete_family(root: &Path, base: &str) -> Result<()> {
    for name in list_root(root)? {
        if name == base || name.starts_with(&format!("{}.", base)) {
            remove_quiet(&root.join(&name))?;
        }
    }
    Ok(())
}

/// Startup sweep step 1: delete every flagged file family.
/// Returns the number of flags processed.
pub fn sweep(root: &Path) -> Result<usize> {
    let mut swept = 0;
    for name in list_root(root)? {
        if let Some(base) = name.strip_suffix(&format!(".{}", FLAG_SUFFIX)) {
            debug!(base, "sweeping flagged file family");
            delete_family(root, base)?;
            swept += 1;
        }
    }
    Ok(swept)
}

/// Names of regular files directly under `root`
pub fn list_root(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn remove_quiet(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("buffer.7"), Some(FileId::Scalar(7)));
        assert_eq!(parse_id("segment.12.data"), Some(FileId::Scalar(12)));
        assert_eq!(parse_id("segment.3-9"), Some(FileId::Pair(3, 9)));
        assert_eq!(parse_id("segment.3-9").unwrap().max_id(), 9);
        assert_eq!(parse_id("segment.a1b2c3"), None);
        assert_eq!(parse_id("junk"), None);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("segment.4.data"), "segment.4");
        assert_eq!(base_name("segment.4"), "segment.4");
        assert_eq!(base_name("buffer.10"), "buffer.10");
    }

    #[test]
    fn test_flag_lifecycle() {
        let dir = TempDir::new().unwrap();
        assert!(!is_flagged(dir.path(), "segment.1"));
        set_flag(dir.path(), "segment.1").unwrap();
        assert!(is_flagged(dir.path(), "segment.1"));
        clear_flag(dir.path(), "segment.1").unwrap();
        assert!(!is_flagged(dir.path(), "segment.1"));
        // Clearing twice is fine
        clear_flag(dir.path(), "segment.1").unwrap();
    }

    #[test]
    fn test_sweep_removes_flagged_family_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("segment.1.data"), b"x").unwrap();
        std::fs::write(dir.path().join("segment.1.offsets"), b"x").unwrap();
        std::fs::write(dir.path().join("segment.10.data"), b"x").unwrap();
        std::fs::write(dir.path().join("buffer.2"), b"x").unwrap();
        set_flag(dir.path(), "segment.1").unwrap();

        let swept = sweep(dir.path()).unwrap();
        assert_eq!(swept, 1);

        let left = list_root(dir.path()).unwrap();
        // segment.10 must survive: "segment.1" is not its base
        assert_eq!(left, vec!["buffer.2".to_string(), "segment.10.data".to_string()]);
    }
}
