//! Deterministic hashing of build inputs.
//!
//! Expands copy-source patterns inside a build context, drops ignored files,
//! and folds one SHA-256 over the surviving (path, content, executable bit)
//! tuples in byte-wise path order. The result is reproducible regardless of
//! filesystem traversal order, and symlinks hash by target string so the
//! digest is host-independent.

use crate::builder::ignore::IgnoreFilter;
use crate::error::{KilnError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Block size for streaming file contents into the hasher.
const READ_BLOCKSIZE: usize = 64 * 1024;

/// One hashed file, in canonical order within [`ContentHash::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHashEntry {
    /// Context-relative path with `/` separators.
    pub path: String,
    /// Hex SHA-256 of the file contents (or symlink target string).
    pub digest: String,
    /// Unix executable bit.
    pub executable: bool,
}

/// Aggregate digest over a sorted file set, plus the per-file trace.
#[derive(Debug, Clone)]
pub struct ContentHash {
    /// Hex SHA-256 over the ordered (path, digest, executable) tuples.
    pub digest: String,
    /// Per-file digests in the same order the aggregate was folded.
    pub entries: Vec<FileHashEntry>,
}

/// Hash the files matched by `patterns` under `context`.
///
/// Patterns are context-relative and may use glob syntax; a matched
/// directory contributes every file beneath it. A pattern matching nothing
/// is logged as a warning unless `fail_on_missing` turns it into an error.
pub fn hash_sources(
    image: &str,
    context: &Path,
    patterns: &[String],
    filter: &IgnoreFilter,
    fail_on_missing: bool,
) -> Result<ContentHash> {
    // BTreeMap gives the canonical byte-wise path order and deduplicates
    // files matched by overlapping patterns.
    let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();

    for pattern in patterns {
        let matched = expand_pattern(image, context, pattern)?;
        if matched.is_empty() {
            if fail_on_missing {
                return Err(KilnError::MissingFiles {
                    image: image.to_string(),
                    pattern: pattern.clone(),
                });
            }
            warn!(image, pattern, "copy source matched no files");
            continue;
        }
        for path in matched {
            let relative = relative_key(context, &path);
            files.insert(relative, path);
        }
    }

    let mut aggregate = Sha256::new();
    let mut entries = Vec::new();

    for (relative, path) in &files {
        if !filter.included(relative) {
            debug!(image, path = %relative, "ignored");
            continue;
        }
        let entry = hash_file(relative, path)?;
        aggregate.update(entry.path.as_bytes());
        aggregate.update([0u8]);
        aggregate.update(entry.digest.as_bytes());
        aggregate.update([u8::from(entry.executable)]);
        debug!(image, path = %entry.path, digest = %entry.digest, "hashed");
        entries.push(entry);
    }

    let digest = format!("{:x}", aggregate.finalize());
    debug!(image, %digest, files = entries.len(), "content hash complete");
    Ok(ContentHash { digest, entries })
}

/// Expand one glob pattern to the regular files and symlinks it names.
fn expand_pattern(image: &str, context: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let absolute = context.join(pattern);
    let glob_expr = absolute.to_string_lossy().into_owned();
    let paths = glob::glob(&glob_expr).map_err(|e| KilnError::Internal(format!(
        "invalid copy source pattern `{pattern}` for image {image}: {e}"
    )))?;

    let mut matched = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| KilnError::IoError {
            path: e.path().to_path_buf(),
            source: e.into_error(),
        })?;
        let meta = path.symlink_metadata().map_err(|e| KilnError::IoError {
            path: path.clone(),
            source: e,
        })?;
        if meta.is_dir() {
            collect_dir(&path, &mut matched)?;
        } else {
            matched.push(path);
        }
    }
    Ok(matched)
}

/// Recursively collect files and symlinks beneath a directory.
fn collect_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            match e.into_io_error() {
                Some(source) => KilnError::IoError { path, source },
                None => KilnError::Internal(format!("walk failed under {}", dir.display())),
            }
        })?;
        if entry.file_type().is_file() || entry.file_type().is_symlink() {
            out.push(entry.into_path());
        }
    }
    Ok(())
}

/// Context-relative path with `/` separators, used as the sort key.
fn relative_key(context: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(context).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Hash one file: symlinks by target string, regular files by streamed
/// contents.
fn hash_file(relative: &str, path: &Path) -> Result<FileHashEntry> {
    let meta = path.symlink_metadata().map_err(|e| KilnError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| KilnError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        hasher.update(target.to_string_lossy().as_bytes());
        return Ok(FileHashEntry {
            path: relative.to_string(),
            digest: format!("{:x}", hasher.finalize()),
            executable: false,
        });
    }

    let mut file = std::fs::File::open(path).map_err(|e| KilnError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = vec![0u8; READ_BLOCKSIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| KilnError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileHashEntry {
        path: relative.to_string(),
        digest: format!("{:x}", hasher.finalize()),
        executable: is_executable(&meta),
    })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn hash_all(context: &Path, patterns: &[&str], filter: &IgnoreFilter) -> ContentHash {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        hash_sources("test", context, &patterns, filter, false).unwrap()
    }

    #[test]
    fn test_determinism() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/keep.txt"), "v1").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine").unwrap();

        let filter = IgnoreFilter::default();
        let first = hash_all(dir.path(), &["Dockerfile", "app"], &filter);
        let second = hash_all(dir.path(), &["Dockerfile", "app"], &filter);
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.entries, second.entries);
    }

    #[test]
    fn test_sensitivity_to_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/keep.txt"), "v1").unwrap();

        let filter = IgnoreFilter::default();
        let before = hash_all(dir.path(), &["app"], &filter);

        fs::write(dir.path().join("app/keep.txt"), "v2").unwrap();
        let after = hash_all(dir.path(), &["app"], &filter);
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_ignored_files_are_inert() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/keep.txt"), "v1").unwrap();

        let filter = IgnoreFilter::from_patterns(["app/skip.txt"]);
        let before = hash_all(dir.path(), &["app"], &filter);

        fs::write(dir.path().join("app/skip.txt"), "noise").unwrap();
        let after = hash_all(dir.path(), &["app"], &filter);
        assert_eq!(before.digest, after.digest);
        assert_eq!(after.entries.len(), 1);
    }

    #[test]
    fn test_entries_sorted_bytewise() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/z.txt"), "z").unwrap();

        let filter = IgnoreFilter::default();
        let hash = hash_all(dir.path(), &["*", "a"], &filter);
        let paths: Vec<&str> = hash.entries.iter().map(|e| e.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_glob_pattern_expansion() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.conf"), "1").unwrap();
        fs::write(dir.path().join("two.conf"), "2").unwrap();
        fs::write(dir.path().join("other.txt"), "x").unwrap();

        let filter = IgnoreFilter::default();
        let hash = hash_all(dir.path(), &["*.conf"], &filter);
        assert_eq!(hash.entries.len(), 2);
    }

    #[test]
    fn test_overlapping_patterns_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.conf"), "1").unwrap();

        let filter = IgnoreFilter::default();
        let hash = hash_all(dir.path(), &["*.conf", "app.conf"], &filter);
        assert_eq!(hash.entries.len(), 1);
    }

    #[test]
    fn test_missing_pattern_warns_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let filter = IgnoreFilter::default();
        let hash = hash_sources("test", dir.path(), &["nope/*".to_string()], &filter, false);
        assert!(hash.unwrap().entries.is_empty());
    }

    #[test]
    fn test_missing_pattern_aborts_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let filter = IgnoreFilter::default();
        let err = hash_sources("test", dir.path(), &["nope/*".to_string()], &filter, true)
            .unwrap_err();
        assert!(matches!(err, KilnError::MissingFiles { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_hashes_target_string() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), "contents").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

        let filter = IgnoreFilter::default();
        let before = hash_all(dir.path(), &["link"], &filter);

        // Changing the target's contents must not change the link's digest.
        fs::write(dir.path().join("real.txt"), "different").unwrap();
        let after = hash_all(dir.path(), &["link"], &filter);
        assert_eq!(before.digest, after.digest);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_changes_digest() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

        let filter = IgnoreFilter::default();
        let before = hash_all(dir.path(), &["run.sh"], &filter);

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let after = hash_all(dir.path(), &["run.sh"], &filter);
        assert_ne!(before.digest, after.digest);
    }
}
