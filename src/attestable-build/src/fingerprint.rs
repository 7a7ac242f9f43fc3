// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Content-addressable fingerprints of file trees.
//!
//! A set of glob patterns is expanded relative to a working directory, sorted
//! and deduplicated, and every entry is hashed into a leaf. Leaves are folded
//! into a Keccak-256 Merkle tree whose root identifies the tree.
//!
//! Hashing fans out over a fixed pool of threads pulling from a shared queue.
//! Each result lands in the slot that matches the path's position in the
//! sorted list, so the outcome does not depend on scheduling.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use glob::{MatchOptions, Pattern};
use sha3::{Digest, Keccak256};
use tracing::debug;

/// Worker threads used when the caller does not ask for a specific number.
pub const DEFAULT_HASH_WORKERS: usize = 10;

/// Pattern that selects every entry under the working directory.
pub const ALL_ENTRIES: &str = "**/*";

pub type Hash = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("invalid file pattern {pattern:?}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("could not expand file pattern {pattern:?}")]
    Walk {
        pattern: String,
        #[source]
        source: glob::GlobError,
    },

    #[error("no files matched {patterns:?} in {root:?}")]
    NoMatches { root: PathBuf, patterns: Vec<String> },

    #[error("path {path:?} is not valid UTF-8")]
    NonUtf8 { path: PathBuf },

    #[error("could not hash {path:?}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("size of {path:?} changed while hashing: expected {expected} bytes, read {actual}")]
    SizeMismatch { path: String, expected: u64, actual: u64 },

    #[error("hash worker panicked")]
    WorkerPanic,
}

/// Ordered file list, per-entry leaves and Merkle root of a file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetFingerprint {
    pub files: Vec<String>,
    pub leaves: Vec<Hash>,
    pub root: Hash,
}

impl FileSetFingerprint {
    pub fn root_hex(&self) -> String {
        to_prefixed_hex(&self.root)
    }
}

/// Lowercase hex with a `0x` prefix.
pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Fingerprint everything under `root` that matches one of `patterns`.
#[tracing::instrument(skip_all, fields(root = ?root.as_ref()))]
pub fn fingerprint(
    root: impl AsRef<Path>,
    patterns: &[impl AsRef<str>],
    workers: usize,
    salt: Option<&[u8]>,
) -> Result<FileSetFingerprint, FingerprintError> {
    let root = root.as_ref();
    let files = expand_patterns(root, patterns)?;
    if files.is_empty() {
        return Err(FingerprintError::NoMatches {
            root: root.to_path_buf(),
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        });
    }
    fingerprint_paths(root, files, workers, salt)
}

/// Like [`fingerprint`], but every matched directory also pulls in the
/// entries beneath it. Used for outputs, where a matched directory is
/// shipped with its contents and those contents must be bound too.
#[tracing::instrument(skip_all, fields(root = ?root.as_ref()))]
pub fn fingerprint_with_subtrees(
    root: impl AsRef<Path>,
    patterns: &[impl AsRef<str>],
    workers: usize,
    salt: Option<&[u8]>,
) -> Result<FileSetFingerprint, FingerprintError> {
    let root = root.as_ref();
    let matched = expand_patterns(root, patterns)?;
    if matched.is_empty() {
        return Err(FingerprintError::NoMatches {
            root: root.to_path_buf(),
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        });
    }
    let files = include_subtrees(root, matched)?;
    fingerprint_paths(root, files, workers, salt)
}

/// Add every entry below each directory in `files`. Symlinks are not
/// followed. The result is sorted and deduplicated.
pub fn include_subtrees(root: &Path, files: Vec<String>) -> Result<Vec<String>, FingerprintError> {
    let mut all: BTreeSet<String> = BTreeSet::new();
    for relative in files {
        let full = root.join(&relative);
        let meta = std::fs::symlink_metadata(&full).map_err(|source| FingerprintError::Read {
            path: relative.clone(),
            source,
        })?;
        if meta.is_dir() {
            walk_dir(root, Path::new(&relative), &mut all)?;
        }
        all.insert(relative);
    }
    Ok(all.into_iter().collect())
}

fn walk_dir(root: &Path, relative: &Path, out: &mut BTreeSet<String>) -> Result<(), FingerprintError> {
    let read_err = |source| FingerprintError::Read {
        path: relative.to_string_lossy().into_owned(),
        source,
    };
    for entry in std::fs::read_dir(root.join(relative)).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = relative.join(entry.file_name());
        let name = path
            .to_str()
            .ok_or_else(|| FingerprintError::NonUtf8 { path: path.clone() })?
            .to_string();
        if entry.file_type().map_err(read_err)?.is_dir() {
            walk_dir(root, &path, out)?;
        }
        out.insert(name);
    }
    Ok(())
}

/// Fingerprint an explicit list of root-relative paths. The list is sorted
/// and deduplicated first.
pub fn fingerprint_paths(
    root: &Path,
    files: Vec<String>,
    workers: usize,
    salt: Option<&[u8]>,
) -> Result<FileSetFingerprint, FingerprintError> {
    let files: Vec<String> = files.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    debug!(count = files.len(), workers, "Hashing file set");
    let leaves = hash_entries(root, &files, workers.max(1))?;
    let root_hash = merkle_root(&leaves, salt.unwrap_or_default());

    Ok(FileSetFingerprint {
        files,
        leaves,
        root: root_hash,
    })
}

/// Expand glob patterns relative to `root` into a sorted, deduplicated list of
/// root-relative paths.
pub fn expand_patterns(
    root: &Path,
    patterns: &[impl AsRef<str>],
) -> Result<Vec<String>, FingerprintError> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let escaped_root = Pattern::escape(&root.to_string_lossy());

    let mut files = BTreeSet::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let full = format!("{}/{}", escaped_root.trim_end_matches('/'), pattern.trim_start_matches("./"));
        let paths = glob::glob_with(&full, options).map_err(|source| FingerprintError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        for entry in paths {
            let path = entry.map_err(|source| FingerprintError::Walk {
                pattern: pattern.to_string(),
                source,
            })?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            if relative.as_os_str().is_empty() {
                continue;
            }
            let relative = relative
                .to_str()
                .ok_or_else(|| FingerprintError::NonUtf8 { path: path.clone() })?;
            files.insert(relative.to_string());
        }
    }

    // BTreeSet<String> orders by bytes, which is what the tree needs.
    Ok(files.into_iter().collect())
}

fn hash_entries(root: &Path, files: &[String], workers: usize) -> Result<Vec<Hash>, FingerprintError> {
    let slots: Vec<OnceLock<Hash>> = (0..files.len()).map(|_| OnceLock::new()).collect();
    let first_error: Mutex<Option<FingerprintError>> = Mutex::new(None);
    let aborted = AtomicBool::new(false);

    let (tx, rx) = crossbeam_channel::bounded::<usize>(workers * 2);

    let panicked = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let slots = &slots;
                let first_error = &first_error;
                let aborted = &aborted;
                scope.spawn(move || {
                    // Keep draining after an abort so the producer never blocks.
                    for index in rx {
                        if aborted.load(Ordering::Relaxed) {
                            continue;
                        }
                        match hash_entry(root, &files[index]) {
                            Ok(leaf) => {
                                let _ = slots[index].set(leaf);
                            }
                            Err(e) => {
                                aborted.store(true, Ordering::Relaxed);
                                let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                                slot.get_or_insert(e);
                            }
                        }
                    }
                })
            })
            .collect();
        drop(rx);

        for index in 0..files.len() {
            if aborted.load(Ordering::Relaxed) {
                break;
            }
            if tx.send(index).is_err() {
                break;
            }
        }
        drop(tx);

        let mut panicked = false;
        for handle in handles {
            panicked |= handle.join().is_err();
        }
        panicked
    });

    if let Some(e) = first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(e);
    }
    if panicked {
        return Err(FingerprintError::WorkerPanic);
    }

    slots
        .into_iter()
        .map(|slot| slot.into_inner().ok_or(FingerprintError::WorkerPanic))
        .collect()
}

/// Leaf hash for a single root-relative path.
///
/// Files hash their path followed by their contents; directories hash the path
/// alone. Symlinks are not followed.
pub fn hash_entry(root: &Path, relative: &str) -> Result<Hash, FingerprintError> {
    let read_err = |source| FingerprintError::Read {
        path: relative.to_string(),
        source,
    };
    let full = root.join(relative);
    let meta = std::fs::symlink_metadata(&full).map_err(read_err)?;

    let mut hasher = Keccak256::new();
    hasher.update(relative.as_bytes());

    if meta.is_dir() {
        return Ok(hasher.finalize().into());
    }

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(&full).map_err(read_err)?;
        hasher.update(target.to_string_lossy().as_bytes());
        return Ok(hasher.finalize().into());
    }

    let expected = meta.len();
    let mut file = File::open(&full).map_err(read_err)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut actual = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        actual += n as u64;
    }

    if actual != expected {
        return Err(FingerprintError::SizeMismatch {
            path: relative.to_string(),
            expected,
            actual,
        });
    }

    Ok(hasher.finalize().into())
}

/// Fold leaves into a Merkle root.
///
/// The leaf row is padded to a power of two. Each real leaf becomes
/// `H(leaf || salt)`; padding nodes are empty. A parent is `H(left || right)`
/// where empty children contribute nothing, and a parent of two empty
/// children stays empty.
pub fn merkle_root(leaves: &[Hash], salt: &[u8]) -> Hash {
    let width = leaves.len().max(1).next_power_of_two();

    let mut row: Vec<Option<Hash>> = Vec::with_capacity(width);
    for leaf in leaves {
        let mut hasher = Keccak256::new();
        hasher.update(leaf);
        hasher.update(salt);
        row.push(Some(hasher.finalize().into()));
    }
    row.resize(width, None);

    while row.len() > 1 {
        row = row
            .chunks(2)
            .map(|pair| match (pair[0], pair[1]) {
                (None, None) => None,
                (left, right) => {
                    let mut hasher = Keccak256::new();
                    if let Some(left) = left {
                        hasher.update(left);
                    }
                    if let Some(right) = right {
                        hasher.update(right);
                    }
                    Some(hasher.finalize().into())
                }
            })
            .collect();
    }

    row[0].unwrap_or_else(|| Keccak256::digest([]).into())
}

/// Prints as `0x`-prefixed hex.
pub struct HexHash<'a>(pub &'a Hash);

impl fmt::Display for HexHash<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn keccak(parts: &[&[u8]]) -> Hash {
        let mut hasher = Keccak256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    #[test]
    fn test_expansion_is_sorted_and_deduplicated() {
        let dir = tree(&[("b.txt", "b"), ("a.txt", "a"), ("sub/c.txt", "c"), (".hidden", "h")]);
        let files = expand_patterns(dir.path(), &["*.txt", "a.txt", ALL_ENTRIES]).unwrap();
        assert_eq!(files, vec![".hidden", "a.txt", "b.txt", "sub", "sub/c.txt"]);
    }

    #[test]
    fn test_single_file_matches_independent_computation() {
        let dir = tree(&[("out.txt", "hi\n")]);
        let fp = fingerprint(dir.path(), &["out.txt"], DEFAULT_HASH_WORKERS, None).unwrap();

        let leaf = keccak(&[b"out.txt", b"hi\n"]);
        assert_eq!(fp.files, vec!["out.txt"]);
        assert_eq!(fp.leaves, vec![leaf]);
        assert_eq!(fp.root, keccak(&[&leaf]));
    }

    #[test]
    fn test_subtree_contents_bound_into_output_root() {
        let dir = tree(&[("dist/app.bin", "honest"), ("dist/lib/x.so", "x"), ("other", "o")]);
        let before = fingerprint_with_subtrees(dir.path(), &["dist"], 2, None).unwrap();
        assert_eq!(before.files, vec!["dist", "dist/app.bin", "dist/lib", "dist/lib/x.so"]);

        fs::write(dir.path().join("dist/app.bin"), "EVIL payload").unwrap();
        let after = fingerprint_with_subtrees(dir.path(), &["dist"], 2, None).unwrap();
        assert_ne!(before.root, after.root);
    }

    #[test]
    fn test_directory_leaf_hashes_path_only() {
        let dir = tree(&[("sub/x", "x")]);
        assert_eq!(hash_entry(dir.path(), "sub").unwrap(), keccak(&[b"sub"]));
    }

    #[test]
    fn test_root_independent_of_worker_count() {
        let files: Vec<(String, String)> = (0..57).map(|i| (format!("f{i:03}"), format!("content {i}"))).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let dir = tree(&refs);

        let one = fingerprint(dir.path(), &[ALL_ENTRIES], 1, None).unwrap();
        let many = fingerprint(dir.path(), &[ALL_ENTRIES], 16, None).unwrap();
        assert_eq!(one, many);
    }

    #[test]
    fn test_content_and_path_changes_change_root() {
        let base = tree(&[("a", "same"), ("b", "other")]);
        let changed_content = tree(&[("a", "diff"), ("b", "other")]);
        let renamed = tree(&[("c", "same"), ("b", "other")]);

        let root = |d: &TempDir| fingerprint(d.path(), &[ALL_ENTRIES], 4, None).unwrap().root;
        assert_ne!(root(&base), root(&changed_content));
        assert_ne!(root(&base), root(&renamed));
    }

    #[test]
    fn test_same_content_different_path_differs() {
        let dir = tree(&[("one", "x"), ("two", "x")]);
        let fp = fingerprint(dir.path(), &[ALL_ENTRIES], 2, None).unwrap();
        assert_ne!(fp.leaves[0], fp.leaves[1]);
    }

    #[test]
    fn test_salt_changes_root() {
        let dir = tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let plain = fingerprint(dir.path(), &[ALL_ENTRIES], 2, None).unwrap();
        let salted = fingerprint(dir.path(), &[ALL_ENTRIES], 2, Some(b"salt")).unwrap();
        assert_eq!(plain.leaves, salted.leaves);
        assert_ne!(plain.root, salted.root);
    }

    #[test]
    fn test_three_leaves_pad_to_four() {
        let leaves = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let n: Vec<Hash> = leaves.iter().map(|l| keccak(&[l])).collect();
        let left = keccak(&[&n[0], &n[1]]);
        let right = keccak(&[&n[2]]);
        assert_eq!(merkle_root(&leaves, &[]), keccak(&[&left, &right]));
    }

    #[test]
    fn test_empty_set_is_an_error() {
        let dir = tree(&[("a", "1")]);
        let err = fingerprint(dir.path(), &["*.missing"], 2, None).unwrap_err();
        assert!(matches!(err, FingerprintError::NoMatches { .. }));
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = tree(&[("a", "1")]);
        let err = fingerprint(dir.path(), &["[unclosed"], 2, None).unwrap_err();
        assert!(matches!(err, FingerprintError::Pattern { .. }));
    }

    #[test]
    fn test_hex_display() {
        let hash = [0xabu8; 32];
        assert_eq!(HexHash(&hash).to_string(), to_prefixed_hex(&hash));
        assert!(HexHash(&hash).to_string().starts_with("0xabab"));
    }
}
