use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fmt,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::ext::{AsyncTryFrom, BestEffortPathExt};
use crate::tree::{FileDigest, FileDigestError, TreeEntry, is_concurrent_change};

/// Canonical summary of a directory tree: one entry per file or directory
/// below the root, sorted by relative path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeFingerprint {
    entries: Vec<TreeEntry>,
}

impl TreeFingerprint {
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, relative_path: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|entry| entry.relative_path().cmp(relative_path))
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Lines present on only one side, in fingerprint order.
    pub fn diff(&self, other: &TreeFingerprint) -> FingerprintDiff {
        let left = self.entries.iter().collect::<BTreeSet<_>>();
        let right = other.entries.iter().collect::<BTreeSet<_>>();

        FingerprintDiff {
            left_only: self
                .entries
                .iter()
                .filter(|entry| !right.contains(entry))
                .cloned()
                .collect(),
            right_only: other
                .entries
                .iter()
                .filter(|entry| !left.contains(entry))
                .cloned()
                .collect(),
        }
    }

    fn from_entries(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.relative_path().cmp(b.relative_path()));
        Self { entries }
    }
}

impl fmt::Display for TreeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl AsyncTryFrom<&Path> for TreeFingerprint {
    type Error = FingerprintError;

    async fn async_try_from(root: &Path) -> Result<Self, Self::Error> {
        let metadata = root.metadata().context(RootSnafu {
            path: root.to_path_buf(),
        })?;
        if !metadata.is_dir() {
            return Err(FingerprintError::RootNotDirectoryError {
                path: root.to_path_buf(),
            });
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(root).min_depth(1).follow_links(false);

        for item in walker {
            let dir_entry = match item {
                Ok(dir_entry) => dir_entry,
                Err(e) if changed_during_walk(&e) => {
                    debug!("Entry changed during walk: {:?}", e.path());
                    continue;
                }
                Err(e) => {
                    return Err(e).context(WalkSnafu {
                        path: root.to_path_buf(),
                    });
                }
            };

            if let Some(entry) = tree_entry(root, &dir_entry).await? {
                entries.push(entry);
            }
        }

        Ok(Self::from_entries(entries))
    }
}

/// Computes the fingerprint of the tree rooted at `root`.
pub async fn fingerprint(root: &Path) -> Result<TreeFingerprint, FingerprintError> {
    TreeFingerprint::async_try_from(root).await
}

/// Symlinks are opaque leaves: hashed by their target path, never followed.
async fn tree_entry(
    root: &Path,
    dir_entry: &DirEntry,
) -> Result<Option<TreeEntry>, FingerprintError> {
    let relative_path = relative_path(root, dir_entry.path());
    let file_type = dir_entry.file_type();

    if file_type.is_dir() {
        return Ok(Some(TreeEntry::directory(relative_path)));
    }

    if file_type.is_symlink() {
        let target = match std::fs::read_link(dir_entry.path()) {
            Ok(target) => target,
            // InvalidInput: the link was replaced by a regular entry.
            Err(e) if is_concurrent_change(&e) || e.kind() == ErrorKind::InvalidInput => {
                debug!("Symlink changed during walk: {relative_path}");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(SymlinkSnafu {
                    path: dir_entry.path().to_path_buf(),
                });
            }
        };
        let digest = FileDigest::of_bytes(target.as_os_str().as_encoded_bytes());
        return Ok(Some(TreeEntry::file(relative_path, digest.size, digest.hex)));
    }

    match FileDigest::of_file(dir_entry.path())
        .await
        .context(DigestSnafu)?
    {
        Some(digest) => Ok(Some(TreeEntry::file(relative_path, digest.size, digest.hex))),
        None => {
            debug!("File vanished or became a directory before hashing: {relative_path}");
            Ok(None)
        }
    }
}

/// Joins the components below `root` with `/`.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(escape_name(name)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// UTF-8 names are kept as they are, except that `\` is doubled. Bytes that
/// are not UTF-8 become `\xNN`, so distinct names never render the same.
fn escape_name(name: &OsStr) -> String {
    let mut escaped = String::new();
    for chunk in name.as_encoded_bytes().utf8_chunks() {
        escaped.push_str(&chunk.valid().replace('\\', "\\\\"));
        for byte in chunk.invalid() {
            escaped.push_str(&format!("\\x{byte:02x}"));
        }
    }
    escaped
}

fn changed_during_walk(error: &walkdir::Error) -> bool {
    error.io_error().is_some_and(is_concurrent_change)
}

/// Set difference between two fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FingerprintDiff {
    pub left_only: Vec<TreeEntry>,
    pub right_only: Vec<TreeEntry>,
}

#[cfg(test)]
impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        self.left_only.is_empty() && self.right_only.is_empty()
    }
}

impl fmt::Display for FingerprintDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.left_only {
            writeln!(f, "- {entry}")?;
        }
        for entry in &self.right_only {
            writeln!(f, "+ {entry}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum FingerprintError {
    #[snafu(display("Cannot fingerprint {}", path.best_effort_path_display()))]
    RootError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Cannot fingerprint {}: not a directory", path.best_effort_path_display()))]
    RootNotDirectoryError { path: PathBuf },
    #[snafu(display("Failed to walk {}", path.best_effort_path_display()))]
    WalkError {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[snafu(display("Failed to read symlink {}", path.best_effort_path_display()))]
    SymlinkError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to hash file contents"))]
    DigestError { source: FileDigestError },
}
