//! Canonical fingerprints of directory trees.
//!
//! A fingerprint lists every file and directory below a root with its size
//! and content digest, sorted by relative path, so two trees can be compared
//! for equality regardless of how they were produced. Symlinks are treated
//! as opaque leaves both here and by the reset helpers.

mod file_digest;
mod tree_entry;
mod tree_fingerprint;
mod tree_reset;

use std::io::{self, ErrorKind};

pub use file_digest::{FileDigest, FileDigestError};
pub use tree_entry::{EntryKind, TreeEntry};
pub use tree_fingerprint::{FingerprintDiff, FingerprintError, TreeFingerprint, fingerprint};
pub use tree_reset::{TreeResetError, reset_tree, wipe_tree};

/// Errors caused by another process changing the tree while it is read: the
/// path vanished, or it turned from a file into a directory or back.
fn is_concurrent_change(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::IsADirectory
    )
}
