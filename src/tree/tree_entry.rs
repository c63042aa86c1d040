use std::fmt;

use derive_more::Display;

/// Digest used for directories and for paths that no longer exist.
pub const NO_CONTENT_DIGEST: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum EntryKind {
    #[display("file")]
    File,
    #[display("directory")]
    Directory,
}

/// One line of a tree fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeEntry {
    relative_path: String,
    kind: EntryKind,
    size: u64,
    content_digest: String,
}

impl TreeEntry {
    pub fn file(relative_path: impl Into<String>, size: u64, content_digest: String) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: EntryKind::File,
            size,
            content_digest,
        }
    }

    /// Directories carry no size and no digest.
    pub fn directory(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: EntryKind::Directory,
            size: 0,
            content_digest: NO_CONTENT_DIGEST.to_string(),
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    #[cfg(test)]
    pub fn content_digest(&self) -> &str {
        &self.content_digest
    }
}

/// Renders the `relative_path,entry_kind,size,content_digest` line format.
impl fmt::Display for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.relative_path, self.kind, self.size, self.content_digest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_entry_has_zero_size_and_sentinel_digest() {
        let entry = TreeEntry::directory("newemptydir");

        assert_eq!(entry.kind(), EntryKind::Directory);
        assert_eq!(entry.size(), 0);
        assert_eq!(entry.content_digest(), NO_CONTENT_DIGEST);
    }

    #[test]
    fn entry_renders_as_comma_separated_line() {
        let file = TreeEntry::file("dir/new file.txt", 8, "abc123".to_string());
        let dir = TreeEntry::directory("dir");

        assert_eq!(file.to_string(), "dir/new file.txt,file,8,abc123");
        assert_eq!(dir.to_string(), "dir,directory,0,0");
    }
}
