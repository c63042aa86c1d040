use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use compio::fs;
use derive_more::Display;
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;
use walkdir::WalkDir;

use crate::ext::BestEffortPathExt;
use crate::tree::{TreeResetError, wipe_tree};

/// Largest file a single `write` may produce.
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// Placeholder replaced by the repetition index in repeated mutations.
const INDEX_PLACEHOLDER: &str = "{i}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Side {
    #[default]
    #[display("client")]
    Client,
    #[display("server")]
    Server,
}

/// The client and server roots of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRoots {
    pub client: PathBuf,
    pub server: PathBuf,
}

impl TreeRoots {
    pub fn root(&self, side: Side) -> &Path {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Writes `content` followed by `fill` repeated `fill_len` times.
    Write {
        path: String,
        content: String,
        fill: String,
        fill_len: usize,
    },
    Remove {
        path: String,
    },
    Mkdir {
        path: String,
    },
    /// Removes a directory and everything below it.
    Rmdir {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Wipe,
    Sleep {
        duration: Duration,
    },
}

impl Operation {
    /// Substitutes `index` for every `{i}` in the operation's arguments.
    pub fn with_index(&self, index: usize) -> Self {
        let sub = |value: &String| value.replace(INDEX_PLACEHOLDER, &index.to_string());
        match self {
            Operation::Write {
                path,
                content,
                fill,
                fill_len,
            } => Operation::Write {
                path: sub(path),
                content: sub(content),
                fill: sub(fill),
                fill_len: *fill_len,
            },
            Operation::Remove { path } => Operation::Remove { path: sub(path) },
            Operation::Mkdir { path } => Operation::Mkdir { path: sub(path) },
            Operation::Rmdir { path } => Operation::Rmdir { path: sub(path) },
            Operation::Rename { from, to } => Operation::Rename {
                from: sub(from),
                to: sub(to),
            },
            Operation::Wipe | Operation::Sleep { .. } => self.clone(),
        }
    }

    /// Number of bytes a `write` produces; `None` if that overflows `usize`.
    /// Other operations write nothing.
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            Operation::Write {
                content,
                fill,
                fill_len,
                ..
            } => fill
                .len()
                .checked_mul(*fill_len)
                .and_then(|len| len.checked_add(content.len())),
            _ => Some(0),
        }
    }

    fn bytes(content: &str, fill: &str, fill_len: usize) -> Vec<u8> {
        let mut bytes = content.as_bytes().to_vec();
        bytes.extend(fill.as_bytes().repeat(fill_len));
        bytes
    }
}

/// One filesystem change applied to one side of a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub side: Side,
    pub operation: Operation,
}

impl Mutation {
    pub fn new(side: Side, operation: Operation) -> Self {
        Self { side, operation }
    }

    #[cfg(test)]
    pub fn on_client(operation: Operation) -> Self {
        Self::new(Side::Client, operation)
    }

    pub async fn apply(&self, roots: &TreeRoots) -> Result<(), MutationError> {
        let root = roots.root(self.side);
        debug!("Applying {:?} on {}", self.operation, self.side);

        match &self.operation {
            Operation::Write {
                path,
                content,
                fill,
                fill_len,
            } => {
                let target = root.join(path);
                let within_limit = self
                    .operation
                    .payload_len()
                    .is_some_and(|len| len <= MAX_PAYLOAD_LEN);
                ensure!(
                    within_limit,
                    PayloadTooLargeSnafu {
                        path: target,
                        limit: MAX_PAYLOAD_LEN
                    }
                );
                let bytes = Operation::bytes(content, fill, *fill_len);
                fs::write(&target, bytes)
                    .await
                    .0
                    .context(IoSnafu {
                        operation: "write",
                        path: target,
                    })
            }
            Operation::Remove { path } => {
                let target = root.join(path);
                fs::remove_file(&target).await.context(IoSnafu {
                    operation: "remove",
                    path: target,
                })
            }
            Operation::Mkdir { path } => {
                let target = root.join(path);
                fs::create_dir(&target).await.context(IoSnafu {
                    operation: "mkdir",
                    path: target,
                })
            }
            Operation::Rmdir { path } => {
                let target = root.join(path);
                remove_dir_recursive(&target).await.context(IoSnafu {
                    operation: "rmdir",
                    path: target,
                })
            }
            Operation::Rename { from, to } => {
                let source_path = root.join(from);
                fs::rename(&source_path, root.join(to))
                    .await
                    .context(IoSnafu {
                        operation: "rename",
                        path: source_path,
                    })
            }
            Operation::Wipe => wipe_tree(root).context(WipeSnafu),
            Operation::Sleep { duration } => {
                compio::time::sleep(*duration).await;
                Ok(())
            }
        }
    }
}

/// Removes a directory and everything below it, deepest entries first.
/// Symlinks are unlinked, never followed.
async fn remove_dir_recursive(target: &Path) -> io::Result<()> {
    let entries = WalkDir::new(target)
        .contents_first(true)
        .follow_links(false)
        .follow_root_links(false)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    for entry in entries {
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path()).await?;
        } else if entry.depth() == 0 {
            return Err(io::Error::from(ErrorKind::NotADirectory));
        } else {
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Snafu)]
pub enum MutationError {
    #[snafu(display("Failed to {} {}", operation, path.best_effort_path_display()))]
    IoError {
        operation: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to wipe tree"))]
    WipeError { source: TreeResetError },
    #[snafu(display(
        "Refusing to write {}: payload exceeds {} bytes",
        path.best_effort_path_display(),
        limit
    ))]
    PayloadTooLargeError { path: PathBuf, limit: usize },
}
