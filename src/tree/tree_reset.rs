use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::ext::BestEffortPathExt;

/// Removes `path` recursively if it exists and recreates it empty.
pub fn reset_tree(path: &Path) -> Result<(), TreeResetError> {
    debug!("Resetting tree {}", path.best_effort_path_display());
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).context(RemoveSnafu {
                path: path.to_path_buf(),
            });
        }
    }
    fs::create_dir_all(path).context(CreateSnafu {
        path: path.to_path_buf(),
    })
}

/// Removes every child of `path` but keeps `path` itself.
///
/// Symlinks are unlinked, never followed, matching how fingerprinting treats
/// them.
pub fn wipe_tree(path: &Path) -> Result<(), TreeResetError> {
    debug!("Wiping tree {}", path.best_effort_path_display());
    let children = fs::read_dir(path).context(ListSnafu {
        path: path.to_path_buf(),
    })?;

    for child in children {
        let child = child.context(ListSnafu {
            path: path.to_path_buf(),
        })?;
        let child_path = child.path();
        let file_type = child.file_type().context(RemoveSnafu {
            path: child_path.clone(),
        })?;

        let result = if file_type.is_dir() {
            fs::remove_dir_all(&child_path)
        } else {
            fs::remove_file(&child_path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(RemoveSnafu { path: child_path }),
        }
    }

    Ok(())
}

#[derive(Debug, Snafu)]
pub enum TreeResetError {
    #[snafu(display("Failed to remove {}", path.best_effort_path_display()))]
    RemoveError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to create {}", path.best_effort_path_display()))]
    CreateError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to list {}", path.best_effort_path_display()))]
    ListError {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reset_creates_missing_root() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("build").join("cl_dir");

        reset_tree(&root).expect("Failed to reset tree");

        assert!(root.is_dir());
    }

    #[test]
    fn reset_empties_existing_root() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("nested/file.txt"), "contents").unwrap();

        reset_tree(&root).expect("Failed to reset tree");

        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn wipe_keeps_root_and_removes_children() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path();
        for i in 0..3 {
            fs::write(root.join(format!("file_{i}")), format!("contents_{i}")).unwrap();
            fs::create_dir_all(root.join(format!("dir_{i}/inner"))).unwrap();
        }

        wipe_tree(root).expect("Failed to wipe tree");

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(root).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn wipe_unlinks_symlinks_without_touching_targets() {
        let outside = TempDir::new().expect("Failed to create temp directory");
        let root = TempDir::new().expect("Failed to create temp directory");
        fs::write(outside.path().join("keep.txt"), "keep").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        wipe_tree(root.path()).expect("Failed to wipe tree");

        assert!(!root.path().join("link").exists());
        assert!(outside.path().join("keep.txt").is_file());
    }
}
