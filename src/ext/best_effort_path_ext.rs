use std::path::{Component, Path, PathBuf};

/// Renders a path for error messages and logs.
///
/// Tree roots are often wiped or not created yet when something goes wrong,
/// so canonicalization cannot be relied on. Falls back to an absolute,
/// lexically normalized path.
pub trait BestEffortPathExt {
    fn best_effort_path_display(&self) -> String;
}

impl BestEffortPathExt for Path {
    fn best_effort_path_display(&self) -> String {
        if let Ok(canonical) = self.canonicalize() {
            return canonical.display().to_string();
        }

        let absolute = std::path::absolute(self).unwrap_or_else(|_| self.to_path_buf());
        normalize_lexically(&absolute).display().to_string()
    }
}

impl BestEffortPathExt for PathBuf {
    fn best_effort_path_display(&self) -> String {
        self.as_path().best_effort_path_display()
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    normalized.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                ) {
                    normalized.pop();
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
