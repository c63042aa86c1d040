use std::path::Path;

use derive_more::{Display, From};

use crate::scenario::TreeRoots;

/// A shell command line with `{port}`, `{path}`, `{client_path}` and
/// `{server_path}` placeholders. `{path}` is the launched side's own root.
#[derive(Debug, Clone, PartialEq, Eq, Display, From)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, port: u16, own_root: &Path, roots: &TreeRoots) -> String {
        self.0
            .replace("{port}", &port.to_string())
            .replace("{client_path}", &roots.client.to_string_lossy())
            .replace("{server_path}", &roots.server.to_string_lossy())
            .replace("{path}", &own_root.to_string_lossy())
    }
}
