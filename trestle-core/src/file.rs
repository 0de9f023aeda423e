// File system binding

use crate::logging::debug;
use std::path::{Component, Path, PathBuf};

/// A directory that relative paths are resolved against.
///
/// Resolution is purely lexical and never leaves the bound directory:
/// absolute paths are treated as relative to the binding, and `..`
/// components that would climb above it make the lookup fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemBinding {
    root: PathBuf,
}

impl FileSystemBinding {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` inside this binding.
    pub fn file(&self, path: &str) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        debug!(path, root = %self.root.display(), "Path escapes file system binding");
                        return None;
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        Some(resolved)
    }

    /// A binding for a subdirectory of this one.
    pub fn binding(&self, path: &str) -> Option<FileSystemBinding> {
        self.file(path).map(FileSystemBinding::new)
    }
}
