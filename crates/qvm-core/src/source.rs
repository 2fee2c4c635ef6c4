//! Where module images and map files come from.
//!
//! The registry never touches the filesystem directly. It asks an
//! [`ImageSource`] for game-relative paths such as `vm/qagame.qvm`, so hosts
//! can serve images from pak archives, memory, or plain directories.

use rustc_hash::FxHashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Provider of game-relative files.
///
/// # Example
///
/// ```ignore
/// struct Embedded;
///
/// impl ImageSource for Embedded {
///     fn read(&self, path: &str) -> std::io::Result<Option<Vec<u8>>> {
///         Ok((path == "vm/ui.qvm").then(|| include_bytes!("ui.qvm").to_vec()))
///     }
/// }
/// ```
pub trait ImageSource {
    /// Read a whole file.
    ///
    /// Returns `Ok(None)` when the file does not exist; any other failure is
    /// an error.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Reads files from a list of directories, first hit wins.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource {
    roots: Vec<PathBuf>,
}

impl DirectorySource {
    /// Search `roots` in order.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// Directories searched, in order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
    }
}

impl ImageSource for DirectorySource {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match self.resolve(path) {
            Some(file) => std::fs::read(file).map(Some),
            None => Ok(None),
        }
    }
}

/// In-memory files keyed by game-relative path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: FxHashMap<String, Vec<u8>>,
}

impl MemorySource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }

    /// Builder-style [`MemorySource::insert`].
    pub fn with(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }

    /// Drop a file.
    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }
}

impl ImageSource for MemorySource {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new().with("vm/ui.qvm", vec![1, 2, 3]);
        assert_eq!(source.read("vm/ui.qvm").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(source.read("vm/cgame.qvm").unwrap(), None);
    }

    #[test]
    fn test_directory_source_search_order() {
        let home = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("vm")).unwrap();
        std::fs::create_dir_all(base.path().join("vm")).unwrap();
        std::fs::write(base.path().join("vm/ui.qvm"), b"base").unwrap();
        std::fs::write(base.path().join("vm/cgame.qvm"), b"base").unwrap();
        std::fs::write(home.path().join("vm/ui.qvm"), b"home").unwrap();

        let source =
            DirectorySource::new([home.path().to_path_buf(), base.path().to_path_buf()]);
        assert_eq!(source.read("vm/ui.qvm").unwrap(), Some(b"home".to_vec()));
        assert_eq!(source.read("vm/cgame.qvm").unwrap(), Some(b"base".to_vec()));
        assert_eq!(source.read("vm/qagame.qvm").unwrap(), None);
    }
}
