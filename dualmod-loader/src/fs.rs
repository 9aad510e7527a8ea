//! File-system access used by resolution, classification and linking

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Read-only view of the file system the loader resolves against
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Read a whole file as UTF-8
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Whether a regular file exists at `path`
    fn is_file(&self, path: &Path) -> bool;

    /// Whether a directory exists at `path`
    fn is_dir(&self, path: &Path) -> bool;

    /// Canonical form of an existing path
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(normalize_path(path))
    }
}

/// The host file system
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        path.canonicalize()
    }
}

/// In-memory file system; directories exist implicitly above files
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: RwLock<FxHashMap<PathBuf, String>>,
}

impl MemoryFs {
    /// Create an empty file system
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with_file(self, path: impl AsRef<Path>, contents: impl Into<String>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Add or replace a file
    pub fn insert(&self, path: impl AsRef<Path>, contents: impl Into<String>) {
        self.files
            .write()
            .insert(normalize_path(path.as_ref()), contents.into());
    }
}

impl FileSystem for MemoryFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .read()
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.read().contains_key(&normalize_path(path))
    }

    fn is_dir(&self, path: &Path) -> bool {
        let dir = normalize_path(path);
        self.files
            .read()
            .keys()
            .any(|file| file != &dir && file.starts_with(&dir))
    }
}

/// Lexically remove `.` and `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
