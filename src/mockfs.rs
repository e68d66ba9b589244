//! An in-memory host filesystem.
//!
//! The engine never touches the real filesystem. Instead it operates on a
//! `MockFs`: a path-keyed store of directories, files, and symlinks under
//! one or more explicit *mock roots*. Everything inside a root reports the
//! well-known device number [`MOCK_DEV`]; paths outside every root do not
//! exist as far as the engine is concerned, which is how "not under a mock
//! filesystem" manifests.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

/// Sentinel device number identifying mocked storage.
pub const MOCK_DEV: u64 = 8675309;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: '{path}'")]
    NotFound { path: String },

    #[error("file exists: '{path}'")]
    AlreadyExists { path: String },

    #[error("not a directory: '{path}'")]
    NotADirectory { path: String },

    #[error("not a regular file: '{path}'")]
    NotAFile { path: String },

    #[error("not a symbolic link: '{path}'")]
    NotASymlink { path: String },

    #[error("directory not empty: '{path}'")]
    NotEmpty { path: String },

    #[error("path is not under a mock filesystem: '{path}'")]
    NotUnderMockRoot { path: String },
}

impl FsError {
    fn not_found(path: &Path) -> Self {
        FsError::NotFound {
            path: path.display().to_string(),
        }
    }

    fn not_a_directory(path: &Path) -> Self {
        FsError::NotADirectory {
            path: path.display().to_string(),
        }
    }
}

/// Node kind as reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Device nodes, sockets, fifos. Only `lstat` works on these.
    Special,
}

/// The `lstat` result for a mock node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub dev: u64,
    pub mode: u32,
    pub mtime: i64,
    pub atime: i64,
    pub size: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone)]
enum Payload {
    File { data: Vec<u8> },
    Directory,
    Symlink { target: PathBuf },
    Special,
}

#[derive(Debug, Clone)]
struct FsNode {
    payload: Payload,
    mode: u32,
    mtime: i64,
    atime: i64,
}

impl FsNode {
    fn kind(&self) -> FileKind {
        match self.payload {
            Payload::File { .. } => FileKind::File,
            Payload::Directory => FileKind::Directory,
            Payload::Symlink { .. } => FileKind::Symlink,
            Payload::Special => FileKind::Special,
        }
    }

    fn size(&self) -> u64 {
        match &self.payload {
            Payload::File { data } => data.len() as u64,
            Payload::Symlink { target } => target.as_os_str().len() as u64,
            Payload::Directory | Payload::Special => 0,
        }
    }
}

/// In-memory filesystem with explicit mock roots.
#[derive(Debug, Default)]
pub struct MockFs {
    roots: Vec<PathBuf>,
    nodes: BTreeMap<PathBuf, FsNode>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` as a mock root and create it as an empty directory.
    /// Paths must be absolute and free of `.`/`..` components.
    pub fn add_root(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        check_path_shape(path)?;
        if self.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        self.roots.push(path.to_path_buf());
        self.nodes.insert(path.to_path_buf(), dir_node());
        Ok(())
    }

    /// Whether `path` falls under any mock root.
    pub fn is_mock(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.roots.iter().any(|r| path.starts_with(r))
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.contains_key(path.as_ref())
    }

    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<Metadata, FsError> {
        let path = path.as_ref();
        let node = self.node(path)?;
        Ok(Metadata {
            dev: MOCK_DEV,
            mode: node.mode,
            mtime: node.mtime,
            atime: node.atime,
            size: node.size(),
            kind: node.kind(),
        })
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, FsError> {
        let path = path.as_ref();
        match &self.node(path)?.payload {
            Payload::File { data } => Ok(data.clone()),
            _ => Err(FsError::NotAFile {
                path: path.display().to_string(),
            }),
        }
    }

    pub fn read_link(&self, path: impl AsRef<Path>) -> Result<PathBuf, FsError> {
        let path = path.as_ref();
        match &self.node(path)?.payload {
            Payload::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::NotASymlink {
                path: path.display().to_string(),
            }),
        }
    }

    /// Names of the direct children of a directory, sorted.
    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<String>, FsError> {
        let path = path.as_ref();
        match self.node(path)?.payload {
            Payload::Directory => {}
            _ => return Err(FsError::not_a_directory(path)),
        }
        let mut names = Vec::new();
        for child in self.nodes.keys() {
            if child.parent() == Some(path) {
                if let Some(name) = child.file_name() {
                    names.push(name.to_string_lossy().into_owned());
                }
            }
        }
        Ok(names)
    }

    /// Create or replace a regular file.
    pub fn write_file(&mut self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), FsError> {
        let path = path.as_ref();
        self.check_writable_target(path)?;
        if let Some(existing) = self.nodes.get(path) {
            if existing.kind() != FileKind::File {
                return Err(FsError::NotAFile {
                    path: path.display().to_string(),
                });
            }
        }
        let now = Utc::now().timestamp();
        self.nodes.insert(
            path.to_path_buf(),
            FsNode {
                payload: Payload::File {
                    data: data.to_vec(),
                },
                mode: 0o644,
                mtime: now,
                atime: now,
            },
        );
        Ok(())
    }

    pub fn symlink(
        &mut self,
        target: impl AsRef<Path>,
        link: impl AsRef<Path>,
    ) -> Result<(), FsError> {
        let link = link.as_ref();
        self.check_writable_target(link)?;
        if self.nodes.contains_key(link) {
            return Err(FsError::AlreadyExists {
                path: link.display().to_string(),
            });
        }
        let now = Utc::now().timestamp();
        self.nodes.insert(
            link.to_path_buf(),
            FsNode {
                payload: Payload::Symlink {
                    target: target.as_ref().to_path_buf(),
                },
                mode: 0o777,
                mtime: now,
                atime: now,
            },
        );
        Ok(())
    }

    /// Create a device-like node. Exists so callers can exercise paths
    /// that must reject non-archivable file types.
    pub fn mknod(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        self.check_writable_target(path)?;
        if self.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        let now = Utc::now().timestamp();
        self.nodes.insert(
            path.to_path_buf(),
            FsNode {
                payload: Payload::Special,
                mode: 0o600,
                mtime: now,
                atime: now,
            },
        );
        Ok(())
    }

    pub fn mkdir(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        self.check_writable_target(path)?;
        if self.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        self.nodes.insert(path.to_path_buf(), dir_node());
        Ok(())
    }

    /// `mkdir -p`: create the directory and any missing ancestors inside
    /// the mock root.
    pub fn mkdir_p(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        check_path_shape(path)?;
        if !self.is_mock(path) {
            return Err(FsError::NotUnderMockRoot {
                path: path.display().to_string(),
            });
        }
        let mut missing = Vec::new();
        let mut cur = Some(path);
        while let Some(p) = cur {
            match self.nodes.get(p) {
                Some(node) if node.kind() == FileKind::Directory => break,
                Some(_) => return Err(FsError::not_a_directory(p)),
                None => missing.push(p.to_path_buf()),
            }
            cur = p.parent();
        }
        for p in missing.into_iter().rev() {
            self.nodes.insert(p, dir_node());
        }
        Ok(())
    }

    pub fn rmdir(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        match self.node(path)?.payload {
            Payload::Directory => {}
            _ => return Err(FsError::not_a_directory(path)),
        }
        if !self.read_dir(path)?.is_empty() {
            return Err(FsError::NotEmpty {
                path: path.display().to_string(),
            });
        }
        self.roots.retain(|r| r.as_path() != path);
        self.nodes.remove(path);
        Ok(())
    }

    pub fn unlink(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        match self.node(path)?.payload {
            Payload::Directory => Err(FsError::NotAFile {
                path: path.display().to_string(),
            }),
            _ => {
                self.nodes.remove(path);
                Ok(())
            }
        }
    }

    pub fn chmod(&mut self, path: impl AsRef<Path>, mode: u32) -> Result<(), FsError> {
        let path = path.as_ref();
        let node = self.node_mut(path)?;
        node.mode = mode;
        Ok(())
    }

    pub fn utimes(
        &mut self,
        path: impl AsRef<Path>,
        atime: i64,
        mtime: i64,
    ) -> Result<(), FsError> {
        let path = path.as_ref();
        let node = self.node_mut(path)?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    fn node(&self, path: &Path) -> Result<&FsNode, FsError> {
        self.nodes.get(path).ok_or_else(|| FsError::not_found(path))
    }

    fn node_mut(&mut self, path: &Path) -> Result<&mut FsNode, FsError> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| FsError::not_found(path))
    }

    // A mutating target needs a shaped path under a mock root with an
    // existing parent directory.
    fn check_writable_target(&self, path: &Path) -> Result<(), FsError> {
        check_path_shape(path)?;
        if !self.is_mock(path) {
            return Err(FsError::NotUnderMockRoot {
                path: path.display().to_string(),
            });
        }
        let parent = path.parent().ok_or_else(|| FsError::not_found(path))?;
        match self.nodes.get(parent) {
            Some(node) if node.kind() == FileKind::Directory => Ok(()),
            Some(_) => Err(FsError::not_a_directory(parent)),
            None => Err(FsError::not_found(parent)),
        }
    }
}

fn dir_node() -> FsNode {
    let now = Utc::now().timestamp();
    FsNode {
        payload: Payload::Directory,
        mode: 0o755,
        mtime: now,
        atime: now,
    }
}

fn check_path_shape(path: &Path) -> Result<(), FsError> {
    let ok = path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(FsError::NotFound {
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_and_mock_check() {
        let mut fs = MockFs::new();
        fs.add_root("/test123").unwrap();
        assert!(fs.is_mock("/test123"));
        assert!(fs.is_mock("/test123/a/b"));
        assert!(!fs.is_mock("/other"));
        assert!(!fs.is_mock("/"));
        assert_eq!(fs.lstat("/test123").unwrap().dev, MOCK_DEV);
    }

    #[test]
    fn test_write_read_file() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.write_file("/m/file1", b"hello").unwrap();
        assert_eq!(fs.read_file("/m/file1").unwrap(), b"hello");
        let meta = fs.lstat("/m/file1").unwrap();
        assert_eq!(meta.kind, FileKind::File);
        assert_eq!(meta.size, 5);
        assert_eq!(meta.mode, 0o644);
    }

    #[test]
    fn test_write_outside_mock_root_fails() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        assert!(matches!(
            fs.write_file("/elsewhere/file", b"x"),
            Err(FsError::NotUnderMockRoot { .. })
        ));
        assert!(matches!(
            fs.mkdir("/elsewhere/dir"),
            Err(FsError::NotUnderMockRoot { .. })
        ));
    }

    #[test]
    fn test_mkdir_requires_parent() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        assert!(matches!(
            fs.mkdir("/m/a/b"),
            Err(FsError::NotFound { .. })
        ));
        fs.mkdir("/m/a").unwrap();
        fs.mkdir("/m/a/b").unwrap();
        assert!(matches!(
            fs.mkdir("/m/a"),
            Err(FsError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_mkdir_p_creates_chain() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.mkdir_p("/m/a/b/c").unwrap();
        assert!(fs.exists("/m/a"));
        assert!(fs.exists("/m/a/b"));
        assert_eq!(fs.lstat("/m/a/b/c").unwrap().kind, FileKind::Directory);
        // Idempotent on an existing chain.
        fs.mkdir_p("/m/a/b").unwrap();
    }

    #[test]
    fn test_read_dir_sorted() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.write_file("/m/b", b"").unwrap();
        fs.write_file("/m/a", b"").unwrap();
        fs.mkdir("/m/c").unwrap();
        fs.write_file("/m/c/nested", b"").unwrap();
        assert_eq!(fs.read_dir("/m").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(fs.read_dir("/m/c").unwrap(), vec!["nested"]);
    }

    #[test]
    fn test_rmdir_and_unlink() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.mkdir("/m/d").unwrap();
        fs.write_file("/m/d/f", b"x").unwrap();
        assert!(matches!(fs.rmdir("/m/d"), Err(FsError::NotEmpty { .. })));
        fs.unlink("/m/d/f").unwrap();
        fs.rmdir("/m/d").unwrap();
        assert!(!fs.exists("/m/d"));
        assert!(matches!(fs.unlink("/m"), Err(FsError::NotAFile { .. })));
    }

    #[test]
    fn test_symlink_and_readlink() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.symlink("/m/target", "/m/link").unwrap();
        assert_eq!(fs.read_link("/m/link").unwrap(), PathBuf::from("/m/target"));
        assert_eq!(fs.lstat("/m/link").unwrap().kind, FileKind::Symlink);
        assert!(matches!(
            fs.read_link("/m"),
            Err(FsError::NotASymlink { .. })
        ));
    }

    #[test]
    fn test_chmod_utimes() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.write_file("/m/f", b"x").unwrap();
        fs.chmod("/m/f", 0o600).unwrap();
        fs.utimes("/m/f", 11, 22).unwrap();
        let meta = fs.lstat("/m/f").unwrap();
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.atime, 11);
        assert_eq!(meta.mtime, 22);
    }

    #[test]
    fn test_relative_paths_rejected() {
        let mut fs = MockFs::new();
        assert!(fs.add_root("relative").is_err());
        fs.add_root("/m").unwrap();
        assert!(fs.write_file("/m/../x", b"").is_err());
    }
}
