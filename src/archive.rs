//! Subtree capture for copy-on-write content.
//!
//! Snapshots, clones, and unmounted filesystems carry their content as an
//! archive: an opaque tree of entries captured from the mock filesystem.
//! Archives are immutable once captured and shared by reference, so a
//! clone "copying" a snapshot's content is a cheap `Rc` clone.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;

use crate::engine::Error;
use crate::mockfs::{FileKind, Metadata, MockFs};

/// Largest file an archive will capture.
pub const MAX_ARCHIVE_FILE: u64 = 1 << 20;

/// One captured node. Directories own their children; files own their
/// bytes; symlinks own their target.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub meta: Metadata,
    pub payload: ArchivePayload,
}

#[derive(Debug, Clone)]
pub enum ArchivePayload {
    File { data: Vec<u8> },
    Symlink { target: PathBuf },
    Directory { children: Vec<ArchiveEntry> },
}

/// Capture the subtree rooted at `path`. Descent stops at any child path
/// present in `mounts`: the mounted directory is recorded as an empty
/// stub so a later restore can recreate it for remounting.
pub fn archive(
    fs: &MockFs,
    path: &Path,
    mounts: &BTreeSet<PathBuf>,
) -> Result<Rc<ArchiveEntry>, Error> {
    if !fs.is_mock(path) {
        return Err(Error::invalid_argument(format!(
            "cannot archive '{}': not under a mock filesystem",
            path.display()
        )));
    }
    let entry = capture(fs, path, mounts, true)?;
    debug!("archived '{}'", path.display());
    Ok(Rc::new(entry))
}

fn capture(
    fs: &MockFs,
    path: &Path,
    mounts: &BTreeSet<PathBuf>,
    descend: bool,
) -> Result<ArchiveEntry, Error> {
    let meta = fs.lstat(path)?;
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => "/".to_string(),
    };

    let payload = match meta.kind {
        FileKind::File => {
            if meta.size > MAX_ARCHIVE_FILE {
                return Err(Error::invalid_argument(format!(
                    "cannot archive '{}': file exceeds {} bytes",
                    path.display(),
                    MAX_ARCHIVE_FILE
                )));
            }
            ArchivePayload::File {
                data: fs.read_file(path)?,
            }
        }
        FileKind::Symlink => ArchivePayload::Symlink {
            target: fs.read_link(path)?,
        },
        FileKind::Directory => {
            let mut children = Vec::new();
            if descend {
                for child_name in fs.read_dir(path)? {
                    let child = path.join(&child_name);
                    // Mount-points terminate recursion.
                    let descend_child = !mounts.contains(&child);
                    children.push(capture(fs, &child, mounts, descend_child)?);
                }
            }
            ArchivePayload::Directory { children }
        }
        FileKind::Special => {
            return Err(Error::InvalidFileType {
                path: path.display().to_string(),
            });
        }
    };

    Ok(ArchiveEntry {
        name,
        meta,
        payload,
    })
}

/// Recreate an archived tree under `base`, preserving mode and times.
/// `base` itself must already exist as a directory; the root entry's
/// children land directly inside it.
pub fn restore(fs: &mut MockFs, base: &Path, entry: &ArchiveEntry) -> Result<(), Error> {
    match &entry.payload {
        ArchivePayload::Directory { children } => {
            for child in children {
                restore_at(fs, &base.join(&child.name), child)?;
            }
            fs.chmod(base, entry.meta.mode)?;
            fs.utimes(base, entry.meta.atime, entry.meta.mtime)?;
            Ok(())
        }
        _ => Err(Error::InvalidFileType {
            path: base.display().to_string(),
        }),
    }
}

fn restore_at(fs: &mut MockFs, path: &Path, entry: &ArchiveEntry) -> Result<(), Error> {
    match &entry.payload {
        ArchivePayload::File { data } => {
            fs.write_file(path, data)?;
            fs.chmod(path, entry.meta.mode)?;
        }
        ArchivePayload::Symlink { target } => {
            fs.symlink(target, path)?;
        }
        ArchivePayload::Directory { children } => {
            if !fs.exists(path) {
                fs.mkdir(path)?;
            }
            for child in children {
                restore_at(fs, &path.join(&child.name), child)?;
            }
            fs.chmod(path, entry.meta.mode)?;
        }
    }
    fs.utimes(path, entry.meta.atime, entry.meta.mtime)?;
    Ok(())
}

/// Delete the contents of `dir` without removing `dir` itself. Subtrees
/// that are mount-points are left alone.
pub fn clear_dir(fs: &mut MockFs, dir: &Path, mounts: &BTreeSet<PathBuf>) -> Result<(), Error> {
    if !fs.is_mock(dir) {
        return Err(Error::invalid_argument(format!(
            "cannot clear '{}': not under a mock filesystem",
            dir.display()
        )));
    }
    for child_name in fs.read_dir(dir)? {
        let child = dir.join(&child_name);
        if mounts.contains(&child) {
            continue;
        }
        match fs.lstat(&child)?.kind {
            FileKind::Directory => {
                clear_dir(fs, &child, mounts)?;
                // A nested mount-point keeps its ancestors in place.
                if fs.read_dir(&child)?.is_empty() {
                    fs.rmdir(&child)?;
                }
            }
            _ => fs.unlink(&child)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.mkdir("/m/sub").unwrap();
        fs.write_file("/m/file1", b"alpha").unwrap();
        fs.write_file("/m/sub/file2", b"beta").unwrap();
        fs.symlink("/m/file1", "/m/sub/link").unwrap();
        fs.chmod("/m/file1", 0o640).unwrap();
        fs.utimes("/m/file1", 100, 200).unwrap();
        fs
    }

    #[test]
    fn test_archive_clear_restore_round_trip() {
        let mut fs = fixture();
        let mounts = BTreeSet::new();
        let tree = archive(&fs, Path::new("/m"), &mounts).unwrap();

        clear_dir(&mut fs, Path::new("/m"), &mounts).unwrap();
        assert!(fs.read_dir("/m").unwrap().is_empty());

        restore(&mut fs, Path::new("/m"), &tree).unwrap();
        assert_eq!(fs.read_file("/m/file1").unwrap(), b"alpha");
        assert_eq!(fs.read_file("/m/sub/file2").unwrap(), b"beta");
        assert_eq!(
            fs.read_link("/m/sub/link").unwrap(),
            PathBuf::from("/m/file1")
        );
        let meta = fs.lstat("/m/file1").unwrap();
        assert_eq!(meta.mode, 0o640);
        assert_eq!(meta.atime, 100);
        assert_eq!(meta.mtime, 200);
    }

    #[test]
    fn test_archive_stops_at_mount_points() {
        let fs = {
            let mut fs = fixture();
            fs.write_file("/m/sub/secret", b"do not capture").unwrap();
            fs
        };
        let mounts: BTreeSet<PathBuf> = [PathBuf::from("/m/sub")].into_iter().collect();
        let tree = archive(&fs, Path::new("/m"), &mounts).unwrap();

        let ArchivePayload::Directory { children } = &tree.payload else {
            panic!("archive root is not a directory");
        };
        let sub = children.iter().find(|c| c.name == "sub").unwrap();
        match &sub.payload {
            ArchivePayload::Directory { children } => assert!(children.is_empty()),
            other => panic!("expected directory stub, got {:?}", other),
        }
    }

    #[test]
    fn test_clear_dir_skips_mount_points() {
        let mut fs = fixture();
        let mounts: BTreeSet<PathBuf> = [PathBuf::from("/m/sub")].into_iter().collect();
        clear_dir(&mut fs, Path::new("/m"), &mounts).unwrap();
        assert!(!fs.exists("/m/file1"));
        assert_eq!(fs.read_file("/m/sub/file2").unwrap(), b"beta");
    }

    #[test]
    fn test_archive_rejects_oversized_files() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        let big = vec![0u8; (MAX_ARCHIVE_FILE + 1) as usize];
        fs.write_file("/m/big", &big).unwrap();
        assert!(matches!(
            archive(&fs, Path::new("/m"), &BTreeSet::new()),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_archive_rejects_special_files() {
        let mut fs = MockFs::new();
        fs.add_root("/m").unwrap();
        fs.mknod("/m/dev0").unwrap();
        assert!(matches!(
            archive(&fs, Path::new("/m"), &BTreeSet::new()),
            Err(Error::InvalidFileType { .. })
        ));
    }

    #[test]
    fn test_archive_outside_mock_root() {
        let fs = MockFs::new();
        assert!(matches!(
            archive(&fs, Path::new("/nope"), &BTreeSet::new()),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
