//! File writes for certificates and configuration.
//!
//! Files are replaced, never rewritten in place: contents go to a sibling
//! `<name>.tmp` first and are renamed over the target once fully on disk,
//! so the server never reloads a truncated file. Related files (a
//! certificate and its key, parameters and HBA rules) are written with
//! [`FileWriter::write_together`], which only touches the targets after
//! every one of them was staged.
//!
//! Production code writes to the real filesystem; tests use [`MemoryFiles`]
//! to observe exactly which files were (or were not) written.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Permission bits for key material and rendered configuration.
pub const OWNER_ONLY: u32 = 0o600;

/// Suffix of the sibling file contents are staged in.
pub const STAGING_SUFFIX: &str = ".tmp";

/// Provider trait for writing whole files.
pub trait FileWriter: Send + Sync {
    /// Replace the contents of `path` with a file of mode `mode`.
    fn write(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        self.write_together(&[(path, contents)], mode)
    }

    /// Replace every `(path, contents)` entry, or none of them.
    ///
    /// On error no target has been touched, except when the final renames
    /// themselves fail, which leaves the earlier entries replaced.
    fn write_together(&self, files: &[(&Path, &[u8])], mode: u32) -> io::Result<()>;
}

/// Path `path` is staged at before being renamed into place.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    path.with_file_name(name)
}

/// Writes to the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFiles;

impl DiskFiles {
    /// Create a new disk writer.
    pub fn new() -> Self {
        Self
    }

    fn stage(staged: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(staged)?;
        // A leftover staging file may carry other permissions
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn discard(staged: &[PathBuf]) {
        for path in staged {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
                }
            }
        }
    }

    fn sync_parent(path: &Path) {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if let Err(e) = std::fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(dir = %parent.display(), error = %e, "Failed to sync directory");
        }
    }
}

impl FileWriter for DiskFiles {
    fn write_together(&self, files: &[(&Path, &[u8])], mode: u32) -> io::Result<()> {
        let mut staged = Vec::with_capacity(files.len());
        for (path, contents) in files {
            let staging = staging_path(path);
            let result = Self::stage(&staging, contents, mode);
            staged.push(staging);
            if let Err(e) = result {
                Self::discard(&staged);
                return Err(e);
            }
        }

        for (index, (path, _)) in files.iter().enumerate() {
            if let Err(e) = std::fs::rename(&staged[index], path) {
                Self::discard(&staged[index..]);
                return Err(e);
            }
            Self::sync_parent(path);
        }
        Ok(())
    }
}

/// A file captured by [`MemoryFiles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    /// File contents.
    pub contents: Vec<u8>,
    /// Requested permission bits.
    pub mode: u32,
}

/// In-memory file writer for testing.
///
/// # Example
///
/// ```
/// use pgkeeper_engine::files::{FileWriter, MemoryFiles, OWNER_ONLY};
/// use std::path::Path;
///
/// let files = MemoryFiles::new();
/// files.write(Path::new("/certs/server.crt"), b"pem", OWNER_ONLY).unwrap();
///
/// assert_eq!(files.read(Path::new("/certs/server.crt")).unwrap(), b"pem");
/// assert_eq!(files.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: RwLock<HashMap<PathBuf, WrittenFile>>,
    failing: RwLock<HashSet<PathBuf>>,
}

impl MemoryFiles {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `path` fail with a permission error.
    pub fn failing_on(self, path: impl Into<PathBuf>) -> Self {
        self.failing.write().insert(path.into());
        self
    }

    /// Contents written to `path`, if any.
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|f| f.contents.clone())
    }

    /// Full record of the last write to `path`.
    pub fn get(&self, path: &Path) -> Option<WrittenFile> {
        self.files.read().get(path).cloned()
    }

    /// Paths written so far, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of distinct files written.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileWriter for MemoryFiles {
    fn write_together(&self, files: &[(&Path, &[u8])], mode: u32) -> io::Result<()> {
        let failing = self.failing.read();
        if let Some((path, _)) = files.iter().find(|(path, _)| failing.contains(*path)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write refused: {}", path.display()),
            ));
        }

        let mut written = self.files.write();
        for (path, contents) in files {
            written.insert(
                path.to_path_buf(),
                WrittenFile {
                    contents: contents.to_vec(),
                    mode,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_files_are_owner_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.key");

        DiskFiles::new().write(&path, b"secret", OWNER_ONLY).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"secret");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn disk_files_tighten_existing_permissions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        DiskFiles::new().write(&path, b"new", OWNER_ONLY).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn disk_files_leave_no_staging_file_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.conf");

        DiskFiles::new().write(&path, b"work_mem = '4MB'\n", OWNER_ONLY).unwrap();

        assert!(!staging_path(&path).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_staging_keeps_old_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.key");
        std::fs::write(&path, b"old key").unwrap();
        // A directory where the staging file should go makes staging fail
        std::fs::create_dir(staging_path(&path)).unwrap();

        let err = DiskFiles::new().write(&path, b"new key", OWNER_ONLY);

        assert!(err.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"old key");
    }

    #[test]
    fn failed_pair_replaces_neither_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, b"old cert").unwrap();
        std::fs::write(&key, b"old key").unwrap();
        std::fs::create_dir(staging_path(&key)).unwrap();

        let err = DiskFiles::new().write_together(
            &[(cert.as_path(), &b"new cert"[..]), (key.as_path(), &b"new key"[..])],
            OWNER_ONLY,
        );

        assert!(err.is_err());
        assert_eq!(std::fs::read(&cert).unwrap(), b"old cert");
        assert_eq!(std::fs::read(&key).unwrap(), b"old key");
        assert!(!staging_path(&cert).exists());
    }

    #[test]
    fn pair_is_written_together() {
        let dir = tempfile::TempDir::new().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");

        DiskFiles::new()
            .write_together(
                &[(cert.as_path(), &b"cert"[..]), (key.as_path(), &b"key"[..])],
                OWNER_ONLY,
            )
            .unwrap();

        assert_eq!(std::fs::read(&cert).unwrap(), b"cert");
        assert_eq!(std::fs::read(&key).unwrap(), b"key");
    }

    #[test]
    fn staging_path_is_a_sibling() {
        assert_eq!(
            staging_path(Path::new("/certs/server.key")),
            PathBuf::from("/certs/server.key.tmp")
        );
    }

    #[test]
    fn memory_files_record_writes() {
        let files = MemoryFiles::new();
        files
            .write(Path::new("/a"), b"1", OWNER_ONLY)
            .unwrap();
        files
            .write(Path::new("/a"), b"2", OWNER_ONLY)
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(
            files.get(Path::new("/a")),
            Some(WrittenFile {
                contents: b"2".to_vec(),
                mode: OWNER_ONLY
            })
        );
    }

    #[test]
    fn memory_files_can_fail() {
        let files = MemoryFiles::new().failing_on("/locked");
        let err = files
            .write(Path::new("/locked"), b"x", OWNER_ONLY)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(files.is_empty());
    }

    #[test]
    fn memory_files_fail_whole_batch() {
        let files = MemoryFiles::new().failing_on("/certs/server.key");

        let err = files
            .write_together(
                &[
                    (Path::new("/certs/server.crt"), &b"cert"[..]),
                    (Path::new("/certs/server.key"), &b"key"[..]),
                ],
                OWNER_ONLY,
            )
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(files.is_empty());
    }
}
