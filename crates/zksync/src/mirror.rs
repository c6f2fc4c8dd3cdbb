//! Local mirror of the coordination namespace.
//!
//! Maps coordination paths one-to-one under a root directory and performs the
//! only disk mutations the engine makes. Leaf writes go through a temporary
//! file in the destination directory and a rename, so readers never observe a
//! partial file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::Builder;
use thiserror::Error;
use tracing::{debug, error};

/// Name of the per-directory marker for subtrees that are never watched again.
pub const DONE_MARKER: &str = ".done";

/// Name of the root-level marker bumped after post-readiness mutations.
pub const MODIFIED_MARKER: &str = ".modified";

const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to rename {from} => {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MirrorError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MirrorError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

/// How a failed rename of the temporary file is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Log and propagate the error
    #[default]
    Strict,
    /// Log and carry on
    BestEffort,
}

/// Mirror root on the local filesystem
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path of a coordination path.
    pub fn fpath(&self, zkpath: &str) -> PathBuf {
        let relative = zkpath.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Atomically write `data` for `zkpath`, stamped with `modified`.
    pub fn write(&self, zkpath: &str, data: &[u8], modified: SystemTime, mode: WriteMode) -> Result<()> {
        write_atomic(&self.fpath(zkpath), data, modified, mode)
    }

    /// Create the directory for `zkpath` (and parents).
    pub fn mkdir(&self, zkpath: &str) -> Result<()> {
        let path = self.fpath(zkpath);
        fs::create_dir_all(&path).map_err(|e| MirrorError::io(path, e))
    }

    /// Sorted names of the mirrored entries under `zkpath`.
    ///
    /// Hidden names (markers, temporaries) are skipped; a missing directory
    /// lists as empty.
    pub fn list(&self, zkpath: &str) -> Result<Vec<String>> {
        let path = self.fpath(zkpath);
        let dir = match fs::read_dir(&path) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MirrorError::io(path, e)),
        };

        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| MirrorError::io(&path, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove the mirrored file for `zkpath`; already absent is fine.
    pub fn remove(&self, zkpath: &str) -> Result<bool> {
        let path = self.fpath(zkpath);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }

    /// Remove the mirrored directory tree for `zkpath`; already absent is fine.
    pub fn remove_tree(&self, zkpath: &str) -> Result<bool> {
        let path = self.fpath(zkpath);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }

    pub fn exists(&self, zkpath: &str) -> bool {
        self.fpath(zkpath).exists()
    }

    /// Whether the subtree at `zkpath` carries a done marker.
    pub fn is_done(&self, zkpath: &str) -> bool {
        self.fpath(zkpath).join(DONE_MARKER).exists()
    }

    /// Mark the subtree at `zkpath` as static.
    pub fn mark_done(&self, zkpath: &str) -> Result<()> {
        touch(&self.fpath(zkpath).join(DONE_MARKER), SystemTime::now())
    }

    /// Bump the root-level modification marker.
    pub fn touch_modified(&self) -> Result<()> {
        touch(&self.root.join(MODIFIED_MARKER), SystemTime::now())
    }

    /// Path of the root-level modification marker.
    pub fn modified_marker(&self) -> PathBuf {
        self.root.join(MODIFIED_MARKER)
    }
}

/// Write `data` to `path` through a temporary file and a rename.
///
/// The temporary file lives in the destination directory so the rename never
/// crosses filesystems. Its mtime is set to `modified` before the rename.
pub fn write_atomic(path: &Path, data: &[u8], modified: SystemTime, mode: WriteMode) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| MirrorError::io(dir, e))?;

    if !data.is_empty() {
        temp.write_all(data)
            .map_err(|e| MirrorError::io(temp.path(), e))?;
    }
    set_readable(temp.as_file()).map_err(|e| MirrorError::io(temp.path(), e))?;
    temp.as_file()
        .set_modified(modified)
        .map_err(|e| MirrorError::io(temp.path(), e))?;

    match temp.persist(path) {
        Ok(_) => {
            debug!("Wrote {:?} ({} bytes)", path, data.len());
            Ok(())
        }
        Err(err) => {
            // Dropping the returned handle removes the temporary file.
            let from = err.file.path().to_path_buf();
            error!("Unable to rename: {:?} => {:?}: {}", from, path, err.error);
            match mode {
                WriteMode::Strict => Err(MirrorError::Rename {
                    from,
                    to: path.to_path_buf(),
                    source: err.error,
                }),
                WriteMode::BestEffort => Ok(()),
            }
        }
    }
}

/// Create `path` if missing and set its mtime.
fn touch(path: &Path, mtime: SystemTime) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MirrorError::io(path, e))?;
    file.set_modified(mtime).map_err(|e| MirrorError::io(path, e))
}

#[cfg(unix)]
fn set_readable(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn mtime_of(path: &Path) -> SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn test_fpath_mapping() {
        let mirror = Mirror::new("/var/mirror");
        assert_eq!(mirror.fpath("/servers/host1"), PathBuf::from("/var/mirror/servers/host1"));
        assert_eq!(mirror.fpath("/"), PathBuf::from("/var/mirror"));
    }

    #[test]
    fn test_write_sets_content_and_remote_mtime() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        let modified = UNIX_EPOCH + Duration::from_secs(1_000_000);

        mirror.write("/a", b"hello", modified, WriteMode::Strict).unwrap();

        let path = mirror.fpath("/a");
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert_eq!(mtime_of(&path), modified);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.write("/a", b"x", SystemTime::now(), WriteMode::Strict).unwrap();

        let mode = fs::metadata(mirror.fpath("/a")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_write_empty_data() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.write("/empty", b"", SystemTime::now(), WriteMode::Strict).unwrap();
        assert_eq!(fs::read(mirror.fpath("/empty")).unwrap(), b"");
    }

    #[test]
    fn test_failed_rename_leaves_destination_intact() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());

        // A non-empty directory cannot be replaced by a file.
        mirror.mkdir("/busy").unwrap();
        mirror.write("/busy/child", b"keep", SystemTime::now(), WriteMode::Strict).unwrap();

        let result = mirror.write("/busy", b"new", SystemTime::now(), WriteMode::Strict);
        assert!(matches!(result, Err(MirrorError::Rename { .. })));

        assert!(mirror.fpath("/busy").is_dir());
        assert_eq!(fs::read(mirror.fpath("/busy/child")).unwrap(), b"keep");

        // No temporary file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_best_effort_swallows_rename_failure() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.mkdir("/busy").unwrap();
        mirror.write("/busy/child", b"keep", SystemTime::now(), WriteMode::Strict).unwrap();

        mirror
            .write("/busy", b"new", SystemTime::now(), WriteMode::BestEffort)
            .unwrap();
        assert!(mirror.fpath("/busy").is_dir());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.write("/a", b"old", SystemTime::now(), WriteMode::Strict).unwrap();
        mirror.write("/a", b"new", SystemTime::now(), WriteMode::Strict).unwrap();
        assert_eq!(fs::read(mirror.fpath("/a")).unwrap(), b"new");
    }

    #[test]
    fn test_list_skips_hidden_and_sorts() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.mkdir("/p").unwrap();
        for name in ["c", "a", "b"] {
            mirror
                .write(&format!("/p/{}", name), b"", SystemTime::now(), WriteMode::Strict)
                .unwrap();
        }
        mirror.mark_done("/p").unwrap();

        assert_eq!(mirror.list("/p").unwrap(), vec!["a", "b", "c"]);
        assert!(mirror.list("/missing").unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.write("/a", b"x", SystemTime::now(), WriteMode::Strict).unwrap();

        assert!(mirror.remove("/a").unwrap());
        assert!(!mirror.remove("/a").unwrap());
        assert!(!mirror.remove_tree("/nothing").unwrap());
    }

    #[test]
    fn test_done_marker() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.mkdir("/static").unwrap();

        assert!(!mirror.is_done("/static"));
        mirror.mark_done("/static").unwrap();
        assert!(mirror.is_done("/static"));
    }

    #[test]
    fn test_touch_modified_bumps_mtime() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::new(dir.path());
        mirror.touch_modified().unwrap();

        let marker = mirror.modified_marker();
        let old = UNIX_EPOCH + Duration::from_secs(10);
        File::options()
            .append(true)
            .open(&marker)
            .unwrap()
            .set_modified(old)
            .unwrap();

        mirror.touch_modified().unwrap();
        assert!(mtime_of(&marker) > old);
    }
}
