//! Path-addressed byte storage.
//!
//! This module centralizes all filesystem access for `parquet-lake`. Every
//! higher layer (the metadata log, the checkpoint manager, the engine) talks
//! to storage through a small set of async operations on paths relative to a
//! [`StoreLocation`]:
//!
//! - `put` creates a *new* file (data files and log entries are immutable,
//!   so a colliding path is an error, never an overwrite).
//! - `put_atomic` performs a write-then-rename for the one file that is
//!   legitimately replaced in place: the checkpoint marker.
//! - `get_bytes` / `get_string` read whole files.
//! - `list_dir`, `exists`, `create_dir`, `remove_dir_all` support the
//!   directory-backed database namespace and log recovery.
//! - `sync_dir` fsyncs a directory so a rename/creation is durable.
//!
//! Keeping path conventions and durability details here means the log and
//! engine never touch `tokio::fs` directly, and a future object-storage
//! backend can be introduced without rewriting them.

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of a store.
///
/// All relative paths used by the engine (data files, delta files, the
/// metadata log's own files, checkpoints) resolve under this root. Local
/// filesystem only for now; the enum leaves room for object-storage backends.
#[derive(Clone, Debug)]
pub enum StoreLocation {
    /// A store rooted at a local filesystem directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// Creates a new `StoreLocation` for a local filesystem root.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }
}

/// Errors produced by the storage backend implementation.
///
/// Backend-specific I/O errors are wrapped here so higher layers can map them
/// into [`StorageError`] variants with path context attached.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Join a store location with a relative path into an absolute local path.
fn join_local(location: &StoreLocation, rel: &Path) -> PathBuf {
    match location {
        StoreLocation::Local(root) => root.join(rel),
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    /// Call this after a successful rename.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we're likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the path is already occupied.
///
/// The file is fully written and fsynced before this returns, so a caller may
/// safely record the path elsewhere (for example in a log entry) immediately
/// afterwards. Data files and persisted log entries are written exclusively
/// through this function; their immutability invariant rests on the
/// create-new open mode.
pub async fn put(location: &StoreLocation, rel_path: &Path, contents: &[u8]) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let path_str = abs.display().to_string();

            // Atomic "create only if not exists" on the target path.
            let open_result = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await;

            let mut file = match open_result {
                Ok(f) => f,
                Err(e) => {
                    let backend = BackendError::Local(e);
                    let storage_err = match &backend {
                        BackendError::Local(inner)
                            if inner.kind() == io::ErrorKind::AlreadyExists =>
                        {
                            StorageError::AlreadyExists {
                                path: path_str,
                                source: backend,
                                backtrace: Backtrace::capture(),
                            }
                        }
                        _ => StorageError::OtherIo {
                            path: path_str,
                            source: backend,
                            backtrace: Backtrace::capture(),
                        },
                    };
                    return Err(storage_err);
                }
            };

            file.write_all(contents)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            file.sync_all()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            Ok(())
        }
    }
}

/// Write `contents` to `rel_path` using a write-then-rename sequence.
///
/// The payload goes to a temporary file next to the target path, is synced,
/// and is then renamed into place so readers observe either the old or the
/// new contents, never a partial write. Used for the checkpoint marker, the
/// only mutable file in the store.
pub async fn put_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            create_parent_dir(&abs).await?;

            // Append rather than replace the extension: marker names contain
            // dots ("_last_checkpoint.<db>.<table>"), and two tables' markers
            // must never share a temp path.
            let tmp_path = {
                let mut name = abs.file_name().map(|n| n.to_os_string()).unwrap_or_default();
                name.push(".tmp");
                abs.with_file_name(name)
            };
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            // Success - don't remove the temp file (it's been renamed).
            guard.disarm();

            Ok(())
        }
    }
}

/// Read the full contents of the file at `rel_path` as a `Vec<u8>`.
///
/// Returns [`StorageError::NotFound`] for a missing file and
/// [`StorageError::OtherIo`] for any other I/O failure.
pub async fn get_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            match fs::read(&abs).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
                }
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
            }
        }
    }
}

/// Read the file at `rel_path` and return its contents as a `String`.
pub async fn get_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            match fs::read_to_string(&abs).await {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
                }
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
            }
        }
    }
}

/// A single entry returned by [`list_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Name of the entry (final path component, no directory prefix).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// List the entries of the directory at `rel_path`, sorted by name.
///
/// Returns [`StorageError::NotFound`] if the directory does not exist;
/// callers that treat an absent directory as "empty" (for example log
/// recovery on a fresh store) match on that variant.
pub async fn list_dir(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<DirEntry>> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            let mut reader = match fs::read_dir(&abs).await {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str });
                }
                Err(e) => {
                    return Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str });
                }
            };

            let mut entries = Vec::new();
            loop {
                let next = reader
                    .next_entry()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: path_str.clone(),
                    })?;
                let Some(entry) = next else { break };

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: path_str.clone(),
                    })?;

                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: file_type.is_dir(),
                });
            }

            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }
    }
}

/// Check whether a file or directory exists at `rel_path`.
pub async fn exists(location: &StoreLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::metadata(&abs).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Create the directory at `rel_path` (and any missing parents).
pub async fn create_dir(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::create_dir_all(&abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })
        }
    }
}

/// Remove the directory at `rel_path` and everything under it.
pub async fn remove_dir_all(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();
            match fs::remove_dir_all(&abs).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
                }
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
            }
        }
    }
}

/// Fsync the directory at `rel_path`.
///
/// On POSIX filesystems a file creation or rename is only durable once its
/// parent directory has been synced; the checkpoint marker path calls this
/// after updating the marker.
pub async fn sync_dir(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            let dir = fs::File::open(&abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: path_str.clone(),
                })?;
            dir.sync_all()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu { path: path_str })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn put_creates_file_with_contents() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        put(&location, Path::new("db/t/data/f1.parquet"), b"payload").await?;

        let abs = tmp.path().join("db/t/data/f1.parquet");
        assert_eq!(tokio::fs::read(&abs).await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn put_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("immutable.bin");

        put(&location, rel, b"first").await?;
        let result = put(&location, rel, b"second").await;

        let err = result.expect_err("expected AlreadyExists error");
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        // Original content must be unchanged.
        let read_back = get_bytes(&location, rel).await?;
        assert_eq!(read_back, b"first");
        Ok(())
    }

    #[tokio::test]
    async fn put_atomic_overwrites_and_leaves_no_tmp_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("marker.txt");

        put_atomic(&location, rel, b"1").await?;
        put_atomic(&location, rel, b"2").await?;

        assert_eq!(get_string(&location, rel).await?, "2");
        assert!(!tmp.path().join("marker.txt.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn get_bytes_returns_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let err = get_bytes(&location, Path::new("missing.bin"))
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_dir_returns_sorted_entries() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        put(&location, Path::new("dir/b.bin"), b"b").await?;
        put(&location, Path::new("dir/a.bin"), b"a").await?;
        create_dir(&location, Path::new("dir/sub")).await?;

        let entries = list_dir(&location, Path::new("dir")).await?;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "sub"]);
        assert!(entries[2].is_dir);
        Ok(())
    }

    #[tokio::test]
    async fn list_dir_missing_directory_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let err = list_dir(&location, Path::new("absent"))
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn exists_and_remove_dir_all() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        create_dir(&location, Path::new("db1")).await?;
        assert!(exists(&location, Path::new("db1")).await?);

        remove_dir_all(&location, Path::new("db1")).await?;
        assert!(!exists(&location, Path::new("db1")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn sync_dir_on_existing_directory_succeeds() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        create_dir(&location, Path::new("synced")).await?;
        sync_dir(&location, Path::new("synced")).await?;
        Ok(())
    }
}
