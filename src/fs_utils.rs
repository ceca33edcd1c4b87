use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::ArchiveError;

/// Write `bytes` to `path` without ever exposing a partially written file.
///
/// The data goes to a temporary file in the same directory, which is synced
/// and then renamed over `path`. A failure at any point leaves `path` as it
/// was.
///
/// # Errors
///
/// Returns [`ArchiveError::Write`] naming `path` if any filesystem step fails.
pub async fn write_atomic(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<(), ArchiveError> {
    let path = path.into();
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(|e| ArchiveError::write(&path, std::io::Error::other(e)))?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ArchiveError::write(dir, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| ArchiveError::write(path, e))?;
    file.write_all(bytes)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|e| ArchiveError::write(path, e))?;
    file.persist(path)
        .map_err(|e| ArchiveError::write(path, e.error))?;
    trace!(path = %path.display(), bytes = bytes.len(), "Wrote file");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns [`ArchiveError::Write`] if serialization or writing fails.
pub async fn write_json_atomic<T: serde::Serialize>(
    path: impl Into<PathBuf>,
    value: &T,
) -> Result<(), ArchiveError> {
    let path = path.into();
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ArchiveError::write(&path, std::io::Error::other(e)))?;
    bytes.push(b'\n');
    write_atomic(path, bytes).await
}
