//! Crash-safe file replacement.
//!
//! [`atomic_write`] follows the temp + fsync + chmod + rename + dir-fsync
//! protocol: at no point can a reader observe a partially written file at
//! the destination, and a crash at any step leaves either the old complete
//! file or the new complete file. The explicit chmod exists because the
//! temp file is created 0600 and the rename would otherwise carry that mode
//! onto a file other tools need to read.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Errors from the atomic write protocol. On any failure the temp file is
/// unlinked and the destination is untouched.
#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    #[error("path has no parent directory: {path}")]
    NoParentDirectory { path: String },

    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AtomicWriteError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Atomically replaces `path` with `data`, leaving the file at `mode`.
///
/// 1. Create a temp file in the destination directory (same filesystem, so
///    the rename is atomic).
/// 2. Write and fsync the temp file.
/// 3. chmod the temp file to `mode`.
/// 4. Rename the temp file over the destination.
/// 5. fsync the parent directory to commit the rename.
///
/// # Errors
///
/// Returns [`AtomicWriteError`] on any failed step; the original file is
/// left as it was.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<(), AtomicWriteError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| AtomicWriteError::NoParentDirectory {
            path: path.display().to_string(),
        })?;

    std::fs::create_dir_all(parent).map_err(|e| AtomicWriteError::io("create parent directory", e))?;

    // NamedTempFile unlinks itself on drop, which covers every early return
    // below until persist() takes ownership of the path.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| AtomicWriteError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| AtomicWriteError::io("write temp file", e))?;
    tmp.flush()
        .map_err(|e| AtomicWriteError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| AtomicWriteError::io("fsync temp file", e))?;

    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| AtomicWriteError::io("chmod temp file", e))?;

    tmp.persist(path)
        .map_err(|e| AtomicWriteError::io("rename over destination", e.error))?;

    let dir = File::open(parent).map_err(|e| AtomicWriteError::io("open parent directory", e))?;
    dir.sync_all()
        .map_err(|e| AtomicWriteError::io("fsync parent directory", e))?;

    Ok(())
}
