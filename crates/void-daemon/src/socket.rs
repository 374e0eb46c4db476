//! Control-socket lifecycle.
//!
//! Binding is more than `UnixListener::bind`: the parent directory may not
//! exist, a previous daemon may have left a stale socket file behind, and
//! the bound socket needs permissions that let unprivileged clients talk to
//! a root daemon. A *live* socket (something answers a connect) refuses the
//! bind so two daemons never fight over one path.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

/// Mode for the parent directory when it has to be created.
const SOCKET_DIR_MODE: u32 = 0o755;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket {path} is already in use")]
    AddressInUse { path: PathBuf },

    #[error("failed to create socket directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove stale socket {path}: {source}")]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set socket permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the control socket at `path`, replacing any stale socket file and
/// applying [`default_socket_mode`].
pub fn bind(path: &Path) -> Result<UnixListener, SocketError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(SOCKET_DIR_MODE)
            .create(parent)
            .map_err(|source| SocketError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    // Someone answering on the socket means a daemon is alive there.
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(SocketError::AddressInUse {
            path: path.to_path_buf(),
        });
    }

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SocketError::RemoveStale {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let listener = UnixListener::bind(path).map_err(|source| SocketError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    let mode = default_socket_mode();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        SocketError::Permissions {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(listener)
}

/// World read/write where the platform provides peer credentials for
/// auditing, owner-only otherwise.
#[must_use]
pub const fn default_socket_mode() -> u32 {
    if cfg!(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd"
    )) {
        0o666
    } else {
        0o600
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[tokio::test]
    async fn bind_creates_socket_with_expected_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voidd.socket");

        let _listener = bind(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(mode, default_socket_mode());
    }

    #[tokio::test]
    async fn bind_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("voidd.socket");

        let _listener = bind(&path).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bind_removes_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voidd.socket");

        // A socket file with nothing listening behind it.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _listener = bind(&path).unwrap();
    }

    #[tokio::test]
    async fn bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voidd.socket");

        let _first = bind(&path).unwrap();
        let err = bind(&path).unwrap_err();
        assert!(matches!(err, SocketError::AddressInUse { .. }));
    }
}
