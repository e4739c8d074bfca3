use std::fs::File;
use std::io::{self, BufReader};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

/// Error that occurs when opening a file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to open file `{path}`: {source}")]
pub struct FileOpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Error that occurs when clearing a socket path before binding.
#[derive(Debug, thiserror::Error)]
pub enum SocketPathError {
    #[error("failed to inspect socket path `{path}`: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path `{path}` exists and is not a socket")]
    NotASocket { path: PathBuf },
    #[error("socket `{path}` is in use by another process")]
    InUse { path: PathBuf },
    #[error("failed to check whether socket `{path}` is in use: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale socket `{path}`: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Opens a file at the given path and wraps it in a [`BufReader`].
///
/// # Errors
///
/// Returns a [`FileOpenError`] if the file cannot be opened.
///
/// # Example
/// ```no_run
/// # use uds_ingest::fsutil;
/// let reader = fsutil::open_file_reader("/proc/self/cgroup")?;
/// # Ok::<(), fsutil::FileOpenError>(())
/// ```
pub fn open_file_reader(path: impl AsRef<Path>) -> Result<BufReader<File>, FileOpenError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| FileOpenError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Removes a leftover socket file at `path`.
///
/// Returns `true` if a socket was removed and `false` if nothing existed. A socket is stale
/// when connecting to it is refused; anything else is left in place.
///
/// # Errors
///
/// - [`SocketPathError::NotASocket`] if `path` exists but is not a socket.
/// - [`SocketPathError::InUse`] if another socket is still bound and reading at `path`.
/// - [`SocketPathError::Metadata`], [`SocketPathError::Connect`] and
///   [`SocketPathError::Remove`] on I/O failures.
pub fn remove_stale_socket(path: impl AsRef<Path>) -> Result<bool, SocketPathError> {
    let path = path.as_ref();
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(SocketPathError::Metadata {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(SocketPathError::NotASocket {
            path: path.to_path_buf(),
        });
    }

    let client = UnixDatagram::unbound().map_err(|source| SocketPathError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    match client.connect(path) {
        Ok(()) => {
            return Err(SocketPathError::InUse {
                path: path.to_path_buf(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(SocketPathError::Connect {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SocketPathError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_open_file_reader_success() {
        let tmp = tempfile::NamedTempFile::new().expect("failed to create temp file");
        let path = tmp.path();
        let reader = open_file_reader(path).expect("should open test file");
        let metadata = reader.get_ref().metadata().unwrap();
        assert!(metadata.is_file());
    }

    #[test]
    fn test_open_file_reader_error() {
        let result = open_file_reader("/definitely/does/not/exist");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.path, PathBuf::from("/definitely/does/not/exist"));
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_stale_socket_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_stale_socket(dir.path().join("missing.sock")).unwrap());
    }

    #[test]
    fn test_remove_stale_socket_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let socket = UnixDatagram::bind(&path).unwrap();
        drop(socket);
        assert!(path.exists());

        assert!(remove_stale_socket(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_stale_socket_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _socket = UnixDatagram::bind(&path).unwrap();

        let err = remove_stale_socket(&path).unwrap_err();
        assert!(matches!(err, SocketPathError::InUse { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_remove_stale_socket_keeps_regular_files() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = remove_stale_socket(tmp.path()).unwrap_err();
        assert!(matches!(err, SocketPathError::NotASocket { .. }));
        assert!(tmp.path().exists());
    }
}
