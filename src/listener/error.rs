use std::path::PathBuf;

use super::State;
use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    SocketPath(#[from] fsutil::SocketPathError),
    #[error("failed to bind socket `{path}`: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set permissions {mode:o} on socket `{path}`: {source}")]
    Permissions {
        path: PathBuf,
        mode: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set {option} on socket `{path}`: {source}")]
    SocketOption {
        path: PathBuf,
        option: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register socket `{path}` with the runtime: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecoverable read error on socket `{path}`: {source}")]
    Receive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listener on `{path}` is already {state:?}")]
    InvalidState { path: PathBuf, state: State },
}

pub type Result<T> = std::result::Result<T, Error>;
