use std::path::PathBuf;

use crate::fsutil;

/// Reasons a sender could not be attributed to a container.
///
/// These never reach the packet pipeline; resolvers log them and return an empty origin.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no usable pid in peer credential: {0}")]
    InvalidPid(i32),
    #[error(transparent)]
    FileOpen(#[from] fsutil::FileOpenError),
    #[error("failed to read line for file `{path}`: {source}")]
    ReadLine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cgroup file `{path}`: {source}")]
    CgroupLine {
        path: PathBuf,
        #[source]
        source: CgroupLineError,
    },
    #[error("no container id found in `{path}`")]
    NotContainerized { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum CgroupLineError {
    #[error("invalid cgroup line format: {0}")]
    InvalidFormat(String),
    #[error("invalid hierarchy id in cgroup line: {0}")]
    InvalidHierarchyID(String),
}

pub type Result<T> = std::result::Result<T, Error>;
