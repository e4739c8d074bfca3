use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP handshake with `{path}` failed: {source}")]
    Handshake {
        path: PathBuf,
        #[source]
        source: hyper::Error,
    },
    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("request failed: {0}")]
    Send(#[source] hyper::Error),
    #[error("unexpected status {0}")]
    Status(hyper::StatusCode),
    #[error("failed to read response body: {0}")]
    Body(#[source] hyper::Error),
    #[error("failed to decode stats: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    /// True if the remote side could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect { .. } | Error::Handshake { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
