//! Client for the stats endpoint of a sibling daemon listening on a Unix stream socket.
//!
//! The result is always a map. Failures are reported under the reserved `"Errors"` key so
//! callers that render status pages keep working while the daemon is down.
mod error;

pub use error::{Error, Result};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{pin, task};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tower::ServiceExt;

pub const STATS_PATH: &str = "/debug/stats";
pub const ERRORS_KEY: &str = "Errors";

pub type Stats = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future =
        pin::Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;

            Ok(TokioIo::new(stream))
        })
    }
}

/// Fetches the stats map served at `GET /debug/stats` on `socket_path`.
///
/// Never fails: a connection failure yields `{"Errors": "<error>"}` and any later failure
/// yields `{"Errors": "issue querying stats from system probe: <error>"}`.
pub async fn get_remote_stats(socket_path: impl AsRef<Path>) -> Stats {
    match query_stats(socket_path.as_ref()).await {
        Ok(stats) => stats,
        Err(err) if err.is_connect() => error_stats(err.to_string()),
        Err(err) => error_stats(format!("issue querying stats from system probe: {err}")),
    }
}

fn error_stats(message: String) -> Stats {
    HashMap::from([(ERRORS_KEY.to_owned(), serde_json::Value::String(message))])
}

/// Like [`get_remote_stats`], but returns the failure instead of folding it into the map.
pub async fn query_stats(socket_path: &Path) -> Result<Stats> {
    log::debug!("Querying stats from {}...", socket_path.display());
    let connector = UnixConnector {
        path: socket_path.to_path_buf(),
    };
    let io = connector
        .oneshot(hyper::Uri::from_static("http://localhost/"))
        .await
        .map_err(|source| Error::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|source| Error::Handshake {
            path: socket_path.to_path_buf(),
            source,
        })?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::debug!("Stats connection closed with error: {err}");
        }
    });

    let request = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(STATS_PATH)
        .header(hyper::header::HOST, "localhost")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await.map_err(Error::Send)?;
    if !response.status().is_success() {
        return Err(Error::Status(response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(Error::Body)?
        .to_bytes();
    let stats: Stats = serde_json::from_slice(&body)?;
    log::trace!("Received {} stats entries from {}", stats.len(), socket_path.display());

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http_body_util::Full;
    use hyper::{Request, Response, StatusCode};

    use super::*;

    async fn serve_once(listener: tokio::net::UnixListener, status: StatusCode, body: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| async move {
            assert_eq!(req.uri().path(), STATS_PATH);
            let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
            *response.status_mut() = status;
            Ok::<_, Infallible>(response)
        });
        // The client hangs up once it has the response.
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
    }

    #[tokio::test]
    async fn test_unreachable_socket_reports_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let stats = get_remote_stats(dir.path().join("missing.sock")).await;

        assert_eq!(stats.len(), 1);
        let message = stats[ERRORS_KEY].as_str().unwrap();
        assert!(message.starts_with("failed to connect to"), "{message}");
    }

    #[tokio::test]
    async fn test_returns_remote_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            StatusCode::OK,
            r#"{"uptime": 12, "tracer": {"conns": 3}}"#,
        ));

        let stats = get_remote_stats(&path).await;
        assert!(!stats.contains_key(ERRORS_KEY));
        assert_eq!(stats["uptime"], 12);
        assert_eq!(stats["tracer"]["conns"], 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_status_reports_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(listener, StatusCode::INTERNAL_SERVER_ERROR, ""));

        let stats = get_remote_stats(&path).await;
        assert_eq!(stats.len(), 1);
        let message = stats[ERRORS_KEY].as_str().unwrap();
        assert!(
            message.starts_with("issue querying stats from system probe: unexpected status 500"),
            "{message}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_json_reports_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(listener, StatusCode::OK, "[1, 2]"));

        let err = query_stats(&path).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.is_connect());
        server.await.unwrap();
    }
}
