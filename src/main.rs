/// Entry point for the UDS ingest agent.
///
/// Receives metric datagrams on a Unix socket and tags each one with the container it was sent
/// from. Settings are read from `UDS_INGEST_*` environment variables.
///
/// # Errors
///
/// Returns an error if initialization fails (e.g., invalid configuration or a socket path that
/// cannot be bound).
///
/// # Examples
///
/// ```bash
/// RUST_LOG=debug UDS_INGEST_SOCKET=/tmp/dsd.socket cargo run
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    uds_ingest::run().await
}
