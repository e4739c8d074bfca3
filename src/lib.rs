use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::ListenerConfig;
use error::ResultOkLogExt;
use listener::UdsListener;
use origin::{CachedResolver, CgroupResolver, OriginResolver};
use packets::{Pool, PoolManager};

/// UDS Ingest: a metrics-ingestion front end that receives datagrams on a Unix socket.
///
/// This library provides the listener that reads metric datagrams, tags them with the
/// container they were sent from (resolved through the sender's peer credentials and its cgroup),
/// and hands them to consumers through a bounded channel backed by a buffer pool.
pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod fsutil;
pub mod listener;
pub mod origin;
pub mod packets;
pub mod probe;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Runs the UDS ingest agent.
///
/// Binds the listener, drains received packets, and periodically logs telemetry until Ctrl-C.
///
/// # Errors
///
/// Possible errors include:
/// - Invalid `UDS_INGEST_*` environment variables.
/// - A containerized agent without the host root mount at `ROOTFS_MOUNT_PATH`.
/// - Failure to bind the socket.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ListenerConfig::from_env()?;
    log::debug!("Configuration: {config:?}");

    let procfs_root = match &config.procfs_root {
        Some(root) => root.clone(),
        None => detect_procfs_root()?,
    };
    log::debug!("Final procfs root: {}", procfs_root.display());

    if let Some(probe_socket) = std::env::var_os("UDS_INGEST_PROBE_SOCKET") {
        let stats = probe::get_remote_stats(PathBuf::from(probe_socket)).await;
        serde_json::to_string(&stats)
            .map(|stats| log::info!("System probe stats: {stats}"))
            .ok_log();
    }

    let pool = Pool::with_options(
        config.buffer_size,
        config.pool_capacity,
        config.exhaustion_policy,
    );
    let manager = PoolManager::new(pool);
    let resolver: Arc<dyn OriginResolver> = Arc::new(CachedResolver::new(
        CgroupResolver::new(procfs_root),
        config.origin_cache_ttl,
    ));

    let (tx, mut rx) = tokio::sync::mpsc::channel(config.channel_capacity);
    let listener = Arc::new(UdsListener::new(
        &config,
        tx,
        manager.clone(),
        Some(resolver),
    )?);

    let mut listen = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.listen().await }
    });

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(packets) = rx.recv().await {
                for packet in &packets {
                    log::trace!(
                        "Packet origin=`{}` contents={:?}",
                        packet.origin(),
                        String::from_utf8_lossy(packet.contents())
                    );
                }
                manager.put_all(packets);
            }
        });
    }

    {
        let listener = Arc::clone(&listener);
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TELEMETRY_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                serde_json::to_string(&listener.telemetry())
                    .map(|telemetry| log::info!("Listener telemetry: {telemetry}"))
                    .ok_log();
                serde_json::to_string(&manager.stats())
                    .map(|stats| log::debug!("Pool stats: {stats}"))
                    .ok_log();
            }
        });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            log::info!("Received Ctrl-C, shutting down");
            listener.stop();
            listen.await??;
        }
        result = &mut listen => {
            result??;
        }
    }

    manager.report_leaks();
    Ok(())
}

/// Picks the procfs that shows the senders' processes for the detected runtime environment.
fn detect_procfs_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let rootfs = std::env::var_os("ROOTFS_MOUNT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/rootfs"));
    let runtime_env = environment::detect_runtime_environment(&rootfs);
    log::debug!("Detected runtime environment: {runtime_env:?}");
    if matches!(runtime_env, environment::RuntimeEnvironment::Container) && !rootfs.exists() {
        return Err(format!(
            "Detected container runtime environment, but missing host root mount at `{}`!",
            rootfs.display()
        )
        .into());
    }

    Ok(environment::procfs_root_for(runtime_env, &rootfs))
}
