use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::Interest;
use tokio::sync::{mpsc, watch};

use super::credentials::{self, Credential, ReadWithCredential};
use super::telemetry::{ListenerTelemetry, ListenerTelemetrySnapshot};
use super::{Error, Result};
use crate::config::{ListenerConfig, OversizePolicy};
use crate::container::Origin;
use crate::error::ResultOkLogExt;
use crate::fsutil;
use crate::origin::OriginResolver;
use crate::packets::{Packets, PoolManager};

const LOG_TARGET: &str = "uds listener";

/// Lifecycle of a [`UdsListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// The socket is bound but nothing reads from it yet.
    Created = 0,
    Listening = 1,
    Stopped = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Created,
            1 => State::Listening,
            _ => State::Stopped,
        }
    }
}

/// Receives metric datagrams on a Unix datagram socket and forwards them as [`Packets`].
///
/// Every datagram is read into a pooled buffer, tagged with the [`Origin`] of its sender and
/// sent on the packet channel in arrival order. A full channel suspends the read loop, so
/// under sustained overload the kernel's socket buffer is where datagrams get dropped.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use uds_ingest::config::ListenerConfig;
/// # use uds_ingest::listener::UdsListener;
/// # use uds_ingest::packets::{Pool, PoolManager};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ListenerConfig::default();
/// let (tx, mut rx) = tokio::sync::mpsc::channel(config.channel_capacity);
/// let manager = PoolManager::new(Pool::new(config.buffer_size));
/// let listener = Arc::new(UdsListener::new(&config, tx, manager.clone(), None)?);
///
/// let task = tokio::spawn({
///     let listener = Arc::clone(&listener);
///     async move { listener.listen().await }
/// });
/// while let Some(packets) = rx.recv().await {
///     manager.put_all(packets);
/// }
/// listener.stop();
/// task.await??;
/// # Ok(())
/// # }
/// ```
pub struct UdsListener {
    path: PathBuf,
    socket: Mutex<Option<UnixDatagram>>,
    state: AtomicU8,
    socket_file_removed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    packets_tx: mpsc::Sender<Packets>,
    pool_manager: PoolManager,
    resolver: Option<Arc<dyn OriginResolver>>,
    oversize_policy: OversizePolicy,
    telemetry: ListenerTelemetry,
}

impl std::fmt::Debug for UdsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsListener")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("origin_detection", &self.resolver.is_some())
            .field("oversize_policy", &self.oversize_policy)
            .finish_non_exhaustive()
    }
}

impl UdsListener {
    /// Binds the socket at `config.socket_path`.
    ///
    /// A stale socket file at the path is removed first. The resolver is used only when
    /// `config.origin_detection` is enabled; without one, every origin is empty.
    ///
    /// # Errors
    ///
    /// Any failure leaves no socket file behind:
    ///
    /// - [`Error::SocketPath`] if the path is occupied by something other than a socket, or
    ///   by a socket another listener is still bound to.
    /// - [`Error::Bind`] if the socket cannot be bound.
    /// - [`Error::Permissions`] and [`Error::SocketOption`] if it cannot be configured.
    pub fn new(
        config: &ListenerConfig,
        packets_tx: mpsc::Sender<Packets>,
        pool_manager: PoolManager,
        resolver: Option<Arc<dyn OriginResolver>>,
    ) -> Result<Self> {
        let path = config.socket_path.clone();
        if fsutil::remove_stale_socket(&path)? {
            log::debug!(target: LOG_TARGET, "Removed stale socket `{}`", path.display());
        }

        let socket = UnixDatagram::bind(&path).map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })?;
        if let Err(err) = configure_socket(&socket, &path, config) {
            drop(socket);
            remove_socket_file(&path);
            return Err(err);
        }

        let resolver = if config.origin_detection {
            resolver
        } else {
            None
        };
        if config.origin_detection && resolver.is_none() {
            log::warn!(
                target: LOG_TARGET,
                "Origin detection enabled without a resolver, origins will be empty"
            );
        }

        let (stop_tx, _) = watch::channel(false);
        log::debug!(target: LOG_TARGET, "Bound datagram socket `{}`", path.display());

        Ok(Self {
            path,
            socket: Mutex::new(Some(socket)),
            state: AtomicU8::new(State::Created as u8),
            socket_file_removed: AtomicBool::new(false),
            stop_tx,
            packets_tx,
            pool_manager,
            resolver,
            oversize_policy: config.oversize_policy,
            telemetry: ListenerTelemetry::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn telemetry(&self) -> ListenerTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Runs the read loop until [`UdsListener::stop`] is called, the packet receiver is
    /// dropped, or the socket fails unrecoverably.
    ///
    /// Returns immediately if the listener was already stopped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if another call is already listening.
    /// - [`Error::Register`] if the socket cannot be registered with the tokio reactor.
    /// - [`Error::Receive`] if the socket became unusable.
    pub async fn listen(&self) -> Result<()> {
        if let Err(current) = self.state.compare_exchange(
            State::Created as u8,
            State::Listening as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match State::from_u8(current) {
                State::Stopped => Ok(()),
                state => Err(Error::InvalidState {
                    path: self.path.clone(),
                    state,
                }),
            };
        }

        let socket = self.take_socket();
        let Some(socket) = socket else {
            return Ok(());
        };
        let socket = match tokio::net::UnixDatagram::from_std(socket) {
            Ok(socket) => socket,
            Err(source) => {
                self.finish();
                return Err(Error::Register {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        log::info!(target: LOG_TARGET, "Listening on `{}`", self.path.display());
        let result = self.read_loop(&socket).await;
        drop(socket);
        self.finish();
        log::info!(target: LOG_TARGET, "Stopped listening on `{}`", self.path.display());

        result
    }

    async fn read_loop(&self, socket: &tokio::net::UnixDatagram) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            let mut buffer = tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => return Ok(()),
                buffer = self.pool_manager.get() => buffer,
            };

            let read = tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => return Ok(()),
                read = socket.async_io(Interest::READABLE, || {
                    socket.read_with_credential(buffer.as_mut_slice())
                }) => read,
            };

            let datagram = match read {
                Ok(datagram) => datagram,
                Err(err) if is_unrecoverable(&err) => {
                    self.telemetry.record_read_error();
                    return Err(Error::Receive {
                        path: self.path.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    self.telemetry.record_read_error();
                    log::error!(
                        target: LOG_TARGET,
                        "Failed to read datagram on `{}`: {}",
                        self.path.display(),
                        err
                    );
                    continue;
                }
            };

            if datagram.truncated {
                self.telemetry.record_truncated();
                match self.oversize_policy {
                    OversizePolicy::Truncate => log::warn!(
                        target: LOG_TARGET,
                        "Datagram larger than {} bytes truncated",
                        buffer.capacity()
                    ),
                    OversizePolicy::Drop => {
                        self.telemetry.record_dropped_oversized();
                        log::warn!(
                            target: LOG_TARGET,
                            "Datagram larger than {} bytes dropped",
                            buffer.capacity()
                        );
                        continue;
                    }
                }
            }

            buffer.set_len(datagram.len);
            self.telemetry.record_packet(datagram.len);
            let origin = self.resolve_origin(datagram.credential.as_ref());
            log::trace!(
                target: LOG_TARGET,
                "Received {} bytes, origin=`{}`",
                datagram.len,
                origin
            );
            let packet = self.pool_manager.packet(buffer, origin);

            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => return Ok(()),
                sent = self.packets_tx.send(vec![packet]) => {
                    if sent.is_err() {
                        log::warn!(target: LOG_TARGET, "Packet channel closed, stopping listener");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn resolve_origin(&self, credential: Option<&Credential>) -> Origin {
        let Some(resolver) = &self.resolver else {
            return Origin::none();
        };
        let Some(credential) = credential else {
            self.telemetry.record_missing_credential();
            return Origin::none();
        };

        let origin = resolver.resolve(credential);
        self.telemetry.record_origin(!origin.is_empty());
        origin
    }

    /// Stops the listener.
    ///
    /// Safe to call from any thread and more than once. A running [`UdsListener::listen`]
    /// returns promptly; packets already delivered stay with their consumers. The socket file
    /// is removed, so later sends to the path fail.
    pub fn stop(&self) {
        let previous = State::from_u8(self.state.swap(State::Stopped as u8, Ordering::AcqRel));
        if previous == State::Stopped {
            return;
        }

        self.stop_tx.send_replace(true);
        // Still created: nobody will take the socket anymore.
        drop(self.take_socket());
        self.remove_socket_file_once();
        log::debug!(target: LOG_TARGET, "Stop requested for `{}`", self.path.display());
    }

    fn finish(&self) {
        self.state.store(State::Stopped as u8, Ordering::Release);
        self.remove_socket_file_once();
    }

    fn take_socket(&self) -> Option<UnixDatagram> {
        // Only ever held for a `take`, which cannot panic.
        self.socket.lock().expect("socket lock poisoned").take()
    }

    fn remove_socket_file_once(&self) {
        if !self.socket_file_removed.swap(true, Ordering::AcqRel) {
            remove_socket_file(&self.path);
        }
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn configure_socket(socket: &UnixDatagram, path: &Path, config: &ListenerConfig) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(config.socket_mode)).map_err(
        |source| Error::Permissions {
            path: path.to_path_buf(),
            mode: config.socket_mode,
            source,
        },
    )?;

    let option_error = |option: &'static str| {
        move |source| Error::SocketOption {
            path: path.to_path_buf(),
            option,
            source,
        }
    };

    if config.origin_detection {
        credentials::enable_credential_passing(socket.as_fd())
            .map_err(option_error("SO_PASSCRED"))?;
    }
    if let Some(size) = config.receive_buffer {
        credentials::set_receive_buffer(socket.as_fd(), size).map_err(option_error("SO_RCVBUF"))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(option_error("O_NONBLOCK"))?;

    Ok(())
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        result => {
            result
                .map_err(|source| fsutil::SocketPathError::Remove {
                    path: path.to_path_buf(),
                    source,
                })
                .ok_log();
        }
    }
}

/// Errors after which the descriptor itself is unusable.
fn is_unrecoverable(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::ENOTSOCK) | Some(libc::EINVAL)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::packets::{ExhaustionPolicy, Pool};

    const ID: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    struct FixedResolver(Origin);

    impl OriginResolver for FixedResolver {
        fn resolve(&self, _credential: &Credential) -> Origin {
            self.0.clone()
        }
    }

    fn config(dir: &tempfile::TempDir) -> ListenerConfig {
        ListenerConfig {
            socket_path: dir.path().join("dsd.socket"),
            buffer_size: 32,
            ..ListenerConfig::default()
        }
    }

    fn manager(buffer_size: usize) -> PoolManager {
        PoolManager::new(Pool::with_options(buffer_size, 4, ExhaustionPolicy::Block))
    }

    #[test]
    fn test_new_binds_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, _rx) = mpsc::channel(1);
        let listener = UdsListener::new(&config, tx, manager(32), None).unwrap();

        assert_eq!(listener.state(), State::Created);
        let mode = std::fs::metadata(&config.socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o722);
    }

    #[test]
    fn test_new_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        drop(UnixDatagram::bind(&config.socket_path).unwrap());

        let (tx, _rx) = mpsc::channel(1);
        assert!(UdsListener::new(&config, tx, manager(32), None).is_ok());
    }

    #[test]
    fn test_new_refuses_non_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        std::fs::write(&config.socket_path, b"keep me").unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let err = UdsListener::new(&config, tx, manager(32), None).unwrap_err();
        assert!(matches!(
            err,
            Error::SocketPath(fsutil::SocketPathError::NotASocket { .. })
        ));
        assert_eq!(std::fs::read(&config.socket_path).unwrap(), b"keep me");
    }

    #[test]
    fn test_new_fails_on_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ListenerConfig {
            socket_path: dir.path().join("missing/dsd.socket"),
            ..ListenerConfig::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            UdsListener::new(&config, tx, manager(32), None),
            Err(Error::Bind { .. })
        ));
    }

    #[test]
    fn test_stop_before_listen_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, _rx) = mpsc::channel(1);
        let listener = UdsListener::new(&config, tx, manager(32), None).unwrap();

        listener.stop();
        listener.stop();
        assert_eq!(listener.state(), State::Stopped);
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn test_listen_after_stop_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, _rx) = mpsc::channel(1);
        let listener = UdsListener::new(&config, tx, manager(32), None).unwrap();
        listener.stop();

        tokio::time::timeout(Duration::from_secs(2), listener.listen())
            .await
            .expect("listen returned")
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, _rx) = mpsc::channel(1);
        let listener = Arc::new(UdsListener::new(&config, tx, manager(32), None).unwrap());

        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.listen().await }
        });
        while listener.state() != State::Listening {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            listener.listen().await,
            Err(Error::InvalidState {
                state: State::Listening,
                ..
            })
        ));
        listener.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delivers_packet_with_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, mut rx) = mpsc::channel(4);
        let manager = manager(32);
        let origin = Origin::from(crate::container::ContainerID::new(ID).unwrap());
        let listener = Arc::new(
            UdsListener::new(
                &config,
                tx,
                manager.clone(),
                Some(Arc::new(FixedResolver(origin.clone()))),
            )
            .unwrap(),
        );
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.listen().await }
        });

        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"custom_counter1:1|c", &config.socket_path)
            .unwrap();

        let packets = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout on receive channel")
            .expect("channel open");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].contents(), b"custom_counter1:1|c");
        if cfg!(target_os = "linux") {
            assert_eq!(packets[0].origin(), &origin);
        }
        manager.put_all(packets);

        listener.stop();
        task.await.unwrap().unwrap();
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(listener.telemetry().packets, 1);
    }

    #[tokio::test]
    async fn test_origin_detection_disabled_yields_empty_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = ListenerConfig {
            origin_detection: false,
            ..config(&dir)
        };
        let (tx, mut rx) = mpsc::channel(4);
        let origin = Origin::from(crate::container::ContainerID::new(ID).unwrap());
        let listener = Arc::new(
            UdsListener::new(&config, tx, manager(32), Some(Arc::new(FixedResolver(origin))))
                .unwrap(),
        );
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.listen().await }
        });

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"a:1|c", &config.socket_path).unwrap();

        let packets = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(packets[0].origin().is_empty());
        drop(packets);

        listener.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversize_policies() {
        for (policy, expected) in [
            (OversizePolicy::Truncate, Some(&b"01234567"[..])),
            (OversizePolicy::Drop, None),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let config = ListenerConfig {
                oversize_policy: policy,
                ..config(&dir)
            };
            let (tx, mut rx) = mpsc::channel(4);
            let listener =
                Arc::new(UdsListener::new(&config, tx, manager(8), None).unwrap());
            let task = tokio::spawn({
                let listener = Arc::clone(&listener);
                async move { listener.listen().await }
            });

            let client = UnixDatagram::unbound().unwrap();
            client.send_to(b"0123456789abcdef", &config.socket_path).unwrap();
            client.send_to(b"ok", &config.socket_path).unwrap();

            let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match expected {
                Some(contents) => {
                    assert_eq!(first[0].contents(), contents);
                    let second = rx.recv().await.unwrap();
                    assert_eq!(second[0].contents(), b"ok");
                }
                None => assert_eq!(first[0].contents(), b"ok"),
            }

            listener.stop();
            task.await.unwrap().unwrap();
            let telemetry = listener.telemetry();
            assert_eq!(telemetry.truncated, 1);
            assert_eq!(
                telemetry.dropped_oversized,
                u64::from(policy == OversizePolicy::Drop)
            );
        }
    }

    #[tokio::test]
    async fn test_stop_unblocks_exhausted_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, _rx) = mpsc::channel(4);
        let manager = PoolManager::new(Pool::with_options(32, 1, ExhaustionPolicy::Block));
        let held = manager.get().await;
        let listener = Arc::new(UdsListener::new(&config, tx, manager.clone(), None).unwrap());
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.listen().await }
        });
        while listener.state() != State::Listening {
            tokio::task::yield_now().await;
        }

        listener.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listen returned")
            .unwrap()
            .unwrap();
        drop(held);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_listener() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (tx, rx) = mpsc::channel(4);
        let listener = Arc::new(UdsListener::new(&config, tx, manager(32), None).unwrap());
        drop(rx);
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.listen().await }
        });

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"a:1|c", &config.socket_path).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listen returned")
            .unwrap()
            .unwrap();
        assert_eq!(listener.state(), State::Stopped);
        assert!(!config.socket_path.exists());
    }
}
