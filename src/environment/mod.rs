//! Environment detection module.
//!
//! Determines whether the agent runs on the host or inside a container. A containerized agent
//! sees the senders' processes through the host's procfs mounted under a rootfs, so origin
//! lookups must use `<rootfs>/proc` instead of its own `/proc`.
mod error;

pub use error::{Error, Result};

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::origin::container_id_from_cgroup_path;

/// Available runtime environments for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    /// Running directly on the host.
    Host,
    /// Running inside a containerized environment (e.g., Docker, Kubernetes, Podman).
    Container,
}

/// Detects whether the current process runs in a container or on the host.
///
/// The checks, in order:
///
/// 1. The init process under `rootfs` lives in a different PID namespace.
/// 2. `/proc/self/cgroup` names a container or a container runtime.
/// 3. Marker files (`/.dockerenv`, `/run/.containerenv`) or the `container` variable exist.
///
/// Failing checks are logged as warnings and skipped.
pub fn detect_runtime_environment(rootfs: impl AsRef<Path>) -> RuntimeEnvironment {
    let rootfs = rootfs.as_ref();

    match is_pid_namespace_isolated(rootfs) {
        Ok(true) => return RuntimeEnvironment::Container,
        Ok(false) => {}
        Err(err) => log::warn!("Namespace check failed when detecting runtime environment: {err}"),
    }

    match self_cgroup_is_containerized("/proc/self/cgroup") {
        Ok(true) => return RuntimeEnvironment::Container,
        Ok(false) => {}
        Err(err) => log::warn!("Cgroup analysis failed during runtime detection: {err}"),
    }

    if has_container_indicators() {
        return RuntimeEnvironment::Container;
    }

    RuntimeEnvironment::Host
}

/// Picks the procfs that shows the senders' processes.
pub fn procfs_root_for(env: RuntimeEnvironment, rootfs: impl AsRef<Path>) -> PathBuf {
    match env {
        RuntimeEnvironment::Container => rootfs.as_ref().join("proc"),
        RuntimeEnvironment::Host => PathBuf::from("/proc"),
    }
}

/// Returns true if `<rootfs>/proc/1` is in another PID namespace than this process.
///
/// A rootfs without `/proc` cannot be compared and counts as not isolated.
fn is_pid_namespace_isolated(rootfs: &Path) -> Result<bool> {
    let proc = rootfs.join("proc");
    if !proc
        .try_exists()
        .map_err(|source| Error::ExistenceCheck {
            path: proc.clone(),
            source,
        })?
    {
        return Ok(false);
    }

    let read_link = |path: PathBuf| {
        std::fs::read_link(&path).map_err(|source| Error::ReadSymlink { path, source })
    };
    let own = read_link(PathBuf::from("/proc/self/ns/pid"))?;
    let init = read_link(proc.join("1/ns/pid"))?;

    Ok(own != init)
}

/// Returns true if a cgroup file names a container id or a well-known runtime.
fn self_cgroup_is_containerized(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let mut reader = fsutil::open_file_reader(path)?;
    let mut line = String::with_capacity(256);

    while reader.read_line(&mut line).map_err(|source| Error::ReadLine {
        path: path.to_path_buf(),
        source,
    })? != 0
    {
        if ["docker", "kubepods", "containerd", "libpod"]
            .iter()
            .any(|marker| line.contains(marker))
        {
            return Ok(true);
        }

        let cgroup_path = line.splitn(3, ':').nth(2).unwrap_or_default().trim();
        if container_id_from_cgroup_path(cgroup_path).is_some() {
            return Ok(true);
        }

        line.clear();
    }

    Ok(false)
}

fn has_container_indicators() -> bool {
    Path::new("/.dockerenv").exists()
        || Path::new("/run/.containerenv").exists()
        || std::env::var_os("container").is_some()
}
