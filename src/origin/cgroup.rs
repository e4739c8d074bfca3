use std::io::BufRead;
use std::path::{Path, PathBuf};

use super::error::CgroupLineError;
use super::{Error, OriginResolver, Result};
use crate::container::{CONTAINER_ID_LEN, ContainerID, Origin, is_container_id};
use crate::fsutil;
use crate::listener::Credential;

/// Scope unit prefixes used by the systemd cgroup driver of the supported runtimes.
const SCOPE_PREFIXES: &[&[u8]] = &[b"docker-", b"cri-containerd-", b"crio-", b"libpod-"];
const SCOPE_SUFFIX: &[u8] = b".scope";

/// Resolves the container of a process by reading `<procfs_root>/<pid>/cgroup`.
///
/// Works with both the systemd (`docker-<id>.scope`) and cgroupfs (`/docker/<id>`) drivers and
/// with cgroup v1 and v2 layouts.
#[derive(Debug, Clone)]
pub struct CgroupResolver {
    procfs_root: PathBuf,
}

impl Default for CgroupResolver {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl CgroupResolver {
    pub fn new(procfs_root: impl Into<PathBuf>) -> Self {
        Self {
            procfs_root: procfs_root.into(),
        }
    }

    pub fn procfs_root(&self) -> &Path {
        &self.procfs_root
    }

    /// Looks up the container id of `pid`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPid`] for a pid that cannot name a process.
    /// - [`Error::FileOpen`] if the process exited or its cgroup file is not readable.
    /// - [`Error::ReadLine`] if the file cannot be read.
    /// - [`Error::CgroupLine`] if no line of the file parses.
    /// - [`Error::NotContainerized`] if no cgroup path names a container.
    ///
    /// Unparsable lines are skipped, so one bad line does not hide a container named further
    /// down.
    pub fn container_id(&self, pid: i32) -> Result<ContainerID> {
        if pid <= 0 {
            return Err(Error::InvalidPid(pid));
        }

        let path = self.procfs_root.join(pid.to_string()).join("cgroup");
        let mut reader = fsutil::open_file_reader(&path)?;
        let mut line = String::with_capacity(256);
        let mut parsed_any = false;
        let mut first_error = None;

        while reader
            .read_line(&mut line)
            .map_err(|source| Error::ReadLine {
                path: path.clone(),
                source,
            })?
            != 0
        {
            if line.trim().is_empty() {
                line.clear();
                continue;
            }
            match parse_cgroup_line(&line) {
                Ok(cgroup_line) => {
                    parsed_any = true;
                    log::trace!(
                        "Cgroup line of pid {pid}: hierarchy={} controllers={:?} path={}",
                        cgroup_line.hierarchy_id,
                        cgroup_line.controllers,
                        cgroup_line.cgroup_path
                    );
                    if let Some(id) = container_id_from_cgroup_path(cgroup_line.cgroup_path) {
                        return Ok(id);
                    }
                }
                Err(err) => {
                    log::debug!("Skipping cgroup line of pid {pid} in `{}`: {err}", path.display());
                    first_error.get_or_insert(err);
                }
            }
            line.clear();
        }

        match first_error {
            Some(source) if !parsed_any => Err(Error::CgroupLine { path, source }),
            _ => Err(Error::NotContainerized { path }),
        }
    }
}

impl OriginResolver for CgroupResolver {
    fn resolve(&self, credential: &Credential) -> Origin {
        match self.container_id(credential.pid) {
            Ok(id) => Origin::from(&id),
            Err(err) => {
                log::debug!("No origin for pid {}: {}", credential.pid, err);
                Origin::none()
            }
        }
    }
}

/// One line of `/proc/<pid>/cgroup`: `<hierarchy-id>:<controller-list>:<cgroup-path>`.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct CgroupLine<'a> {
    pub(super) hierarchy_id: u32,
    pub(super) controllers: Vec<&'a str>,
    pub(super) cgroup_path: &'a str,
}

/// Parses one cgroup line. The path may itself contain `:`.
pub(super) fn parse_cgroup_line(line: &str) -> std::result::Result<CgroupLine<'_>, CgroupLineError> {
    let mut it = line.splitn(3, ':');
    let hierarchy_id = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?
        .parse::<u32>()
        .map_err(|_| CgroupLineError::InvalidHierarchyID(line.to_owned()))?;
    let controllers = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;
    let controllers = if controllers.is_empty() {
        Vec::default()
    } else {
        controllers.split(',').collect()
    };
    let cgroup_path = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;

    Ok(CgroupLine {
        hierarchy_id,
        controllers,
        cgroup_path: cgroup_path.trim(),
    })
}

/// Finds the innermost path segment that names a container.
pub(crate) fn container_id_from_cgroup_path(path: &str) -> Option<ContainerID> {
    path.rsplit('/').find_map(container_id_from_segment)
}

fn container_id_from_segment(segment: &str) -> Option<ContainerID> {
    let bytes = segment.as_bytes();
    if is_container_id(bytes) {
        return ContainerID::new(segment).ok();
    }

    SCOPE_PREFIXES.iter().find_map(|prefix| {
        let id = extract_id_from_path_bytes(bytes, prefix, SCOPE_SUFFIX, CONTAINER_ID_LEN)?;
        ContainerID::new(std::str::from_utf8(id).ok()?).ok()
    })
}

/// Extracts an ID from the given path, if it has the given prefix and suffix, and has the given
/// expected length if the prefix and suffix are stripped.
#[inline]
fn extract_id_from_path_bytes<'a>(
    path_bytes: &'a [u8],
    prefix: &[u8],
    suffix: &[u8],
    expected_length: usize,
) -> Option<&'a [u8]> {
    if path_bytes.starts_with(prefix)
        && path_bytes.ends_with(suffix)
        && path_bytes.len() == prefix.len() + expected_length + suffix.len()
    {
        return Some(&path_bytes[prefix.len()..(path_bytes.len() - suffix.len())]);
    }
    None
}
