//! Origin detection: mapping a datagram sender's credentials to a container.
//!
//! Resolution is best effort. A sender that exited, that runs on the host, or whose procfs
//! entry cannot be read yields an empty [`Origin`]; the packet is delivered regardless.
mod cache;
mod cgroup;
mod error;

pub use cache::CachedResolver;
pub use cgroup::CgroupResolver;
pub(crate) use cgroup::container_id_from_cgroup_path;
pub use error::{CgroupLineError, Error, Result};

use crate::container::Origin;
use crate::listener::Credential;

/// Resolves the origin of a datagram from its sender's peer credential.
pub trait OriginResolver: Send + Sync {
    /// Returns the sender's origin, or an empty origin if it cannot be determined.
    ///
    /// Must not block for longer than a procfs lookup.
    fn resolve(&self, credential: &Credential) -> Origin;
}

impl<R: OriginResolver + ?Sized> OriginResolver for std::sync::Arc<R> {
    fn resolve(&self, credential: &Credential) -> Origin {
        (**self).resolve(credential)
    }
}

impl<R: OriginResolver + ?Sized> OriginResolver for Box<R> {
    fn resolve(&self, credential: &Credential) -> Origin {
        (**self).resolve(credential)
    }
}
