use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod error;

pub use error::{Error, Result};

/// The exact length of a container runtime identifier.
pub const CONTAINER_ID_LEN: usize = 64;

/// Prefix of a resolved [`Origin`], consumed verbatim by downstream tagging.
pub const ORIGIN_PREFIX: &str = "container_id://";

/// A validated container identifier.
///
/// Docker, containerd, CRI-O and podman all use 64 lowercase hex characters.
///
/// # Examples
///
/// ```
/// # use uds_ingest::container::ContainerID;
/// let raw_id = "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd";
/// let container_id = ContainerID::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), raw_id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is not exactly
    /// [`CONTAINER_ID_LEN`] lowercase hex characters.
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if !is_container_id(src.as_bytes()) {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns true if `src` has the shape of a container id.
pub(crate) fn is_container_id(src: &[u8]) -> bool {
    src.len() == CONTAINER_ID_LEN
        && src
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

impl FromStr for ContainerID {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The sender identity attached to a packet.
///
/// Either `container_id://<id>` or the empty string when the sender could not be
/// attributed to a container. Clones are cheap, so resolvers can hand out cached values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Origin(Option<Arc<str>>);

impl Origin {
    /// An origin that could not be determined.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }
}

impl From<&ContainerID> for Origin {
    fn from(id: &ContainerID) -> Self {
        Self(Some(format!("{ORIGIN_PREFIX}{id}").into()))
    }
}

impl From<ContainerID> for Origin {
    fn from(id: ContainerID) -> Self {
        Self::from(&id)
    }
}

impl PartialEq<str> for Origin {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Origin {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Origin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
