//! Listener configuration, read from `UDS_INGEST_*` environment variables.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::packets::{DEFAULT_POOL_CAPACITY, ExhaustionPolicy};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/uds-ingest/dsd.socket";
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
/// Owner can do anything, everyone else may only write (send metrics).
pub const DEFAULT_SOCKET_MODE: u32 = 0o722;
pub const DEFAULT_ORIGIN_CACHE_TTL: Duration = Duration::from_secs(2);

const ENV_PREFIX: &str = "UDS_INGEST_";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("`{key}` must be greater than zero")]
    Zero { key: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the listener does with a datagram larger than a pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Deliver the first `buffer_size` bytes.
    #[default]
    Truncate,
    /// Discard the datagram and count it.
    Drop,
}

impl FromStr for OversizePolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "drop" => Ok(Self::Drop),
            _ => Err(()),
        }
    }
}

fn parse_exhaustion_policy(s: &str) -> Option<ExhaustionPolicy> {
    match s.to_ascii_lowercase().as_str() {
        "block" => Some(ExhaustionPolicy::Block),
        "allocate" => Some(ExhaustionPolicy::Allocate),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Settings for a [`crate::listener::UdsListener`] and the pipeline around it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub socket_path: PathBuf,
    pub origin_detection: bool,
    /// Largest datagram accepted without truncation.
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub exhaustion_policy: ExhaustionPolicy,
    pub oversize_policy: OversizePolicy,
    /// Number of packet batches buffered between the listener and consumers.
    pub channel_capacity: usize,
    pub socket_mode: u32,
    /// `SO_RCVBUF` in bytes; the OS default is kept when unset.
    pub receive_buffer: Option<usize>,
    /// Procfs used for origin lookups; detected from the runtime environment when unset.
    pub procfs_root: Option<PathBuf>,
    pub origin_cache_ttl: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            origin_detection: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            exhaustion_policy: ExhaustionPolicy::Block,
            oversize_policy: OversizePolicy::Truncate,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            socket_mode: DEFAULT_SOCKET_MODE,
            receive_buffer: None,
            procfs_root: None,
            origin_cache_ttl: DEFAULT_ORIGIN_CACHE_TTL,
        }
    }
}

impl ListenerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for a variable that does not parse and [`Error::Zero`]
    /// for a size that must be positive.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let invalid = |(key, value): (String, String)| Error::InvalidValue { key, value };

        let mut config = Self::default();

        if let Some((_, value)) = get("SOCKET") {
            config.socket_path = PathBuf::from(value);
        }
        if let Some(entry) = get("ORIGIN_DETECTION") {
            config.origin_detection = parse_bool(&entry.1).ok_or_else(|| invalid(entry))?;
        }
        if let Some(entry) = get("BUFFER_SIZE") {
            config.buffer_size = entry.1.parse().map_err(|_| invalid(entry))?;
        }
        if let Some(entry) = get("POOL_CAPACITY") {
            config.pool_capacity = entry.1.parse().map_err(|_| invalid(entry))?;
        }
        if let Some(entry) = get("POOL_EXHAUSTION") {
            config.exhaustion_policy =
                parse_exhaustion_policy(&entry.1).ok_or_else(|| invalid(entry))?;
        }
        if let Some(entry) = get("OVERSIZE") {
            config.oversize_policy = entry.1.parse().map_err(|_| invalid(entry))?;
        }
        if let Some(entry) = get("CHANNEL_CAPACITY") {
            config.channel_capacity = entry.1.parse().map_err(|_| invalid(entry))?;
        }
        if let Some(entry) = get("SOCKET_MODE") {
            let digits = entry.1.trim_start_matches("0o");
            config.socket_mode = u32::from_str_radix(digits, 8).map_err(|_| invalid(entry))?;
        }
        if let Some(entry) = get("SO_RCVBUF") {
            config.receive_buffer = Some(entry.1.parse().map_err(|_| invalid(entry))?);
        }
        if let Some((_, value)) = get("PROCFS_ROOT") {
            config.procfs_root = Some(PathBuf::from(value));
        }
        if let Some(entry) = get("ORIGIN_CACHE_TTL_SECS") {
            config.origin_cache_ttl =
                Duration::from_secs(entry.1.parse().map_err(|_| invalid(entry))?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the sizes that must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Zero { key: "buffer_size" });
        }
        if self.pool_capacity == 0 {
            return Err(Error::Zero {
                key: "pool_capacity",
            });
        }
        if self.channel_capacity == 0 {
            return Err(Error::Zero {
                key: "channel_capacity",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(entries: &[(&str, &str)]) -> Result<ListenerConfig> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ListenerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config, ListenerConfig::default());
        assert_eq!(config.socket_mode, 0o722);
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::Block);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("UDS_INGEST_SOCKET", "/tmp/t.sock"),
            ("UDS_INGEST_ORIGIN_DETECTION", "false"),
            ("UDS_INGEST_BUFFER_SIZE", "32"),
            ("UDS_INGEST_POOL_CAPACITY", "4"),
            ("UDS_INGEST_POOL_EXHAUSTION", "allocate"),
            ("UDS_INGEST_OVERSIZE", "drop"),
            ("UDS_INGEST_CHANNEL_CAPACITY", "8"),
            ("UDS_INGEST_SOCKET_MODE", "0o700"),
            ("UDS_INGEST_SO_RCVBUF", "1048576"),
            ("UDS_INGEST_PROCFS_ROOT", "/host/proc"),
            ("UDS_INGEST_ORIGIN_CACHE_TTL_SECS", "0"),
        ])
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/t.sock"));
        assert!(!config.origin_detection);
        assert_eq!(config.buffer_size, 32);
        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::Allocate);
        assert_eq!(config.oversize_policy, OversizePolicy::Drop);
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.socket_mode, 0o700);
        assert_eq!(config.receive_buffer, Some(1048576));
        assert_eq!(config.procfs_root, Some(PathBuf::from("/host/proc")));
        assert_eq!(config.origin_cache_ttl, Duration::ZERO);
    }

    #[test]
    fn test_invalid_value() {
        let err = from_map(&[("UDS_INGEST_BUFFER_SIZE", "big")]).unwrap_err();
        match err {
            Error::InvalidValue { key, value } => {
                assert_eq!(key, "UDS_INGEST_BUFFER_SIZE");
                assert_eq!(value, "big");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(from_map(&[("UDS_INGEST_POOL_EXHAUSTION", "maybe")]).is_err());
        assert!(from_map(&[("UDS_INGEST_SOCKET_MODE", "999")]).is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(matches!(
            from_map(&[("UDS_INGEST_POOL_CAPACITY", "0")]),
            Err(Error::Zero { key: "pool_capacity" })
        ));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ListenerConfig = serde_json::from_str(
            r#"{"socket_path": "/tmp/x.sock", "exhaustion_policy": "allocate", "oversize_policy": "drop"}"#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::Allocate);
        assert_eq!(config.oversize_policy, OversizePolicy::Drop);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }
}
