use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::OriginResolver;
use crate::container::Origin;
use crate::listener::Credential;

/// Number of cached pids above which expired entries are swept.
const DEFAULT_MAX_ENTRIES: usize = 4096;

/// Memoizes another resolver's answers per pid for a short time.
///
/// A busy sender emits many datagrams per second; this keeps the procfs lookups to one per
/// pid and TTL. The TTL must stay short since pids are recycled by the kernel.
#[derive(Debug)]
pub struct CachedResolver<R> {
    inner: R,
    ttl: Duration,
    max_entries: usize,
    entries: DashMap<i32, (Origin, Instant)>,
}

impl<R: OriginResolver> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: DashMap::new(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry older than the TTL.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, (_, resolved_at)| now.duration_since(*resolved_at) < self.ttl);
    }
}

impl<R: OriginResolver> OriginResolver for CachedResolver<R> {
    fn resolve(&self, credential: &Credential) -> Origin {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&credential.pid) {
            let (origin, resolved_at) = entry.value();
            if now.duration_since(*resolved_at) < self.ttl {
                return origin.clone();
            }
        }

        let origin = self.inner.resolve(credential);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&credential.pid) {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                log::debug!(
                    "Origin cache full with {} live entries, not caching pid {}",
                    self.entries.len(),
                    credential.pid
                );
                return origin;
            }
        }
        self.entries.insert(credential.pid, (origin.clone(), now));
        origin
    }
}
