use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the read loop.
#[derive(Debug, Default)]
pub struct ListenerTelemetry {
    packets: AtomicU64,
    bytes: AtomicU64,
    read_errors: AtomicU64,
    truncated: AtomicU64,
    dropped_oversized: AtomicU64,
    origin_resolved: AtomicU64,
    origin_unresolved: AtomicU64,
    missing_credentials: AtomicU64,
}

/// Point-in-time copy of [`ListenerTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ListenerTelemetrySnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub read_errors: u64,
    pub truncated: u64,
    pub dropped_oversized: u64,
    pub origin_resolved: u64,
    pub origin_unresolved: u64,
    pub missing_credentials: u64,
}

impl ListenerTelemetry {
    pub(crate) fn record_packet(&self, len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_oversized(&self) {
        self.dropped_oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_origin(&self, resolved: bool) {
        let counter = if resolved {
            &self.origin_resolved
        } else {
            &self.origin_unresolved
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_missing_credential(&self) {
        self.missing_credentials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListenerTelemetrySnapshot {
        ListenerTelemetrySnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            dropped_oversized: self.dropped_oversized.load(Ordering::Relaxed),
            origin_resolved: self.origin_resolved.load(Ordering::Relaxed),
            origin_unresolved: self.origin_unresolved.load(Ordering::Relaxed),
            missing_credentials: self.missing_credentials.load(Ordering::Relaxed),
        }
    }
}
