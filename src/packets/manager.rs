use super::{Buffer, Packet, Packets, Pool, PoolStats};
use crate::container::Origin;

/// Hands out pool-backed buffers to the listener and takes packets back from consumers.
///
/// Cloning a manager shares the underlying [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolManager {
    pool: Pool,
}

impl PoolManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Checks out a buffer, suspending according to the pool's exhaustion policy.
    pub async fn get(&self) -> Buffer {
        self.pool.get().await
    }

    /// Wraps a filled buffer into a [`Packet`].
    pub fn packet(&self, buffer: Buffer, origin: Origin) -> Packet {
        Packet::new(buffer, origin)
    }

    /// Signals that a consumer is done with `packet` and recycles its buffer.
    pub fn put(&self, packet: Packet) {
        self.pool.put(packet.into_buffer());
    }

    /// Recycles every packet of a batch.
    pub fn put_all(&self, packets: Packets) {
        for packet in packets {
            self.put(packet);
        }
    }

    /// Number of buffers currently held outside the pool.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Logs a warning if buffers are still checked out.
    ///
    /// Only meaningful once the listener has stopped: while it runs it holds one buffer for
    /// its next read.
    pub fn report_leaks(&self) -> usize {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            log::warn!("{in_flight} packet buffers were not returned to the pool");
        }
        in_flight
    }
}
