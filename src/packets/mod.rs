//! Pooled packet buffers shared between the socket reader and packet consumers.
//!
//! The listener checks a [`Buffer`] out of a [`Pool`] through the [`PoolManager`], reads one
//! datagram into it and wraps it in a [`Packet`]. Consumers receive [`Packets`] batches and
//! release each packet once done, which recycles the buffer. A packet's contents are a view
//! into its buffer, so the buffer cannot be recycled while the packet is alive.
mod manager;
mod pool;

pub use manager::PoolManager;
pub use pool::{Buffer, DEFAULT_POOL_CAPACITY, ExhaustionPolicy, Pool, PoolStats};

use crate::container::Origin;

/// One received datagram together with the identity of its sender.
#[derive(Debug)]
pub struct Packet {
    buffer: Buffer,
    origin: Origin,
}

/// A batch of packets, in socket receive order.
pub type Packets = Vec<Packet>;

impl Packet {
    pub fn new(buffer: Buffer, origin: Origin) -> Self {
        Self { buffer, origin }
    }

    /// The raw datagram payload.
    pub fn contents(&self) -> &[u8] {
        self.buffer.filled()
    }

    /// `container_id://<id>`, or empty if the sender is unknown.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
