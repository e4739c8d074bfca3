//! Unix datagram socket listener.
//!
//! Clients write one or more metric lines per datagram to the socket. The listener reads each
//! datagram into a pooled buffer, attaches the sender's [`crate::container::Origin`] when
//! origin detection is enabled, and forwards it on a bounded channel.
mod credentials;
mod error;
mod telemetry;
mod uds;

pub use credentials::{Credential, Datagram, ReadWithCredential};
pub use error::{Error, Result};
pub use telemetry::ListenerTelemetrySnapshot;
pub use uds::{State, UdsListener};
