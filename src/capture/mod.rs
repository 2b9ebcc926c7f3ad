//! Packet I/O capability
//!
//! The data plane never touches sockets itself. Whatever feeds it packets
//! and carries them away implements [`PacketIo`].

mod memory;

pub use memory::{MemoryIo, Written};

use crate::packet::Packet;
use crate::Result;
use std::future::Future;

/// Packet source and sink
///
/// `read` yields parsed packets. A malformed buffer is reported as
/// `Error::Parse`/`Error::PacketTooShort` and the next call moves on;
/// `Error::Closed` means no more packets will arrive.
pub trait PacketIo: Send + Sync {
    fn read(&self) -> impl Future<Output = Result<Packet>> + Send;

    /// Transmit on `packet.egress`
    fn write(&self, packet: Packet) -> impl Future<Output = Result<()>> + Send;
}
