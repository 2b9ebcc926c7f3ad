//! Netgate - software router data plane
//!
//! Routing, NAT, firewall, QoS and intrusion detection engines plus the
//! orchestration that moves packets through them.

pub mod capture;
pub mod clock;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod protocol;
pub mod state;
pub mod telemetry;

pub use error::{Error, Result};
pub use packet::{Packet, PacketMetadata};
