//! Raw header access
//!
//! Only the parts of IPv4, IPv6 and the TCP/UDP headers the data plane
//! needs: addresses, protocol numbers, ports and checksums.

pub mod ipv4;
pub mod ipv6;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IP protocol numbers
pub mod number {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// Transport protocol as seen by the engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
    #[serde(rename = "ICMPv6")]
    Icmpv6,
    #[serde(rename = "OTHER")]
    Other,
}

impl IpProtocol {
    pub fn from_number(value: u8) -> Self {
        match value {
            number::ICMP => IpProtocol::Icmp,
            number::TCP => IpProtocol::Tcp,
            number::UDP => IpProtocol::Udp,
            number::ICMPV6 => IpProtocol::Icmpv6,
            _ => IpProtocol::Other,
        }
    }

    /// Whether the first 4 bytes of the transport header are ports
    pub fn has_ports(&self) -> bool {
        matches!(self, IpProtocol::Tcp | IpProtocol::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpProtocol::Tcp => "TCP",
            IpProtocol::Udp => "UDP",
            IpProtocol::Icmp => "ICMP",
            IpProtocol::Icmpv6 => "ICMPv6",
            IpProtocol::Other => "OTHER",
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(IpProtocol::Tcp),
            "udp" => Ok(IpProtocol::Udp),
            "icmp" => Ok(IpProtocol::Icmp),
            "icmpv6" => Ok(IpProtocol::Icmpv6),
            "other" => Ok(IpProtocol::Other),
            _ => Err(format!("unknown protocol '{}'", s)),
        }
    }
}
