//! Match predicates shared by the engines
//!
//! CIDR networks, port ranges and the "absent means any" helpers used by
//! firewall, NAT, QoS and IDS rules.

use crate::protocol::IpProtocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IPv4 CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a new IPv4 CIDR; host bits are masked off
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & Self::prefix_to_mask(prefix_len)),
            prefix_len,
        }
    }

    /// Check if an address is within this CIDR range
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::prefix_to_mask(self.prefix_len);
        (u32::from(self.addr) & mask) == (u32::from(addr) & mask)
    }

    fn prefix_to_mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        }
    }
}

/// IPv6 CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Cidr {
    addr: Ipv6Addr,
    prefix_len: u8,
}

impl Ipv6Cidr {
    /// Create a new IPv6 CIDR; host bits are masked off
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(128);
        Self {
            addr: Ipv6Addr::from(u128::from(addr) & Self::prefix_to_mask(prefix_len)),
            prefix_len,
        }
    }

    /// Check if an address is within this CIDR range
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let mask = Self::prefix_to_mask(self.prefix_len);
        (u128::from(self.addr) & mask) == (u128::from(addr) & mask)
    }

    fn prefix_to_mask(prefix_len: u8) -> u128 {
        if prefix_len == 0 {
            0
        } else {
            !0u128 << (128 - prefix_len)
        }
    }
}

/// IP CIDR (IPv4 or IPv6), always stored as its masked network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpCidr {
    V4(Ipv4Cidr),
    V6(Ipv6Cidr),
}

impl IpCidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        match addr {
            IpAddr::V4(a) => IpCidr::V4(Ipv4Cidr::new(a, prefix_len)),
            IpAddr::V6(a) => IpCidr::V6(Ipv6Cidr::new(a, prefix_len)),
        }
    }

    /// Single-host network (/32 or /128)
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::new(addr, 32),
            IpAddr::V6(_) => Self::new(addr, 128),
        }
    }

    /// Parse "192.168.1.0/24", "2001:db8::/32", or a bare address as a host
    pub fn parse(s: &str) -> Option<Self> {
        let Some((addr, prefix)) = s.split_once('/') else {
            return s.parse().ok().map(Self::host);
        };
        let addr: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return None;
        }
        Some(Self::new(addr, prefix_len))
    }

    /// Check if an address is within this CIDR range
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (IpCidr::V4(cidr), IpAddr::V4(a)) => cidr.contains(*a),
            (IpCidr::V6(cidr), IpAddr::V6(a)) => cidr.contains(*a),
            // v4 cidr doesn't match v6 addr and vice versa
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            IpCidr::V4(c) => c.prefix_len,
            IpCidr::V6(c) => c.prefix_len,
        }
    }

    pub fn network(&self) -> IpAddr {
        match self {
            IpCidr::V4(c) => IpAddr::V4(c.addr),
            IpCidr::V6(c) => IpAddr::V6(c.addr),
        }
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid CIDR '{}'", s))
    }
}

impl TryFrom<String> for IpCidr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpCidr> for String {
    fn from(cidr: IpCidr) -> Self {
        cidr.to_string()
    }
}

/// Inclusive port range for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Parse from string like "80" or "1024-65535"
    pub fn parse(s: &str) -> Option<Self> {
        if let Some((start, end)) = s.split_once('-') {
            let start: u16 = start.trim().parse().ok()?;
            let end: u16 = end.trim().parse().ok()?;
            if start > end {
                return None;
            }
            Some(Self::new(start, end))
        } else {
            let port: u16 = s.trim().parse().ok()?;
            Some(Self::single(port))
        }
    }

    /// Check if a port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid port range '{}'", s))
    }
}

impl TryFrom<String> for PortRange {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

pub(crate) fn protocol_matches(want: Option<IpProtocol>, have: IpProtocol) -> bool {
    want.map_or(true, |p| p == have)
}

/// An address predicate never matches a packet without that address
pub(crate) fn addr_matches(want: &Option<IpCidr>, have: Option<IpAddr>) -> bool {
    match (want, have) {
        (None, _) => true,
        (Some(cidr), Some(addr)) => cidr.contains(&addr),
        (Some(_), None) => false,
    }
}

pub(crate) fn port_matches(want: &Option<PortRange>, have: u16) -> bool {
    want.as_ref().map_or(true, |range| range.contains(have))
}

pub(crate) fn iface_matches(want: &Option<String>, have: &str) -> bool {
    match want {
        None => true,
        Some(name) => name == have,
    }
}
