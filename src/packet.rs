//! Packet model
//!
//! A [`Packet`] carries the raw IP datagram, the interfaces it entered and
//! leaves through, the metadata every engine matches on, and a release
//! callback that hands the buffer back to whoever allocated it.

use crate::protocol::{ipv4, ipv6, transport, IpProtocol};
use crate::{Error, Result};
use std::fmt;
use std::net::IpAddr;

/// Header fields derived once per packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMetadata {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub protocol: IpProtocol,
    /// Zero when the protocol has no ports
    pub src_port: u16,
    pub dst_port: u16,
    /// Total length in bytes
    pub length: usize,
}

impl PacketMetadata {
    /// Parse the IP header and, for TCP/UDP, the port pair
    pub fn parse(data: &[u8]) -> Result<Self> {
        let first = *data.first().ok_or(Error::PacketTooShort {
            needed: 1,
            actual: 0,
        })?;

        let (src_ip, dst_ip, protocol, segment) = match first >> 4 {
            4 => {
                let hdr = ipv4::Ipv4Header::parse(data)?;
                (
                    IpAddr::V4(hdr.src_addr()),
                    IpAddr::V4(hdr.dst_addr()),
                    IpProtocol::from_number(hdr.protocol()),
                    hdr.payload(),
                )
            }
            6 => {
                let hdr = ipv6::Ipv6Header::parse(data)?;
                (
                    IpAddr::V6(hdr.src_addr()),
                    IpAddr::V6(hdr.dst_addr()),
                    IpProtocol::from_number(hdr.next_header()),
                    hdr.payload(),
                )
            }
            version => return Err(Error::UnsupportedVersion(version)),
        };

        let (src_port, dst_port) = if protocol.has_ports() {
            transport::ports(segment)?
        } else {
            (0, 0)
        };

        Ok(Self {
            src_ip: Some(src_ip),
            dst_ip: Some(dst_ip),
            protocol,
            src_port,
            dst_port,
            length: data.len(),
        })
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A packet moving through the data plane.
///
/// The release callback runs exactly once: explicitly through
/// [`Packet::release`], or when the packet is dropped.
pub struct Packet {
    pub data: Vec<u8>,
    pub ingress: String,
    pub egress: String,
    pub meta: PacketMetadata,
    release: Option<ReleaseFn>,
}

impl Packet {
    pub fn new(data: Vec<u8>, ingress: impl Into<String>, meta: PacketMetadata) -> Self {
        Self {
            data,
            ingress: ingress.into(),
            egress: String::new(),
            meta,
            release: None,
        }
    }

    /// Parse metadata from the raw datagram
    pub fn parse(data: Vec<u8>, ingress: impl Into<String>) -> Result<Self> {
        let meta = PacketMetadata::parse(&data)?;
        Ok(Self::new(data, ingress, meta))
    }

    /// Install the callback that returns the buffer to its owner
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Run the release callback now; later calls are no-ops
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the address/port tuple.
    ///
    /// Metadata is always updated. The raw buffer is rewritten (addresses,
    /// ports and checksums) only when it holds an IP header of the same
    /// family as the new addresses.
    pub fn set_endpoints(&mut self, src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) {
        self.meta.src_ip = Some(src_ip);
        self.meta.dst_ip = Some(dst_ip);
        self.meta.src_port = src_port;
        self.meta.dst_port = dst_port;
        self.rewrite_headers();
    }

    fn rewrite_headers(&mut self) {
        let (Some(src), Some(dst)) = (self.meta.src_ip, self.meta.dst_ip) else {
            return;
        };
        let protocol = self.meta.protocol;
        let ports = (self.meta.src_port, self.meta.dst_port);

        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let (header_len, total_len) = match ipv4::Ipv4Header::parse(&self.data) {
                    Ok(hdr) if IpProtocol::from_number(hdr.protocol()) == protocol => {
                        (hdr.header_len(), hdr.total_length() as usize)
                    }
                    _ => return,
                };
                // Trailing link-layer padding is not part of the segment
                let end = total_len.clamp(header_len, self.data.len());
                if protocol.has_ports() {
                    transport::rewrite(
                        &mut self.data[header_len..end],
                        protocol,
                        ports,
                        src,
                        dst,
                    );
                }
                ipv4::rewrite_addresses(&mut self.data, header_len, s, d);
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let payload_len = match ipv6::Ipv6Header::parse(&self.data) {
                    Ok(hdr) if IpProtocol::from_number(hdr.next_header()) == protocol => {
                        hdr.payload_length() as usize
                    }
                    _ => return,
                };
                // A zero payload length (jumbogram) runs to the end of the buffer
                let end = match payload_len {
                    0 => self.data.len(),
                    n => (ipv6::HEADER_SIZE + n).min(self.data.len()),
                };
                if protocol.has_ports() {
                    transport::rewrite(
                        &mut self.data[ipv6::HEADER_SIZE..end],
                        protocol,
                        ports,
                        src,
                        dst,
                    );
                }
                ipv6::rewrite_addresses(&mut self.data, s, d);
            }
            _ => {}
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("ingress", &self.ingress)
            .field("egress", &self.egress)
            .field("meta", &self.meta)
            .field("pending_release", &self.release.is_some())
            .finish()
    }
}
