//! IPv6 protocol - RFC 8200
//!
//! Extension headers are not walked: the Next Header of the fixed header is
//! taken as the transport protocol.

use crate::{Error, Result};
use std::net::Ipv6Addr;

/// IPv6 header size (fixed, unlike IPv4)
pub const HEADER_SIZE: usize = 40;

/// Parsed IPv6 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv6Header<'a> {
    buffer: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::PacketTooShort {
                needed: HEADER_SIZE,
                actual: buffer.len(),
            });
        }

        let version = buffer[0] >> 4;
        if version != 6 {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Self { buffer })
    }

    /// Payload Length (does not include header)
    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// Next Header (protocol)
    pub fn next_header(&self) -> u8 {
        self.buffer[6]
    }

    /// Hop Limit (equivalent to IPv4 TTL)
    pub fn hop_limit(&self) -> u8 {
        self.buffer[7]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        read_addr(&self.buffer[8..24])
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        read_addr(&self.buffer[24..40])
    }

    /// Payload (after header)
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

fn read_addr(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}

/// Overwrite source and destination addresses (IPv6 has no header checksum).
///
/// The caller must have validated the buffer with [`Ipv6Header::parse`].
pub fn rewrite_addresses(buffer: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());
}

/// Build an IPv6 packet with the given addresses, next header and payload
pub fn build(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; HEADER_SIZE + payload.len()];
    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buffer[6] = next_header;
    buffer[7] = 64;
    rewrite_addresses(&mut buffer, src, dst);
    buffer[HEADER_SIZE..].copy_from_slice(payload);
    buffer
}
