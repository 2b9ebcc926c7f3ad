//! TCP/UDP header fields shared by both protocols
//!
//! Only the port pair and the checksum are touched; everything else in the
//! segment is opaque to the data plane.

use super::ipv4::{fold, sum_words};
use super::{number, IpProtocol};
use crate::{Error, Result};
use std::net::IpAddr;

/// Bytes needed to read the port pair
pub const PORTS_SIZE: usize = 4;

pub const TCP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// Read source and destination port from the start of a TCP/UDP header
pub fn ports(segment: &[u8]) -> Result<(u16, u16)> {
    if segment.len() < PORTS_SIZE {
        return Err(Error::PacketTooShort {
            needed: PORTS_SIZE,
            actual: segment.len(),
        });
    }
    let src = u16::from_be_bytes([segment[0], segment[1]]);
    let dst = u16::from_be_bytes([segment[2], segment[3]]);
    Ok((src, dst))
}

/// Rewrite the port pair and, when the header is complete, the checksum
pub fn rewrite(
    segment: &mut [u8],
    protocol: IpProtocol,
    ports: (u16, u16),
    src_ip: IpAddr,
    dst_ip: IpAddr,
) {
    if segment.len() < PORTS_SIZE {
        return;
    }
    segment[0..2].copy_from_slice(&ports.0.to_be_bytes());
    segment[2..4].copy_from_slice(&ports.1.to_be_bytes());

    match protocol {
        IpProtocol::Tcp if segment.len() >= TCP_HEADER_SIZE => {
            segment[16] = 0;
            segment[17] = 0;
            let sum = checksum(src_ip, dst_ip, number::TCP, segment);
            segment[16..18].copy_from_slice(&sum.to_be_bytes());
        }
        IpProtocol::Udp if segment.len() >= UDP_HEADER_SIZE => {
            // Zero means "no checksum" for UDP over IPv4; leave it that way
            if segment[6] == 0 && segment[7] == 0 && src_ip.is_ipv4() {
                return;
            }
            segment[6] = 0;
            segment[7] = 0;
            let sum = checksum(src_ip, dst_ip, number::UDP, segment);
            let sum = if sum == 0 { 0xFFFF } else { sum };
            segment[6..8].copy_from_slice(&sum.to_be_bytes());
        }
        _ => {}
    }
}

/// Transport checksum over the IPv4 or IPv6 pseudo-header plus segment
pub fn checksum(src_ip: IpAddr, dst_ip: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = sum_words(&src.octets(), sum);
            sum = sum_words(&dst.octets(), sum);
            sum = sum.wrapping_add(protocol as u32);
            sum = sum.wrapping_add(segment.len() as u32);
        }
        (src, dst) => {
            sum = sum_words(&to_v6_octets(src), sum);
            sum = sum_words(&to_v6_octets(dst), sum);
            let len = segment.len() as u32;
            sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xFFFF);
            sum = sum.wrapping_add(protocol as u32);
        }
    }
    !fold(sum_words(segment, sum))
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Build a minimal TCP segment (no options, zero checksum)
pub fn tcp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut tcp = vec![0u8; TCP_HEADER_SIZE];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    // data offset 5, SYN
    tcp[12] = 0x50;
    tcp[13] = 0x02;
    tcp[14..16].copy_from_slice(&0x7210u16.to_be_bytes());
    tcp.extend_from_slice(payload);
    tcp
}

/// Build a UDP datagram (zero checksum)
pub fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let length = (UDP_HEADER_SIZE + payload.len()) as u16;
    let mut udp = vec![0u8; UDP_HEADER_SIZE];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&length.to_be_bytes());
    udp.extend_from_slice(payload);
    udp
}
