//! Raw datagram builders

use netgate::protocol::ipv4::Ipv4Builder;
use netgate::protocol::{number, transport};
use std::net::Ipv4Addr;

fn ipv4(protocol: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    Ipv4Builder::new()
        .src_addr(Ipv4Addr::from(src))
        .dst_addr(Ipv4Addr::from(dst))
        .protocol(protocol)
        .payload(payload)
        .build()
}

pub fn tcp(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let segment = transport::tcp_segment(src_port, dst_port, payload);
    ipv4(number::TCP, src, dst, &segment)
}

pub fn udp(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Vec<u8> {
    let datagram = transport::udp_datagram(src_port, dst_port, b"payload");
    ipv4(number::UDP, src, dst, &datagram)
}
