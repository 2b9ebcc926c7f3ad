//! A small home router built from a TOML configuration

use super::packets::{tcp, udp};
use netgate::capture::{MemoryIo, Written};
use netgate::config::{self, Config};
use netgate::dataplane::{AlertKind, Chain};
use netgate::pipeline::Dataplane;
use netgate::protocol::IpProtocol;
use netgate::Packet;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::watch;

const CONFIG: &str = r#"
[logging]
level = "debug"

[dataplane]
local_addresses = ["192.168.1.1", "203.0.113.10"]
egress_batch = 64

[[routes]]
destination = "192.168.1.0/24"
interface = "lan0"

[[routes]]
destination = "0.0.0.0/0"
gateway = "203.0.113.1"
interface = "wan0"

[firewall.defaults]
INPUT = "DROP"
OUTPUT = "ACCEPT"
FORWARD = "ACCEPT"

[[firewall.rules]]
chain = "INPUT"
action = "ACCEPT"
protocol = "icmp"

[[firewall.rules]]
chain = "FORWARD"
action = "REJECT"
protocol = "tcp"
dst_port = "25"

[[nat.rules]]
type = "SNAT"
src = "192.168.1.0/24"
to_ip = "203.0.113.10"

[[nat.rules]]
type = "DNAT"
dst = "203.0.113.10"
dst_port = "8080"
to_ip = "192.168.1.20"
to_port = 80

[[qos.classes]]
name = "dns"
protocol = "udp"
dst_port = "53"
priority = 10

[[qos.classes]]
name = "web"
protocol = "tcp"
priority = 5
max_queue = 16

[ids]
window_secs = 10

[[ids.rules]]
name = "shell-probe"
protocol = "tcp"
payload_contains = "/bin/sh"
action = "drop"
"#;

fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn build() -> Dataplane {
    let cfg: Config = toml::from_str(CONFIG).unwrap();
    assert!(!config::validate(&cfg).has_errors());
    config::compile(&cfg).unwrap().into_dataplane()
}

async fn ingest(dataplane: &Dataplane, ingress: &str, packets: Vec<Vec<u8>>) -> MemoryIo {
    let io = MemoryIo::with_packets(ingress, packets);
    let (_done_tx, done_rx) = watch::channel(false);
    dataplane.run_ingest(&io, done_rx).await.unwrap();
    io
}

fn hits(dataplane: &Dataplane, chain: Chain) -> u64 {
    dataplane
        .firewall
        .chain_hits()
        .get(&chain)
        .copied()
        .unwrap_or(0)
}

/// Re-read a transmitted datagram, keeping the interface it left through
fn parsed(written: &Written) -> Packet {
    let mut packet = Packet::parse(written.data.clone(), "wire").unwrap();
    packet.egress = written.egress.clone();
    packet
}

#[tokio::test]
async fn test_outbound_snat_and_reply() {
    let dataplane = build();
    let sink = MemoryIo::new("sink");

    ingest(
        &dataplane,
        "lan0",
        vec![udp([192, 168, 1, 5], 40000, [8, 8, 8, 8], 53)],
    )
    .await;
    assert_eq!(dataplane.egress_once(&sink, 64).await, 1);

    let out = parsed(&sink.written()[0]);
    assert_eq!(out.egress, "wan0");
    assert_eq!(out.meta.src_ip, Some(ip(203, 0, 113, 10)));
    assert_eq!(out.meta.src_port, 40000);
    assert_eq!(out.meta.dst_ip, Some(ip(8, 8, 8, 8)));

    // The reply is addressed to the router and translated back to the host
    ingest(
        &dataplane,
        "wan0",
        vec![udp([8, 8, 8, 8], 53, [203, 0, 113, 10], 40000)],
    )
    .await;
    assert_eq!(dataplane.egress_once(&sink, 64).await, 1);

    let back = parsed(&sink.written()[1]);
    assert_eq!(back.egress, "lan0");
    assert_eq!(back.meta.src_ip, Some(ip(8, 8, 8, 8)));
    assert_eq!(back.meta.dst_ip, Some(ip(192, 168, 1, 5)));
    assert_eq!(back.meta.dst_port, 40000);

    assert_eq!(dataplane.nat.flow_count(), 2);
    assert_eq!(dataplane.metrics.nat_translated.get(), 2);
}

#[tokio::test]
async fn test_port_forward_reroutes_to_lan() {
    let dataplane = build();
    let sink = MemoryIo::new("sink");

    ingest(
        &dataplane,
        "wan0",
        vec![tcp([198, 51, 100, 7], 4000, [203, 0, 113, 10], 8080, b"GET /")],
    )
    .await;
    assert_eq!(dataplane.egress_once(&sink, 64).await, 1);

    let forwarded = parsed(&sink.written()[0]);
    assert_eq!(forwarded.egress, "lan0");
    assert_eq!(forwarded.meta.dst_ip, Some(ip(192, 168, 1, 20)));
    assert_eq!(forwarded.meta.dst_port, 80);
    // After translation the packet is transit traffic, not for the router
    assert_eq!(hits(&dataplane, Chain::Forward), 0);
    assert_eq!(hits(&dataplane, Chain::Input), 0);
    assert_eq!(dataplane.metrics.filter_accepted.get(), 1);
}

#[tokio::test]
async fn test_router_is_closed_except_icmp() {
    let dataplane = build();
    let sink = MemoryIo::new("sink");

    let mut ping = udp([198, 51, 100, 7], 0, [203, 0, 113, 10], 0);
    // Turn the UDP datagram into an ICMP one; the port bytes are ignored
    ping[9] = 1;

    let io = ingest(
        &dataplane,
        "wan0",
        vec![
            tcp([198, 51, 100, 7], 5000, [203, 0, 113, 10], 22, b""),
            ping,
            tcp([192, 168, 1, 5], 5001, [198, 51, 100, 25], 25, b"HELO"),
        ],
    )
    .await;

    assert_eq!(dataplane.metrics.filter_dropped.get(), 1);
    assert_eq!(dataplane.metrics.filter_rejected.get(), 1);
    assert_eq!(dataplane.metrics.filter_accepted.get(), 1);
    assert_eq!(hits(&dataplane, Chain::Input), 1);
    assert_eq!(io.released(), 2);

    assert_eq!(dataplane.egress_once(&sink, 64).await, 1);
    assert_eq!(parsed(&sink.written()[0]).meta.protocol, IpProtocol::Icmp);
}

#[tokio::test]
async fn test_signature_blocks_forwarded_exploit() {
    let dataplane = build();

    let io = ingest(
        &dataplane,
        "wan0",
        vec![
            tcp([198, 51, 100, 7], 4001, [203, 0, 113, 10], 8080, b"GET /cgi?x=/bin/sh"),
            tcp([198, 51, 100, 7], 4002, [203, 0, 113, 10], 8080, b"GET /index.html"),
        ],
    )
    .await;

    assert_eq!(dataplane.metrics.ids_blocked.get(), 1);
    assert_eq!(dataplane.metrics.ids_alerts.get(), 1);
    assert_eq!(dataplane.qos.total_queued(), 1);
    assert_eq!(io.released(), 1);

    let alerts = dataplane.ids.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Signature);
    assert_eq!(alerts[0].reason, "shell-probe");
    // Detection sees the translated destination
    assert_eq!(alerts[0].dst_ip, Some(ip(192, 168, 1, 20)));
}

#[tokio::test]
async fn test_dns_leaves_before_web() {
    let dataplane = build();
    let sink = MemoryIo::new("sink");

    ingest(
        &dataplane,
        "lan0",
        vec![
            tcp([192, 168, 1, 5], 5000, [93, 184, 216, 34], 443, b""),
            tcp([192, 168, 1, 5], 5001, [93, 184, 216, 34], 443, b""),
            udp([192, 168, 1, 5], 5002, [8, 8, 8, 8], 53),
        ],
    )
    .await;

    let stats = dataplane.qos.class_stats();
    let queued: Vec<(String, usize)> = stats.into_iter().map(|s| (s.name, s.queued)).collect();
    assert_eq!(
        queued,
        vec![
            ("dns".to_string(), 1),
            ("web".to_string(), 2),
            ("default".to_string(), 0)
        ]
    );

    assert_eq!(dataplane.egress_once(&sink, 64).await, 3);
    let first = parsed(&sink.written()[0]);
    assert_eq!(first.meta.dst_port, 53);
    assert_eq!(dataplane.metrics.get("wan0_tx_packets"), Some(3));
}
