//! Ingest/egress loop behaviour

use super::packets::{tcp, udp};
use netgate::capture::{MemoryIo, PacketIo};
use netgate::clock::ManualClock;
use netgate::dataplane::{Action, Chain, IdsConfig, IpCidr, NatRule, QosClass, Route};
use netgate::pipeline::Dataplane;
use netgate::protocol::IpProtocol;
use netgate::Packet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const IDLE: Duration = Duration::from_millis(1);

fn forwarding_dataplane() -> Arc<Dataplane> {
    let dataplane = Dataplane::new(IdsConfig::default());
    dataplane
        .firewall
        .set_default_policy(Chain::Forward, Action::Accept);
    dataplane
        .routing
        .add(Route::connected(IpCidr::parse("0.0.0.0/0").unwrap(), "wan0"));
    Arc::new(dataplane)
}

async fn run_to_completion(dataplane: &Arc<Dataplane>, io: &Arc<MemoryIo>) {
    let (done_tx, done_rx) = watch::channel(false);

    let egress = {
        let dataplane = dataplane.clone();
        let io = io.clone();
        let done = done_rx.clone();
        tokio::spawn(async move { dataplane.run_egress(&*io, done, 16, IDLE).await })
    };

    dataplane.run_ingest(&**io, done_rx).await.unwrap();
    while dataplane.qos.total_queued() > 0 {
        tokio::time::sleep(IDLE).await;
    }
    done_tx.send(true).unwrap();
    egress.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_packets_flow_from_ingest_to_egress() {
    let dataplane = forwarding_dataplane();
    let io = Arc::new(MemoryIo::with_packets(
        "lan0",
        vec![
            tcp([10, 0, 0, 1], 1000, [8, 8, 8, 8], 80, b""),
            vec![0x45, 0x00, 0x00],
            udp([10, 0, 0, 1], 1001, [1, 1, 1, 1], 53),
            tcp([10, 0, 0, 2], 1002, [9, 9, 9, 9], 443, b"hello"),
        ],
    ));

    run_to_completion(&dataplane, &io).await;

    let written = io.written();
    assert_eq!(written.len(), 3);
    assert!(written.iter().all(|w| w.egress == "wan0"));

    // Every packet handed out was released exactly once
    assert_eq!(io.handed_out(), 3);
    assert_eq!(io.released(), 3);

    let metrics = &dataplane.metrics;
    assert_eq!(metrics.rx_errors.get(), 1);
    assert_eq!(metrics.packets_transmitted.get(), 3);
    assert_eq!(metrics.get("lan0_rx_packets"), Some(3));
    assert_eq!(metrics.get("wan0_tx_packets"), Some(3));
}

#[tokio::test]
async fn test_filtered_packets_are_released() {
    let dataplane = Arc::new(Dataplane::default());
    let io = Arc::new(MemoryIo::with_packets(
        "lan0",
        vec![
            tcp([10, 0, 0, 1], 1000, [8, 8, 8, 8], 80, b""),
            udp([10, 0, 0, 1], 1001, [8, 8, 8, 8], 53),
        ],
    ));

    run_to_completion(&dataplane, &io).await;

    assert!(io.written().is_empty());
    assert_eq!(io.released(), 2);
    assert_eq!(dataplane.metrics.filter_dropped.get(), 2);
}

#[tokio::test]
async fn test_egress_order_follows_priority() {
    let dataplane = forwarding_dataplane();
    dataplane.qos.replace_classes(vec![
        QosClass {
            protocol: Some(IpProtocol::Udp),
            ..QosClass::new("voice", 10)
        },
        QosClass {
            protocol: Some(IpProtocol::Tcp),
            ..QosClass::new("bulk", 1)
        },
    ]);

    let io = MemoryIo::with_packets(
        "lan0",
        vec![
            tcp([10, 0, 0, 1], 1000, [8, 8, 8, 8], 80, b""),
            tcp([10, 0, 0, 1], 1001, [8, 8, 8, 8], 80, b""),
            udp([10, 0, 0, 1], 5060, [8, 8, 8, 8], 5060),
        ],
    );
    let (_done_tx, done_rx) = watch::channel(false);
    dataplane.run_ingest(&io, done_rx).await.unwrap();
    assert_eq!(dataplane.qos.total_queued(), 3);

    assert_eq!(dataplane.egress_once(&io, 16).await, 3);
    let protocols: Vec<IpProtocol> = io
        .written()
        .into_iter()
        .map(|w| Packet::parse(w.data, w.egress).unwrap().meta.protocol)
        .collect();
    assert_eq!(
        protocols,
        vec![IpProtocol::Udp, IpProtocol::Tcp, IpProtocol::Tcp]
    );
}

#[tokio::test]
async fn test_done_signal_stops_both_loops() {
    let dataplane = forwarding_dataplane();
    let io = MemoryIo::with_packets("lan0", vec![udp([10, 0, 0, 1], 1, [8, 8, 8, 8], 53)]);

    let (done_tx, done_rx) = watch::channel(false);
    done_tx.send(true).unwrap();

    dataplane.run_ingest(&io, done_rx.clone()).await.unwrap();
    assert_eq!(io.pending(), 1);

    let stopped = tokio::time::timeout(
        Duration::from_secs(1),
        dataplane.run_egress(&io, done_rx, 16, Duration::from_secs(60)),
    )
    .await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_idle_egress_wakes_on_done() {
    let dataplane = forwarding_dataplane();
    let io = Arc::new(MemoryIo::new("lan0"));
    let (done_tx, done_rx) = watch::channel(false);

    let egress = {
        let dataplane = dataplane.clone();
        let io = io.clone();
        tokio::spawn(async move {
            dataplane
                .run_egress(&*io, done_rx, 16, Duration::from_secs(60))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    done_tx.send(true).unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(1), egress).await;
    assert!(joined.is_ok());
}

#[tokio::test]
async fn test_read_after_close() {
    let io = MemoryIo::new("lan0");
    assert!(matches!(io.read().await, Err(netgate::Error::Closed)));
}

#[tokio::test]
async fn test_replay_from_hex_capture() {
    let dataplane = forwarding_dataplane();
    let capture = format!(
        "# lan0 capture\n{}\n\n{}  # dns\n",
        hex::encode(tcp([10, 0, 0, 1], 1000, [8, 8, 8, 8], 80, b"GET /")),
        hex::encode(udp([10, 0, 0, 1], 1001, [8, 8, 8, 8], 53)),
    );
    let io = Arc::new(MemoryIo::from_hex_lines("lan0", &capture).unwrap());
    assert_eq!(io.pending(), 2);

    run_to_completion(&dataplane, &io).await;

    assert_eq!(io.written().len(), 2);
    assert_eq!(io.released(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_expires_idle_flows() {
    let clock = ManualClock::new();
    let dataplane = Arc::new(Dataplane::with_clock(
        IdsConfig::default(),
        Arc::new(clock.clone()),
    ));
    dataplane
        .firewall
        .set_default_policy(Chain::Forward, Action::Accept);
    dataplane.nat.add_rule(NatRule::snat(
        IpCidr::parse("10.0.0.0/8"),
        "203.0.113.10".parse().unwrap(),
        None,
    ));
    dataplane.process(Packet::parse(udp([10, 0, 0, 1], 1000, [8, 8, 8, 8], 53), "lan0").unwrap());
    assert_eq!(dataplane.nat.flow_count(), 2);

    let (done_tx, done_rx) = watch::channel(false);
    let maintenance = {
        let dataplane = dataplane.clone();
        tokio::spawn(async move {
            dataplane
                .run_maintenance(done_rx, Duration::from_secs(30), Duration::from_secs(60))
                .await
        })
    };

    // Ticks at 0s and 30s find the flow still fresh
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(dataplane.nat.flow_count(), 2);

    clock.advance(Duration::from_secs(61));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dataplane.nat.flow_count(), 0);

    done_tx.send(true).unwrap();
    maintenance.await.unwrap();
}
