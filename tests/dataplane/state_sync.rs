//! Handing configuration from one data plane to another

use super::packets::{tcp, udp};
use netgate::dataplane::{
    Action, Chain, FirewallRule, IdsConfig, IpCidr, NatRule, PortRange, QosClass, Route,
};
use netgate::pipeline::{Dataplane, Disposition};
use netgate::protocol::IpProtocol;
use netgate::state::{apply_state, build_state, DataplaneState};
use netgate::Packet;

fn primary() -> Dataplane {
    let dataplane = Dataplane::new(IdsConfig::default());
    dataplane
        .firewall
        .set_default_policy(Chain::Forward, Action::Accept);
    dataplane.firewall.add_rule(FirewallRule {
        protocol: Some(IpProtocol::Tcp),
        dst_port: Some(PortRange::single(23)),
        ..FirewallRule::new(Chain::Forward, Action::Drop)
    });
    dataplane.nat.add_rule(NatRule::snat(
        IpCidr::parse("10.0.0.0/8"),
        "203.0.113.10".parse().unwrap(),
        None,
    ));
    dataplane.qos.add_class(QosClass {
        protocol: Some(IpProtocol::Udp),
        ..QosClass::new("udp", 7)
    })
    .unwrap();
    dataplane
        .routing
        .add(Route::connected(IpCidr::parse("0.0.0.0/0").unwrap(), "wan0"));
    dataplane
}

fn replicate(from: &Dataplane) -> Dataplane {
    let text = build_state(from).to_toml().unwrap();
    let standby = Dataplane::new(IdsConfig::default());
    apply_state(&standby, DataplaneState::from_toml(&text).unwrap());
    standby
}

fn traffic() -> Vec<Vec<u8>> {
    vec![
        tcp([10, 0, 0, 1], 1000, [198, 51, 100, 1], 80, b""),
        tcp([10, 0, 0, 1], 1001, [198, 51, 100, 1], 23, b""),
        udp([10, 0, 0, 2], 1002, [198, 51, 100, 2], 123),
    ]
}

fn run(dataplane: &Dataplane) -> Vec<Disposition> {
    traffic()
        .into_iter()
        .map(|raw| dataplane.process(Packet::parse(raw, "lan0").unwrap()))
        .collect()
}

#[test]
fn test_standby_makes_the_same_decisions() {
    let active = primary();
    let standby = replicate(&active);

    assert_eq!(build_state(&standby), build_state(&active));

    let decisions = run(&active);
    assert_eq!(decisions, run(&standby));
    assert_eq!(
        decisions,
        vec![
            Disposition::Queued {
                class: "default".into()
            },
            Disposition::Filtered(Action::Drop),
            Disposition::Queued {
                class: "udp".into()
            },
        ]
    );

    let a = active.qos.dequeue().unwrap();
    let b = standby.qos.dequeue().unwrap();
    assert_eq!(a.data, b.data);
    assert_eq!(a.egress, "wan0");
    assert_eq!(b.meta.src_ip, Some("203.0.113.10".parse().unwrap()));
}

#[test]
fn test_runtime_state_stays_behind() {
    let active = primary();
    run(&active);
    // NAT runs before filtering, so the dropped telnet flow is tracked too
    assert_eq!(active.nat.flow_count(), 6);

    let standby = replicate(&active);
    assert_eq!(standby.nat.flow_count(), 0);
    assert_eq!(standby.qos.total_queued(), 0);
    assert!(standby
        .firewall
        .rules_with_stats()
        .iter()
        .all(|entry| entry.hits == 0));
}

#[test]
fn test_apply_overwrites_standby_config() {
    let active = primary();
    let standby = Dataplane::new(IdsConfig::default());
    standby
        .firewall
        .set_default_policy(Chain::Forward, Action::Reject);
    standby
        .routing
        .add(Route::connected(IpCidr::parse("10.0.0.0/8").unwrap(), "lan0"));

    apply_state(&standby, build_state(&active));

    assert_eq!(standby.firewall.default_policy(Chain::Forward), Action::Accept);
    assert_eq!(standby.routing.routes(), active.routing.routes());
}
