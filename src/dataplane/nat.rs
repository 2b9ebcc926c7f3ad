//! NAT table with connection tracking
//!
//! SNAT rewrites the source endpoint, DNAT the destination endpoint. The
//! first packet of a flow is matched against the rule list; the decision is
//! then memoised for the flow in both directions, so replies are translated
//! back without consulting the rules again. Tracked flows outlive the rule
//! that created them.

use super::matcher::{addr_matches, port_matches, IpCidr, PortRange};
use crate::clock::{self, SharedClock};
use crate::packet::Packet;
use crate::protocol::IpProtocol;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NatKind {
    /// Rewrite source address/port
    Snat,
    /// Rewrite destination address/port
    Dnat,
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NatKind::Snat => "SNAT",
            NatKind::Dnat => "DNAT",
        })
    }
}

impl FromStr for NatKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SNAT" => Ok(NatKind::Snat),
            "DNAT" => Ok(NatKind::Dnat),
            _ => Err(format!("unknown NAT type '{}'", s)),
        }
    }
}

/// Translation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    #[serde(rename = "type")]
    pub kind: NatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<IpCidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<IpCidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<PortRange>,
    pub to_ip: IpAddr,
    /// Keep the original port when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_port: Option<u16>,
}

impl NatRule {
    pub fn snat(src: Option<IpCidr>, to_ip: IpAddr, to_port: Option<u16>) -> Self {
        Self {
            kind: NatKind::Snat,
            src,
            dst: None,
            src_port: None,
            dst_port: None,
            to_ip,
            to_port,
        }
    }

    pub fn dnat(dst: Option<IpCidr>, dst_port: Option<PortRange>, to_ip: IpAddr, to_port: Option<u16>) -> Self {
        Self {
            kind: NatKind::Dnat,
            src: None,
            dst,
            src_port: None,
            dst_port,
            to_ip,
            to_port,
        }
    }

    fn matches(&self, flow: &FlowKey) -> bool {
        addr_matches(&self.src, Some(flow.src_ip))
            && addr_matches(&self.dst, Some(flow.dst_ip))
            && port_matches(&self.src_port, flow.src_port)
            && port_matches(&self.dst_port, flow.dst_port)
    }

    /// The tuple `flow` becomes after this rule rewrites it
    fn translate(&self, flow: &FlowKey) -> FlowKey {
        let mut out = *flow;
        match self.kind {
            NatKind::Snat => {
                out.src_ip = self.to_ip;
                out.src_port = self.to_port.unwrap_or(flow.src_port);
            }
            NatKind::Dnat => {
                out.dst_ip = self.to_ip;
                out.dst_port = self.to_port.unwrap_or(flow.dst_port);
            }
        }
        out
    }
}

/// Flow identifier (5-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    /// Key of the packet as it currently stands; None without addresses
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let meta = &packet.meta;
        Some(Self {
            protocol: meta.protocol,
            src_ip: meta.src_ip?,
            src_port: meta.src_port,
            dst_ip: meta.dst_ip?,
            dst_port: meta.dst_port,
        })
    }

    /// Create the reverse key (swap src/dst)
    pub fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// A NAT rule together with the number of flows it created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRuleStats {
    pub rule: NatRule,
    pub hits: u64,
}

/// Tracked translation for one direction of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub translated: FlowKey,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    translated: FlowKey,
    /// Key of the opposite direction; both age together
    peer: FlowKey,
    last_seen: Instant,
}

#[derive(Default)]
struct NatState {
    rules: Vec<NatRuleStats>,
    /// As-seen tuple -> rewritten tuple, one entry per direction
    conntrack: HashMap<FlowKey, Tracked>,
}

/// NAT translation table
pub struct NatTable {
    inner: Mutex<NatState>,
    clock: SharedClock,
}

impl NatTable {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(NatState::default()),
            clock,
        }
    }

    /// Translate a packet, creating flow state on the first rule hit
    pub fn apply(&self, mut packet: Packet) -> Packet {
        let Some(key) = FlowKey::from_packet(&packet) else {
            return packet;
        };
        let now = self.clock.now();

        let translated = {
            let mut state = self.inner.lock();
            let state = &mut *state;

            if let Some(tracked) = state.conntrack.get_mut(&key) {
                tracked.last_seen = now;
                let (translated, peer) = (tracked.translated, tracked.peer);
                if let Some(peer) = state.conntrack.get_mut(&peer) {
                    peer.last_seen = now;
                }
                translated
            } else {
                let Some(entry) = state.rules.iter_mut().find(|e| e.rule.matches(&key)) else {
                    return packet;
                };
                entry.hits += 1;
                let translated = entry.rule.translate(&key);

                // Reply to the translated tuple maps back to the reply of the original
                state.conntrack.insert(
                    key,
                    Tracked {
                        translated,
                        peer: translated.reverse(),
                        last_seen: now,
                    },
                );
                state.conntrack.insert(
                    translated.reverse(),
                    Tracked {
                        translated: key.reverse(),
                        peer: key,
                        last_seen: now,
                    },
                );
                debug!(kind = %entry.rule.kind, flow = %key, to = %translated, "NAT flow created");
                translated
            }
        };

        if translated != key {
            packet.set_endpoints(
                translated.src_ip,
                translated.src_port,
                translated.dst_ip,
                translated.dst_port,
            );
        }
        packet
    }

    pub fn add_rule(&self, rule: NatRule) {
        debug!(kind = %rule.kind, to = %rule.to_ip, "NAT rule added");
        self.inner.lock().rules.push(NatRuleStats { rule, hits: 0 });
    }

    /// Remove the first rule equal to `rule`; its flows stay tracked
    pub fn remove_rule(&self, rule: &NatRule) -> bool {
        let mut state = self.inner.lock();
        let Some(pos) = state.rules.iter().position(|e| e.rule == *rule) else {
            return false;
        };
        state.rules.remove(pos);
        debug!(kind = %rule.kind, to = %rule.to_ip, "NAT rule removed");
        true
    }

    /// Swap the rule list; tracked flows are kept
    pub fn replace_rules(&self, rules: Vec<NatRule>) {
        debug!(count = rules.len(), "NAT rules replaced");
        self.inner.lock().rules = rules
            .into_iter()
            .map(|rule| NatRuleStats { rule, hits: 0 })
            .collect();
    }

    pub fn rules(&self) -> Vec<NatRule> {
        self.inner.lock().rules.iter().map(|e| e.rule.clone()).collect()
    }

    pub fn rules_with_stats(&self) -> Vec<NatRuleStats> {
        self.inner.lock().rules.clone()
    }

    /// Number of tracked directions (two per flow)
    pub fn flow_count(&self) -> usize {
        self.inner.lock().conntrack.len()
    }

    pub fn flows(&self) -> Vec<FlowEntry> {
        self.inner
            .lock()
            .conntrack
            .iter()
            .map(|(key, tracked)| FlowEntry {
                key: *key,
                translated: tracked.translated,
            })
            .collect()
    }

    /// Drop flows idle for longer than `idle`, both directions at once;
    /// returns how many directions went
    pub fn expire_flows(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        let before = state.conntrack.len();
        let stale: Vec<FlowKey> = state
            .conntrack
            .iter()
            .filter(|(_, tracked)| now.duration_since(tracked.last_seen) > idle)
            .flat_map(|(key, tracked)| [*key, tracked.peer])
            .collect();
        for key in &stale {
            state.conntrack.remove(key);
        }
        let expired = before - state.conntrack.len();
        if expired > 0 {
            debug!(expired, "NAT flows expired");
        }
        expired
    }

    pub fn flush_flows(&self) {
        self.inner.lock().conntrack.clear();
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NatTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("NatTable")
            .field("rules", &state.rules.len())
            .field("flows", &state.conntrack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::packet::{fixtures, PacketMetadata};
    use std::sync::Arc;

    fn snat_rule() -> NatRule {
        NatRule::snat(
            IpCidr::parse("10.0.0.0/8"),
            "203.0.113.10".parse().unwrap(),
            Some(40000),
        )
    }

    fn endpoints(p: &Packet) -> (IpAddr, u16, IpAddr, u16) {
        (
            p.meta.src_ip.unwrap(),
            p.meta.src_port,
            p.meta.dst_ip.unwrap(),
            p.meta.dst_port,
        )
    }

    #[test]
    fn test_snat_outbound_and_reply() {
        let nat = NatTable::new();
        nat.add_rule(snat_rule());

        let out = nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));
        assert_eq!(
            endpoints(&out),
            (
                "203.0.113.10".parse().unwrap(),
                40000,
                "8.8.8.8".parse().unwrap(),
                80
            )
        );
        // Raw header follows metadata
        assert_eq!(PacketMetadata::parse(&out.data).unwrap(), out.meta);

        let reply = nat.apply(fixtures::tcp([8, 8, 8, 8], 80, [203, 0, 113, 10], 40000));
        assert_eq!(
            endpoints(&reply),
            (
                "8.8.8.8".parse().unwrap(),
                80,
                "10.1.2.3".parse().unwrap(),
                1234
            )
        );
    }

    #[test]
    fn test_reply_translated_after_rules_cleared() {
        let nat = NatTable::new();
        nat.add_rule(snat_rule());
        nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));

        nat.replace_rules(Vec::new());

        let reply = nat.apply(fixtures::tcp([8, 8, 8, 8], 80, [203, 0, 113, 10], 40000));
        assert_eq!(reply.meta.dst_ip, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(reply.meta.dst_port, 1234);

        // Established flow keeps translating outbound too
        let again = nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));
        assert_eq!(again.meta.src_ip, Some("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn test_remove_rule_keeps_flows() {
        let nat = NatTable::new();
        nat.add_rule(snat_rule());
        nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));

        assert!(nat.remove_rule(&snat_rule()));
        assert!(!nat.remove_rule(&snat_rule()));
        assert!(nat.rules().is_empty());
        assert_eq!(nat.flow_count(), 2);

        // New flows are no longer translated
        let fresh = nat.apply(fixtures::tcp([10, 1, 2, 4], 1234, [8, 8, 8, 8], 80));
        assert_eq!(fresh.meta.src_ip, Some("10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn test_dnat_port_forward() {
        let nat = NatTable::new();
        nat.add_rule(NatRule::dnat(
            IpCidr::parse("198.51.100.1/32"),
            Some(PortRange::single(8080)),
            "192.168.1.20".parse().unwrap(),
            Some(80),
        ));

        let inbound = nat.apply(fixtures::tcp([1, 2, 3, 4], 5555, [198, 51, 100, 1], 8080));
        assert_eq!(
            endpoints(&inbound),
            (
                "1.2.3.4".parse().unwrap(),
                5555,
                "192.168.1.20".parse().unwrap(),
                80
            )
        );

        let reply = nat.apply(fixtures::tcp([192, 168, 1, 20], 80, [1, 2, 3, 4], 5555));
        assert_eq!(
            endpoints(&reply),
            (
                "198.51.100.1".parse().unwrap(),
                8080,
                "1.2.3.4".parse().unwrap(),
                5555
            )
        );
    }

    #[test]
    fn test_snat_without_port_keeps_source_port() {
        let nat = NatTable::new();
        nat.add_rule(NatRule::snat(None, "203.0.113.10".parse().unwrap(), None));

        let out = nat.apply(fixtures::udp([10, 0, 0, 9], 5353, [1, 1, 1, 1], 53));
        assert_eq!(out.meta.src_port, 5353);
        assert_eq!(out.meta.src_ip, Some("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn test_no_match_unchanged_and_untracked() {
        let nat = NatTable::new();
        nat.add_rule(snat_rule());

        let pkt = nat.apply(fixtures::tcp([192, 168, 1, 5], 1234, [8, 8, 8, 8], 80));
        assert_eq!(pkt.meta.src_ip, Some("192.168.1.5".parse().unwrap()));
        assert_eq!(nat.flow_count(), 0);
        assert_eq!(nat.rules_with_stats()[0].hits, 0);
    }

    #[test]
    fn test_conntrack_skips_rule_reevaluation() {
        let nat = NatTable::new();
        nat.add_rule(snat_rule());

        for _ in 0..3 {
            nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));
        }

        assert_eq!(nat.rules_with_stats()[0].hits, 1);
        assert_eq!(nat.flow_count(), 2);
        let flows = nat.flows();
        assert!(flows.iter().any(|f| f.key.src_port == 1234 && f.translated.src_port == 40000));
    }

    #[test]
    fn test_expire_idle_flows() {
        let clock = ManualClock::new();
        let nat = NatTable::with_clock(Arc::new(clock.clone()));
        nat.add_rule(snat_rule());
        nat.apply(fixtures::tcp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 80));

        clock.advance(Duration::from_secs(30));
        assert_eq!(nat.expire_flows(Duration::from_secs(60)), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(nat.expire_flows(Duration::from_secs(60)), 2);
        assert_eq!(nat.flow_count(), 0);
    }

    #[test]
    fn test_one_sided_traffic_keeps_reply_mapping() {
        let clock = ManualClock::new();
        let nat = NatTable::with_clock(Arc::new(clock.clone()));
        nat.add_rule(snat_rule());

        // Outbound only, every 40s, with a 60s idle timeout
        for _ in 0..4 {
            nat.apply(fixtures::udp([10, 1, 2, 3], 1234, [8, 8, 8, 8], 53));
            clock.advance(Duration::from_secs(40));
            assert_eq!(nat.expire_flows(Duration::from_secs(60)), 0);
        }
        assert_eq!(nat.flow_count(), 2);

        let reply = nat.apply(fixtures::udp([8, 8, 8, 8], 53, [203, 0, 113, 10], 40000));
        assert_eq!(reply.meta.dst_ip, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(reply.meta.dst_port, 1234);
    }
}
