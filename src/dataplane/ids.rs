//! Intrusion detection
//!
//! Two phases per packet. Signature rules are scanned in order and the
//! first match decides. Without a signature hit, the source's sliding
//! window is updated and checked against the rate, port-scan and
//! destination-sweep thresholds.

use super::matcher::{addr_matches, port_matches, protocol_matches, IpCidr, PortRange};
use crate::clock::{self, SharedClock};
use crate::packet::Packet;
use crate::protocol::IpProtocol;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdsAction {
    #[default]
    Alert,
    Drop,
}

impl FromStr for IdsAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALERT" => Ok(IdsAction::Alert),
            "DROP" => Ok(IdsAction::Drop),
            _ => Err(format!("unknown IDS action '{}'", s)),
        }
    }
}

impl fmt::Display for IdsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdsAction::Alert => "ALERT",
            IdsAction::Drop => "DROP",
        })
    }
}

/// Signature rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdsRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<IpProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<IpCidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<IpCidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<PortRange>,
    /// Byte substring searched in the packet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_contains: Option<String>,
    #[serde(default)]
    pub action: IdsAction,
}

impl IdsRule {
    pub fn new(name: impl Into<String>, action: IdsAction) -> Self {
        Self {
            name: name.into(),
            protocol: None,
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            payload_contains: None,
            action,
        }
    }

    fn matches(&self, packet: &Packet) -> bool {
        let meta = &packet.meta;
        protocol_matches(self.protocol, meta.protocol)
            && addr_matches(&self.src, meta.src_ip)
            && addr_matches(&self.dst, meta.dst_ip)
            && port_matches(&self.src_port, meta.src_port)
            && port_matches(&self.dst_port, meta.dst_port)
            && self
                .payload_contains
                .as_deref()
                .map_or(true, |needle| contains_bytes(packet.payload(), needle.as_bytes()))
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Behavioural thresholds. A threshold of 0 disables that check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdsConfig {
    pub window: Duration,
    /// Packets per source per window
    pub rate_threshold: u64,
    /// Distinct destination ports per source per window
    pub port_scan_threshold: usize,
    /// Distinct destination addresses per source per window
    pub unique_dst_threshold: usize,
    pub behavior_action: IdsAction,
    /// Alert ring capacity
    pub max_alerts: usize,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            rate_threshold: 1000,
            port_scan_threshold: 50,
            unique_dst_threshold: 0,
            behavior_action: IdsAction::Alert,
            max_alerts: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    Signature,
    RateSpike,
    PortScan,
    DstSweep,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertKind::Signature => "SIGNATURE",
            AlertKind::RateSpike => "RATE_SPIKE",
            AlertKind::PortScan => "PORT_SCAN",
            AlertKind::DstSweep => "DST_SWEEP",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub reason: String,
    pub protocol: IpProtocol,
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    fn new(kind: AlertKind, severity: Severity, reason: String, packet: &Packet) -> Self {
        let meta = &packet.meta;
        Self {
            kind,
            severity,
            reason,
            protocol: meta.protocol,
            src_ip: meta.src_ip,
            src_port: meta.src_port,
            dst_ip: meta.dst_ip,
            dst_port: meta.dst_port,
            timestamp: Utc::now(),
        }
    }
}

/// Verdict for one packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub drop: bool,
    pub alert: Option<Alert>,
}

/// Per-source sliding window
struct SourceWindow {
    start: Instant,
    packets: u64,
    dst_ports: HashSet<u16>,
    dst_ips: HashSet<IpAddr>,
    /// Conditions already reported in this window
    alerted: HashSet<AlertKind>,
}

impl SourceWindow {
    fn new(now: Instant) -> Self {
        Self {
            start: now,
            packets: 0,
            dst_ports: HashSet::new(),
            dst_ips: HashSet::new(),
            alerted: HashSet::new(),
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.start) > window
    }

    /// Conditions over threshold, in evaluation order
    fn triggered(&self, config: &IdsConfig) -> Vec<(AlertKind, Severity, String)> {
        let mut hits = Vec::new();
        if config.rate_threshold > 0 && self.packets >= config.rate_threshold {
            hits.push((
                AlertKind::RateSpike,
                Severity::High,
                format!("{} packets within {:?}", self.packets, config.window),
            ));
        }
        if config.port_scan_threshold > 0 && self.dst_ports.len() >= config.port_scan_threshold {
            hits.push((
                AlertKind::PortScan,
                Severity::Medium,
                format!("{} distinct destination ports", self.dst_ports.len()),
            ));
        }
        if config.unique_dst_threshold > 0 && self.dst_ips.len() >= config.unique_dst_threshold {
            hits.push((
                AlertKind::DstSweep,
                Severity::Medium,
                format!("{} distinct destination addresses", self.dst_ips.len()),
            ));
        }
        hits
    }
}

struct IdsState {
    rules: Vec<IdsRule>,
    config: IdsConfig,
    windows: HashMap<IpAddr, SourceWindow>,
    alerts: VecDeque<Alert>,
}

impl IdsState {
    fn record(&mut self, alert: Alert) {
        if self.config.max_alerts == 0 {
            return;
        }
        while self.alerts.len() >= self.config.max_alerts {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    fn signature(&mut self, packet: &Packet) -> Option<Detection> {
        let rule = self.rules.iter().find(|rule| rule.matches(packet))?;
        let drop = rule.action == IdsAction::Drop;
        let alert = Alert::new(AlertKind::Signature, Severity::High, rule.name.clone(), packet);
        warn!(rule = %rule.name, src = ?alert.src_ip, dst = ?alert.dst_ip, drop, "IDS signature matched");
        self.record(alert.clone());
        Some(Detection {
            drop,
            alert: Some(alert),
        })
    }

    fn behaviour(&mut self, src: IpAddr, packet: &Packet, now: Instant) -> Detection {
        let config = self.config.clone();
        let window = self
            .windows
            .entry(src)
            .or_insert_with(|| SourceWindow::new(now));
        if window.expired(now, config.window) {
            *window = SourceWindow::new(now);
        }

        window.packets += 1;
        if packet.meta.protocol.has_ports() {
            window.dst_ports.insert(packet.meta.dst_port);
        }
        if let Some(dst) = packet.meta.dst_ip {
            window.dst_ips.insert(dst);
        }

        let triggered = window.triggered(&config);
        // Only the first triggered condition may alert, once per window
        let drop = config.behavior_action == IdsAction::Drop;
        let Some((kind, severity, reason)) = triggered.into_iter().next() else {
            return Detection::default();
        };
        if !window.alerted.insert(kind) {
            return Detection { drop, alert: None };
        }

        let alert = Alert::new(kind, severity, reason, packet);
        warn!(kind = %kind, src = %src, reason = %alert.reason, drop, "IDS behavioural alert");
        self.record(alert.clone());
        Detection {
            drop,
            alert: Some(alert),
        }
    }
}

/// Signature and behavioural detector
pub struct IdsEngine {
    inner: Mutex<IdsState>,
    clock: SharedClock,
}

impl IdsEngine {
    pub fn new(config: IdsConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: IdsConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(IdsState {
                rules: Vec::new(),
                config,
                windows: HashMap::new(),
                alerts: VecDeque::new(),
            }),
            clock,
        }
    }

    /// Inspect a packet. Packets without a source address are not inspected.
    pub fn detect(&self, packet: &Packet) -> Detection {
        let Some(src) = packet.meta.src_ip else {
            return Detection::default();
        };
        let now = self.clock.now();
        let mut state = self.inner.lock();

        if let Some(detection) = state.signature(packet) {
            return detection;
        }
        state.behaviour(src, packet, now)
    }

    pub fn add_rule(&self, rule: IdsRule) {
        debug!(name = %rule.name, action = %rule.action, "IDS rule added");
        self.inner.lock().rules.push(rule);
    }

    /// Remove every rule with this name
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut state = self.inner.lock();
        let before = state.rules.len();
        state.rules.retain(|rule| rule.name != name);
        let removed = state.rules.len() != before;
        if removed {
            debug!(name, "IDS rule removed");
        }
        removed
    }

    pub fn replace_rules(&self, rules: Vec<IdsRule>) {
        debug!(count = rules.len(), "IDS rules replaced");
        self.inner.lock().rules = rules;
    }

    pub fn rules(&self) -> Vec<IdsRule> {
        self.inner.lock().rules.clone()
    }

    /// Recorded alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().alerts.iter().cloned().collect()
    }

    /// Clear alerts and behavioural state; rules are kept
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.alerts.clear();
        state.windows.clear();
    }

    pub fn config(&self) -> IdsConfig {
        self.inner.lock().config.clone()
    }

    /// Install new thresholds; a smaller ring drops the oldest alerts
    pub fn set_config(&self, config: IdsConfig) {
        let mut state = self.inner.lock();
        let excess = state.alerts.len().saturating_sub(config.max_alerts);
        state.alerts.drain(..excess);
        state.config = config;
    }

    /// Drop windows that have elapsed, returning how many went
    pub fn prune_windows(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        let window = state.config.window;
        let before = state.windows.len();
        state.windows.retain(|_, w| !w.expired(now, window));
        before - state.windows.len()
    }
}

impl Default for IdsEngine {
    fn default() -> Self {
        Self::new(IdsConfig::default())
    }
}

impl fmt::Debug for IdsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("IdsEngine")
            .field("rules", &state.rules.len())
            .field("sources", &state.windows.len())
            .field("alerts", &state.alerts.len())
            .finish()
    }
}
