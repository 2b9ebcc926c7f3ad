//! Packet filtering engine
//!
//! Provides firewall-like packet filtering with support for:
//! - Chain-based processing (INPUT/OUTPUT/FORWARD)
//! - Match conditions (IP, port, protocol, interface)
//! - Actions (ACCEPT, DROP, REJECT)
//! - Per-rule and per-chain hit counters
//!
//! Rules are evaluated first-match-wins in insertion order. A chain with no
//! configured default policy drops.

use super::matcher::{addr_matches, iface_matches, port_matches, protocol_matches, IpCidr, PortRange};
use crate::packet::Packet;
use crate::protocol::IpProtocol;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Filter chain (similar to iptables chains)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    /// Packets destined for the router itself
    Input,
    /// Packets originating from the router
    Output,
    /// Packets being forwarded through the router
    Forward,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        })
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(Chain::Input),
            "OUTPUT" => Ok(Chain::Output),
            "FORWARD" => Ok(Chain::Forward),
            _ => Err(format!("unknown chain '{}'", s)),
        }
    }
}

/// Filter action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Allow the packet
    Accept,
    /// Silently drop the packet
    Drop,
    /// Drop; the caller may answer with an ICMP error
    Reject,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        })
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Action::Accept),
            "DROP" => Ok(Action::Drop),
            "REJECT" => Ok(Action::Reject),
            _ => Err(format!("unknown action '{}'", s)),
        }
    }
}

/// Filter rule. Every `None` predicate matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Chain this rule applies to
    pub chain: Chain,
    /// Action to take
    pub action: Action,
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
    /// Input interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    /// Output interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
}

impl FirewallRule {
    /// Create a rule matching every packet on `chain`
    pub fn new(chain: Chain, action: Action) -> Self {
        Self {
            chain,
            action,
            protocol: None,
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            in_interface: None,
            out_interface: None,
        }
    }

    /// Check if this rule matches the packet on the given chain
    pub fn matches(&self, chain: Chain, packet: &Packet) -> bool {
        let meta = &packet.meta;
        self.chain == chain
            && protocol_matches(self.protocol, meta.protocol)
            && addr_matches(&self.src, meta.src_ip)
            && addr_matches(&self.dst, meta.dst_ip)
            && port_matches(&self.src_port, meta.src_port)
            && port_matches(&self.dst_port, meta.dst_port)
            && iface_matches(&self.in_interface, &packet.ingress)
            && iface_matches(&self.out_interface, &packet.egress)
    }
}

/// A rule together with its cumulative hit count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStats {
    pub rule: FirewallRule,
    pub hits: u64,
}

#[derive(Debug, Default)]
struct FilterState {
    rules: Vec<RuleStats>,
    defaults: BTreeMap<Chain, Action>,
    chain_hits: BTreeMap<Chain, u64>,
}

/// Packet filter engine
#[derive(Debug, Default)]
pub struct FirewallEngine {
    inner: Mutex<FilterState>,
}

impl FirewallEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a packet against the rules of `chain`
    pub fn evaluate(&self, chain: Chain, packet: &Packet) -> Action {
        let mut state = self.inner.lock();
        let state = &mut *state;

        // Find first matching rule
        if let Some(entry) = state.rules.iter_mut().find(|e| e.rule.matches(chain, packet)) {
            entry.hits += 1;
            *state.chain_hits.entry(chain).or_insert(0) += 1;
            return entry.rule.action;
        }

        // No rule matched, return default action
        state.defaults.get(&chain).copied().unwrap_or(Action::Drop)
    }

    /// Append a filter rule
    pub fn add_rule(&self, rule: FirewallRule) {
        debug!(chain = %rule.chain, action = %rule.action, "firewall rule added");
        self.inner.lock().rules.push(RuleStats { rule, hits: 0 });
    }

    /// Remove the first rule equal to `rule`
    pub fn remove_rule(&self, rule: &FirewallRule) -> bool {
        let mut state = self.inner.lock();
        match state.rules.iter().position(|e| &e.rule == rule) {
            Some(pos) => {
                state.rules.remove(pos);
                debug!(chain = %rule.chain, action = %rule.action, "firewall rule removed");
                true
            }
            None => false,
        }
    }

    /// Replace the first rule equal to `target` in place; its hit count restarts
    pub fn update_rule(&self, target: &FirewallRule, replacement: FirewallRule) -> bool {
        let mut state = self.inner.lock();
        match state.rules.iter_mut().find(|e| &e.rule == target) {
            Some(entry) => {
                *entry = RuleStats {
                    rule: replacement,
                    hits: 0,
                };
                true
            }
            None => false,
        }
    }

    pub fn set_default_policy(&self, chain: Chain, action: Action) {
        debug!(%chain, %action, "default policy set");
        self.inner.lock().defaults.insert(chain, action);
    }

    /// Effective default for `chain` (DROP when never set)
    pub fn default_policy(&self, chain: Chain) -> Action {
        self.inner
            .lock()
            .defaults
            .get(&chain)
            .copied()
            .unwrap_or(Action::Drop)
    }

    /// Swap in a complete rule set and default policies; stats restart
    pub fn replace(&self, rules: Vec<FirewallRule>, defaults: BTreeMap<Chain, Action>) {
        debug!(rules = rules.len(), defaults = defaults.len(), "firewall replaced");
        let mut state = self.inner.lock();
        state.rules = rules
            .into_iter()
            .map(|rule| RuleStats { rule, hits: 0 })
            .collect();
        state.defaults = defaults;
        state.chain_hits.clear();
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.inner.lock().rules.iter().map(|e| e.rule.clone()).collect()
    }

    pub fn rules_with_stats(&self) -> Vec<RuleStats> {
        self.inner.lock().rules.clone()
    }

    /// Explicitly configured default policies
    pub fn defaults(&self) -> BTreeMap<Chain, Action> {
        self.inner.lock().defaults.clone()
    }

    pub fn chain_hits(&self) -> BTreeMap<Chain, u64> {
        self.inner.lock().chain_hits.clone()
    }

    pub fn reset_stats(&self) {
        let mut state = self.inner.lock();
        for entry in &mut state.rules {
            entry.hits = 0;
        }
        state.chain_hits.clear();
    }

    /// Get the number of rules
    pub fn rule_count(&self) -> usize {
        self.inner.lock().rules.len()
    }
}
