//! Data plane state document
//!
//! Snapshot of everything a peer needs to take over forwarding: firewall
//! defaults and rules, NAT rules, QoS classes and routes. Conntrack, queues
//! and IDS state are runtime-only and not part of it.

use crate::dataplane::{Action, Chain, FirewallRule, NatRule, QosClass, Route};
use crate::pipeline::Dataplane;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Default verdict for one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPolicy {
    pub chain: Chain,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneState {
    pub firewall_defaults: Vec<DefaultPolicy>,
    pub firewall_rules: Vec<FirewallRule>,
    pub nat_rules: Vec<NatRule>,
    pub qos_classes: Vec<QosClass>,
    pub routes: Vec<Route>,
}

impl DataplaneState {
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Parse(e.to_string()))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Parse(e.to_string()))
    }

    fn defaults_map(&self) -> BTreeMap<Chain, Action> {
        self.firewall_defaults
            .iter()
            .map(|policy| (policy.chain, policy.action))
            .collect()
    }
}

/// Capture the current configuration of every engine
pub fn build_state(dataplane: &Dataplane) -> DataplaneState {
    DataplaneState {
        firewall_defaults: dataplane
            .firewall
            .defaults()
            .into_iter()
            .map(|(chain, action)| DefaultPolicy { chain, action })
            .collect(),
        firewall_rules: dataplane.firewall.rules(),
        nat_rules: dataplane.nat.rules(),
        qos_classes: dataplane.qos.classes(),
        routes: dataplane.routing.routes(),
    }
}

/// Install `state` engine by engine.
///
/// There is no transaction across engines: a reader running concurrently
/// may see the new firewall rules next to the old routes.
pub fn apply_state(dataplane: &Dataplane, state: DataplaneState) {
    let defaults = state.defaults_map();
    let counts = (
        state.firewall_rules.len(),
        state.nat_rules.len(),
        state.qos_classes.len(),
        state.routes.len(),
    );

    dataplane.firewall.replace(state.firewall_rules, defaults);
    dataplane.nat.replace_rules(state.nat_rules);
    dataplane.qos.replace_classes(state.qos_classes);
    dataplane.routing.replace_routes(state.routes);

    info!(
        firewall_rules = counts.0,
        nat_rules = counts.1,
        qos_classes = counts.2,
        routes = counts.3,
        "data plane state applied"
    );
}
