//! Data plane engines
//!
//! Each engine owns its state behind a single lock and knows nothing about
//! the others; [`crate::pipeline`] wires them together per packet.

mod firewall;
mod ids;
mod matcher;
mod nat;
mod qos;
mod routing;

pub use firewall::{Action, Chain, FirewallEngine, FirewallRule, RuleStats};
pub use ids::{
    Alert, AlertKind, Detection, IdsAction, IdsConfig, IdsEngine, IdsRule, Severity,
};
pub use matcher::{IpCidr, Ipv4Cidr, Ipv6Cidr, PortRange};
pub use nat::{FlowEntry, FlowKey, NatKind, NatRule, NatRuleStats, NatTable};
pub use qos::{ClassStats, DropPolicy, EnqueueOutcome, QosClass, QosManager, DEFAULT_CLASS};
pub use routing::{Route, RoutingTable};
