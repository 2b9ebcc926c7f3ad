//! Configuration types
//!
//! Everything in the file is a plain string or integer. The `to_*`
//! conversions turn a section into engine types and are the only place
//! addresses, ports and keywords get parsed.

use crate::dataplane::{
    Action, Chain, DropPolicy, FirewallRule, IdsAction, IdsConfig, IdsRule, IpCidr, NatKind,
    NatRule, PortRange, QosClass, Route,
};
use crate::protocol::IpProtocol;
use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub dataplane: DataplaneConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub nat: NatConfig,
    #[serde(default)]
    pub qos: QosConfig,
    #[serde(default)]
    pub ids: IdsSection,
}

pub const DEFAULT_EGRESS_BATCH: usize = 32;
pub const DEFAULT_EGRESS_IDLE_MS: u64 = 10;
pub const DEFAULT_FLOW_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataplaneConfig {
    /// Addresses owned by the router (INPUT chain)
    #[serde(default)]
    pub local_addresses: Vec<String>,
    pub egress_batch: Option<usize>,
    pub egress_idle_ms: Option<u64>,
    pub flow_timeout_secs: Option<u64>,
    pub maintenance_interval_secs: Option<u64>,
}

impl DataplaneConfig {
    pub fn egress_batch(&self) -> usize {
        self.egress_batch.unwrap_or(DEFAULT_EGRESS_BATCH)
    }

    pub fn egress_idle(&self) -> Duration {
        Duration::from_millis(self.egress_idle_ms.unwrap_or(DEFAULT_EGRESS_IDLE_MS))
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs.unwrap_or(DEFAULT_FLOW_TIMEOUT_SECS))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(
            self.maintenance_interval_secs
                .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_SECS),
        )
    }

    pub fn to_local_addresses(&self) -> Result<Vec<IpAddr>, String> {
        self.local_addresses
            .iter()
            .map(|addr| parse_ip(addr))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub destination: String,
    pub gateway: Option<String>,
    pub interface: String,
    pub metric: Option<u32>,
}

impl RouteConfig {
    pub fn to_route(&self) -> Result<Route, String> {
        let destination = parse_cidr(&self.destination)?;
        let gateway = self.gateway.as_deref().map(parse_ip).transpose()?;
        if let Some(gw) = gateway {
            if gw.is_ipv4() != destination.network().is_ipv4() {
                return Err(format!(
                    "gateway {} and destination {} are different address families",
                    gw, destination
                ));
            }
        }
        Ok(Route {
            destination,
            gateway,
            interface: self.interface.clone(),
            metric: self.metric.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirewallConfig {
    /// Chain name -> default action
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub rules: Vec<FirewallRuleConfig>,
}

impl FirewallConfig {
    pub fn to_defaults(&self) -> Result<BTreeMap<Chain, Action>, String> {
        self.defaults
            .iter()
            .map(|(chain, action)| -> Result<(Chain, Action), String> {
                Ok((keyword(chain)?, keyword(action)?))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallRuleConfig {
    pub chain: String,
    pub action: String,
    pub protocol: Option<String>,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
}

impl FirewallRuleConfig {
    pub fn to_rule(&self) -> Result<FirewallRule, String> {
        Ok(FirewallRule {
            protocol: optional(&self.protocol, keyword)?,
            src: optional(&self.src, parse_cidr)?,
            dst: optional(&self.dst, parse_cidr)?,
            src_port: optional(&self.src_port, parse_ports)?,
            dst_port: optional(&self.dst_port, parse_ports)?,
            in_interface: self.in_interface.clone(),
            out_interface: self.out_interface.clone(),
            ..FirewallRule::new(keyword(&self.chain)?, keyword(&self.action)?)
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NatConfig {
    #[serde(default)]
    pub rules: Vec<NatRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatRuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub to_ip: String,
    pub to_port: Option<u16>,
}

impl NatRuleConfig {
    pub fn to_rule(&self) -> Result<NatRule, String> {
        let kind: NatKind = keyword(&self.kind)?;
        Ok(NatRule {
            kind,
            src: optional(&self.src, parse_cidr)?,
            dst: optional(&self.dst, parse_cidr)?,
            src_port: optional(&self.src_port, parse_ports)?,
            dst_port: optional(&self.dst_port, parse_ports)?,
            to_ip: parse_ip(&self.to_ip)?,
            to_port: self.to_port,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QosConfig {
    #[serde(default)]
    pub classes: Vec<QosClassConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QosClassConfig {
    pub name: String,
    pub protocol: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub rate_kbps: Option<u64>,
    pub priority: Option<i32>,
    pub max_queue: Option<usize>,
    pub drop_policy: Option<String>,
}

impl QosClassConfig {
    pub fn to_class(&self) -> Result<QosClass, String> {
        Ok(QosClass {
            protocol: optional(&self.protocol, keyword)?,
            src_port: optional(&self.src_port, parse_ports)?,
            dst_port: optional(&self.dst_port, parse_ports)?,
            rate_kbps: self.rate_kbps.unwrap_or(0),
            max_queue: self.max_queue.unwrap_or(0),
            drop_policy: optional(&self.drop_policy, keyword::<DropPolicy>)?.unwrap_or_default(),
            ..QosClass::new(self.name.clone(), self.priority.unwrap_or(0))
        })
    }
}

/// `[ids]` section; unset thresholds keep the engine defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdsSection {
    pub window_secs: Option<u64>,
    pub rate_threshold: Option<u64>,
    pub port_scan_threshold: Option<usize>,
    pub unique_dst_threshold: Option<usize>,
    pub behavior_action: Option<String>,
    pub max_alerts: Option<usize>,
    #[serde(default)]
    pub rules: Vec<IdsRuleConfig>,
}

impl IdsSection {
    pub fn to_config(&self) -> Result<IdsConfig, String> {
        let defaults = IdsConfig::default();
        Ok(IdsConfig {
            window: self
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            rate_threshold: self.rate_threshold.unwrap_or(defaults.rate_threshold),
            port_scan_threshold: self
                .port_scan_threshold
                .unwrap_or(defaults.port_scan_threshold),
            unique_dst_threshold: self
                .unique_dst_threshold
                .unwrap_or(defaults.unique_dst_threshold),
            behavior_action: optional(&self.behavior_action, keyword::<IdsAction>)?
                .unwrap_or(defaults.behavior_action),
            max_alerts: self.max_alerts.unwrap_or(defaults.max_alerts),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdsRuleConfig {
    pub name: String,
    pub protocol: Option<String>,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub payload_contains: Option<String>,
    pub action: Option<String>,
}

impl IdsRuleConfig {
    pub fn to_rule(&self) -> Result<IdsRule, String> {
        let action: IdsAction = optional(&self.action, keyword)?.unwrap_or_default();
        Ok(IdsRule {
            protocol: optional(&self.protocol, keyword::<IpProtocol>)?,
            src: optional(&self.src, parse_cidr)?,
            dst: optional(&self.dst, parse_cidr)?,
            src_port: optional(&self.src_port, parse_ports)?,
            dst_port: optional(&self.dst_port, parse_ports)?,
            payload_contains: self.payload_contains.clone(),
            ..IdsRule::new(self.name.clone(), action)
        })
    }
}

fn parse_ip(s: &str) -> Result<IpAddr, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid IP address '{}'", s))
}

fn parse_cidr(s: &str) -> Result<IpCidr, String> {
    s.trim().parse()
}

fn parse_ports(s: &str) -> Result<PortRange, String> {
    s.parse()
}

/// Chains, actions, protocols and policies all parse case-insensitively
fn keyword<T: FromStr<Err = String>>(s: &str) -> Result<T, String> {
    s.trim().parse()
}

fn optional<T>(
    value: &Option<String>,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, String> {
    value.as_deref().map(parse).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_file_parses() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [dataplane]
            local_addresses = ["192.168.1.1"]
            egress_batch = 8

            [[routes]]
            destination = "0.0.0.0/0"
            gateway = "203.0.113.1"
            interface = "wan0"
            metric = 100

            [firewall.defaults]
            FORWARD = "accept"

            [[firewall.rules]]
            chain = "input"
            action = "ACCEPT"
            protocol = "tcp"
            dst_port = "22"

            [[nat.rules]]
            type = "snat"
            src = "192.168.1.0/24"
            to_ip = "203.0.113.10"

            [[qos.classes]]
            name = "voice"
            protocol = "UDP"
            priority = 10
            rate_kbps = 256
            drop_policy = "head"

            [ids]
            rate_threshold = 500
            behavior_action = "drop"

            [[ids.rules]]
            name = "http-get"
            payload_contains = "GET"
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.dataplane.egress_batch(), 8);
        assert_eq!(config.dataplane.flow_timeout(), Duration::from_secs(300));

        let route = config.routes[0].to_route().unwrap();
        assert_eq!(route.gateway, Some("203.0.113.1".parse().unwrap()));
        assert_eq!(route.metric, 100);

        let defaults = config.firewall.to_defaults().unwrap();
        assert_eq!(defaults.get(&Chain::Forward), Some(&Action::Accept));
        let rule = config.firewall.rules[0].to_rule().unwrap();
        assert_eq!(rule.chain, Chain::Input);
        assert_eq!(rule.protocol, Some(IpProtocol::Tcp));
        assert_eq!(rule.dst_port, Some(PortRange::single(22)));

        let nat = config.nat.rules[0].to_rule().unwrap();
        assert_eq!(nat.kind, NatKind::Snat);
        assert_eq!(nat.to_port, None);

        let class = config.qos.classes[0].to_class().unwrap();
        assert_eq!(class.drop_policy, DropPolicy::Head);
        assert_eq!(class.max_queue, 0);

        let ids = config.ids.to_config().unwrap();
        assert_eq!(ids.rate_threshold, 500);
        assert_eq!(ids.behavior_action, IdsAction::Drop);
        assert_eq!(ids.window, IdsConfig::default().window);
        let sig = config.ids.rules[0].to_rule().unwrap();
        assert_eq!(sig.action, IdsAction::Alert);
    }

    #[test]
    fn test_conversion_errors() {
        let route = RouteConfig {
            destination: "10.0.0.0/8".to_string(),
            gateway: Some("2001:db8::1".to_string()),
            interface: "eth0".to_string(),
            metric: None,
        };
        assert!(route.to_route().unwrap_err().contains("address families"));

        let rule = FirewallRuleConfig {
            chain: "PREROUTING".to_string(),
            action: "ACCEPT".to_string(),
            protocol: None,
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            in_interface: None,
            out_interface: None,
        };
        assert!(rule.to_rule().is_err());

        let class = QosClassConfig {
            name: "bulk".to_string(),
            protocol: None,
            src_port: Some("9000-80".to_string()),
            dst_port: None,
            rate_kbps: None,
            priority: None,
            max_queue: None,
            drop_policy: None,
        };
        assert!(class.to_class().unwrap_err().contains("port range"));
    }
}
