//! Configuration validation

use super::Config;
use crate::dataplane::{Chain, NatKind, DEFAULT_CLASS};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }

    fn check<T>(&mut self, path: impl std::fmt::Display, converted: Result<T, String>) -> Option<T> {
        match converted {
            Ok(value) => Some(value),
            Err(e) => {
                self.error(format!("{}: {}", path, e));
                None
            }
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_logging(config, &mut result);
    validate_dataplane(config, &mut result);
    validate_routes(config, &mut result);
    validate_firewall(config, &mut result);
    validate_nat(config, &mut result);
    validate_qos(config, &mut result);
    validate_ids(config, &mut result);

    result
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    for unknown in config.logging.unknown_fields() {
        result.warn(format!("logging: unknown {}, using default", unknown));
    }
}

fn validate_dataplane(config: &Config, result: &mut ValidationResult) {
    let dataplane = &config.dataplane;
    result.check("dataplane.local_addresses", dataplane.to_local_addresses());

    if dataplane.egress_batch == Some(0) {
        result.error("dataplane.egress_batch: must be at least 1");
    }
    if dataplane.maintenance_interval_secs == Some(0) {
        result.error("dataplane.maintenance_interval_secs: must be at least 1");
    }
    if dataplane.local_addresses.is_empty() {
        result.warn("dataplane.local_addresses: none set, all traffic uses the FORWARD chain");
    }
}

fn validate_routes(config: &Config, result: &mut ValidationResult) {
    for (i, route) in config.routes.iter().enumerate() {
        result.check(format!("routes[{}]", i), route.to_route());

        if route.interface.trim().is_empty() {
            result.error(format!("routes[{}]: interface is empty", i));
        }
    }
}

fn validate_firewall(config: &Config, result: &mut ValidationResult) {
    let firewall = &config.firewall;

    if let Some(defaults) = result.check("firewall.defaults", firewall.to_defaults()) {
        for chain in [Chain::Input, Chain::Output, Chain::Forward] {
            if !defaults.contains_key(&chain) {
                result.warn(format!(
                    "firewall.defaults: no policy for {}, using DROP",
                    chain
                ));
            }
        }
    }

    for (i, rule) in firewall.rules.iter().enumerate() {
        result.check(format!("firewall.rules[{}]", i), rule.to_rule());
    }
}

fn validate_nat(config: &Config, result: &mut ValidationResult) {
    for (i, cfg) in config.nat.rules.iter().enumerate() {
        let Some(rule) = result.check(format!("nat.rules[{}]", i), cfg.to_rule()) else {
            continue;
        };

        let unscoped = match rule.kind {
            NatKind::Snat => rule.src.is_none(),
            NatKind::Dnat => rule.dst.is_none() && rule.dst_port.is_none(),
        };
        if unscoped {
            result.warn(format!(
                "nat.rules[{}]: {} rule matches every flow",
                i, rule.kind
            ));
        }
    }
}

fn validate_qos(config: &Config, result: &mut ValidationResult) {
    let mut seen = HashSet::new();

    for (i, cfg) in config.qos.classes.iter().enumerate() {
        if cfg.name.trim().is_empty() {
            result.error(format!("qos.classes[{}]: name is empty", i));
        } else if !seen.insert(cfg.name.as_str()) {
            result.error(format!(
                "qos.classes[{}]: duplicate class name '{}'",
                i, cfg.name
            ));
        }

        let Some(class) = result.check(format!("qos.classes[{}]", i), cfg.to_class()) else {
            continue;
        };

        if class.is_default() {
            if class.protocol.is_some() || class.src_port.is_some() || class.dst_port.is_some() {
                result.warn(format!(
                    "qos.classes[{}]: match fields on '{}' are ignored, it catches all unmatched traffic",
                    i, DEFAULT_CLASS
                ));
            }
            if cfg.priority.is_some() {
                result.warn(format!(
                    "qos.classes[{}]: priority on '{}' is ignored, it is always dequeued last",
                    i, DEFAULT_CLASS
                ));
            }
        }
    }
}

fn validate_ids(config: &Config, result: &mut ValidationResult) {
    let ids = &config.ids;

    if ids.window_secs == Some(0) {
        result.error("ids.window_secs: must be at least 1");
    }
    if let Some(settings) = result.check("ids", ids.to_config()) {
        if settings.rate_threshold == 0
            && settings.port_scan_threshold == 0
            && settings.unique_dst_threshold == 0
        {
            result.warn("ids: all behavioural thresholds are 0, only signatures are checked");
        }
        if settings.max_alerts == 0 {
            result.warn("ids.max_alerts: 0, alerts will not be kept");
        }
    }

    for (i, cfg) in ids.rules.iter().enumerate() {
        result.check(format!("ids.rules[{}]", i), cfg.to_rule());
        if cfg.payload_contains.as_deref() == Some("") {
            result.warn(format!(
                "ids.rules[{}]: empty payload_contains matches every packet",
                i
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = parse(
            r#"
            [dataplane]
            local_addresses = ["10.0.0.1"]

            [firewall.defaults]
            INPUT = "DROP"
            OUTPUT = "ACCEPT"
            FORWARD = "ACCEPT"
            "#,
        );
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_defaults_warn() {
        let result = validate(&Config::default());
        assert!(!result.has_errors());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("no policy for FORWARD")));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let config = parse(
            r#"
            [[routes]]
            destination = "10.0.0.0/40"
            interface = "eth0"

            [firewall.defaults]
            FORWARD = "maybe"

            [[firewall.rules]]
            chain = "INPUT"
            action = "ACCEPT"
            protocol = "sctp"

            [[nat.rules]]
            type = "SNAT"
            src = "10.0.0.0/8"
            to_ip = "not-an-ip"

            [[ids.rules]]
            name = "x"
            dst_port = "90-80"
            "#,
        );
        let result = validate(&config);
        assert_eq!(result.errors.len(), 5, "{:?}", result.errors);
        assert!(result.errors[0].starts_with("routes[0]"));
        assert!(result.errors.iter().any(|e| e.starts_with("firewall.defaults")));
        assert!(result.errors.iter().any(|e| e.starts_with("firewall.rules[0]")));
        assert!(result.errors.iter().any(|e| e.starts_with("nat.rules[0]")));
        assert!(result.errors.iter().any(|e| e.starts_with("ids.rules[0]")));
    }

    #[test]
    fn test_duplicate_qos_class() {
        let config = parse(
            r#"
            [[qos.classes]]
            name = "voice"
            priority = 10

            [[qos.classes]]
            name = "voice"
            priority = 5
            "#,
        );
        let result = validate(&config);
        assert!(result.has_errors());
        assert!(result.errors[0].contains("duplicate class name 'voice'"));
    }

    #[test]
    fn test_default_class_fields_ignored() {
        let config = parse(
            r#"
            [[qos.classes]]
            name = "default"
            protocol = "TCP"
            priority = 99
            max_queue = 128
            "#,
        );
        let result = validate(&config);
        assert!(!result.has_errors());
        let about_default: Vec<_> = result
            .warnings
            .iter()
            .filter(|w| w.starts_with("qos.classes[0]"))
            .collect();
        assert_eq!(about_default.len(), 2);
    }

    #[test]
    fn test_unscoped_nat_rule_warns() {
        let config = parse(
            r#"
            [[nat.rules]]
            type = "dnat"
            to_ip = "192.168.1.10"
            "#,
        );
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("DNAT rule matches every flow")));
    }

    #[test]
    fn test_zero_values() {
        let config = parse(
            r#"
            [dataplane]
            egress_batch = 0

            [ids]
            window_secs = 0
            rate_threshold = 0
            port_scan_threshold = 0
            "#,
        );
        let result = validate(&config);
        assert_eq!(result.errors.len(), 2);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("only signatures are checked")));
    }
}
