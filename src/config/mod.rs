//! Configuration management
//!
//! `config.toml` is parsed into [`Config`], checked by [`validate`], and
//! compiled into engine types. Nothing past [`compile`] re-validates.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::dataplane::{IdsConfig, IdsRule};
use crate::pipeline::Dataplane;
use crate::state::{DataplaneState, DefaultPolicy};
use crate::{Error, Result};
use std::net::IpAddr;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Engine-ready configuration
#[derive(Debug, Clone)]
pub struct Compiled {
    pub state: DataplaneState,
    pub ids_config: IdsConfig,
    pub ids_rules: Vec<IdsRule>,
    pub local_addresses: Vec<IpAddr>,
}

impl Compiled {
    /// Build a data plane on the system clock with this configuration applied
    pub fn into_dataplane(self) -> Dataplane {
        let dataplane =
            Dataplane::new(self.ids_config).with_local_addresses(self.local_addresses);
        dataplane.ids.replace_rules(self.ids_rules);
        crate::state::apply_state(&dataplane, self.state);
        dataplane
    }
}

/// Validate and convert; every validation error is reported at once
pub fn compile(config: &Config) -> Result<Compiled> {
    let result = validate(config);
    if result.has_errors() {
        return Err(Error::Config(result.errors.join("; ")));
    }

    let firewall_defaults = config
        .firewall
        .to_defaults()
        .map_err(Error::Config)?
        .into_iter()
        .map(|(chain, action)| DefaultPolicy { chain, action })
        .collect();

    let state = DataplaneState {
        firewall_defaults,
        firewall_rules: collect(&config.firewall.rules, FirewallRuleConfig::to_rule)?,
        nat_rules: collect(&config.nat.rules, NatRuleConfig::to_rule)?,
        qos_classes: collect(&config.qos.classes, QosClassConfig::to_class)?,
        routes: collect(&config.routes, RouteConfig::to_route)?,
    };

    Ok(Compiled {
        state,
        ids_config: config.ids.to_config().map_err(Error::Config)?,
        ids_rules: collect(&config.ids.rules, IdsRuleConfig::to_rule)?,
        local_addresses: config
            .dataplane
            .to_local_addresses()
            .map_err(Error::Config)?,
    })
}

fn collect<C, T>(items: &[C], convert: impl Fn(&C) -> std::result::Result<T, String>) -> Result<Vec<T>> {
    items
        .iter()
        .map(|item| convert(item).map_err(Error::Config))
        .collect()
}
