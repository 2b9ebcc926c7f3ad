//! Routing table
//!
//! Longest-prefix match with metric as tie-break. Every mutation rebuilds a
//! sorted working copy so lookups are a single front-to-back scan.

use super::matcher::IpCidr;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

/// Route entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network
    pub destination: IpCidr,
    /// Next hop (None for directly connected)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Outgoing interface name
    pub interface: String,
    /// Lower is preferred
    #[serde(default)]
    pub metric: u32,
}

impl Route {
    /// Directly connected network
    pub fn connected(destination: IpCidr, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: interface.into(),
            metric: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RouteSet {
    /// Insertion order, as handed back by `routes()`
    routes: Vec<Route>,
    /// Prefix length descending, then metric ascending
    lookup_order: Vec<Route>,
}

impl RouteSet {
    fn rebuild(&mut self) {
        self.lookup_order = self.routes.clone();
        // sort_by is stable: equal prefix and metric keep insertion order
        self.lookup_order.sort_by(|a, b| {
            b.destination
                .prefix_len()
                .cmp(&a.destination.prefix_len())
                .then(a.metric.cmp(&b.metric))
        });
    }
}

/// Routing table using longest prefix match
#[derive(Debug, Default)]
pub struct RoutingTable {
    inner: Mutex<RouteSet>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route
    pub fn add(&self, route: Route) {
        debug!(
            destination = %route.destination,
            interface = %route.interface,
            metric = route.metric,
            "route added"
        );
        let mut set = self.inner.lock();
        set.routes.push(route);
        set.rebuild();
    }

    /// Replace the whole table
    pub fn replace_routes(&self, routes: Vec<Route>) {
        debug!(count = routes.len(), "routes replaced");
        let mut set = self.inner.lock();
        set.routes = routes;
        set.rebuild();
    }

    /// Remove the first route equal to `route`
    pub fn remove_route(&self, route: &Route) -> bool {
        let mut set = self.inner.lock();
        let Some(pos) = set.routes.iter().position(|r| r == route) else {
            return false;
        };
        set.routes.remove(pos);
        set.rebuild();
        debug!(destination = %route.destination, interface = %route.interface, "route removed");
        true
    }

    /// Lookup route using longest prefix match
    pub fn lookup(&self, addr: IpAddr) -> Option<Route> {
        self.inner
            .lock()
            .lookup_order
            .iter()
            .find(|route| route.destination.contains(&addr))
            .cloned()
    }

    /// Get all routes in insertion order
    pub fn routes(&self) -> Vec<Route> {
        self.inner.lock().routes.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().routes.is_empty()
    }
}
