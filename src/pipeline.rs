//! Packet pipeline
//!
//! Per packet: routing lookup, NAT, firewall, IDS, then QoS. The ingest and
//! egress loops run as separate tasks and only meet at the QoS queues.

use crate::capture::PacketIo;
use crate::clock::{self, SharedClock};
use crate::dataplane::{
    Action, Alert, Chain, FirewallEngine, IdsConfig, IdsEngine, NatTable, QosManager,
    RoutingTable,
};
use crate::packet::Packet;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What happened to a packet on ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Waiting in a QoS class for egress
    Queued { class: String },
    /// Accepted by policy but the class queue was full under tail drop
    QueueFull { class: String },
    /// Firewall verdict other than accept
    Filtered(Action),
    /// Firewall accepted, IDS dropped
    Blocked { alert: Option<Alert> },
}

/// The five engines plus the counters the loops maintain
pub struct Dataplane {
    pub routing: Arc<RoutingTable>,
    pub firewall: Arc<FirewallEngine>,
    pub nat: Arc<NatTable>,
    pub qos: Arc<QosManager>,
    pub ids: Arc<IdsEngine>,
    pub metrics: Arc<MetricsRegistry>,
    local_addresses: Vec<IpAddr>,
}

impl Dataplane {
    pub fn new(ids_config: IdsConfig) -> Self {
        Self::with_clock(ids_config, clock::system())
    }

    /// All time-dependent engines share `clock`
    pub fn with_clock(ids_config: IdsConfig, clock: SharedClock) -> Self {
        Self {
            routing: Arc::new(RoutingTable::new()),
            firewall: Arc::new(FirewallEngine::new()),
            nat: Arc::new(NatTable::with_clock(clock.clone())),
            qos: Arc::new(QosManager::with_clock(clock.clone())),
            ids: Arc::new(IdsEngine::with_clock(ids_config, clock)),
            metrics: Arc::new(MetricsRegistry::new()),
            local_addresses: Vec::new(),
        }
    }

    /// Addresses owned by the router; traffic to them is filtered on INPUT
    pub fn with_local_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.local_addresses = addresses;
        self
    }

    pub fn local_addresses(&self) -> &[IpAddr] {
        &self.local_addresses
    }

    fn chain_for(&self, packet: &Packet) -> Chain {
        match packet.meta.dst_ip {
            Some(dst) if self.local_addresses.contains(&dst) => Chain::Input,
            _ => Chain::Forward,
        }
    }

    fn route(&self, packet: &mut Packet) {
        let Some(dst) = packet.meta.dst_ip else {
            return;
        };
        match self.routing.lookup(dst) {
            Some(route) => packet.egress = route.interface,
            None => {
                self.metrics.no_route.inc();
                debug!(dst = %dst, "no route");
            }
        }
    }

    /// Run one packet through every engine.
    ///
    /// Packets that do not end up queued are released before this returns.
    pub fn process(&self, mut packet: Packet) -> Disposition {
        let preset_egress = !packet.egress.is_empty();
        if !preset_egress {
            self.route(&mut packet);
        }

        let dst_before = packet.meta.dst_ip;
        let tuple_before = (
            packet.meta.src_ip,
            packet.meta.src_port,
            packet.meta.dst_ip,
            packet.meta.dst_port,
        );
        let mut packet = self.nat.apply(packet);
        let tuple_after = (
            packet.meta.src_ip,
            packet.meta.src_port,
            packet.meta.dst_ip,
            packet.meta.dst_port,
        );
        if tuple_after != tuple_before {
            self.metrics.nat_translated.inc();
            // Destination NAT can change the next hop
            if !preset_egress && packet.meta.dst_ip != dst_before {
                self.route(&mut packet);
            }
        }

        let chain = self.chain_for(&packet);
        let verdict = self.firewall.evaluate(chain, &packet);
        match verdict {
            Action::Accept => self.metrics.filter_accepted.inc(),
            Action::Drop => self.metrics.filter_dropped.inc(),
            Action::Reject => self.metrics.filter_rejected.inc(),
        }

        // Filtered traffic still feeds detection, so scans against closed
        // ports are seen
        let detection = self.ids.detect(&packet);
        if detection.alert.is_some() {
            self.metrics.ids_alerts.inc();
        }

        if verdict != Action::Accept {
            debug!(%chain, %verdict, src = ?packet.meta.src_ip, dst = ?packet.meta.dst_ip, "packet filtered");
            return Disposition::Filtered(verdict);
        }
        if detection.drop {
            self.metrics.ids_blocked.inc();
            return Disposition::Blocked {
                alert: detection.alert,
            };
        }

        let outcome = self.qos.enqueue(packet);
        if outcome.dropped {
            self.metrics.qos_dropped.inc();
        }
        if outcome.accepted {
            self.metrics.qos_enqueued.inc();
            Disposition::Queued {
                class: outcome.class,
            }
        } else {
            Disposition::QueueFull {
                class: outcome.class,
            }
        }
    }

    /// Read and process packets until the source closes or `done` is set
    pub async fn run_ingest<I: PacketIo>(&self, io: &I, mut done: watch::Receiver<bool>) -> Result<()> {
        info!("ingest loop started");
        loop {
            if *done.borrow() {
                break;
            }
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                read = io.read() => match read {
                    Ok(packet) => {
                        self.metrics.record_rx(&packet.ingress, packet.len());
                        let disposition = self.process(packet);
                        debug!(?disposition, "packet processed");
                    }
                    Err(Error::Closed) => {
                        info!("packet source closed");
                        break;
                    }
                    Err(e @ (Error::Parse(_) | Error::PacketTooShort { .. } | Error::UnsupportedVersion(_))) => {
                        self.metrics.rx_errors.inc();
                        debug!(error = %e, "discarding malformed packet");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        info!("ingest loop stopped");
        Ok(())
    }

    /// Dequeue up to `batch` packets and write them; returns how many left
    pub async fn egress_once<I: PacketIo>(&self, io: &I, batch: usize) -> usize {
        let packets = self.qos.dequeue_batch(batch);
        let count = packets.len();
        for packet in packets {
            let egress = packet.egress.clone();
            let len = packet.len();
            match io.write(packet).await {
                Ok(()) => self.metrics.record_tx(&egress, len),
                Err(e) => {
                    self.metrics.record_tx_error(&egress);
                    warn!(egress = %egress, error = %e, "write failed");
                }
            }
        }
        count
    }

    /// Drain QoS to `io` until `done` is set, sleeping `idle` when nothing
    /// is eligible
    pub async fn run_egress<I: PacketIo>(
        &self,
        io: &I,
        mut done: watch::Receiver<bool>,
        batch: usize,
        idle: Duration,
    ) -> Result<()> {
        info!(batch, "egress loop started");
        loop {
            if *done.borrow() {
                break;
            }
            if self.egress_once(io, batch).await > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
        info!(queued = self.qos.total_queued(), "egress loop stopped");
        Ok(())
    }

    /// Age out NAT flows idle longer than `flow_timeout` and expired IDS
    /// windows, every `interval`
    pub async fn run_maintenance(
        &self,
        mut done: watch::Receiver<bool>,
        interval: Duration,
        flow_timeout: Duration,
    ) {
        let mut timer = tokio::time::interval(interval);
        loop {
            if *done.borrow() {
                break;
            }
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    let flows = self.nat.expire_flows(flow_timeout);
                    let windows = self.ids.prune_windows();
                    if flows > 0 || windows > 0 {
                        debug!(flows, windows, "expired idle state");
                    }
                }
            }
        }
    }
}

impl Default for Dataplane {
    fn default() -> Self {
        Self::new(IdsConfig::default())
    }
}
