//! Metrics collection for packet statistics.
//!
//! Provides thread-safe counters for the packet pipeline at both the
//! global and per-interface level. Only the orchestration layer writes
//! them; the engines keep their own hit counters.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface statistics.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    /// Number of packets received.
    pub rx_packets: Counter,
    /// Number of bytes received.
    pub rx_bytes: Counter,
    /// Number of packets transmitted.
    pub tx_packets: Counter,
    /// Number of bytes transmitted.
    pub tx_bytes: Counter,
    /// Number of transmit errors.
    pub tx_errors: Counter,
}

impl InterfaceStats {
    /// Creates new interface statistics initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received packet.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    /// Records a transmitted packet.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    /// Records a transmit error.
    pub fn record_tx_error(&self) {
        self.tx_errors.inc();
    }
}

/// Counters for the whole data plane.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Per-interface statistics, created on first use.
    interfaces: RwLock<BTreeMap<String, InterfaceStats>>,

    // Ingest
    /// Buffers that failed to parse.
    pub rx_errors: Counter,
    /// Packets whose destination had no route.
    pub no_route: Counter,
    /// Packets rewritten by NAT.
    pub nat_translated: Counter,

    // Firewall verdicts
    pub filter_accepted: Counter,
    pub filter_dropped: Counter,
    pub filter_rejected: Counter,

    // IDS
    /// Alerts raised.
    pub ids_alerts: Counter,
    /// Packets the IDS turned from accept into drop.
    pub ids_blocked: Counter,

    // QoS
    pub qos_enqueued: Counter,
    /// Packets lost to a full queue (arriving or evicted).
    pub qos_dropped: Counter,

    // Egress
    pub packets_transmitted: Counter,
    pub tx_errors: Counter,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_interface(&self, interface: &str, f: impl FnOnce(&InterfaceStats)) {
        if let Some(stats) = self.interfaces.read().get(interface) {
            f(stats);
            return;
        }
        let mut interfaces = self.interfaces.write();
        f(interfaces.entry(interface.to_string()).or_default());
    }

    /// Records a received packet on an interface.
    pub fn record_rx(&self, interface: &str, bytes: usize) {
        self.with_interface(interface, |stats| stats.record_rx(bytes));
    }

    /// Records a transmitted packet on an interface.
    pub fn record_tx(&self, interface: &str, bytes: usize) {
        self.packets_transmitted.inc();
        self.with_interface(interface, |stats| stats.record_tx(bytes));
    }

    /// Records a transmit error on an interface.
    pub fn record_tx_error(&self, interface: &str) {
        self.tx_errors.inc();
        self.with_interface(interface, |stats| stats.record_tx_error());
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("rx_errors".into(), self.rx_errors.get()),
            ("no_route".into(), self.no_route.get()),
            ("nat_translated".into(), self.nat_translated.get()),
            ("filter_accepted".into(), self.filter_accepted.get()),
            ("filter_dropped".into(), self.filter_dropped.get()),
            ("filter_rejected".into(), self.filter_rejected.get()),
            ("ids_alerts".into(), self.ids_alerts.get()),
            ("ids_blocked".into(), self.ids_blocked.get()),
            ("qos_enqueued".into(), self.qos_enqueued.get()),
            ("qos_dropped".into(), self.qos_dropped.get()),
            ("packets_transmitted".into(), self.packets_transmitted.get()),
            ("tx_errors".into(), self.tx_errors.get()),
        ];

        let interfaces = self.interfaces.read();
        for (name, stats) in interfaces.iter() {
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_tx_errors", name), stats.tx_errors.get()),
            ]);
        }

        result
    }

    /// Single metric by its exported name
    pub fn get(&self, name: &str) -> Option<u64> {
        self.export()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}
