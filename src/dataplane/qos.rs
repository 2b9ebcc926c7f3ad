//! QoS queue manager
//!
//! Packets are classified into named classes, queued per class, and
//! dequeued in strict priority order. Rate-limited classes draw from a
//! token bucket; a class without enough tokens is skipped so it never
//! blocks lower-priority traffic. A saturated unlimited high-priority class
//! can starve everything below it.

use super::matcher::{port_matches, protocol_matches, PortRange};
use crate::clock::{self, SharedClock};
use crate::packet::Packet;
use crate::protocol::IpProtocol;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::debug;

/// Reserved catch-all class; always present, always dequeued last
pub const DEFAULT_CLASS: &str = "default";

/// What to do when a class queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Reject the arriving packet
    #[default]
    Tail,
    /// Evict the oldest queued packet and accept the arriving one
    Head,
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tail" => Ok(DropPolicy::Tail),
            "head" => Ok(DropPolicy::Head),
            _ => Err(format!("unknown drop policy '{}'", s)),
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropPolicy::Tail => "tail",
            DropPolicy::Head => "head",
        })
    }
}

/// Traffic class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosClass {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<IpProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<PortRange>,
    /// 0 = unlimited
    #[serde(default)]
    pub rate_kbps: u64,
    /// Higher is dequeued first
    #[serde(default)]
    pub priority: i32,
    /// 0 = unbounded
    #[serde(default)]
    pub max_queue: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

impl QosClass {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            protocol: None,
            src_port: None,
            dst_port: None,
            rate_kbps: 0,
            priority,
            max_queue: 0,
            drop_policy: DropPolicy::Tail,
        }
    }

    /// The implicit catch-all class
    pub fn default_class() -> Self {
        Self::new(DEFAULT_CLASS, 0)
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CLASS
    }

    fn matches(&self, packet: &Packet) -> bool {
        let meta = &packet.meta;
        protocol_matches(self.protocol, meta.protocol)
            && port_matches(&self.src_port, meta.src_port)
            && port_matches(&self.dst_port, meta.dst_port)
    }
}

/// Result of [`QosManager::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The arriving packet is queued
    pub accepted: bool,
    /// Some packet (the arriving one under tail drop, the oldest under head drop) was discarded
    pub dropped: bool,
    pub class: String,
}

/// Per-class counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub name: String,
    pub queued: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
}

/// Token bucket in bytes; capacity equals one second of traffic
#[derive(Debug, Clone)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_kbps: u64, now: Instant) -> Self {
        let rate = rate_kbps as f64 * 1000.0 / 8.0;
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Debit `bytes` if available. A packet larger than the whole bucket
    /// goes out once the bucket is full, otherwise it could never leave.
    fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let bytes = bytes as f64;
        if bytes <= self.tokens {
            self.tokens -= bytes;
            true
        } else if bytes > self.capacity && self.tokens >= self.capacity {
            self.tokens = 0.0;
            true
        } else {
            false
        }
    }
}

struct ClassQueue {
    class: QosClass,
    queue: VecDeque<Packet>,
    bucket: Option<TokenBucket>,
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
}

impl ClassQueue {
    fn new(class: QosClass, now: Instant) -> Self {
        let bucket = Self::bucket_for(&class, now);
        Self {
            class,
            queue: VecDeque::new(),
            bucket,
            enqueued: 0,
            dequeued: 0,
            dropped: 0,
        }
    }

    fn bucket_for(class: &QosClass, now: Instant) -> Option<TokenBucket> {
        (class.rate_kbps > 0).then(|| TokenBucket::new(class.rate_kbps, now))
    }

    /// Install a new definition, keeping queued packets and counters
    fn redefine(&mut self, class: QosClass, now: Instant) {
        if class.rate_kbps != self.class.rate_kbps {
            self.bucket = Self::bucket_for(&class, now);
        }
        self.class = class;
    }

    fn stats(&self) -> ClassStats {
        ClassStats {
            name: self.class.name.clone(),
            queued: self.queue.len(),
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            dropped: self.dropped,
        }
    }
}

struct QosState {
    /// Non-default classes by descending priority, `default` last
    classes: Vec<ClassQueue>,
}

impl QosState {
    fn sort(&mut self) {
        // Stable: equal priorities keep insertion order
        self.classes.sort_by(|a, b| {
            a.class
                .is_default()
                .cmp(&b.class.is_default())
                .then(b.class.priority.cmp(&a.class.priority))
        });
    }

    fn ensure_default(&mut self, now: Instant) {
        if !self.classes.iter().any(|c| c.class.is_default()) {
            self.classes
                .push(ClassQueue::new(QosClass::default_class(), now));
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.class.name == name)
    }

    fn classify(&self, packet: &Packet) -> usize {
        let last = self.classes.len() - 1;
        self.classes
            .iter()
            .position(|c| !c.class.is_default() && c.class.matches(packet))
            .unwrap_or(last)
    }
}

/// Priority queue manager
pub struct QosManager {
    inner: Mutex<QosState>,
    clock: SharedClock,
}

impl QosManager {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        let mut state = QosState {
            classes: Vec::new(),
        };
        state.ensure_default(clock.now());
        Self {
            inner: Mutex::new(state),
            clock,
        }
    }

    /// Classify and queue a packet.
    ///
    /// Discarded packets are released after the lock is dropped.
    pub fn enqueue(&self, packet: Packet) -> EnqueueOutcome {
        let (outcome, discarded) = {
            let mut state = self.inner.lock();
            let idx = state.classify(&packet);
            let cq = &mut state.classes[idx];
            let class = cq.class.name.clone();
            let full = cq.class.max_queue > 0 && cq.queue.len() >= cq.class.max_queue;

            if !full {
                cq.queue.push_back(packet);
                cq.enqueued += 1;
                let outcome = EnqueueOutcome {
                    accepted: true,
                    dropped: false,
                    class,
                };
                (outcome, None)
            } else {
                cq.dropped += 1;
                match cq.class.drop_policy {
                    DropPolicy::Tail => {
                        let outcome = EnqueueOutcome {
                            accepted: false,
                            dropped: true,
                            class,
                        };
                        (outcome, Some(packet))
                    }
                    DropPolicy::Head => {
                        let evicted = cq.queue.pop_front();
                        cq.queue.push_back(packet);
                        cq.enqueued += 1;
                        let outcome = EnqueueOutcome {
                            accepted: true,
                            dropped: true,
                            class,
                        };
                        (outcome, evicted)
                    }
                }
            }
        };

        if discarded.is_some() {
            debug!(class = %outcome.class, accepted = outcome.accepted, "QoS queue full, packet dropped");
        }
        drop(discarded);
        outcome
    }

    /// Take the next packet by strict priority and rate limit
    pub fn dequeue(&self) -> Option<Packet> {
        let now = self.clock.now();
        let mut state = self.inner.lock();

        for cq in state.classes.iter_mut() {
            let Some(head) = cq.queue.front() else {
                continue;
            };
            if let Some(bucket) = cq.bucket.as_mut() {
                if !bucket.try_consume(head.len(), now) {
                    continue;
                }
            }
            cq.dequeued += 1;
            return cq.queue.pop_front();
        }
        None
    }

    /// Up to `max` packets, stopping early once nothing is eligible
    pub fn dequeue_batch(&self, max: usize) -> Vec<Packet> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.dequeue() {
                Some(packet) => batch.push(packet),
                None => break,
            }
        }
        batch
    }

    pub fn add_class(&self, class: QosClass) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        if state.position(&class.name).is_some() {
            return Err(Error::DuplicateClass(class.name));
        }
        debug!(name = %class.name, priority = class.priority, rate_kbps = class.rate_kbps, "QoS class added");
        state.classes.push(ClassQueue::new(class, now));
        state.sort();
        Ok(())
    }

    /// Remove a class and discard its queue; `default` cannot be removed
    pub fn remove_class(&self, name: &str) -> bool {
        if name == DEFAULT_CLASS {
            return false;
        }
        let removed = {
            let mut state = self.inner.lock();
            match state.position(name) {
                Some(idx) => state.classes.remove(idx),
                None => return false,
            }
        };
        debug!(name, discarded = removed.queue.len(), "QoS class removed");
        true
    }

    /// Redefine the class with the same name; its queue is kept
    pub fn update_class(&self, class: QosClass) -> bool {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        let Some(idx) = state.position(&class.name) else {
            return false;
        };
        debug!(name = %class.name, priority = class.priority, "QoS class updated");
        state.classes[idx].redefine(class, now);
        state.sort();
        true
    }

    /// Install a new class set. Queues of classes whose name survives are
    /// kept; the rest are discarded. `default` is added if missing.
    pub fn replace_classes(&self, classes: Vec<QosClass>) {
        let now = self.clock.now();
        let discarded = {
            let mut state = self.inner.lock();
            let mut old = std::mem::take(&mut state.classes);

            for class in classes {
                if state.position(&class.name).is_some() {
                    continue;
                }
                let entry = match old.iter().position(|c| c.class.name == class.name) {
                    Some(idx) => {
                        let mut existing = old.swap_remove(idx);
                        existing.redefine(class, now);
                        existing
                    }
                    None => ClassQueue::new(class, now),
                };
                state.classes.push(entry);
            }

            if state.position(DEFAULT_CLASS).is_none() {
                match old.iter().position(|c| c.class.is_default()) {
                    Some(idx) => {
                        let existing = old.swap_remove(idx);
                        state.classes.push(existing);
                    }
                    None => state.ensure_default(now),
                }
            }
            state.sort();
            debug!(count = state.classes.len(), "QoS classes replaced");
            old
        };
        drop(discarded);
    }

    /// Class definitions in dequeue order
    pub fn classes(&self) -> Vec<QosClass> {
        self.inner
            .lock()
            .classes
            .iter()
            .map(|c| c.class.clone())
            .collect()
    }

    pub fn class_stats(&self) -> Vec<ClassStats> {
        self.inner.lock().classes.iter().map(ClassQueue::stats).collect()
    }

    pub fn queue_len(&self, name: &str) -> Option<usize> {
        let state = self.inner.lock();
        state.position(name).map(|idx| state.classes[idx].queue.len())
    }

    pub fn total_queued(&self) -> usize {
        self.inner.lock().classes.iter().map(|c| c.queue.len()).sum()
    }
}

impl Default for QosManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QosManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("QosManager")
            .field("classes", &state.classes.len())
            .field(
                "queued",
                &state.classes.iter().map(|c| c.queue.len()).sum::<usize>(),
            )
            .finish()
    }
}
