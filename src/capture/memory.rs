//! In-memory packet I/O for tests and offline replay

use super::PacketIo;
use crate::packet::Packet;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A transmitted packet as the wire would see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub egress: String,
    pub data: Vec<u8>,
}

/// Preloaded raw datagrams in, recorded packets out
///
/// Every packet handed out by `read` carries a release callback that bumps
/// [`MemoryIo::released`], so tests can check nothing leaks.
#[derive(Debug)]
pub struct MemoryIo {
    ingress: String,
    pending: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Written>>,
    handed_out: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MemoryIo {
    pub fn new(ingress: impl Into<String>) -> Self {
        Self {
            ingress: ingress.into(),
            pending: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            handed_out: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_packets(ingress: impl Into<String>, packets: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let io = Self::new(ingress);
        io.pending.lock().extend(packets);
        io
    }

    /// One hex-encoded datagram per line; blank lines and `#` comments are skipped
    pub fn from_hex_lines(ingress: impl Into<String>, text: &str) -> Result<Self> {
        let io = Self::new(ingress);
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let digits: String = line.split_whitespace().collect();
            let data = hex::decode(&digits)
                .map_err(|e| Error::Parse(format!("line {}: {}", lineno + 1, e)))?;
            io.push(data);
        }
        Ok(io)
    }

    pub fn push(&self, data: Vec<u8>) {
        self.pending.lock().push_back(data);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Everything written so far, in write order
    pub fn written(&self) -> Vec<Written> {
        self.written.lock().clone()
    }

    /// Packets successfully parsed and handed to the caller
    pub fn handed_out(&self) -> usize {
        self.handed_out.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl PacketIo for MemoryIo {
    async fn read(&self) -> Result<Packet> {
        let data = self.pending.lock().pop_front().ok_or(Error::Closed)?;
        let packet = Packet::parse(data, self.ingress.clone())?;
        self.handed_out.fetch_add(1, Ordering::SeqCst);

        let released = self.released.clone();
        Ok(packet.with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        self.written.lock().push(Written {
            egress: packet.egress.clone(),
            data: packet.data.clone(),
        });
        Ok(())
    }
}
