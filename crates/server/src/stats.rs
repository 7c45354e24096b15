//! Server-wide counters, shared across worker threads.

use serde::Serialize;
use simwire_net::NetError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated from any worker.
#[derive(Debug, Default)]
pub struct ServerStats {
    datagrams_in: AtomicU64,
    datagrams_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    unroutable: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    trust_drops: AtomicU64,
    rejected_handshakes: AtomicU64,
    refused_handshakes: AtomicU64,
    enqueue_rejected: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    /// Live circuits.
    pub circuits: usize,
    /// Datagrams received.
    pub datagrams_in: u64,
    /// Datagrams produced.
    pub datagrams_out: u64,
    /// Bytes received.
    pub bytes_in: u64,
    /// Bytes produced.
    pub bytes_out: u64,
    /// Datagrams matching no circuit.
    pub unroutable: u64,
    /// Malformed datagrams or messages.
    pub malformed: u64,
    /// Duplicate datagrams.
    pub duplicates: u64,
    /// Messages dropped at the trust boundary.
    pub trust_drops: u64,
    /// Handshakes that did not match the authorized session.
    pub rejected_handshakes: u64,
    /// Handshakes dropped while too many circuits were still establishing.
    pub refused_handshakes: u64,
    /// Enqueues refused.
    pub enqueue_rejected: u64,
}

impl ServerStats {
    pub(crate) fn record_datagram_in(&self, len: usize) {
        self.datagrams_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_datagram_out(&self, len: usize) {
        self.datagrams_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_handshake(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused_handshake(&self) {
        self.refused_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueue_rejected(&self) {
        self.enqueue_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, err: &NetError) {
        let counter = match err {
            NetError::MalformedPacket(m) if m.is_security_relevant() => &self.trust_drops,
            NetError::MalformedPacket(_) => &self.malformed,
            NetError::DuplicateDatagram { .. } => &self.duplicates,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self, circuits: usize) -> ServerStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStatsSnapshot {
            circuits,
            datagrams_in: get(&self.datagrams_in),
            datagrams_out: get(&self.datagrams_out),
            bytes_in: get(&self.bytes_in),
            bytes_out: get(&self.bytes_out),
            unroutable: get(&self.unroutable),
            malformed: get(&self.malformed),
            duplicates: get(&self.duplicates),
            trust_drops: get(&self.trust_drops),
            rejected_handshakes: get(&self.rejected_handshakes),
            refused_handshakes: get(&self.refused_handshakes),
            enqueue_rejected: get(&self.enqueue_rejected),
        }
    }
}
