//! Deterministic in-memory datagram link with loss, duplication, reordering
//! and delay.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

/// Link impairments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    /// Chance a datagram is dropped.
    pub loss: f64,
    /// Chance a delivered datagram is delivered twice.
    pub duplicate: f64,
    /// Chance a datagram is held back behind later ones.
    pub reorder: f64,
    /// One-way latency.
    pub latency_ms: u64,
}

impl LinkProfile {
    /// No impairment and no delay.
    pub fn perfect() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            latency_ms: 0,
        }
    }

    /// Drop `loss` of all datagrams, nothing else.
    pub fn lossy(loss: f64) -> Self {
        Self {
            loss,
            ..Self::perfect()
        }
    }
}

/// Counters kept by a [`LossyLink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Datagrams offered.
    pub sent: u64,
    /// Datagrams dropped.
    pub dropped: u64,
    /// Extra copies delivered.
    pub duplicated: u64,
    /// Datagrams held back.
    pub reordered: u64,
}

/// One direction of a simulated network path.
pub struct LossyLink {
    profile: LinkProfile,
    rng: StdRng,
    in_flight: Vec<(Instant, Vec<u8>)>,
    stats: LinkStats,
}

impl LossyLink {
    /// Link seeded for reproducible runs.
    pub fn new(profile: LinkProfile, seed: u64) -> Self {
        Self {
            profile,
            rng: StdRng::seed_from_u64(seed),
            in_flight: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Datagrams not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Offer a datagram at `now`.
    pub fn send(&mut self, bytes: Vec<u8>, now: Instant) {
        self.stats.sent += 1;
        if self.rng.gen_bool(self.profile.loss) {
            self.stats.dropped += 1;
            trace!(len = bytes.len(), "link dropped datagram");
            return;
        }
        let mut due = now + Duration::from_millis(self.profile.latency_ms);
        if self.rng.gen_bool(self.profile.reorder) {
            self.stats.reordered += 1;
            due += Duration::from_millis(self.profile.latency_ms.max(10) * 2);
        }
        if self.rng.gen_bool(self.profile.duplicate) {
            self.stats.duplicated += 1;
            self.in_flight.push((due, bytes.clone()));
        }
        self.in_flight.push((due, bytes));
    }

    /// Datagrams due by `now`, in due order.
    pub fn deliver(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.in_flight.sort_by_key(|(due, _)| *due);
        let ready = self.in_flight.partition_point(|(due, _)| *due <= now);
        self.in_flight.drain(..ready).map(|(_, bytes)| bytes).collect()
    }
}
