//! Sequence bookkeeping: pending reliable sends, inbound dedup and ack
//! batching.

use crate::frame::{self, PacketFlags};
use bit_vec::BitVec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Reliability tuning. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// First retransmission timeout.
    pub base_rto_ms: u64,
    /// Ceiling for the doubled timeout.
    pub max_rto_ms: u64,
    /// Transmissions (including the first) before the circuit is declared
    /// unresponsive.
    pub max_attempts: u32,
    /// Inbound sequences remembered for duplicate detection.
    pub dedup_window: u32,
    /// Longest an ack may wait for a piggyback ride.
    pub ack_delay_ms: u64,
    /// Acks appended to a single outbound packet.
    pub max_appended_acks: usize,
    /// Interval between keep-alive probes.
    pub ping_interval_ms: u64,
    /// Silence after which the circuit is closed.
    pub inactivity_timeout_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            base_rto_ms: 500,
            max_rto_ms: 5_000,
            max_attempts: 6,
            dedup_window: 1024,
            ack_delay_ms: 100,
            max_appended_acks: 64,
            ping_interval_ms: 5_000,
            inactivity_timeout_ms: 60_000,
        }
    }
}

impl ReliabilityConfig {
    /// Timeout after the `attempts`-th transmission.
    pub fn rto(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let ms = self.base_rto_ms.saturating_mul(1 << shift).min(self.max_rto_ms);
        Duration::from_millis(ms)
    }

    /// Ack coalescing window.
    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    /// Keep-alive probe interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Inactivity limit.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Signed distance from `from` to `to`, accounting for wrap.
pub fn seq_dist(from: u32, to: u32) -> i64 {
    i64::from(to.wrapping_sub(from) as i32)
}

/// A reliable packet waiting for its ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Assigned sequence.
    pub sequence: u32,
    /// Packet bytes as first sent, without appended acks.
    pub bytes: Vec<u8>,
    /// First transmission.
    pub first_sent_at: Instant,
    /// Most recent transmission.
    pub last_sent_at: Instant,
    /// Transmissions so far.
    pub attempts: u32,
    /// When the next retransmission becomes due.
    pub next_retry_at: Instant,
    queued: bool,
}

/// Result of a timer sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// `(sequence, packet length)` of sends due for retransmission.
    pub resend: Vec<(u32, usize)>,
    /// Sends that ran out of attempts; removed from the table.
    pub gave_up: Vec<PendingSend>,
}

/// Outbound half: sequence assignment and the pending table.
#[derive(Debug)]
pub struct SendWindow {
    next_sequence: u32,
    pending: BTreeMap<u32, PendingSend>,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendWindow {
    /// Window whose first sequence is 1.
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Claim the next sequence. Zero is never issued.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        seq
    }

    /// Record a reliable packet just put on the wire.
    pub fn register(
        &mut self,
        sequence: u32,
        bytes: Vec<u8>,
        now: Instant,
        config: &ReliabilityConfig,
    ) {
        self.pending.insert(
            sequence,
            PendingSend {
                sequence,
                bytes,
                first_sent_at: now,
                last_sent_at: now,
                attempts: 1,
                next_retry_at: now + config.rto(1),
                queued: false,
            },
        );
    }

    /// Remove the matching pending send. Unknown sequences are ignored.
    pub fn ack(&mut self, sequence: u32) -> Option<PendingSend> {
        self.pending.remove(&sequence)
    }

    /// Collect sends whose timer has fired. Each due send is reported once
    /// until [`SendWindow::take_resend`] retransmits it.
    pub fn expired(&mut self, now: Instant, config: &ReliabilityConfig) -> Expired {
        let mut out = Expired::default();
        let mut dead = Vec::new();
        for pending in self.pending.values_mut() {
            if pending.queued || pending.next_retry_at > now {
                continue;
            }
            if pending.attempts >= config.max_attempts {
                dead.push(pending.sequence);
            } else {
                pending.queued = true;
                out.resend.push((pending.sequence, pending.bytes.len()));
            }
        }
        for sequence in dead {
            if let Some(p) = self.pending.remove(&sequence) {
                out.gave_up.push(p);
            }
        }
        out
    }

    /// Bytes to retransmit for `sequence` with the resent flag set; `None`
    /// if it was acked in the meantime.
    pub fn take_resend(
        &mut self,
        sequence: u32,
        now: Instant,
        config: &ReliabilityConfig,
    ) -> Option<Vec<u8>> {
        let pending = self.pending.get_mut(&sequence)?;
        pending.attempts += 1;
        pending.last_sent_at = now;
        pending.next_retry_at = now + config.rto(pending.attempts);
        pending.queued = false;
        let mut bytes = pending.bytes.clone();
        frame::insert_flags(&mut bytes, PacketFlags::RESENT);
        Some(bytes)
    }

    /// Pending sends in sequence order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> {
        self.pending.values()
    }

    /// Number of unacknowledged sends.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lowest unacknowledged sequence.
    pub fn oldest_unacked(&self) -> Option<u32> {
        self.pending
            .values()
            .min_by_key(|p| p.first_sent_at)
            .map(|p| p.sequence)
    }

    /// Drop every pending send.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Outcome of observing an inbound sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    /// First sighting; dispatch.
    New,
    /// Seen within the window; drop.
    Duplicate,
    /// Older than the window; treated as a duplicate.
    Stale,
}

/// Largest dedup window; bigger requests are clamped to it.
pub const MAX_DEDUP_WINDOW: u32 = 1 << 16;

/// Bitmap of recently seen sequences, sliding with the highest one.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    bits: BitVec,
    highest: Option<u32>,
}

impl DedupWindow {
    /// Window remembering at least `size` sequences, up to
    /// [`MAX_DEDUP_WINDOW`]. The size is rounded up to a power of two so slots
    /// stay contiguous across sequence wrap.
    pub fn new(size: u32) -> Self {
        let size = size.clamp(1, MAX_DEDUP_WINDOW).next_power_of_two();
        Self {
            bits: BitVec::from_elem(size as usize, false),
            highest: None,
        }
    }

    fn slot(&self, sequence: u32) -> usize {
        sequence as usize % self.bits.len()
    }

    /// Record `sequence` and classify it.
    pub fn observe(&mut self, sequence: u32) -> SeqStatus {
        let size = self.bits.len() as i64;
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            let slot = self.slot(sequence);
            self.bits.set(slot, true);
            return SeqStatus::New;
        };

        let dist = seq_dist(highest, sequence);
        if dist > 0 {
            if dist >= size {
                self.bits = BitVec::from_elem(self.bits.len(), false);
            } else {
                for step in 1..=dist as u32 {
                    let slot = self.slot(highest.wrapping_add(step));
                    self.bits.set(slot, false);
                }
            }
            self.highest = Some(sequence);
            let slot = self.slot(sequence);
            self.bits.set(slot, true);
            return SeqStatus::New;
        }

        if -dist >= size {
            return SeqStatus::Stale;
        }
        let slot = self.slot(sequence);
        if self.bits.get(slot).unwrap_or(false) {
            SeqStatus::Duplicate
        } else {
            self.bits.set(slot, true);
            SeqStatus::New
        }
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.bits = BitVec::from_elem(self.bits.len(), false);
        self.highest = None;
    }
}

/// Inbound half: dedup plus acks waiting to be sent.
#[derive(Debug)]
pub struct RecvWindow {
    dedup: DedupWindow,
    acks: Vec<u32>,
    oldest_ack_at: Option<Instant>,
    urgent: bool,
}

impl RecvWindow {
    /// Window with the configured dedup size.
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            dedup: DedupWindow::new(config.dedup_window),
            acks: Vec::new(),
            oldest_ack_at: None,
            urgent: false,
        }
    }

    /// Classify an inbound sequence.
    pub fn observe(&mut self, sequence: u32) -> SeqStatus {
        self.dedup.observe(sequence)
    }

    /// Schedule an ack. Duplicates are acked again since the first ack may
    /// have been lost.
    pub fn queue_ack(&mut self, sequence: u32, now: Instant) {
        if !self.acks.contains(&sequence) {
            self.acks.push(sequence);
        }
        self.oldest_ack_at.get_or_insert(now);
    }

    /// Ask for the queued acks to go out on this tick.
    pub fn mark_urgent(&mut self) {
        self.urgent = true;
    }

    /// Whether queued acks should be flushed as a standalone packet.
    pub fn acks_due(&self, now: Instant, config: &ReliabilityConfig) -> bool {
        match self.oldest_ack_at {
            Some(at) => self.urgent || now.duration_since(at) >= config.ack_delay(),
            None => false,
        }
    }

    /// Queued acks.
    pub fn pending_acks(&self) -> &[u32] {
        &self.acks
    }

    /// Remove and return up to `max` queued acks, oldest first.
    pub fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let n = self.acks.len().min(max);
        let taken: Vec<u32> = self.acks.drain(..n).collect();
        if self.acks.is_empty() {
            self.oldest_ack_at = None;
            self.urgent = false;
        }
        taken
    }

    /// Forget queued acks and dedup state.
    pub fn clear(&mut self) {
        self.dedup.reset();
        self.acks.clear();
        self.oldest_ack_at = None;
        self.urgent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReliabilityConfig {
        ReliabilityConfig::default()
    }

    #[test]
    fn rto_doubles_up_to_ceiling() {
        let c = config();
        assert_eq!(c.rto(1), Duration::from_millis(500));
        assert_eq!(c.rto(2), Duration::from_millis(1000));
        assert_eq!(c.rto(3), Duration::from_millis(2000));
        assert_eq!(c.rto(10), Duration::from_millis(5000));
    }

    #[test]
    fn sequences_skip_zero_on_wrap() {
        let mut w = SendWindow::new();
        w.next_sequence = u32::MAX;
        assert_eq!(w.next_sequence(), u32::MAX);
        assert_eq!(w.next_sequence(), 1);
    }

    #[test]
    fn lost_acks_then_delivery_empties_pending() {
        let c = config();
        let mut w = SendWindow::new();
        let start = Instant::now();
        let seq = w.next_sequence();
        w.register(seq, vec![0x40, 0, 0, 0, 1, 0, 1], start, &c);

        let mut now = start;
        let mut resends = 0;
        for _ in 0..3 {
            now += Duration::from_secs(10);
            let expired = w.expired(now, &c);
            assert_eq!(expired.resend, vec![(seq, 7)]);
            let bytes = w.take_resend(seq, now, &c).unwrap();
            assert!(frame::flags(&bytes).contains(PacketFlags::RESENT));
            resends += 1;
        }
        assert!(w.ack(seq).is_some());
        assert_eq!(w.pending_len(), 0);
        assert_eq!(resends, 3);
        assert!(w.ack(seq).is_none());
    }

    #[test]
    fn due_send_is_reported_once_until_resent() {
        let c = config();
        let mut w = SendWindow::new();
        let start = Instant::now();
        w.register(1, vec![0; 8], start, &c);
        let later = start + Duration::from_secs(1);
        assert_eq!(w.expired(later, &c).resend.len(), 1);
        assert!(w.expired(later, &c).resend.is_empty());
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let c = ReliabilityConfig {
            max_attempts: 2,
            ..config()
        };
        let mut w = SendWindow::new();
        let mut now = Instant::now();
        w.register(5, vec![0; 8], now, &c);
        now += Duration::from_secs(10);
        assert_eq!(w.expired(now, &c).resend.len(), 1);
        w.take_resend(5, now, &c).unwrap();
        now += Duration::from_secs(10);
        let expired = w.expired(now, &c);
        assert!(expired.resend.is_empty());
        assert_eq!(expired.gave_up.len(), 1);
        assert_eq!(expired.gave_up[0].attempts, 2);
        assert_eq!(w.pending_len(), 0);
    }

    #[test]
    fn dedup_detects_repeats() {
        let mut d = DedupWindow::new(8);
        assert_eq!(d.observe(1), SeqStatus::New);
        assert_eq!(d.observe(3), SeqStatus::New);
        assert_eq!(d.observe(2), SeqStatus::New);
        assert_eq!(d.observe(3), SeqStatus::Duplicate);
        assert_eq!(d.observe(1), SeqStatus::Duplicate);
    }

    #[test]
    fn dedup_slides_and_ages_out() {
        let mut d = DedupWindow::new(8);
        d.observe(1);
        d.observe(20);
        assert_eq!(d.observe(1), SeqStatus::Stale);
        assert_eq!(d.observe(13), SeqStatus::New);
        assert_eq!(d.observe(20), SeqStatus::Duplicate);
    }

    #[test]
    fn dedup_handles_wrap() {
        let mut d = DedupWindow::new(16);
        d.observe(u32::MAX - 1);
        assert_eq!(d.observe(2), SeqStatus::New);
        assert_eq!(d.observe(u32::MAX), SeqStatus::New);
        assert_eq!(d.observe(u32::MAX - 1), SeqStatus::Duplicate);
    }

    #[test]
    fn oversized_dedup_window_is_clamped() {
        let mut d = DedupWindow::new(u32::MAX);
        assert_eq!(d.bits.len(), MAX_DEDUP_WINDOW as usize);
        assert_eq!(d.observe(u32::MAX - 1), SeqStatus::New);
        assert_eq!(d.observe(u32::MAX - 1), SeqStatus::Duplicate);

        let config = ReliabilityConfig {
            dedup_window: u32::MAX,
            ..ReliabilityConfig::default()
        };
        let mut recv = RecvWindow::new(&config);
        assert_eq!(recv.observe(9), SeqStatus::New);
        assert_eq!(recv.observe(9), SeqStatus::Duplicate);
    }

    #[test]
    fn acks_wait_for_delay_unless_urgent() {
        let c = config();
        let mut r = RecvWindow::new(&c);
        let now = Instant::now();
        r.queue_ack(4, now);
        r.queue_ack(4, now);
        assert_eq!(r.pending_acks(), &[4]);
        assert!(!r.acks_due(now, &c));
        assert!(r.acks_due(now + Duration::from_millis(150), &c));

        r.mark_urgent();
        assert!(r.acks_due(now, &c));
        assert_eq!(r.take_acks(10), vec![4]);
        assert!(!r.acks_due(now, &c));
    }

    #[test]
    fn take_acks_respects_limit() {
        let c = config();
        let mut r = RecvWindow::new(&c);
        let now = Instant::now();
        for seq in 1..=5 {
            r.queue_ack(seq, now);
        }
        assert_eq!(r.take_acks(2), vec![1, 2]);
        assert_eq!(r.pending_acks(), &[3, 4, 5]);
        assert!(r.acks_due(now + Duration::from_secs(1), &c));
    }
}
