//! Per-circuit outbound queues drained in fixed priority order under a byte
//! budget.

use crate::error::EnqueueError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// Outbound queue, in drain order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum OutboundClass {
    /// Control traffic: acks, pings, handshakes.
    Immediate,
    /// Retransmissions of expired reliable sends.
    Resend,
    /// Land layer data.
    Land,
    /// Wind layer data.
    Wind,
    /// Cloud and other generic layer data.
    Cloud,
    /// Ordinary state updates.
    Medium,
    /// Statistics and other deferrable traffic.
    Low,
    /// Asset transfers.
    Asset,
    /// First packet of each texture.
    TextureStart,
    /// Texture data.
    Texture,
    /// Object updates.
    Object,
}

impl OutboundClass {
    /// Every class in drain order.
    pub const ALL: [Self; 11] = [
        Self::Immediate,
        Self::Resend,
        Self::Land,
        Self::Wind,
        Self::Cloud,
        Self::Medium,
        Self::Low,
        Self::Asset,
        Self::TextureStart,
        Self::Texture,
        Self::Object,
    ];

    /// Position in drain order.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// What a queue entry will put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedPacket {
    /// A serialized packet with no sequence assigned yet.
    Fresh {
        /// Packet bytes with a placeholder sequence.
        bytes: Vec<u8>,
        /// Whether the packet must be registered for retransmission.
        reliable: bool,
    },
    /// Retransmit the pending send with this sequence.
    Resend {
        /// Sequence of the pending send.
        sequence: u32,
        /// Size charged against the budget.
        len: usize,
    },
}

/// One queued packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Queue it was placed in.
    pub class: OutboundClass,
    /// Payload.
    pub packet: QueuedPacket,
    /// When it was queued.
    pub enqueued_at: Instant,
}

impl QueueEntry {
    /// Bytes charged against the budget.
    pub fn len(&self) -> usize {
        match &self.packet {
            QueuedPacket::Fresh { bytes, .. } => bytes.len(),
            QueuedPacket::Resend { len, .. } => *len,
        }
    }

    /// Whether the entry carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The eleven queues of one circuit.
#[derive(Debug)]
pub struct OutboundScheduler {
    queues: [VecDeque<QueueEntry>; 11],
    budget: usize,
    max_depth: usize,
}

impl OutboundScheduler {
    /// Scheduler releasing about `budget` bytes per drain, with at most
    /// `max_depth` entries in each queue.
    pub fn new(budget: usize, max_depth: usize) -> Self {
        Self {
            queues: Default::default(),
            budget,
            max_depth,
        }
    }

    /// Per-drain byte budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Change the per-drain byte budget.
    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    /// Queue a fresh packet. The resend queue is reserved for the reliability
    /// engine.
    pub fn push(
        &mut self,
        class: OutboundClass,
        bytes: Vec<u8>,
        reliable: bool,
        now: Instant,
    ) -> Result<(), EnqueueError> {
        if class == OutboundClass::Resend {
            return Err(EnqueueError::ReservedClass(class));
        }
        let queue = &mut self.queues[class.index()];
        if queue.len() >= self.max_depth {
            return Err(EnqueueError::QueueFull {
                class,
                depth: self.max_depth,
            });
        }
        queue.push_back(QueueEntry {
            class,
            packet: QueuedPacket::Fresh { bytes, reliable },
            enqueued_at: now,
        });
        Ok(())
    }

    /// Queue a retransmission. Not subject to the depth limit; the pending
    /// table already bounds it.
    pub fn push_resend(&mut self, sequence: u32, len: usize, now: Instant) {
        self.queues[OutboundClass::Resend.index()].push_back(QueueEntry {
            class: OutboundClass::Resend,
            packet: QueuedPacket::Resend { sequence, len },
            enqueued_at: now,
        });
    }

    /// Drop a queued retransmission whose sequence has been acknowledged.
    pub fn discard_resend(&mut self, sequence: u32) {
        self.queues[OutboundClass::Resend.index()].retain(|e| {
            !matches!(e.packet, QueuedPacket::Resend { sequence: s, .. } if s == sequence)
        });
    }

    /// Whether a retransmission of `sequence` is already queued.
    pub fn has_resend(&self, sequence: u32) -> bool {
        self.queues[OutboundClass::Resend.index()]
            .iter()
            .any(|e| matches!(e.packet, QueuedPacket::Resend { sequence: s, .. } if s == sequence))
    }

    /// Release entries in priority order using the configured budget.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.drain_with(self.budget)
    }

    /// Release entries in priority order, FIFO within a queue, while budget
    /// remains. The entry that exhausts the budget is still released.
    pub fn drain_with(&mut self, budget: usize) -> Vec<QueueEntry> {
        let mut remaining = budget;
        let mut out = Vec::new();
        for queue in &mut self.queues {
            while remaining > 0 {
                let Some(entry) = queue.pop_front() else {
                    break;
                };
                remaining = remaining.saturating_sub(entry.len());
                out.push(entry);
            }
            if remaining == 0 {
                break;
            }
        }
        out
    }

    /// Entries waiting in `class`.
    pub fn len(&self, class: OutboundClass) -> usize {
        self.queues[class.index()].len()
    }

    /// Entries waiting in every queue.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// When the longest-waiting entry was queued.
    pub fn oldest_enqueued(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(VecDeque::front)
            .map(|e| e.enqueued_at)
            .min()
    }

    /// Whether every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fill(s: &mut OutboundScheduler, class: OutboundClass, n: usize, size: usize) {
        for _ in 0..n {
            s.push(class, vec![0; size], false, Instant::now()).unwrap();
        }
    }

    #[test]
    fn classes_are_in_drain_order() {
        for (i, class) in OutboundClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn higher_classes_drain_first() {
        let mut s = OutboundScheduler::new(100, 64);
        fill(&mut s, OutboundClass::Texture, 3, 10);
        fill(&mut s, OutboundClass::Immediate, 3, 10);
        fill(&mut s, OutboundClass::Low, 3, 10);

        let out = s.drain_with(45);
        let classes: Vec<_> = out.iter().map(|e| e.class).collect();
        assert_eq!(
            classes,
            vec![
                OutboundClass::Immediate,
                OutboundClass::Immediate,
                OutboundClass::Immediate,
                OutboundClass::Low,
                OutboundClass::Low,
            ]
        );
        assert_eq!(s.len(OutboundClass::Texture), 3);
        assert_eq!(s.len(OutboundClass::Low), 1);
    }

    #[test]
    fn oversized_entry_still_released() {
        let mut s = OutboundScheduler::new(10, 64);
        fill(&mut s, OutboundClass::Medium, 2, 500);
        let out = s.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(s.len(OutboundClass::Medium), 1);
    }

    #[test]
    fn fifo_within_a_queue() {
        let mut s = OutboundScheduler::new(1000, 64);
        for i in 0..4u8 {
            s.push(OutboundClass::Asset, vec![i], false, Instant::now())
                .unwrap();
        }
        let firsts: Vec<u8> = s
            .drain()
            .into_iter()
            .map(|e| match e.packet {
                QueuedPacket::Fresh { bytes, .. } => bytes[0],
                QueuedPacket::Resend { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn resends_precede_content_and_can_be_discarded() {
        let mut s = OutboundScheduler::new(1000, 64);
        fill(&mut s, OutboundClass::Land, 1, 10);
        s.push_resend(7, 20, Instant::now());
        s.push_resend(8, 20, Instant::now());
        assert!(s.has_resend(7));
        s.discard_resend(7);
        assert!(!s.has_resend(7));

        let out = s.drain();
        assert_eq!(out[0].packet, QueuedPacket::Resend { sequence: 8, len: 20 });
        assert_eq!(out[1].class, OutboundClass::Land);
    }

    #[test]
    fn depth_limit_rejects() {
        let mut s = OutboundScheduler::new(1000, 2);
        fill(&mut s, OutboundClass::Object, 2, 1);
        assert_eq!(
            s.push(OutboundClass::Object, vec![1], false, Instant::now()),
            Err(EnqueueError::QueueFull {
                class: OutboundClass::Object,
                depth: 2
            })
        );
        assert!(s
            .push(OutboundClass::Medium, vec![1], false, Instant::now())
            .is_ok());
    }

    #[test]
    fn resend_queue_is_reserved() {
        let mut s = OutboundScheduler::new(1000, 2);
        assert!(matches!(
            s.push(OutboundClass::Resend, vec![1], true, Instant::now()),
            Err(EnqueueError::ReservedClass(OutboundClass::Resend))
        ));
    }

    #[test]
    fn oldest_entry_spans_queues() {
        let t0 = Instant::now();
        let mut s = OutboundScheduler::new(0, 8);
        assert_eq!(s.oldest_enqueued(), None);
        s.push(OutboundClass::Asset, vec![1], false, t0 + Duration::from_secs(2))
            .unwrap();
        s.push(OutboundClass::Object, vec![1], false, t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(s.oldest_enqueued(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn zero_budget_releases_nothing() {
        let mut s = OutboundScheduler::new(0, 8);
        fill(&mut s, OutboundClass::Immediate, 1, 1);
        assert!(s.drain().is_empty());
        assert_eq!(s.total_len(), 1);
    }
}
