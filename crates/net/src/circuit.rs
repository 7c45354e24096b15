//! One circuit: state machine, reliability, ack batching, keep-alive and the
//! outbound scheduler for a single `(endpoint, circuit code)` pair.

use crate::error::{EnqueueError, EncodeError, Malformed, NetError};
use crate::frame::{self, PacketFlags};
use crate::message::typed::{
    AgentThrottle, CloseCircuit, CompletePingCheck, LayerData, LogoutReply, LogoutRequest,
    PacketAck, StartPingCheck, TypedMessage, UseCircuitCode,
};
use crate::message::{ids, Listener, Message, MessageRegistry, PayloadKind, PriorityClass};
use crate::reliability::{RecvWindow, ReliabilityConfig, SendWindow, SeqStatus};
use crate::scheduler::{OutboundClass, OutboundScheduler, QueuedPacket};
use crate::terrain::{self, DecodedLayer};
use serde::{Deserialize, Serialize};
use simwire_core::{AgentSession, CircuitKey};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Waiting for the handshake to be authorized.
    Establishing,
    /// Normal operation.
    Active,
    /// No new enqueues; pending reliable sends still retried.
    Draining,
    /// Released; inbound is discarded.
    Closed,
}

/// Why a circuit left `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The viewer logged out.
    Logout,
    /// The simulation asked for the disconnect.
    Requested,
    /// The remote side sent `CloseCircuit`.
    ClosedByPeer,
    /// A reliable send ran out of attempts.
    Unresponsive,
    /// Nothing arrived within the inactivity timeout.
    TimedOut,
    /// The handshake did not match the authorized session.
    Rejected,
}

/// Per-send reliability choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reliability {
    /// Use the descriptor's default.
    #[default]
    Default,
    /// Always acknowledge and retransmit.
    Reliable,
    /// Fire and forget.
    Unreliable,
}

impl Reliability {
    /// Resolve against a descriptor default.
    pub fn resolve(self, descriptor_default: bool) -> bool {
        match self {
            Self::Default => descriptor_default,
            Self::Reliable => true,
            Self::Unreliable => false,
        }
    }
}

/// Runtime settings for a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Retransmission, dedup, ack and keep-alive tuning.
    pub reliability: ReliabilityConfig,
    /// Largest datagram produced.
    pub max_packet_size: usize,
    /// Largest zero-decoded body accepted.
    pub max_decoded_size: usize,
    /// Bytes the scheduler releases per tick.
    pub budget_bytes: usize,
    /// Entries per outbound queue.
    pub max_queue_depth: usize,
    /// Terrain patches along one side of the region.
    pub patches_per_side: u32,
    /// Ticks per second, used to turn viewer throttles into a budget.
    pub tick_rate_hz: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            reliability: ReliabilityConfig::default(),
            max_packet_size: 1200,
            max_decoded_size: 8192,
            budget_bytes: 7_500,
            max_queue_depth: 512,
            patches_per_side: 16,
            tick_rate_hz: 20,
        }
    }
}

/// Running counters for one circuit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitStats {
    /// Datagrams received.
    pub packets_in: u64,
    /// Datagrams sent.
    pub packets_out: u64,
    /// Bytes received.
    pub bytes_in: u64,
    /// Bytes sent.
    pub bytes_out: u64,
    /// Retransmissions sent.
    pub resends: u64,
    /// Inbound duplicates dropped.
    pub duplicates: u64,
    /// Inbound datagrams or messages dropped as malformed.
    pub malformed: u64,
    /// Inbound messages dropped at the trust boundary.
    pub trust_drops: u64,
    /// Acks sent, appended or standalone.
    pub acks_sent: u64,
    /// Acks received that matched a pending send.
    pub acks_received: u64,
    /// Terrain patches dropped on decode.
    pub patches_rejected: u64,
    /// Smoothed round-trip time in milliseconds.
    pub srtt_ms: Option<f64>,
    /// Reliable sends awaiting acknowledgement.
    pub pending_reliable: usize,
}

/// What an inbound datagram produced for the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    /// A decoded message.
    Message(Message),
    /// A decoded terrain layer.
    Terrain(DecodedLayer),
    /// The viewer presented its circuit code.
    Handshake(UseCircuitCode),
}

/// State for one `(endpoint, circuit code)` pair.
#[derive(Debug)]
pub struct Circuit {
    key: CircuitKey,
    listener: Listener,
    state: CircuitState,
    config: CircuitConfig,
    send: SendWindow,
    recv: RecvWindow,
    scheduler: OutboundScheduler,
    stats: CircuitStats,
    session: Option<AgentSession>,
    handshake: Option<UseCircuitCode>,
    drain_reason: Option<DisconnectReason>,
    disconnect: Option<DisconnectReason>,
    last_inbound_at: Instant,
    last_ping_at: Instant,
    ping_id: u8,
    outstanding_ping: Option<(u8, Instant)>,
    srtt: Option<Duration>,
}

impl Circuit {
    /// A viewer circuit awaiting authorization.
    pub fn new(key: CircuitKey, listener: Listener, config: CircuitConfig, now: Instant) -> Self {
        let recv = RecvWindow::new(&config.reliability);
        let scheduler = OutboundScheduler::new(config.budget_bytes, config.max_queue_depth);
        Self {
            key,
            listener,
            state: CircuitState::Establishing,
            config,
            send: SendWindow::new(),
            recv,
            scheduler,
            stats: CircuitStats::default(),
            session: None,
            handshake: None,
            drain_reason: None,
            disconnect: None,
            last_inbound_at: now,
            last_ping_at: now,
            ping_id: 0,
            outstanding_ping: None,
            srtt: None,
        }
    }

    /// A circuit to a trusted peer simulator; active immediately.
    pub fn new_trusted(key: CircuitKey, config: CircuitConfig, now: Instant) -> Self {
        let mut circuit = Self::new(key, Listener::Peer, config, now);
        circuit.state = CircuitState::Active;
        circuit
    }

    /// Identity.
    pub fn key(&self) -> CircuitKey {
        self.key
    }

    /// Listener the circuit belongs to.
    pub fn listener(&self) -> Listener {
        self.listener
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Authorized session, once active.
    pub fn session(&self) -> Option<AgentSession> {
        self.session
    }

    /// Handshake presented by the viewer, if any.
    pub fn handshake(&self) -> Option<&UseCircuitCode> {
        self.handshake.as_ref()
    }

    /// Smoothed round-trip time.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            srtt_ms: self.srtt.map(|d| d.as_secs_f64() * 1000.0),
            pending_reliable: self.send.pending_len(),
            ..self.stats.clone()
        }
    }

    /// Outbound scheduler, for inspection.
    pub fn scheduler(&self) -> &OutboundScheduler {
        &self.scheduler
    }

    /// Reliable sends awaiting acknowledgement.
    pub fn pending_reliable(&self) -> usize {
        self.send.pending_len()
    }

    /// Reason the circuit closed, reported once.
    pub fn take_disconnect(&mut self) -> Option<DisconnectReason> {
        self.disconnect.take()
    }

    /// Authorize the circuit for `session`.
    pub fn activate(&mut self, session: AgentSession, now: Instant) -> bool {
        if self.state != CircuitState::Establishing {
            return false;
        }
        debug!(circuit = %self.key, agent = %session.agent_id, "circuit active");
        self.state = CircuitState::Active;
        self.session = Some(session);
        self.last_ping_at = now;
        true
    }

    /// Stop accepting enqueues and close once pending sends settle.
    pub fn begin_drain(&mut self, reason: DisconnectReason) {
        match self.state {
            CircuitState::Active => {
                debug!(circuit = %self.key, ?reason, "circuit draining");
                self.state = CircuitState::Draining;
                self.drain_reason = Some(reason);
            }
            CircuitState::Establishing => self.close(reason),
            CircuitState::Draining | CircuitState::Closed => {}
        }
    }

    /// Close now, releasing pending sends, dedup state and queues.
    pub fn close(&mut self, reason: DisconnectReason) {
        if self.state == CircuitState::Closed {
            return;
        }
        debug!(circuit = %self.key, ?reason, "circuit closed");
        self.state = CircuitState::Closed;
        self.send.clear();
        self.recv.clear();
        self.scheduler.clear();
        self.outstanding_ping = None;
        self.disconnect = Some(reason);
    }

    /// Process one inbound datagram.
    ///
    /// Appended acks are applied and the sequence is recorded for
    /// acknowledgement before the body is decoded, so a malformed or
    /// duplicate body is still acked.
    pub fn receive(
        &mut self,
        registry: &MessageRegistry,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Option<CircuitEvent>, NetError> {
        if self.state == CircuitState::Closed {
            trace!(circuit = %self.key, "discarding datagram for closed circuit");
            return Ok(None);
        }
        self.stats.packets_in += 1;
        self.stats.bytes_in += datagram.len() as u64;
        self.last_inbound_at = now;

        let envelope = frame::parse_envelope(datagram).map_err(|err| self.malformed(err))?;
        for &ack in &envelope.acks {
            self.handle_ack(ack, now);
        }

        let reliable = envelope.flags.contains(PacketFlags::RELIABLE);
        let status = self.recv.observe(envelope.sequence);
        if reliable {
            self.recv.queue_ack(envelope.sequence, now);
        }
        if status != SeqStatus::New {
            self.stats.duplicates += 1;
            if reliable {
                self.recv.mark_urgent();
            }
            return Err(NetError::DuplicateDatagram {
                sequence: envelope.sequence,
            });
        }

        let decoded = envelope
            .decode(registry, self.listener, self.config.max_decoded_size)
            .map_err(|err| self.malformed(err))?;
        let descriptor = decoded.descriptor;
        let message = decoded.message;
        if reliable && descriptor.class() == PriorityClass::Immediate {
            self.recv.mark_urgent();
        }

        if self.state == CircuitState::Establishing && message.id != ids::USE_CIRCUIT_CODE {
            return Err(self.malformed(Malformed::NotEstablished {
                message: descriptor.name,
            }));
        }
        trace!(circuit = %self.key, message = descriptor.name, seq = envelope.sequence, "inbound");

        match message.id {
            ids::PACKET_ACK => {
                let acks = self.view::<PacketAck>(&message)?;
                for ack in acks.packets {
                    self.handle_ack(ack, now);
                }
                Ok(None)
            }
            ids::START_PING_CHECK => {
                let ping = self.view::<StartPingCheck>(&message)?;
                let reply = CompletePingCheck {
                    ping_id: ping.ping_id,
                };
                self.enqueue_control(registry, &reply.to_message(), false, now);
                Ok(None)
            }
            ids::COMPLETE_PING_CHECK => {
                let pong = self.view::<CompletePingCheck>(&message)?;
                if let Some((id, sent_at)) = self.outstanding_ping {
                    if id == pong.ping_id {
                        self.outstanding_ping = None;
                        self.sample_rtt(now.saturating_duration_since(sent_at));
                    }
                }
                Ok(None)
            }
            ids::CLOSE_CIRCUIT => {
                self.close(DisconnectReason::ClosedByPeer);
                Ok(None)
            }
            ids::USE_CIRCUIT_CODE => {
                let handshake = self.view::<UseCircuitCode>(&message)?;
                if self.state != CircuitState::Establishing {
                    return Ok(None);
                }
                self.handshake = Some(handshake);
                Ok(Some(CircuitEvent::Handshake(handshake)))
            }
            ids::LOGOUT_REQUEST => {
                let request = self.view::<LogoutRequest>(&message)?;
                if self.state == CircuitState::Active {
                    let reply = LogoutReply {
                        agent_id: request.agent_id,
                        session_id: request.session_id,
                        items: Vec::new(),
                    };
                    self.enqueue_control(registry, &reply.to_message(), true, now);
                    self.begin_drain(DisconnectReason::Logout);
                }
                Ok(Some(CircuitEvent::Message(message)))
            }
            ids::AGENT_THROTTLE => {
                if let Ok(throttle) = AgentThrottle::try_from(&message) {
                    self.apply_throttle(&throttle);
                }
                Ok(Some(CircuitEvent::Message(message)))
            }
            _ if descriptor.payload == PayloadKind::TerrainLayer => {
                let layer = self.view::<LayerData>(&message)?;
                let decoded = terrain::decode_layer(&layer.data, self.config.patches_per_side)
                    .map_err(|err| self.malformed(Malformed::Terrain(err)))?;
                for rejected in &decoded.rejected {
                    self.stats.patches_rejected += 1;
                    debug!(circuit = %self.key, %rejected, "terrain patch dropped");
                }
                Ok(Some(CircuitEvent::Terrain(decoded)))
            }
            _ => Ok(Some(CircuitEvent::Message(message))),
        }
    }

    /// Queue a message from the simulation. Rejected unless active.
    pub fn enqueue(
        &mut self,
        registry: &MessageRegistry,
        message: &Message,
        reliability: Reliability,
        class: Option<OutboundClass>,
        now: Instant,
    ) -> Result<(), EnqueueError> {
        if self.state != CircuitState::Active {
            return Err(EnqueueError::NotActive(self.state));
        }
        let descriptor = registry
            .get(message.id)
            .ok_or(EncodeError::UnknownMessage(message.id))?;
        let reliable = reliability.resolve(descriptor.reliable);
        let bytes = frame::encode_packet(descriptor, message, reliable, self.config.max_packet_size)?;
        self.scheduler
            .push(class.unwrap_or(descriptor.queue), bytes, reliable, now)
    }

    /// Advance timers and produce the datagrams to send this tick.
    pub fn tick(&mut self, registry: &MessageRegistry, now: Instant) -> Vec<Vec<u8>> {
        if self.state == CircuitState::Closed {
            return Vec::new();
        }
        let cfg = self.config.reliability.clone();

        if now.saturating_duration_since(self.last_inbound_at) >= cfg.inactivity_timeout() {
            warn!(circuit = %self.key, "circuit timed out");
            self.close(DisconnectReason::TimedOut);
            return Vec::new();
        }

        let expired = self.send.expired(now, &cfg);
        for (sequence, len) in expired.resend {
            self.scheduler.push_resend(sequence, len, now);
        }
        if let Some(dead) = expired.gave_up.first() {
            let err = NetError::UnresponsiveCircuit {
                sequence: dead.sequence,
                attempts: dead.attempts,
            };
            warn!(circuit = %self.key, %err, dropped = expired.gave_up.len(), "giving up on reliable sends");
            self.begin_drain(DisconnectReason::Unresponsive);
        }

        if self.state == CircuitState::Active
            && now.saturating_duration_since(self.last_ping_at) >= cfg.ping_interval()
        {
            self.send_ping(registry, now);
        }

        let mut out = Vec::new();
        for entry in self.scheduler.drain() {
            let wire = match entry.packet {
                QueuedPacket::Fresh {
                    mut bytes,
                    reliable,
                } => {
                    let sequence = self.send.next_sequence();
                    frame::set_sequence(&mut bytes, sequence);
                    if reliable {
                        self.send.register(sequence, bytes.clone(), now, &cfg);
                    }
                    bytes
                }
                QueuedPacket::Resend { sequence, .. } => {
                    match self.send.take_resend(sequence, now, &cfg) {
                        Some(bytes) => {
                            self.stats.resends += 1;
                            bytes
                        }
                        None => continue,
                    }
                }
            };
            out.push(self.piggyback(wire));
        }

        if self.recv.acks_due(now, &cfg) {
            self.flush_acks(registry, &mut out);
        }

        if self.state == CircuitState::Draining
            && self.send.pending_len() == 0
            && self.scheduler.is_empty()
        {
            let reason = self.drain_reason.unwrap_or(DisconnectReason::Requested);
            if let Some(close) = self.standalone(registry, &CloseCircuit.to_message()) {
                out.push(close);
            }
            self.close(reason);
        }

        for datagram in &out {
            self.stats.packets_out += 1;
            self.stats.bytes_out += datagram.len() as u64;
        }
        out
    }

    fn malformed(&mut self, err: Malformed) -> NetError {
        if err.is_security_relevant() {
            self.stats.trust_drops += 1;
            warn!(circuit = %self.key, %err, "trust boundary violation");
        } else {
            self.stats.malformed += 1;
            debug!(circuit = %self.key, %err, "malformed packet");
        }
        NetError::MalformedPacket(err)
    }

    fn view<T: TypedMessage>(&mut self, message: &Message) -> Result<T, NetError> {
        T::try_from(message).map_err(|err| self.malformed(err.into()))
    }

    fn handle_ack(&mut self, sequence: u32, now: Instant) {
        if let Some(pending) = self.send.ack(sequence) {
            self.stats.acks_received += 1;
            self.scheduler.discard_resend(sequence);
            // Only first transmissions give an unambiguous sample.
            if pending.attempts == 1 {
                self.sample_rtt(now.saturating_duration_since(pending.first_sent_at));
            }
        }
    }

    fn sample_rtt(&mut self, sample: Duration) {
        self.srtt = Some(match self.srtt {
            None => sample,
            Some(srtt) => (srtt * 7 + sample) / 8,
        });
    }

    fn apply_throttle(&mut self, throttle: &AgentThrottle) {
        let per_tick = throttle.throttles.total_bytes_per_second() as usize
            / self.config.tick_rate_hz.max(1) as usize;
        let budget = per_tick
            .min(self.config.budget_bytes)
            .max(self.config.max_packet_size);
        debug!(circuit = %self.key, budget, "applying viewer throttle");
        self.scheduler.set_budget(budget);
    }

    fn send_ping(&mut self, registry: &MessageRegistry, now: Instant) {
        self.ping_id = self.ping_id.wrapping_add(1);
        let ping = StartPingCheck {
            ping_id: self.ping_id,
            oldest_unacked: self.send.oldest_unacked().unwrap_or(0),
        };
        self.enqueue_control(registry, &ping.to_message(), false, now);
        self.outstanding_ping = Some((self.ping_id, now));
        self.last_ping_at = now;
    }

    /// Queue transport-generated traffic regardless of state.
    fn enqueue_control(
        &mut self,
        registry: &MessageRegistry,
        message: &Message,
        reliable: bool,
        now: Instant,
    ) {
        let Some(descriptor) = registry.get(message.id) else {
            warn!(circuit = %self.key, id = %message.id, "control message not registered");
            return;
        };
        let pushed = frame::encode_packet(descriptor, message, reliable, self.config.max_packet_size)
            .map_err(EnqueueError::from)
            .and_then(|bytes| self.scheduler.push(descriptor.queue, bytes, reliable, now));
        if let Err(err) = pushed {
            warn!(circuit = %self.key, message = descriptor.name, %err, "dropping control message");
        }
    }

    fn piggyback(&mut self, mut wire: Vec<u8>) -> Vec<u8> {
        let max = self.config.reliability.max_appended_acks;
        let pending = self.recv.pending_acks();
        if pending.is_empty() || max == 0 {
            return wire;
        }
        let offer = &pending[..pending.len().min(max)];
        let appended = frame::append_acks(&mut wire, offer, self.config.max_packet_size);
        if appended > 0 {
            self.recv.take_acks(appended);
            self.stats.acks_sent += appended as u64;
        }
        wire
    }

    fn flush_acks(&mut self, registry: &MessageRegistry, out: &mut Vec<Vec<u8>>) {
        // Tag, count byte and one u32 per ack must fit after the header.
        let room = self
            .config
            .max_packet_size
            .saturating_sub(frame::HEADER_LEN + 4 + 1)
            / 4;
        let per_packet = room.clamp(1, frame::MAX_APPENDED_ACKS);
        while !self.recv.pending_acks().is_empty() {
            let packets = self.recv.take_acks(per_packet);
            let count = packets.len() as u64;
            match self.standalone(registry, &PacketAck { packets }.to_message()) {
                Some(datagram) => {
                    self.stats.acks_sent += count;
                    out.push(datagram);
                }
                None => break,
            }
        }
    }

    /// Serialize an unreliable control packet outside the scheduler.
    fn standalone(&mut self, registry: &MessageRegistry, message: &Message) -> Option<Vec<u8>> {
        let descriptor = registry.get(message.id)?;
        match frame::encode_packet(descriptor, message, false, self.config.max_packet_size) {
            Ok(mut bytes) => {
                frame::set_sequence(&mut bytes, self.send.next_sequence());
                Some(bytes)
            }
            Err(err) => {
                warn!(circuit = %self.key, message = descriptor.name, %err, "cannot encode control packet");
                None
            }
        }
    }
}
