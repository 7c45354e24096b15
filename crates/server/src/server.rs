//! Circuit table and the datagram-in, datagram-out facade over it.

use crate::config::ServerConfig;
use crate::pool::WorkerPool;
use crate::stats::{ServerStats, ServerStatsSnapshot};
use crate::{Datagram, InboundEvent, ServerError};
use simwire_core::{AgentSession, CircuitCode, CircuitKey};
use simwire_net::message::typed::{LayerData, TypedMessage, UseCircuitCode};
use simwire_net::{
    frame, ids, Circuit, CircuitEvent, CircuitState, CircuitStats, DisconnectReason,
    EnqueueError, Listener, Message, MessageRegistry, NetError, OutboundClass,
    Reliability,
};
use simwire_world::TerrainStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Bytes reserved in each datagram for the envelope, tag and length prefix
/// of a `LayerData` message.
const LAYER_OVERHEAD: usize = 16;

type SharedCircuit = Arc<Mutex<Circuit>>;

fn lock(circuit: &SharedCircuit) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What one circuit produced while processing inbound datagrams.
struct InboundOutcome {
    key: CircuitKey,
    events: Vec<CircuitEvent>,
    disconnect: Option<DisconnectReason>,
}

/// The transport server: owns every circuit and the event queues between the
/// sockets and the simulation.
pub struct Server {
    config: ServerConfig,
    registry: Arc<MessageRegistry>,
    circuits: HashMap<CircuitKey, SharedCircuit>,
    by_endpoint: HashMap<(Listener, SocketAddr), CircuitKey>,
    authorized: HashMap<CircuitCode, AgentSession>,
    /// Client circuits opened by a handshake and not yet activated.
    pending: HashSet<CircuitKey>,
    inbound: VecDeque<InboundEvent>,
    outbound: VecDeque<Datagram>,
    pool: WorkerPool,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Server over a sealed registry.
    pub fn new(config: ServerConfig, registry: MessageRegistry) -> Self {
        let pool = WorkerPool::new(&config.workers);
        info!(
            messages = registry.len(),
            fingerprint = %registry.fingerprint(),
            tick_rate = config.tick_rate_hz,
            "server ready"
        );
        Self {
            config,
            registry: Arc::new(registry),
            circuits: HashMap::new(),
            by_endpoint: HashMap::new(),
            authorized: HashMap::new(),
            pending: HashSet::new(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            pool,
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Server over the built-in message set.
    pub fn with_standard_messages(config: ServerConfig) -> Result<Self, NetError> {
        Ok(Self::new(config, MessageRegistry::standard()?))
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot(self.circuits.len())
    }

    /// Counters of one circuit.
    pub fn circuit_stats(&self, circuit: CircuitKey) -> Option<CircuitStats> {
        self.circuits.get(&circuit).map(|c| lock(c).stats())
    }

    /// State of one circuit.
    pub fn circuit_state(&self, circuit: CircuitKey) -> Option<CircuitState> {
        self.circuits.get(&circuit).map(|c| lock(c).state())
    }

    /// How long the oldest message queued on `circuit` has waited by `now`.
    pub fn queue_wait(&self, circuit: CircuitKey, now: Instant) -> Option<Duration> {
        let oldest = self
            .circuits
            .get(&circuit)
            .and_then(|c| lock(c).scheduler().oldest_enqueued())?;
        Some(now.saturating_duration_since(oldest))
    }

    /// Keys of every live circuit.
    pub fn circuits(&self) -> impl Iterator<Item = CircuitKey> + '_ {
        self.circuits.keys().copied()
    }

    /// Record the session the login service issued for `code`. Circuits
    /// already waiting on that code are activated or rejected now.
    pub fn authorize_circuit(&mut self, code: CircuitCode, session: AgentSession, now: Instant) {
        self.authorized.insert(code, session);
        let waiting: Vec<CircuitKey> = self
            .circuits
            .keys()
            .filter(|key| key.code == code)
            .copied()
            .collect();
        for key in waiting {
            let handshake = self
                .circuits
                .get(&key)
                .and_then(|c| lock(c).handshake().copied());
            if let Some(handshake) = handshake {
                self.resolve_handshake(key, handshake, now);
            }
        }
    }

    /// Open an active circuit to a trusted peer simulator.
    pub fn add_trusted_peer(
        &mut self,
        endpoint: SocketAddr,
        code: CircuitCode,
        now: Instant,
    ) -> CircuitKey {
        let key = CircuitKey::new(endpoint, code);
        let circuit = Circuit::new_trusted(key, self.config.circuit_config(), now);
        self.insert_circuit(Listener::Peer, circuit);
        self.inbound.push_back(InboundEvent::Connected {
            circuit: key,
            session: None,
        });
        info!(circuit = %key, "trusted peer added");
        key
    }

    /// Queue a message for `circuit`. `class` overrides the descriptor's
    /// queue.
    pub fn enqueue(
        &self,
        circuit: CircuitKey,
        message: &Message,
        reliability: Reliability,
        class: Option<OutboundClass>,
        now: Instant,
    ) -> Result<(), EnqueueError> {
        let shared = self
            .circuits
            .get(&circuit)
            .ok_or(EnqueueError::UnknownCircuit)?;
        let result = lock(shared).enqueue(&self.registry, message, reliability, class, now);
        if result.is_err() {
            self.stats.record_enqueue_rejected();
        }
        result
    }

    /// Compress the given patches of `store` and queue them as `LayerData`.
    /// Returns how many messages were queued.
    pub fn send_terrain(
        &self,
        circuit: CircuitKey,
        store: &TerrainStore,
        patches: impl IntoIterator<Item = (u32, u32)>,
        now: Instant,
    ) -> Result<usize, ServerError> {
        let max_body = self.config.max_packet_size.saturating_sub(LAYER_OVERHEAD);
        let bodies = store.layer_bodies(patches, max_body)?;
        let count = bodies.len();
        for data in bodies {
            let layer = LayerData {
                layer_type: simwire_net::LayerType::Land.to_byte(),
                data,
            };
            self.enqueue(
                circuit,
                &layer.to_message(),
                Reliability::Default,
                Some(simwire_net::LayerType::Land.queue()),
                now,
            )?;
        }
        Ok(count)
    }

    /// Begin closing `circuit`; it drains pending reliable sends first.
    pub fn disconnect(&mut self, circuit: CircuitKey) -> Result<(), EnqueueError> {
        let shared = self
            .circuits
            .get(&circuit)
            .ok_or(EnqueueError::UnknownCircuit)?;
        lock(shared).begin_drain(DisconnectReason::Requested);
        self.collect_disconnect(circuit);
        Ok(())
    }

    /// Next event for the simulation.
    pub fn poll_decoded(&mut self) -> Option<InboundEvent> {
        self.inbound.pop_front()
    }

    /// Next datagram for the sockets.
    pub fn poll_outbound(&mut self) -> Option<Datagram> {
        self.outbound.pop_front()
    }

    /// Process one datagram received on `listener` from `endpoint`.
    pub fn handle_datagram(
        &mut self,
        listener: Listener,
        endpoint: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) {
        self.handle_batch(vec![(listener, endpoint, bytes.to_vec())], now);
    }

    /// Process a batch of datagrams. Datagrams for different circuits are
    /// handled in parallel; each circuit sees its own in arrival order.
    #[instrument(skip_all, fields(datagrams = batch.len()))]
    pub fn handle_batch(&mut self, batch: Vec<(Listener, SocketAddr, Vec<u8>)>, now: Instant) {
        let mut per_circuit: Vec<(CircuitKey, Vec<Vec<u8>>)> = Vec::new();
        for (listener, endpoint, bytes) in batch {
            self.stats.record_datagram_in(bytes.len());
            let Some(key) = self.resolve(listener, endpoint, &bytes, now) else {
                continue;
            };
            match per_circuit.iter_mut().find(|(k, _)| *k == key) {
                Some((_, list)) => list.push(bytes),
                None => per_circuit.push((key, vec![bytes])),
            }
        }

        let jobs: Vec<_> = per_circuit
            .into_iter()
            .filter_map(|(key, datagrams)| {
                let circuit = Arc::clone(self.circuits.get(&key)?);
                Some((key, circuit, datagrams))
            })
            .collect();
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let outcomes = self.pool.map(jobs, move |(key, circuit, datagrams)| {
            let mut circuit = lock(&circuit);
            let mut events = Vec::new();
            for datagram in datagrams {
                match circuit.receive(&registry, &datagram, now) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(err) => stats.record_error(&err),
                }
            }
            InboundOutcome {
                key,
                events,
                disconnect: circuit.take_disconnect(),
            }
        });

        for outcome in outcomes {
            self.apply_outcome(outcome, now);
        }
    }

    /// Advance every circuit: retries, acks, pings, scheduler drain.
    #[instrument(skip_all, fields(circuits = self.circuits.len()))]
    pub fn tick(&mut self, now: Instant) {
        let jobs: Vec<_> = self
            .circuits
            .iter()
            .map(|(key, circuit)| (*key, Arc::clone(circuit)))
            .collect();
        let registry = Arc::clone(&self.registry);
        let results = self.pool.map(jobs, move |(key, circuit)| {
            let mut circuit = lock(&circuit);
            let datagrams = circuit.tick(&registry, now);
            (key, circuit.listener(), datagrams, circuit.take_disconnect())
        });

        for (key, listener, datagrams, disconnect) in results {
            for bytes in datagrams {
                self.stats.record_datagram_out(bytes.len());
                self.outbound.push_back(Datagram {
                    listener,
                    endpoint: key.endpoint,
                    bytes,
                });
            }
            if let Some(reason) = disconnect {
                self.remove_circuit(key, reason);
            }
        }
    }

    /// Find the circuit a datagram belongs to, creating one for a first
    /// handshake on the client listener. Counts what it drops.
    fn resolve(
        &mut self,
        listener: Listener,
        endpoint: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Option<CircuitKey> {
        let handshake = self.peek_handshake(listener, bytes);
        if let Some(handshake) = handshake {
            let key = CircuitKey::new(endpoint, handshake.code);
            if self.circuits.contains_key(&key) {
                self.by_endpoint.insert((listener, endpoint), key);
                return Some(key);
            }
            if !self.has_handshake_room(endpoint) {
                debug!(circuit = %key, pending = self.pending.len(), "handshake refused");
                self.stats.record_refused_handshake();
                return None;
            }
            debug!(circuit = %key, "handshake from new endpoint");
            let circuit = Circuit::new(key, Listener::Client, self.config.circuit_config(), now);
            self.insert_circuit(Listener::Client, circuit);
            self.pending.insert(key);
            return Some(key);
        }
        let key = self.by_endpoint.get(&(listener, endpoint)).copied();
        if key.is_none() {
            self.stats.record_unroutable();
        }
        key
    }

    /// Whether another establishing circuit fits, overall and for `endpoint`.
    fn has_handshake_room(&self, endpoint: SocketAddr) -> bool {
        if self.pending.len() >= self.config.max_pending_handshakes {
            return false;
        }
        let from_endpoint = self.pending.iter().filter(|k| k.endpoint == endpoint).count();
        from_endpoint < self.config.max_pending_per_endpoint
    }

    fn peek_handshake(&self, listener: Listener, bytes: &[u8]) -> Option<UseCircuitCode> {
        if listener != Listener::Client {
            return None;
        }
        let envelope = frame::parse_envelope(bytes).ok()?;
        if envelope.message_id(self.config.max_decoded_size).ok()? != ids::USE_CIRCUIT_CODE {
            return None;
        }
        let decoded = envelope
            .decode(&self.registry, listener, self.config.max_decoded_size)
            .ok()?;
        UseCircuitCode::try_from(&decoded.message).ok()
    }

    fn insert_circuit(&mut self, listener: Listener, circuit: Circuit) {
        let key = circuit.key();
        self.by_endpoint.insert((listener, key.endpoint), key);
        self.circuits.insert(key, Arc::new(Mutex::new(circuit)));
    }

    fn apply_outcome(&mut self, outcome: InboundOutcome, now: Instant) {
        let key = outcome.key;
        for event in outcome.events {
            match event {
                CircuitEvent::Handshake(handshake) => self.resolve_handshake(key, handshake, now),
                CircuitEvent::Message(message) => {
                    self.inbound.push_back(InboundEvent::Message {
                        circuit: key,
                        message,
                    });
                }
                CircuitEvent::Terrain(layer) => {
                    self.inbound.push_back(InboundEvent::Terrain {
                        circuit: key,
                        layer,
                    });
                }
            }
        }
        if let Some(reason) = outcome.disconnect {
            self.remove_circuit(key, reason);
        }
    }

    /// Compare a handshake with the authorized session for its code.
    fn resolve_handshake(&mut self, key: CircuitKey, handshake: UseCircuitCode, now: Instant) {
        let Some(expected) = self.authorized.get(&handshake.code).copied() else {
            debug!(circuit = %key, "handshake waiting for authorization");
            return;
        };
        let Some(shared) = self.circuits.get(&key).map(Arc::clone) else {
            return;
        };
        let mut circuit = lock(&shared);
        if expected.agent_id == handshake.agent_id && expected.session_id == handshake.session_id {
            if circuit.activate(expected, now) {
                drop(circuit);
                self.pending.remove(&key);
                self.inbound.push_back(InboundEvent::Connected {
                    circuit: key,
                    session: Some(expected),
                });
            }
        } else {
            warn!(circuit = %key, agent = %handshake.agent_id, "handshake does not match session");
            self.stats.record_rejected_handshake();
            circuit.close(DisconnectReason::Rejected);
            drop(circuit);
            self.collect_disconnect(key);
        }
    }

    fn collect_disconnect(&mut self, key: CircuitKey) {
        let reason = self
            .circuits
            .get(&key)
            .and_then(|c| lock(c).take_disconnect());
        if let Some(reason) = reason {
            self.remove_circuit(key, reason);
        }
    }

    fn remove_circuit(&mut self, key: CircuitKey, reason: DisconnectReason) {
        self.pending.remove(&key);
        if let Some(shared) = self.circuits.remove(&key) {
            let listener = lock(&shared).listener();
            if self.by_endpoint.get(&(listener, key.endpoint)) == Some(&key) {
                self.by_endpoint.remove(&(listener, key.endpoint));
            }
            if reason != DisconnectReason::Rejected {
                self.authorized.remove(&key.code);
            }
            info!(circuit = %key, ?reason, "circuit removed");
            self.inbound.push_back(InboundEvent::Disconnected {
                circuit: key,
                reason,
            });
        }
    }
}
