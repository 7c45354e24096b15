//! Server tuning, loaded from the `[server]` table of the config file.

use serde::{Deserialize, Serialize};
use simwire_net::{CircuitConfig, ReliabilityConfig};
use std::time::Duration;

/// Worker pool bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive when idle.
    pub min_workers: usize,
    /// Upper bound under load.
    pub max_workers: usize,
    /// Idle time after which a worker above the minimum exits.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            idle_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Everything the server needs besides sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Simulation ticks per second.
    pub tick_rate_hz: u32,
    /// Outbound bytes per second per circuit.
    pub bytes_per_second: u32,
    /// Largest datagram produced.
    pub max_packet_size: usize,
    /// Largest zero-decoded body accepted.
    pub max_decoded_size: usize,
    /// Entries per outbound queue.
    pub max_queue_depth: usize,
    /// Terrain patches along one side of the region.
    pub patches_per_side: u32,
    /// Circuits allowed to sit in the handshake state at once.
    pub max_pending_handshakes: usize,
    /// Of those, how many may share one remote endpoint.
    pub max_pending_per_endpoint: usize,
    /// Retransmission, ack and keep-alive tuning.
    pub reliability: ReliabilityConfig,
    /// Worker pool bounds.
    pub workers: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            bytes_per_second: 150_000,
            max_packet_size: 1200,
            max_decoded_size: 8192,
            max_queue_depth: 512,
            patches_per_side: 16,
            max_pending_handshakes: 256,
            max_pending_per_endpoint: 4,
            reliability: ReliabilityConfig::default(),
            workers: PoolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Time between ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }

    /// Bytes a circuit may release per tick.
    pub fn budget_per_tick(&self) -> usize {
        (self.bytes_per_second / self.tick_rate_hz.max(1)) as usize
    }

    /// Settings handed to each new circuit.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            reliability: self.reliability.clone(),
            max_packet_size: self.max_packet_size,
            max_decoded_size: self.max_decoded_size,
            budget_bytes: self.budget_per_tick(),
            max_queue_depth: self.max_queue_depth,
            patches_per_side: self.patches_per_side,
            tick_rate_hz: self.tick_rate_hz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_follows_rate() {
        let config = ServerConfig {
            tick_rate_hz: 10,
            bytes_per_second: 50_000,
            ..Default::default()
        };
        assert_eq!(config.budget_per_tick(), 5_000);
        assert_eq!(config.circuit_config().budget_bytes, 5_000);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
    }
}
