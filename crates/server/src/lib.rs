#![warn(missing_docs)]
//! Region server transport: the circuit table, its worker pool and the event
//! queues between the sockets and the simulation loop.

mod config;
mod pool;
mod server;
mod stats;

pub use config::{PoolConfig, ServerConfig};
pub use pool::WorkerPool;
pub use server::Server;
pub use stats::{ServerStats, ServerStatsSnapshot};

use simwire_core::{AgentSession, CircuitKey};
use simwire_net::terrain::DecodedLayer;
use simwire_net::{DisconnectReason, EnqueueError, Listener, Message, TerrainError};
use std::net::SocketAddr;
use thiserror::Error;

/// Something the simulation should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A circuit became active. `session` is `None` for peer simulators.
    Connected {
        /// Circuit.
        circuit: CircuitKey,
        /// Authorized session.
        session: Option<AgentSession>,
    },
    /// A decoded message.
    Message {
        /// Circuit it arrived on.
        circuit: CircuitKey,
        /// Message value.
        message: Message,
    },
    /// A decoded terrain layer.
    Terrain {
        /// Circuit it arrived on.
        circuit: CircuitKey,
        /// Patches that decoded.
        layer: DecodedLayer,
    },
    /// A circuit closed and was removed.
    Disconnected {
        /// Circuit.
        circuit: CircuitKey,
        /// Why.
        reason: DisconnectReason,
    },
}

/// A datagram ready for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Socket to send from.
    pub listener: Listener,
    /// Destination.
    pub endpoint: SocketAddr,
    /// Wire bytes.
    pub bytes: Vec<u8>,
}

/// Server-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// The circuit refused the message.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    /// Terrain could not be packed.
    #[error(transparent)]
    Terrain(#[from] TerrainError),
}
