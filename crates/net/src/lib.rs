#![warn(missing_docs)]
//! Circuit transport for region simulators.
//!
//! Datagrams carry one message each behind a six-byte envelope. Circuits add
//! selective reliability, duplicate suppression, ack batching and per-class
//! outbound scheduling on top; the terrain codec packs height-field patches
//! into `LayerData` bodies.

pub mod circuit;
pub mod cursor;
mod error;
pub mod frame;
pub mod message;
pub mod reliability;
pub mod scheduler;
pub mod terrain;
pub mod zerocode;

pub use circuit::{
    Circuit, CircuitConfig, CircuitEvent, CircuitState, CircuitStats, DisconnectReason,
    Reliability,
};
pub use error::{EncodeError, EnqueueError, Malformed, NetError};
pub use frame::{Envelope, PacketFlags};
pub use message::{
    ids, Listener, Message, MessageDescriptor, MessageId, MessageRegistry, PayloadKind,
    PriorityClass, TrustRequirement,
};
pub use reliability::ReliabilityConfig;
pub use scheduler::OutboundClass;
pub use terrain::{LayerType, TerrainError};
