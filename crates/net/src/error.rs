//! Error taxonomy shared by the transport.

use crate::circuit::CircuitState;
use crate::cursor::CursorError;
use crate::message::typed::FieldError;
use crate::message::{Listener, MessageId, RegistryError};
use crate::scheduler::OutboundClass;
use crate::terrain::TerrainError;
use crate::zerocode::ZeroCodeError;
use thiserror::Error;

/// Why an inbound datagram or message was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    /// A field ran past the end of the buffer or failed validation.
    #[error("cursor: {0}")]
    Cursor(#[from] CursorError),
    /// The zero-coded body does not decode.
    #[error("zero coding: {0}")]
    ZeroCode(#[from] ZeroCodeError),
    /// Shorter than the fixed header plus its extra bytes.
    #[error("datagram of {len} bytes is shorter than its header")]
    TruncatedHeader {
        /// Datagram length.
        len: usize,
    },
    /// The appended-ack trailer is missing or claims more acks than fit.
    #[error("appended ack count {count} does not fit in {available} bytes")]
    TruncatedAcks {
        /// Claimed ack count.
        count: usize,
        /// Bytes available after the header.
        available: usize,
    },
    /// No descriptor is registered for the id.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    /// Message arrived on the wrong side of the trust boundary.
    #[error("{message} is not accepted on the {listener:?} listener")]
    TrustViolation {
        /// Offending type.
        message: &'static str,
        /// Listener it arrived on.
        listener: Listener,
    },
    /// Only the handshake is accepted before the circuit is authorized.
    #[error("{message} arrived before the circuit was established")]
    NotEstablished {
        /// Offending type.
        message: &'static str,
    },
    /// A transport message decoded but lacks a field the circuit reads.
    #[error("{0}")]
    Field(#[from] FieldError),
    /// A terrain payload could not be parsed.
    #[error("terrain payload: {0}")]
    Terrain(#[from] TerrainError),
}

impl Malformed {
    /// Whether the drop should be counted as a security event.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::TrustViolation { .. })
    }
}

/// Outbound serialization failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Writing the body failed.
    #[error("cursor: {0}")]
    Cursor(#[from] CursorError),
    /// The packet does not fit in the configured maximum.
    #[error("packet exceeds {limit} bytes")]
    TooLarge {
        /// Configured maximum packet size.
        limit: usize,
    },
    /// The message shape does not match its schema.
    #[error("{message} does not match its schema: {detail}")]
    SchemaMismatch {
        /// Message type name.
        message: &'static str,
        /// What differs.
        detail: String,
    },
    /// No descriptor is registered for the id.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

/// Why an outbound message was not queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The circuit is not accepting new traffic.
    #[error("circuit is {0:?}, not active")]
    NotActive(CircuitState),
    /// The target queue is at its depth limit.
    #[error("{class:?} queue is full ({depth} entries)")]
    QueueFull {
        /// Queue that rejected the entry.
        class: OutboundClass,
        /// Its configured depth limit.
        depth: usize,
    },
    /// The queue is fed only by the reliability engine.
    #[error("{0:?} queue is reserved")]
    ReservedClass(OutboundClass),
    /// Serialization failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// No circuit with that key exists.
    #[error("unknown circuit")]
    UnknownCircuit,
}

/// Umbrella error for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// Dropped and counted.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] Malformed),
    /// Already seen; not dispatched.
    #[error("duplicate datagram {sequence}")]
    DuplicateDatagram {
        /// Repeated sequence.
        sequence: u32,
    },
    /// A reliable send ran out of attempts.
    #[error("sequence {sequence} unacknowledged after {attempts} attempts")]
    UnresponsiveCircuit {
        /// Sequence that gave up.
        sequence: u32,
        /// Transmissions made.
        attempts: u32,
    },
    /// A terrain patch lies outside the region grid.
    #[error("terrain patch ({x}, {y}) is outside the region")]
    PatchOutOfRange {
        /// Patch column.
        x: u32,
        /// Patch row.
        y: u32,
    },
    /// Startup registration failed.
    #[error(transparent)]
    RegistryConflict(#[from] RegistryError),
    /// Outbound serialization failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Outbound enqueue was rejected.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}
