//! Message identifiers, descriptors and decoded message values.
//!
//! Every message type is described by an immutable [`MessageDescriptor`]
//! whose [`Schema`] drives both decoding and encoding. Descriptors are
//! collected by a [`RegistryBuilder`] at startup and sealed into a
//! [`MessageRegistry`] that is shared read-only between circuits.

mod catalog;
mod registry;
mod schema;
pub mod typed;

pub use catalog::{ids, register_standard_messages};
pub use registry::{MessageRegistry, RegistryBuilder, RegistryError};
pub use schema::{BlockArity, BlockSpec, FieldKind, FieldSpec, FieldValue, Schema};

use crate::cursor::{CursorError, Reader, Writer};
use crate::error::EncodeError;
use crate::scheduler::OutboundClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric message type identifier.
///
/// The numeric range selects the wire tag width and the priority class:
/// `0x00..=0xFE` are one-byte Immediate ids, `0xFF00..=0xFFFE` are
/// Standard ids sent as `0xFF, n`, and `0xFFFF0000..=0xFFFFFFFF` are Bulk
/// ids sent as `0xFF, 0xFF` followed by a big-endian `u16`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u32);

/// Scheduling priority implied by a message id's numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    /// One-byte ids, sent every frame.
    Immediate,
    /// Two-byte ids.
    Standard,
    /// Four-byte ids.
    Bulk,
}

impl MessageId {
    /// Immediate-class id `n` (`n` must not be `0xFF`).
    pub const fn immediate(n: u8) -> Self {
        assert!(n != 0xFF, "0xFF is the standard-class prefix");
        Self(n as u32)
    }

    /// Standard-class id `n` (`n` must not be `0xFF`).
    pub const fn standard(n: u8) -> Self {
        assert!(n != 0xFF, "0xFF 0xFF is the bulk-class prefix");
        Self(0xFF00 | n as u32)
    }

    /// Bulk-class id `n`.
    pub const fn bulk(n: u16) -> Self {
        Self(0xFFFF_0000 | n as u32)
    }

    /// Validate a raw numeric id.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let valid = raw <= 0xFE || (0xFF00..=0xFFFE).contains(&raw) || raw >= 0xFFFF_0000;
        valid.then_some(Self(raw))
    }

    /// Raw numeric value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Priority class implied by the numeric range.
    pub const fn class(self) -> PriorityClass {
        if self.0 <= 0xFE {
            PriorityClass::Immediate
        } else if self.0 <= 0xFFFE {
            PriorityClass::Standard
        } else {
            PriorityClass::Bulk
        }
    }

    /// Bytes the tag occupies on the wire.
    pub const fn tag_len(self) -> usize {
        match self.class() {
            PriorityClass::Immediate => 1,
            PriorityClass::Standard => 2,
            PriorityClass::Bulk => 4,
        }
    }

    /// Read a variable-width type tag.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, CursorError> {
        let first = reader.read_u8()?;
        if first != 0xFF {
            return Ok(Self(u32::from(first)));
        }
        let second = reader.read_u8()?;
        if second != 0xFF {
            return Ok(Self(0xFF00 | u32::from(second)));
        }
        Ok(Self(0xFFFF_0000 | u32::from(reader.read_u16_be()?)))
    }

    /// Write the variable-width type tag.
    pub fn write(self, writer: &mut Writer<'_>) -> Result<(), CursorError> {
        match self.class() {
            PriorityClass::Immediate => writer.write_u8(self.0 as u8),
            PriorityClass::Standard => {
                writer.write_u8(0xFF)?;
                writer.write_u8(self.0 as u8)
            }
            PriorityClass::Bulk => {
                writer.write_u16(0xFFFF)?;
                writer.write_u16_be(self.0 as u16)
            }
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:#x})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            PriorityClass::Immediate => write!(f, "Immediate {}", self.0),
            PriorityClass::Standard => write!(f, "Standard {}", self.0 & 0xFF),
            PriorityClass::Bulk => write!(f, "Bulk {}", self.0 & 0xFFFF),
        }
    }
}

/// Which listener a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Listener {
    /// End-user viewers; untrusted.
    Client,
    /// Peer simulators on the trusted channel.
    Peer,
}

/// Which side of the trust boundary may send a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustRequirement {
    /// Accepted only from peer simulators.
    TrustedPeerOnly,
    /// Accepted only from viewers.
    UntrustedClientOnly,
    /// Accepted from both.
    Either,
}

impl TrustRequirement {
    /// Whether a message with this requirement may arrive on `listener`.
    pub fn permits(self, listener: Listener) -> bool {
        matches!(
            (self, listener),
            (Self::Either, _)
                | (Self::TrustedPeerOnly, Listener::Peer)
                | (Self::UntrustedClientOnly, Listener::Client)
        )
    }
}

/// Payload handling beyond the field schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Fields only.
    Plain,
    /// Carries a compressed terrain patch group.
    TerrainLayer,
}

/// Static per-type metadata and codec.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    /// Type identifier.
    pub id: MessageId,
    /// Human-readable type name.
    pub name: &'static str,
    /// Whether sends default to reliable delivery.
    pub reliable: bool,
    /// Trust boundary rule.
    pub trust: TrustRequirement,
    /// Whether the body may be zero-run coded.
    pub zerocoded: bool,
    /// Outbound queue used when the sender does not choose one.
    pub queue: OutboundClass,
    /// Extra payload handling.
    pub payload: PayloadKind,
    /// Field layout.
    pub schema: Schema,
}

impl MessageDescriptor {
    /// Unreliable, untrusted-or-trusted, uncompressed `Medium` descriptor;
    /// adjust with the `with_*` methods.
    pub const fn new(id: MessageId, name: &'static str, schema: Schema) -> Self {
        Self {
            id,
            name,
            reliable: false,
            trust: TrustRequirement::Either,
            zerocoded: false,
            queue: OutboundClass::Medium,
            payload: PayloadKind::Plain,
            schema,
        }
    }

    /// Default to reliable delivery.
    pub const fn with_reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Allow zero-run coding of the body.
    pub const fn with_zerocoded(mut self) -> Self {
        self.zerocoded = true;
        self
    }

    /// Restrict which listener may deliver this type.
    pub const fn with_trust(mut self, trust: TrustRequirement) -> Self {
        self.trust = trust;
        self
    }

    /// Default outbound queue.
    pub const fn with_queue(mut self, queue: OutboundClass) -> Self {
        self.queue = queue;
        self
    }

    /// Extra payload handling.
    pub const fn with_payload(mut self, payload: PayloadKind) -> Self {
        self.payload = payload;
        self
    }

    /// Priority class derived from the id.
    pub fn class(&self) -> PriorityClass {
        self.id.class()
    }

    /// Decode the fields that follow the type tag.
    pub fn decode(&self, reader: &mut Reader<'_>) -> Result<Message, CursorError> {
        let blocks = self.schema.decode(reader)?;
        Ok(Message {
            id: self.id,
            blocks,
        })
    }

    /// Encode the tag and fields of `message`.
    pub fn encode(&self, message: &Message, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        if message.id != self.id {
            return Err(EncodeError::SchemaMismatch {
                message: self.name,
                detail: format!("message carries id {}", message.id),
            });
        }
        self.id.write(writer)?;
        self.schema.encode(self.name, &message.blocks, writer)
    }
}

/// Field values of one block instance.
pub type Fields = Vec<FieldValue>;

/// A decoded message: for every schema block, the list of its instances.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Type identifier.
    pub id: MessageId,
    /// `blocks[b][i]` holds the fields of instance `i` of block `b`.
    pub blocks: Vec<Vec<Fields>>,
}

impl Message {
    /// Build a message from its blocks.
    pub fn new(id: MessageId, blocks: Vec<Vec<Fields>>) -> Self {
        Self { id, blocks }
    }

    /// Instances of block `block`.
    pub fn instances(&self, block: usize) -> &[Fields] {
        self.blocks.get(block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Field `field` of instance `instance` of block `block`.
    pub fn field(&self, block: usize, instance: usize, field: usize) -> Option<&FieldValue> {
        self.instances(block).get(instance)?.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_bytes(id: MessageId) -> Vec<u8> {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        id.write(&mut w).unwrap();
        w.written().to_vec()
    }

    #[test]
    fn tag_widths_follow_class() {
        assert_eq!(tag_bytes(MessageId::immediate(4)), vec![4]);
        assert_eq!(tag_bytes(MessageId::standard(17)), vec![0xFF, 17]);
        assert_eq!(tag_bytes(MessageId::bulk(0xFFFB)), vec![0xFF, 0xFF, 0xFF, 0xFB]);
    }

    #[test]
    fn tags_read_back() {
        for id in [
            MessageId::immediate(0),
            MessageId::immediate(0xFE),
            MessageId::standard(0),
            MessageId::standard(0xFE),
            MessageId::bulk(3),
            MessageId::bulk(0xFFFF),
        ] {
            let bytes = tag_bytes(id);
            assert_eq!(bytes.len(), id.tag_len());
            assert_eq!(MessageId::read(&mut Reader::new(&bytes)).unwrap(), id);
        }
    }

    #[test]
    fn raw_ids_are_range_checked() {
        assert_eq!(MessageId::from_raw(0xFF), None);
        assert_eq!(MessageId::from_raw(0xFFFF), None);
        assert_eq!(MessageId::from_raw(0x1_0000), None);
        assert_eq!(
            MessageId::from_raw(0xFFFF_FFFB),
            Some(MessageId::bulk(0xFFFB))
        );
        assert_eq!(MessageId::standard(3).class(), PriorityClass::Standard);
        assert_eq!(MessageId::bulk(3).class(), PriorityClass::Bulk);
    }

    #[test]
    fn trust_rules() {
        assert!(TrustRequirement::Either.permits(Listener::Client));
        assert!(TrustRequirement::TrustedPeerOnly.permits(Listener::Peer));
        assert!(!TrustRequirement::TrustedPeerOnly.permits(Listener::Client));
        assert!(!TrustRequirement::UntrustedClientOnly.permits(Listener::Peer));
    }
}
