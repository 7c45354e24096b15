//! Startup registration of message descriptors.

use super::{MessageDescriptor, MessageId};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Registration failure. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two descriptors claim the same id.
    #[error("message id {id} registered twice ({existing} and {new})")]
    Conflict {
        /// Contested id.
        id: MessageId,
        /// Name already registered.
        existing: &'static str,
        /// Name of the rejected descriptor.
        new: &'static str,
    },
    /// Two descriptors claim the same name.
    #[error("message name {name} registered twice")]
    DuplicateName {
        /// Contested name.
        name: &'static str,
    },
}

/// Collects descriptors before the registry is sealed.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: BTreeMap<MessageId, MessageDescriptor>,
}

impl RegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one descriptor.
    pub fn register(&mut self, descriptor: MessageDescriptor) -> Result<&mut Self, RegistryError> {
        if let Some(existing) = self.descriptors.get(&descriptor.id) {
            return Err(RegistryError::Conflict {
                id: descriptor.id,
                existing: existing.name,
                new: descriptor.name,
            });
        }
        if self.descriptors.values().any(|d| d.name == descriptor.name) {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name,
            });
        }
        self.descriptors.insert(descriptor.id, descriptor);
        Ok(self)
    }

    /// Number of descriptors registered so far.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Freeze the table.
    pub fn seal(self) -> MessageRegistry {
        let by_name = self
            .descriptors
            .values()
            .map(|d| (d.name, d.id))
            .collect();
        let fingerprint = fingerprint(&self.descriptors);
        MessageRegistry {
            descriptors: self.descriptors,
            by_name,
            fingerprint,
        }
    }
}

/// Immutable `id -> descriptor` table, shared read-only between circuits.
#[derive(Debug)]
pub struct MessageRegistry {
    descriptors: BTreeMap<MessageId, MessageDescriptor>,
    by_name: HashMap<&'static str, MessageId>,
    fingerprint: blake3::Hash,
}

impl MessageRegistry {
    /// Registry holding the shipped message catalog.
    pub fn standard() -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        super::register_standard_messages(&mut builder)?;
        Ok(builder.seal())
    }

    /// Descriptor for `id`.
    pub fn get(&self, id: MessageId) -> Option<&MessageDescriptor> {
        self.descriptors.get(&id)
    }

    /// Descriptor for a message name.
    pub fn by_name(&self, name: &str) -> Option<&MessageDescriptor> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    /// Descriptors in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &MessageDescriptor> {
        self.descriptors.values()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Digest of every descriptor, compared between peers to catch catalog
    /// drift.
    pub fn fingerprint(&self) -> blake3::Hash {
        self.fingerprint
    }
}

fn fingerprint(descriptors: &BTreeMap<MessageId, MessageDescriptor>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for d in descriptors.values() {
        hasher.update(&d.id.raw().to_be_bytes());
        hasher.update(d.name.as_bytes());
        hasher.update(&[
            u8::from(d.reliable),
            u8::from(d.zerocoded),
            d.trust as u8,
            d.queue.index() as u8,
            d.payload as u8,
        ]);
        for block in d.schema.blocks {
            hasher.update(block.name.as_bytes());
            hasher.update(format!("{:?}", block.arity).as_bytes());
            for field in block.fields {
                hasher.update(field.name.as_bytes());
                hasher.update(format!("{:?}", field.kind).as_bytes());
            }
        }
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PayloadKind, Schema, TrustRequirement};
    use crate::scheduler::OutboundClass;

    fn descriptor(id: MessageId, name: &'static str) -> MessageDescriptor {
        MessageDescriptor {
            id,
            name,
            reliable: false,
            trust: TrustRequirement::Either,
            zerocoded: false,
            queue: OutboundClass::Medium,
            payload: PayloadKind::Plain,
            schema: Schema { blocks: &[] },
        }
    }

    #[test]
    fn duplicate_id_conflicts() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(descriptor(MessageId::bulk(7), "First"))
            .unwrap();
        let err = builder
            .register(descriptor(MessageId::bulk(7), "Second"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                id: MessageId::bulk(7),
                existing: "First",
                new: "Second",
            }
        );
    }

    #[test]
    fn duplicate_name_conflicts() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(descriptor(MessageId::bulk(7), "Same"))
            .unwrap();
        assert!(matches!(
            builder.register(descriptor(MessageId::bulk(8), "Same")),
            Err(RegistryError::DuplicateName { .. })
        ));
    }

    #[test]
    fn lookup_by_id_and_name() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(descriptor(MessageId::immediate(1), "Ping"))
            .unwrap();
        let registry = builder.seal();
        assert_eq!(registry.get(MessageId::immediate(1)).unwrap().name, "Ping");
        assert_eq!(
            registry.by_name("Ping").unwrap().id,
            MessageId::immediate(1)
        );
        assert!(registry.get(MessageId::immediate(2)).is_none());
    }

    #[test]
    fn fingerprint_ignores_registration_order() {
        let mut a = RegistryBuilder::new();
        a.register(descriptor(MessageId::bulk(1), "A")).unwrap();
        a.register(descriptor(MessageId::bulk(2), "B")).unwrap();
        let mut b = RegistryBuilder::new();
        b.register(descriptor(MessageId::bulk(2), "B")).unwrap();
        b.register(descriptor(MessageId::bulk(1), "A")).unwrap();
        assert_eq!(a.seal().fingerprint(), b.seal().fingerprint());
    }

    #[test]
    fn fingerprint_tracks_metadata() {
        let mut a = RegistryBuilder::new();
        a.register(descriptor(MessageId::bulk(1), "A")).unwrap();
        let mut b = RegistryBuilder::new();
        let mut d = descriptor(MessageId::bulk(1), "A");
        d.reliable = true;
        b.register(d).unwrap();
        assert_ne!(a.seal().fingerprint(), b.seal().fingerprint());
    }

    #[test]
    fn standard_catalog_seals() {
        let registry = MessageRegistry::standard().unwrap();
        assert!(registry.by_name("UseCircuitCode").is_some());
        assert!(registry.by_name("PacketAck").is_some());
    }
}
