//! Packet envelope: flags, sequence, extra header, body and appended acks.
//!
//! ```text
//! +-------+----------------+-----------+---------------+----------------+-------+
//! | flags | sequence (BE)  | extra len | extra bytes   | tag + body     | acks  |
//! | 1     | 4              | 1         | extra len     | maybe zerocoded| 4n+1  |
//! +-------+----------------+-----------+---------------+----------------+-------+
//! ```

use crate::cursor::{CursorError, Reader, Writer};
use crate::error::{EncodeError, Malformed};
use crate::message::{Listener, Message, MessageDescriptor, MessageId, MessageRegistry};
use crate::zerocode;
use bitflags::bitflags;
use std::borrow::Cow;

bitflags! {
    /// Envelope flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        /// Tag and body are zero-run coded.
        const ZEROCODED = 0x80;
        /// Receiver must acknowledge the sequence.
        const RELIABLE = 0x40;
        /// Retransmission of an earlier send.
        const RESENT = 0x20;
        /// Acks are appended after the body.
        const ACKS = 0x10;
    }
}

/// Flags, sequence and extra-length byte.
pub const HEADER_LEN: usize = 6;

/// Most acks one packet can carry.
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

/// A parsed envelope; the body may still be zero-coded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Flag byte.
    pub flags: PacketFlags,
    /// Sender-assigned sequence.
    pub sequence: u32,
    /// Opaque extra header bytes.
    pub extra: &'a [u8],
    /// Acks carried in the trailer, nearest the count byte first.
    pub acks: Vec<u32>,
    /// Tag and fields.
    pub body: &'a [u8],
}

/// A body decoded against its descriptor.
#[derive(Debug, Clone)]
pub struct Decoded<'r> {
    /// Descriptor the body matched.
    pub descriptor: &'r MessageDescriptor,
    /// Field values.
    pub message: Message,
}

/// Split a datagram into envelope parts. Acks are read backward from the end
/// so they are available whatever the body turns out to be.
pub fn parse_envelope(datagram: &[u8]) -> Result<Envelope<'_>, Malformed> {
    if datagram.len() < HEADER_LEN {
        return Err(Malformed::TruncatedHeader {
            len: datagram.len(),
        });
    }
    let mut reader = Reader::new(datagram);
    let flags = PacketFlags::from_bits_truncate(reader.read_u8()?);
    let sequence = reader.read_u32_be()?;
    let extra_len = usize::from(reader.read_u8()?);
    let extra = reader.take(extra_len).map_err(|_| Malformed::TruncatedHeader {
        len: datagram.len(),
    })?;
    let mut rest = reader.rest();

    let mut acks = Vec::new();
    if flags.contains(PacketFlags::ACKS) {
        let (&count, without_count) =
            rest.split_last()
                .ok_or(Malformed::TruncatedAcks {
                    count: 0,
                    available: 0,
                })?;
        let count = usize::from(count);
        let needed = count * 4;
        if needed > without_count.len() {
            return Err(Malformed::TruncatedAcks {
                count,
                available: without_count.len(),
            });
        }
        let mut end = without_count.len();
        for _ in 0..count {
            let raw = &without_count[end - 4..end];
            acks.push(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
            end -= 4;
        }
        rest = &without_count[..end];
    }

    Ok(Envelope {
        flags,
        sequence,
        extra,
        acks,
        body: rest,
    })
}

impl Envelope<'_> {
    /// The message tag, after undoing zero coding if needed.
    pub fn message_id(&self, limit: usize) -> Result<MessageId, Malformed> {
        let body = self.plain_body(limit)?;
        Ok(MessageId::read(&mut Reader::new(&body))?)
    }

    /// Tag and fields with zero coding removed.
    pub fn plain_body(&self, limit: usize) -> Result<Cow<'_, [u8]>, Malformed> {
        if self.flags.contains(PacketFlags::ZEROCODED) {
            Ok(Cow::Owned(zerocode::decode(self.body, limit)?))
        } else {
            Ok(Cow::Borrowed(self.body))
        }
    }

    /// Look up the descriptor, enforce the trust boundary and decode fields.
    pub fn decode<'r>(
        &self,
        registry: &'r MessageRegistry,
        listener: Listener,
        limit: usize,
    ) -> Result<Decoded<'r>, Malformed> {
        let body = self.plain_body(limit)?;
        let mut reader = Reader::new(&body);
        let id = MessageId::read(&mut reader)?;
        let descriptor = registry.get(id).ok_or(Malformed::UnknownMessage(id))?;
        if !descriptor.trust.permits(listener) {
            return Err(Malformed::TrustViolation {
                message: descriptor.name,
                listener,
            });
        }
        let message = descriptor.decode(&mut reader)?;
        Ok(Decoded {
            descriptor,
            message,
        })
    }
}

/// Serialize `message` into a packet with a zero sequence placeholder.
///
/// The body is zero-coded only if the descriptor allows it and the result is
/// smaller.
pub fn encode_packet(
    descriptor: &MessageDescriptor,
    message: &Message,
    reliable: bool,
    max_packet_size: usize,
) -> Result<Vec<u8>, EncodeError> {
    let mut buf = vec![0u8; max_packet_size];
    let body_len = {
        let body_area = buf
            .get_mut(HEADER_LEN..)
            .ok_or(EncodeError::TooLarge {
                limit: max_packet_size,
            })?;
        let mut writer = Writer::new(body_area);
        descriptor
            .encode(message, &mut writer)
            .map_err(|err| match err {
                EncodeError::Cursor(CursorError::BufferOverrun { .. }) => EncodeError::TooLarge {
                    limit: max_packet_size,
                },
                other => other,
            })?;
        writer.position()
    };
    buf.truncate(HEADER_LEN + body_len);

    let mut flags = PacketFlags::empty();
    if reliable {
        flags |= PacketFlags::RELIABLE;
    }
    if descriptor.zerocoded {
        let coded = zerocode::encode(&buf[HEADER_LEN..]);
        if coded.len() < body_len {
            buf.truncate(HEADER_LEN);
            buf.extend_from_slice(&coded);
            flags |= PacketFlags::ZEROCODED;
        }
    }
    buf[0] = flags.bits();
    Ok(buf)
}

/// Flags of a serialized packet.
pub fn flags(packet: &[u8]) -> PacketFlags {
    packet
        .first()
        .map_or(PacketFlags::empty(), |&b| PacketFlags::from_bits_truncate(b))
}

/// Sequence of a serialized packet.
pub fn sequence(packet: &[u8]) -> Option<u32> {
    let raw = packet.get(1..5)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Stamp the sequence into a serialized packet.
pub fn set_sequence(packet: &mut [u8], sequence: u32) {
    if let Some(slot) = packet.get_mut(1..5) {
        slot.copy_from_slice(&sequence.to_be_bytes());
    }
}

/// Add flags to a serialized packet.
pub fn insert_flags(packet: &mut [u8], extra: PacketFlags) {
    if let Some(first) = packet.first_mut() {
        *first = (PacketFlags::from_bits_truncate(*first) | extra).bits();
    }
}

/// Append as many of `acks` as fit under `max_packet_size`, returning how
/// many were written. Nothing is appended if not even one fits.
pub fn append_acks(packet: &mut Vec<u8>, acks: &[u32], max_packet_size: usize) -> usize {
    if flags(packet).contains(PacketFlags::ACKS) {
        return 0;
    }
    let room = max_packet_size.saturating_sub(packet.len() + 1) / 4;
    let count = acks.len().min(room).min(MAX_APPENDED_ACKS);
    if count == 0 {
        return 0;
    }
    // Written in reverse so the first ack sits next to the count byte.
    for ack in acks[..count].iter().rev() {
        packet.extend_from_slice(&ack.to_be_bytes());
    }
    packet.push(count as u8);
    insert_flags(packet, PacketFlags::ACKS);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ids, typed::PacketAck, typed::TypedMessage, MessageRegistry};

    fn registry() -> MessageRegistry {
        MessageRegistry::standard().unwrap()
    }

    #[test]
    fn header_layout() {
        let registry = registry();
        let ack = PacketAck {
            packets: vec![0x0A0B0C0D],
        }
        .to_message();
        let desc = registry.get(ids::PACKET_ACK).unwrap();
        let mut packet = encode_packet(desc, &ack, true, 1200).unwrap();
        set_sequence(&mut packet, 0x01020304);
        assert_eq!(packet[0], PacketFlags::RELIABLE.bits());
        assert_eq!(&packet[1..5], &[1, 2, 3, 4]);
        assert_eq!(packet[5], 0);
        assert_eq!(&packet[6..10], &[0xFF, 0xFF, 0xFF, 0xFB]);
        assert_eq!(packet[10], 1);
        assert_eq!(&packet[11..15], &0x0A0B0C0Du32.to_le_bytes());
    }

    #[test]
    fn acks_parse_from_the_tail() {
        let registry = registry();
        let desc = registry.get(ids::CLOSE_CIRCUIT).unwrap();
        let close = Message::new(ids::CLOSE_CIRCUIT, Vec::new());
        let mut packet = encode_packet(desc, &close, false, 1200).unwrap();
        assert_eq!(append_acks(&mut packet, &[10, 11, 12], 1200), 3);

        let env = parse_envelope(&packet).unwrap();
        assert!(env.flags.contains(PacketFlags::ACKS));
        assert_eq!(env.acks, vec![10, 11, 12]);
        assert_eq!(env.body, &[0xFF, 0xFF, 0xFF, 0xFD]);
    }

    #[test]
    fn truncated_ack_count_is_malformed() {
        // Claims 3 acks but carries one.
        let packet = [0x10, 0, 0, 0, 1, 0, 1, 0, 0, 0, 5, 3];
        assert!(matches!(
            parse_envelope(&packet),
            Err(Malformed::TruncatedAcks { count: 3, .. })
        ));
        // Flag set but nothing after the header.
        assert!(matches!(
            parse_envelope(&[0x10, 0, 0, 0, 1, 0]),
            Err(Malformed::TruncatedAcks { .. })
        ));
    }

    #[test]
    fn short_datagram_is_truncated_header() {
        assert_eq!(
            parse_envelope(&[0x40, 0, 0]),
            Err(Malformed::TruncatedHeader { len: 3 })
        );
        // Extra length points past the end.
        assert!(matches!(
            parse_envelope(&[0, 0, 0, 0, 1, 9, 1]),
            Err(Malformed::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn extra_header_is_skipped() {
        let registry = registry();
        let packet = [0u8, 0, 0, 0, 7, 2, 0xAA, 0xBB, 0xFF, 0xFF, 0xFF, 0xFD];
        let env = parse_envelope(&packet).unwrap();
        assert_eq!(env.sequence, 7);
        assert_eq!(env.extra, &[0xAA, 0xBB]);
        let decoded = env.decode(&registry, Listener::Client, 4096).unwrap();
        assert_eq!(decoded.message.id, ids::CLOSE_CIRCUIT);
    }

    #[test]
    fn zerocoding_only_when_smaller() {
        let registry = registry();
        let desc = registry.get(ids::LOGOUT_REPLY).unwrap();
        let reply = crate::message::typed::LogoutReply {
            agent_id: uuid::Uuid::nil(),
            session_id: uuid::Uuid::nil(),
            items: vec![uuid::Uuid::nil(); 4],
        }
        .to_message();
        let packet = encode_packet(desc, &reply, true, 1200).unwrap();
        assert!(flags(&packet).contains(PacketFlags::ZEROCODED));

        let env = parse_envelope(&packet).unwrap();
        let decoded = env.decode(&registry, Listener::Client, 4096).unwrap();
        assert_eq!(decoded.message, reply);
    }

    #[test]
    fn trust_boundary_is_enforced() {
        let registry = registry();
        // KickUser header + tag, body irrelevant.
        let packet = [0u8, 0, 0, 0, 1, 0, 0xFF, 0xFF, 0x00, 0xA3];
        let env = parse_envelope(&packet).unwrap();
        let err = env.decode(&registry, Listener::Client, 4096).unwrap_err();
        assert!(err.is_security_relevant());
    }

    #[test]
    fn unknown_id_is_reported() {
        let registry = registry();
        let packet = [0u8, 0, 0, 0, 1, 0, 0xFE];
        let env = parse_envelope(&packet).unwrap();
        assert_eq!(
            env.decode(&registry, Listener::Client, 4096).unwrap_err(),
            Malformed::UnknownMessage(MessageId::immediate(0xFE))
        );
    }

    #[test]
    fn oversized_body_is_too_large() {
        let registry = registry();
        let desc = registry.get(ids::PACKET_ACK).unwrap();
        let ack = PacketAck {
            packets: (0..200).collect(),
        }
        .to_message();
        assert_eq!(
            encode_packet(desc, &ack, false, 64),
            Err(EncodeError::TooLarge { limit: 64 })
        );
    }

    #[test]
    fn ack_append_respects_size_limit() {
        let mut packet = vec![0u8; 10];
        assert_eq!(append_acks(&mut packet, &[1, 2, 3], 19), 2);
        assert_eq!(packet.len(), 19);
        let mut full = vec![0u8; 20];
        assert_eq!(append_acks(&mut full, &[1], 20), 0);
        assert_eq!(full.len(), 20);
    }
}
