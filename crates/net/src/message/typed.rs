//! Typed views over the messages the transport itself produces or consumes.
//!
//! Everything else travels as a schema-shaped [`Message`]; these views exist
//! for the handful of types the circuit, the server and the terrain path
//! build or inspect directly.

use super::{ids, FieldValue, Fields, Message, MessageId};
use crate::cursor::{CursorError, Reader, Writer};
use glam::{Quat, Vec3, Vec4};
use simwire_core::CircuitCode;
use thiserror::Error;
use uuid::Uuid;

/// A message value does not fit the typed view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The message has a different type.
    #[error("expected message {expected}, got {actual}")]
    WrongMessage {
        /// Id the view handles.
        expected: MessageId,
        /// Id carried by the message.
        actual: MessageId,
    },
    /// A field is absent or has another kind.
    #[error("field {block}/{instance}/{field} is missing or mistyped")]
    Field {
        /// Block index.
        block: usize,
        /// Instance index.
        instance: usize,
        /// Field index.
        field: usize,
    },
    /// An embedded payload blob failed to parse.
    #[error("embedded payload: {0}")]
    Payload(#[from] CursorError),
}

/// A typed view with a fixed message id.
pub trait TypedMessage: Sized + for<'a> TryFrom<&'a Message, Error = FieldError> {
    /// Id of the underlying message type.
    const ID: MessageId;

    /// Build the schema-shaped message.
    fn to_message(&self) -> Message;
}

fn expect_id(message: &Message, expected: MessageId) -> Result<(), FieldError> {
    if message.id == expected {
        Ok(())
    } else {
        Err(FieldError::WrongMessage {
            expected,
            actual: message.id,
        })
    }
}

fn get<'m, T>(
    message: &'m Message,
    (block, instance, field): (usize, usize, usize),
    extract: impl FnOnce(&'m FieldValue) -> Option<T>,
) -> Result<T, FieldError> {
    message
        .field(block, instance, field)
        .and_then(extract)
        .ok_or(FieldError::Field {
            block,
            instance,
            field,
        })
}

fn agent_data(agent_id: Uuid, session_id: Uuid) -> Vec<Fields> {
    vec![vec![FieldValue::Uuid(agent_id), FieldValue::Uuid(session_id)]]
}

/// Standalone acknowledgement of inbound sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAck {
    /// Acknowledged sequences.
    pub packets: Vec<u32>,
}

impl TypedMessage for PacketAck {
    const ID: MessageId = ids::PACKET_ACK;

    fn to_message(&self) -> Message {
        let packets = self
            .packets
            .iter()
            .map(|&id| vec![FieldValue::U32(id)])
            .collect();
        Message::new(Self::ID, vec![packets])
    }
}

impl TryFrom<&Message> for PacketAck {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        let packets = (0..m.instances(0).len())
            .map(|i| get(m, (0, i, 0), FieldValue::as_u32))
            .collect::<Result<_, _>>()?;
        Ok(Self { packets })
    }
}

/// Keep-alive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPingCheck {
    /// Rolling probe id.
    pub ping_id: u8,
    /// Oldest sequence the sender still waits on.
    pub oldest_unacked: u32,
}

impl TypedMessage for StartPingCheck {
    const ID: MessageId = ids::START_PING_CHECK;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![vec![vec![
                FieldValue::U8(self.ping_id),
                FieldValue::U32(self.oldest_unacked),
            ]]],
        )
    }
}

impl TryFrom<&Message> for StartPingCheck {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            ping_id: get(m, (0, 0, 0), FieldValue::as_u8)?,
            oldest_unacked: get(m, (0, 0, 1), FieldValue::as_u32)?,
        })
    }
}

/// Keep-alive reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletePingCheck {
    /// Id echoed from the probe.
    pub ping_id: u8,
}

impl TypedMessage for CompletePingCheck {
    const ID: MessageId = ids::COMPLETE_PING_CHECK;

    fn to_message(&self) -> Message {
        Message::new(Self::ID, vec![vec![vec![FieldValue::U8(self.ping_id)]]])
    }
}

impl TryFrom<&Message> for CompletePingCheck {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            ping_id: get(m, (0, 0, 0), FieldValue::as_u8)?,
        })
    }
}

/// Circuit handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCircuitCode {
    /// Code issued by the login service.
    pub code: CircuitCode,
    /// Login session.
    pub session_id: Uuid,
    /// Agent the viewer claims to be.
    pub agent_id: Uuid,
}

impl TypedMessage for UseCircuitCode {
    const ID: MessageId = ids::USE_CIRCUIT_CODE;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![vec![vec![
                FieldValue::U32(self.code.0),
                FieldValue::Uuid(self.session_id),
                FieldValue::Uuid(self.agent_id),
            ]]],
        )
    }
}

impl TryFrom<&Message> for UseCircuitCode {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            code: CircuitCode(get(m, (0, 0, 0), FieldValue::as_u32)?),
            session_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
            agent_id: get(m, (0, 0, 2), FieldValue::as_uuid)?,
        })
    }
}

/// Viewer logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutRequest {
    /// Agent logging out.
    pub agent_id: Uuid,
    /// Session being closed.
    pub session_id: Uuid,
}

impl TypedMessage for LogoutRequest {
    const ID: MessageId = ids::LOGOUT_REQUEST;

    fn to_message(&self) -> Message {
        Message::new(Self::ID, vec![agent_data(self.agent_id, self.session_id)])
    }
}

impl TryFrom<&Message> for LogoutRequest {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            agent_id: get(m, (0, 0, 0), FieldValue::as_uuid)?,
            session_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
        })
    }
}

/// Logout acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutReply {
    /// Agent logging out.
    pub agent_id: Uuid,
    /// Session being closed.
    pub session_id: Uuid,
    /// Inventory items the viewer should refresh.
    pub items: Vec<Uuid>,
}

impl TypedMessage for LogoutReply {
    const ID: MessageId = ids::LOGOUT_REPLY;

    fn to_message(&self) -> Message {
        let items = self
            .items
            .iter()
            .map(|&id| vec![FieldValue::Uuid(id)])
            .collect();
        Message::new(
            Self::ID,
            vec![agent_data(self.agent_id, self.session_id), items],
        )
    }
}

impl TryFrom<&Message> for LogoutReply {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        let items = (0..m.instances(1).len())
            .map(|i| get(m, (1, i, 0), FieldValue::as_uuid))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            agent_id: get(m, (0, 0, 0), FieldValue::as_uuid)?,
            session_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
            items,
        })
    }
}

/// Either side tears the circuit down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseCircuit;

impl TypedMessage for CloseCircuit {
    const ID: MessageId = ids::CLOSE_CIRCUIT;

    fn to_message(&self) -> Message {
        Message::new(Self::ID, Vec::new())
    }
}

impl TryFrom<&Message> for CloseCircuit {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self)
    }
}

/// Chat typed by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFromViewer {
    /// Speaker.
    pub agent_id: Uuid,
    /// Speaker's session.
    pub session_id: Uuid,
    /// Text.
    pub message: String,
    /// Whisper, say, shout and so on.
    pub chat_type: u8,
    /// Chat channel; 0 is public.
    pub channel: i32,
}

impl TypedMessage for ChatFromViewer {
    const ID: MessageId = ids::CHAT_FROM_VIEWER;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![
                agent_data(self.agent_id, self.session_id),
                vec![vec![
                    FieldValue::Text(self.message.clone()),
                    FieldValue::U8(self.chat_type),
                    FieldValue::I32(self.channel),
                ]],
            ],
        )
    }
}

impl TryFrom<&Message> for ChatFromViewer {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            agent_id: get(m, (0, 0, 0), FieldValue::as_uuid)?,
            session_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
            message: get(m, (1, 0, 0), |v| v.as_text().map(str::to_owned))?,
            chat_type: get(m, (1, 0, 1), FieldValue::as_u8)?,
            channel: get(m, (1, 0, 2), FieldValue::as_i32)?,
        })
    }
}

/// Chat relayed to viewers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFromSimulator {
    /// Display name of the speaker.
    pub from_name: String,
    /// Speaking object or agent.
    pub source_id: Uuid,
    /// Owner of the speaker.
    pub owner_id: Uuid,
    /// Agent, object or system.
    pub source_type: u8,
    /// Whisper, say, shout and so on.
    pub chat_type: u8,
    /// Audibility level.
    pub audible: u8,
    /// Speaker position in region coordinates.
    pub position: Vec3,
    /// Text.
    pub message: String,
}

impl TypedMessage for ChatFromSimulator {
    const ID: MessageId = ids::CHAT_FROM_SIMULATOR;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![vec![vec![
                FieldValue::Text(self.from_name.clone()),
                FieldValue::Uuid(self.source_id),
                FieldValue::Uuid(self.owner_id),
                FieldValue::U8(self.source_type),
                FieldValue::U8(self.chat_type),
                FieldValue::U8(self.audible),
                FieldValue::Vec3(self.position),
                FieldValue::Text(self.message.clone()),
            ]]],
        )
    }
}

impl TryFrom<&Message> for ChatFromSimulator {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            from_name: get(m, (0, 0, 0), |v| v.as_text().map(str::to_owned))?,
            source_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
            owner_id: get(m, (0, 0, 2), FieldValue::as_uuid)?,
            source_type: get(m, (0, 0, 3), FieldValue::as_u8)?,
            chat_type: get(m, (0, 0, 4), FieldValue::as_u8)?,
            audible: get(m, (0, 0, 5), FieldValue::as_u8)?,
            position: get(m, (0, 0, 6), FieldValue::as_vec3)?,
            message: get(m, (0, 0, 7), |v| v.as_text().map(str::to_owned))?,
        })
    }
}

/// Compressed terrain patches for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerData {
    /// Layer type byte.
    pub layer_type: u8,
    /// Group header plus patch bit stream.
    pub data: Vec<u8>,
}

impl TypedMessage for LayerData {
    const ID: MessageId = ids::LAYER_DATA;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![
                vec![vec![FieldValue::U8(self.layer_type)]],
                vec![vec![FieldValue::Bytes(self.data.clone())]],
            ],
        )
    }
}

impl TryFrom<&Message> for LayerData {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        Ok(Self {
            layer_type: get(m, (0, 0, 0), FieldValue::as_u8)?,
            data: get(m, (1, 0, 0), |v| v.as_bytes().map(<[u8]>::to_vec))?,
        })
    }
}

/// Per-class bandwidth the viewer asks for, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Throttles {
    /// Resend, land, wind, cloud, task, texture and asset, in that order.
    pub values: [f32; 7],
}

impl Throttles {
    /// Sum of every class, in bytes per second.
    pub fn total_bytes_per_second(&self) -> u32 {
        let bits: f32 = self.values.iter().map(|v| v.max(0.0)).sum();
        (bits / 8.0) as u32
    }

    fn encode(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CursorError> {
        let mut reader = Reader::new(bytes);
        let mut values = [0.0; 7];
        for value in &mut values {
            *value = reader.read_f32()?;
        }
        Ok(Self { values })
    }
}

/// Viewer bandwidth settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentThrottle {
    /// Agent sending the settings.
    pub agent_id: Uuid,
    /// Agent's session.
    pub session_id: Uuid,
    /// Circuit the settings apply to.
    pub circuit_code: CircuitCode,
    /// Monotonic settings generation.
    pub gen_counter: u32,
    /// Requested rates.
    pub throttles: Throttles,
}

impl TypedMessage for AgentThrottle {
    const ID: MessageId = ids::AGENT_THROTTLE;

    fn to_message(&self) -> Message {
        Message::new(
            Self::ID,
            vec![
                vec![vec![
                    FieldValue::Uuid(self.agent_id),
                    FieldValue::Uuid(self.session_id),
                    FieldValue::U32(self.circuit_code.0),
                ]],
                vec![vec![
                    FieldValue::U32(self.gen_counter),
                    FieldValue::Bytes(self.throttles.encode()),
                ]],
            ],
        )
    }
}

impl TryFrom<&Message> for AgentThrottle {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, Self::ID)?;
        let blob = get(m, (1, 0, 1), FieldValue::as_bytes)?;
        Ok(Self {
            agent_id: get(m, (0, 0, 0), FieldValue::as_uuid)?,
            session_id: get(m, (0, 0, 1), FieldValue::as_uuid)?,
            circuit_code: CircuitCode(get(m, (0, 0, 2), FieldValue::as_u32)?),
            gen_counter: get(m, (1, 0, 0), FieldValue::as_u32)?,
            throttles: Throttles::decode(blob)?,
        })
    }
}

/// Compact motion state of one object, carried in the `Data` blob of
/// [`ImprovedTerseObjectUpdate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerseObjectData {
    /// Region-local object id.
    pub local_id: u32,
    /// Per-object update counter; big-endian on the wire.
    pub update_counter: u16,
    /// Attachment state.
    pub state: u8,
    /// Avatar collision plane; present only for avatars.
    pub collision_plane: Option<Vec4>,
    /// Region position.
    pub position: Vec3,
    /// Linear velocity, quantized to `[-128, 128]`.
    pub velocity: Vec3,
    /// Linear acceleration, quantized to `[-64, 64]`.
    pub acceleration: Vec3,
    /// Orientation, each component quantized to `[-1, 1]`.
    pub rotation: Quat,
    /// Angular velocity, quantized to `[-64, 64]`.
    pub angular_velocity: Vec3,
}

const VELOCITY_RANGE: f32 = 128.0;
const ACCELERATION_RANGE: f32 = 64.0;
const ANGULAR_RANGE: f32 = 64.0;

fn quantize(value: f32, range: f32) -> u16 {
    let unit = ((value + range) / (2.0 * range)).clamp(0.0, 1.0);
    (unit * f32::from(u16::MAX)).round() as u16
}

fn dequantize(raw: u16, range: f32) -> f32 {
    f32::from(raw) / f32::from(u16::MAX) * 2.0 * range - range
}

fn write_quantized(w: &mut Writer<'_>, v: Vec3, range: f32) -> Result<(), CursorError> {
    for c in v.to_array() {
        w.write_u16(quantize(c, range))?;
    }
    Ok(())
}

fn read_quantized(r: &mut Reader<'_>, range: f32) -> Result<Vec3, CursorError> {
    Ok(Vec3::new(
        dequantize(r.read_u16()?, range),
        dequantize(r.read_u16()?, range),
        dequantize(r.read_u16()?, range),
    ))
}

impl TerseObjectData {
    /// Largest encoded size (avatar with collision plane).
    pub const MAX_LEN: usize = 4 + 2 + 1 + 1 + 16 + 12 + 6 + 6 + 8 + 6;

    /// Serialize into the `Data` blob layout.
    pub fn encode(&self) -> Result<Vec<u8>, CursorError> {
        let mut buf = [0u8; Self::MAX_LEN];
        let mut w = Writer::new(&mut buf);
        w.write_u32(self.local_id)?;
        w.write_u16_be(self.update_counter)?;
        w.write_u8(self.state)?;
        w.write_bool(self.collision_plane.is_some())?;
        if let Some(plane) = self.collision_plane {
            w.write_vec4(plane)?;
        }
        w.write_vec3(self.position)?;
        write_quantized(&mut w, self.velocity, VELOCITY_RANGE)?;
        write_quantized(&mut w, self.acceleration, ACCELERATION_RANGE)?;
        for c in self.rotation.to_array() {
            w.write_u16(quantize(c, 1.0))?;
        }
        write_quantized(&mut w, self.angular_velocity, ANGULAR_RANGE)?;
        Ok(w.written().to_vec())
    }

    /// Parse a `Data` blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, CursorError> {
        let mut r = Reader::new(bytes);
        let local_id = r.read_u32()?;
        let update_counter = r.read_u16_be()?;
        let state = r.read_u8()?;
        let collision_plane = if r.read_bool()? {
            Some(r.read_vec4()?)
        } else {
            None
        };
        let position = r.read_vec3()?;
        let velocity = read_quantized(&mut r, VELOCITY_RANGE)?;
        let acceleration = read_quantized(&mut r, ACCELERATION_RANGE)?;
        let mut rotation = [0.0; 4];
        for c in &mut rotation {
            *c = dequantize(r.read_u16()?, 1.0);
        }
        let angular_velocity = read_quantized(&mut r, ANGULAR_RANGE)?;
        Ok(Self {
            local_id,
            update_counter,
            state,
            collision_plane,
            position,
            velocity,
            acceleration,
            rotation: Quat::from_array(rotation),
            angular_velocity,
        })
    }
}

/// Compact motion updates for many objects.
#[derive(Debug, Clone, PartialEq)]
pub struct ImprovedTerseObjectUpdate {
    /// Region the objects live in.
    pub region_handle: u64,
    /// Simulation speed relative to real time, scaled to `u16`.
    pub time_dilation: u16,
    /// One entry per object.
    pub objects: Vec<TerseObjectData>,
}

impl ImprovedTerseObjectUpdate {
    /// Build the message; fails if an object blob cannot be encoded.
    pub fn try_to_message(&self) -> Result<Message, CursorError> {
        let objects = self
            .objects
            .iter()
            .map(|o| -> Result<Fields, CursorError> {
                Ok(vec![
                    FieldValue::Bytes(o.encode()?),
                    FieldValue::Bytes(Vec::new()),
                ])
            })
            .collect::<Result<_, _>>()?;
        Ok(Message::new(
            ids::IMPROVED_TERSE_OBJECT_UPDATE,
            vec![
                vec![vec![
                    FieldValue::U64(self.region_handle),
                    FieldValue::U16(self.time_dilation),
                ]],
                objects,
            ],
        ))
    }
}

impl TryFrom<&Message> for ImprovedTerseObjectUpdate {
    type Error = FieldError;

    fn try_from(m: &Message) -> Result<Self, Self::Error> {
        expect_id(m, ids::IMPROVED_TERSE_OBJECT_UPDATE)?;
        let objects = (0..m.instances(1).len())
            .map(|i| -> Result<TerseObjectData, FieldError> {
                let blob = get(m, (1, i, 0), FieldValue::as_bytes)?;
                Ok(TerseObjectData::decode(blob)?)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            region_handle: get(m, (0, 0, 0), FieldValue::as_u64)?,
            time_dilation: get(m, (0, 0, 1), FieldValue::as_u16)?,
            objects,
        })
    }
}
