//! The shipped subset of the message catalog.
//!
//! Each entry is data: an id, a name, transport metadata and a field schema.
//! Modules that need more types register them on the same builder before it
//! is sealed.

use super::schema::{block, field, BlockArity::*, FieldKind::*, Schema};
use super::{
    MessageDescriptor, PayloadKind, RegistryBuilder, RegistryError, TrustRequirement::*,
};
use crate::scheduler::OutboundClass;

/// Ids of the shipped message types.
pub mod ids {
    use crate::message::MessageId;

    /// Keep-alive probe.
    pub const START_PING_CHECK: MessageId = MessageId::immediate(1);
    /// Keep-alive reply.
    pub const COMPLETE_PING_CHECK: MessageId = MessageId::immediate(2);
    /// Viewer camera and control state.
    pub const AGENT_UPDATE: MessageId = MessageId::immediate(4);
    /// Texture data continuation.
    pub const IMAGE_PACKET: MessageId = MessageId::immediate(10);
    /// Compressed terrain patches.
    pub const LAYER_DATA: MessageId = MessageId::immediate(11);
    /// Compact object motion updates.
    pub const IMPROVED_TERSE_OBJECT_UPDATE: MessageId = MessageId::immediate(15);
    /// Asset transfer chunk.
    pub const TRANSFER_PACKET: MessageId = MessageId::immediate(17);
    /// Viewer asks for full object data.
    pub const REQUEST_MULTIPLE_OBJECTS: MessageId = MessageId::standard(3);
    /// Viewer-side visual effects.
    pub const VIEWER_EFFECT: MessageId = MessageId::standard(17);
    /// Circuit handshake.
    pub const USE_CIRCUIT_CODE: MessageId = MessageId::bulk(3);
    /// First packet of a texture.
    pub const IMAGE_DATA: MessageId = MessageId::bulk(9);
    /// Peer simulator keeps a child agent alive.
    pub const CHILD_AGENT_ALIVE: MessageId = MessageId::bulk(26);
    /// Chat typed by a viewer.
    pub const CHAT_FROM_VIEWER: MessageId = MessageId::bulk(80);
    /// Viewer bandwidth settings.
    pub const AGENT_THROTTLE: MessageId = MessageId::bulk(81);
    /// Chat relayed to viewers.
    pub const CHAT_FROM_SIMULATOR: MessageId = MessageId::bulk(139);
    /// Region statistics.
    pub const SIM_STATS: MessageId = MessageId::bulk(140);
    /// Region description sent after the handshake.
    pub const REGION_HANDSHAKE: MessageId = MessageId::bulk(148);
    /// Viewer confirms the region description.
    pub const REGION_HANDSHAKE_REPLY: MessageId = MessageId::bulk(149);
    /// Simulator clock and sun position.
    pub const SIMULATOR_VIEWER_TIME_MESSAGE: MessageId = MessageId::bulk(150);
    /// Peer simulator asks to kick a user.
    pub const KICK_USER: MessageId = MessageId::bulk(163);
    /// Viewer finishes arriving in the region.
    pub const COMPLETE_AGENT_MOVEMENT: MessageId = MessageId::bulk(249);
    /// Simulator confirms the arrival.
    pub const AGENT_MOVEMENT_COMPLETE: MessageId = MessageId::bulk(250);
    /// Viewer logs out.
    pub const LOGOUT_REQUEST: MessageId = MessageId::bulk(252);
    /// Simulator acknowledges the logout.
    pub const LOGOUT_REPLY: MessageId = MessageId::bulk(253);
    /// Standalone acknowledgements.
    pub const PACKET_ACK: MessageId = MessageId::bulk(0xFFFB);
    /// Either side closes the circuit.
    pub const CLOSE_CIRCUIT: MessageId = MessageId::bulk(0xFFFD);
}

const AGENT_DATA: super::BlockSpec = block(
    "AgentData",
    Single,
    &[field("AgentID", Uuid), field("SessionID", Uuid)],
);

const CATALOG: &[MessageDescriptor] = &[
    MessageDescriptor::new(
        ids::START_PING_CHECK,
        "StartPingCheck",
        Schema {
            blocks: &[block(
                "PingID",
                Single,
                &[field("PingID", U8), field("OldestUnacked", U32)],
            )],
        },
    )
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(
        ids::COMPLETE_PING_CHECK,
        "CompletePingCheck",
        Schema {
            blocks: &[block("PingID", Single, &[field("PingID", U8)])],
        },
    )
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(
        ids::AGENT_UPDATE,
        "AgentUpdate",
        Schema {
            blocks: &[block(
                "AgentData",
                Single,
                &[
                    field("AgentID", Uuid),
                    field("SessionID", Uuid),
                    field("BodyRotation", Quat),
                    field("HeadRotation", Quat),
                    field("State", U8),
                    field("CameraCenter", Vec3),
                    field("CameraAtAxis", Vec3),
                    field("CameraLeftAxis", Vec3),
                    field("CameraUpAxis", Vec3),
                    field("Far", F32),
                    field("ControlFlags", U32),
                    field("Flags", U8),
                ],
            )],
        },
    )
    .with_trust(UntrustedClientOnly)
    .with_zerocoded()
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(
        ids::IMAGE_PACKET,
        "ImagePacket",
        Schema {
            blocks: &[
                block(
                    "ImageID",
                    Single,
                    &[field("ID", Uuid), field("Packet", U16)],
                ),
                block("ImageData", Single, &[field("Data", Variable2)]),
            ],
        },
    )
    .with_queue(OutboundClass::Texture),
    MessageDescriptor::new(
        ids::LAYER_DATA,
        "LayerData",
        Schema {
            blocks: &[
                block("LayerID", Single, &[field("Type", U8)]),
                block("LayerData", Single, &[field("Data", Variable2)]),
            ],
        },
    )
    .with_reliable()
    .with_queue(OutboundClass::Land)
    .with_payload(PayloadKind::TerrainLayer),
    MessageDescriptor::new(
        ids::IMPROVED_TERSE_OBJECT_UPDATE,
        "ImprovedTerseObjectUpdate",
        Schema {
            blocks: &[
                block(
                    "RegionData",
                    Single,
                    &[field("RegionHandle", U64), field("TimeDilation", U16)],
                ),
                block(
                    "ObjectData",
                    Variable,
                    &[field("Data", Variable1), field("TextureEntry", Variable2)],
                ),
            ],
        },
    )
    .with_queue(OutboundClass::Object),
    MessageDescriptor::new(
        ids::TRANSFER_PACKET,
        "TransferPacket",
        Schema {
            blocks: &[block(
                "TransferData",
                Single,
                &[
                    field("TransferID", Uuid),
                    field("ChannelType", I32),
                    field("Packet", I32),
                    field("Status", I32),
                    field("Data", Variable2),
                ],
            )],
        },
    )
    .with_reliable()
    .with_queue(OutboundClass::Asset),
    MessageDescriptor::new(
        ids::REQUEST_MULTIPLE_OBJECTS,
        "RequestMultipleObjects",
        Schema {
            blocks: &[
                AGENT_DATA,
                block(
                    "ObjectData",
                    Variable,
                    &[field("CacheMissType", U8), field("ID", U32)],
                ),
            ],
        },
    )
    .with_reliable()
    .with_zerocoded()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::VIEWER_EFFECT,
        "ViewerEffect",
        Schema {
            blocks: &[
                AGENT_DATA,
                block(
                    "Effect",
                    Variable,
                    &[
                        field("ID", Uuid),
                        field("AgentID", Uuid),
                        field("Type", U8),
                        field("Duration", F32),
                        field("Color", Fixed(4)),
                        field("TypeData", Variable1),
                    ],
                ),
            ],
        },
    )
    .with_zerocoded(),
    MessageDescriptor::new(
        ids::USE_CIRCUIT_CODE,
        "UseCircuitCode",
        Schema {
            blocks: &[block(
                "CircuitCode",
                Single,
                &[
                    field("Code", U32),
                    field("SessionID", Uuid),
                    field("ID", Uuid),
                ],
            )],
        },
    )
    .with_reliable()
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(
        ids::IMAGE_DATA,
        "ImageData",
        Schema {
            blocks: &[
                block(
                    "ImageID",
                    Single,
                    &[
                        field("ID", Uuid),
                        field("Codec", U8),
                        field("Size", U32),
                        field("Packets", U16),
                    ],
                ),
                block("ImageData", Single, &[field("Data", Variable2)]),
            ],
        },
    )
    .with_reliable()
    .with_queue(OutboundClass::TextureStart),
    MessageDescriptor::new(
        ids::CHILD_AGENT_ALIVE,
        "ChildAgentAlive",
        Schema {
            blocks: &[block(
                "AgentData",
                Single,
                &[
                    field("RegionHandle", U64),
                    field("ViewerCircuitCode", U32),
                    field("AgentID", Uuid),
                    field("SessionID", Uuid),
                ],
            )],
        },
    )
    .with_reliable()
    .with_trust(TrustedPeerOnly),
    MessageDescriptor::new(
        ids::CHAT_FROM_VIEWER,
        "ChatFromViewer",
        Schema {
            blocks: &[
                AGENT_DATA,
                block(
                    "ChatData",
                    Single,
                    &[
                        field("Message", String2),
                        field("Type", U8),
                        field("Channel", I32),
                    ],
                ),
            ],
        },
    )
    .with_reliable()
    .with_zerocoded()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::AGENT_THROTTLE,
        "AgentThrottle",
        Schema {
            blocks: &[
                block(
                    "AgentData",
                    Single,
                    &[
                        field("AgentID", Uuid),
                        field("SessionID", Uuid),
                        field("CircuitCode", U32),
                    ],
                ),
                block(
                    "Throttle",
                    Single,
                    &[field("GenCounter", U32), field("Throttles", Variable1)],
                ),
            ],
        },
    )
    .with_reliable()
    .with_zerocoded()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::CHAT_FROM_SIMULATOR,
        "ChatFromSimulator",
        Schema {
            blocks: &[block(
                "ChatData",
                Single,
                &[
                    field("FromName", String1),
                    field("SourceID", Uuid),
                    field("OwnerID", Uuid),
                    field("SourceType", U8),
                    field("ChatType", U8),
                    field("Audible", U8),
                    field("Position", Vec3),
                    field("Message", String2),
                ],
            )],
        },
    )
    .with_reliable(),
    MessageDescriptor::new(
        ids::SIM_STATS,
        "SimStats",
        Schema {
            blocks: &[
                block(
                    "Region",
                    Single,
                    &[
                        field("RegionX", U32),
                        field("RegionY", U32),
                        field("RegionFlags", U32),
                        field("ObjectCapacity", U32),
                    ],
                ),
                block(
                    "Stat",
                    Variable,
                    &[field("StatID", U32), field("StatValue", F32)],
                ),
            ],
        },
    )
    .with_queue(OutboundClass::Low),
    MessageDescriptor::new(
        ids::REGION_HANDSHAKE,
        "RegionHandshake",
        Schema {
            blocks: &[block(
                "RegionInfo",
                Single,
                &[
                    field("RegionFlags", U32),
                    field("SimAccess", U8),
                    field("SimName", String1),
                    field("SimOwner", Uuid),
                    field("IsEstateManager", Bool),
                    field("WaterHeight", F32),
                    field("BillableFactor", F32),
                    field("CacheID", Uuid),
                ],
            )],
        },
    )
    .with_reliable()
    .with_zerocoded(),
    MessageDescriptor::new(
        ids::REGION_HANDSHAKE_REPLY,
        "RegionHandshakeReply",
        Schema {
            blocks: &[
                AGENT_DATA,
                block("RegionInfo", Single, &[field("Flags", U32)]),
            ],
        },
    )
    .with_reliable()
    .with_zerocoded()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::SIMULATOR_VIEWER_TIME_MESSAGE,
        "SimulatorViewerTimeMessage",
        Schema {
            blocks: &[block(
                "TimeInfo",
                Single,
                &[
                    field("UsecSinceStart", U64),
                    field("SecPerDay", U32),
                    field("SecPerYear", U32),
                    field("SunDirection", Vec3),
                    field("SunPhase", F32),
                    field("SunAngVelocity", Vec3),
                ],
            )],
        },
    )
    .with_queue(OutboundClass::Low),
    MessageDescriptor::new(
        ids::KICK_USER,
        "KickUser",
        Schema {
            blocks: &[
                block(
                    "TargetBlock",
                    Single,
                    &[field("TargetIP", U32), field("TargetPort", U16)],
                ),
                block(
                    "UserInfo",
                    Single,
                    &[
                        field("AgentID", Uuid),
                        field("SessionID", Uuid),
                        field("Reason", String2),
                    ],
                ),
            ],
        },
    )
    .with_reliable()
    .with_trust(TrustedPeerOnly),
    MessageDescriptor::new(
        ids::COMPLETE_AGENT_MOVEMENT,
        "CompleteAgentMovement",
        Schema {
            blocks: &[block(
                "AgentData",
                Single,
                &[
                    field("AgentID", Uuid),
                    field("SessionID", Uuid),
                    field("CircuitCode", U32),
                ],
            )],
        },
    )
    .with_reliable()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::AGENT_MOVEMENT_COMPLETE,
        "AgentMovementComplete",
        Schema {
            blocks: &[
                AGENT_DATA,
                block(
                    "Data",
                    Single,
                    &[
                        field("Position", Vec3),
                        field("LookAt", Vec3),
                        field("RegionHandle", U64),
                        field("Timestamp", U32),
                    ],
                ),
                block("SimData", Single, &[field("ChannelVersion", String2)]),
            ],
        },
    )
    .with_reliable(),
    MessageDescriptor::new(
        ids::LOGOUT_REQUEST,
        "LogoutRequest",
        Schema {
            blocks: &[AGENT_DATA],
        },
    )
    .with_reliable()
    .with_trust(UntrustedClientOnly),
    MessageDescriptor::new(
        ids::LOGOUT_REPLY,
        "LogoutReply",
        Schema {
            blocks: &[
                AGENT_DATA,
                block("InventoryData", Variable, &[field("ItemID", Uuid)]),
            ],
        },
    )
    .with_reliable()
    .with_zerocoded()
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(
        ids::PACKET_ACK,
        "PacketAck",
        Schema {
            blocks: &[block("Packets", Variable, &[field("ID", U32)])],
        },
    )
    .with_queue(OutboundClass::Immediate),
    MessageDescriptor::new(ids::CLOSE_CIRCUIT, "CloseCircuit", Schema { blocks: &[] })
        .with_queue(OutboundClass::Immediate),
];

/// Install the shipped catalog into `builder`.
pub fn register_standard_messages(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    for descriptor in CATALOG {
        builder.register(descriptor.clone())?;
    }
    Ok(())
}
