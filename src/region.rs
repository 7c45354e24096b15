//! The simulation side of one region: reacts to transport events.

use crate::config::RegionConfig;
use simwire_core::{AgentSession, CircuitKey};
use simwire_net::message::typed::{ChatFromSimulator, ChatFromViewer, TypedMessage};
use simwire_net::{ids, Message, Reliability};
use simwire_server::{InboundEvent, Server};
use simwire_world::{Heightfield, TerrainStore};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

const SOURCE_AGENT: u8 = 1;
const AUDIBLE_FULLY: u8 = 1;

pub struct Region {
    terrain: TerrainStore,
    viewers: BTreeMap<CircuitKey, AgentSession>,
    send_terrain_on_connect: bool,
    relay_chat: bool,
}

impl Region {
    pub fn new(config: &RegionConfig, patches_per_side: u32) -> Self {
        let field = Heightfield::new(config.heightfield.clone());
        Self {
            terrain: TerrainStore::generate(config.handle(), patches_per_side, &field),
            viewers: BTreeMap::new(),
            send_terrain_on_connect: config.send_terrain_on_connect,
            relay_chat: config.relay_chat,
        }
    }

    pub fn terrain(&self) -> &TerrainStore {
        &self.terrain
    }

    pub fn viewers(&self) -> usize {
        self.viewers.len()
    }

    pub fn handle(&mut self, server: &mut Server, event: InboundEvent, now: Instant) {
        match event {
            InboundEvent::Connected {
                circuit,
                session: Some(session),
            } => {
                info!(%circuit, agent = %session.agent_id, "viewer connected");
                self.viewers.insert(circuit, session);
                if self.send_terrain_on_connect {
                    self.send_all_terrain(server, circuit, now);
                }
            }
            InboundEvent::Connected {
                circuit,
                session: None,
            } => info!(%circuit, "peer simulator connected"),
            InboundEvent::Message { circuit, message } => {
                self.handle_message(server, circuit, &message, now)
            }
            InboundEvent::Terrain { circuit, layer } => {
                let applied = self.terrain.apply_layer(&layer);
                debug!(%circuit, applied, "terrain update from peer");
                self.push_dirty_terrain(server, now);
            }
            InboundEvent::Disconnected { circuit, reason } => {
                self.viewers.remove(&circuit);
                info!(%circuit, ?reason, "circuit closed");
            }
        }
    }

    fn handle_message(
        &mut self,
        server: &mut Server,
        circuit: CircuitKey,
        message: &Message,
        now: Instant,
    ) {
        if message.id == ids::CHAT_FROM_VIEWER && self.relay_chat {
            match ChatFromViewer::try_from(message) {
                Ok(chat) if chat.channel == 0 => self.relay(server, &chat, now),
                Ok(_) => {}
                Err(err) => warn!(%circuit, %err, "unreadable chat"),
            }
            return;
        }
        let name = server
            .registry()
            .get(message.id)
            .map_or("unknown", |d| d.name);
        debug!(%circuit, message = name, "unhandled message");
    }

    fn relay(&self, server: &mut Server, chat: &ChatFromViewer, now: Instant) {
        let outbound = ChatFromSimulator {
            from_name: chat.agent_id.to_string(),
            source_id: chat.agent_id,
            owner_id: chat.agent_id,
            source_type: SOURCE_AGENT,
            chat_type: chat.chat_type,
            audible: AUDIBLE_FULLY,
            position: Default::default(),
            message: chat.message.clone(),
        }
        .to_message();
        for &viewer in self.viewers.keys() {
            if let Err(err) = server.enqueue(viewer, &outbound, Reliability::Default, None, now) {
                warn!(%viewer, %err, "chat relay dropped");
            }
        }
    }

    fn send_all_terrain(&self, server: &mut Server, circuit: CircuitKey, now: Instant) {
        let side = self.terrain.patches_per_side();
        let all = (0..side).flat_map(|y| (0..side).map(move |x| (x, y)));
        match server.send_terrain(circuit, &self.terrain, all, now) {
            Ok(messages) => debug!(%circuit, messages, "queued region terrain"),
            Err(err) => warn!(%circuit, %err, "terrain not sent"),
        }
    }

    /// Send patches changed since the last push to every viewer.
    pub fn push_dirty_terrain(&mut self, server: &mut Server, now: Instant) {
        let dirty = self.terrain.take_dirty();
        if dirty.is_empty() {
            return;
        }
        for &viewer in self.viewers.keys() {
            let patches = dirty.iter().copied();
            if let Err(err) = server.send_terrain(viewer, &self.terrain, patches, now) {
                warn!(%viewer, %err, "terrain update not sent");
            }
        }
    }
}
