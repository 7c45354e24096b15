//! Two circuits talking over an in-memory link.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simwire_core::{AgentSession, CircuitCode, CircuitKey, Uuid};
use simwire_net::message::typed::{ChatFromSimulator, LayerData, TypedMessage};
use simwire_net::terrain::{self, LayerType, PATCH_SIZE};
use simwire_net::{
    frame, Circuit, CircuitConfig, CircuitEvent, CircuitState, Listener, MessageRegistry,
    OutboundClass, Reliability,
};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

fn key(port: u16) -> CircuitKey {
    CircuitKey::new(format!("127.0.0.1:{port}").parse().unwrap(), CircuitCode(7))
}

fn config() -> CircuitConfig {
    let mut config = CircuitConfig::default();
    config.reliability.max_attempts = 20;
    config
}

/// Simulator side and viewer side of one circuit.
fn pair(now: Instant) -> (Circuit, Circuit) {
    let mut sim = Circuit::new(key(1), Listener::Client, config(), now);
    sim.activate(
        AgentSession {
            agent_id: Uuid::from_u128(1),
            session_id: Uuid::from_u128(2),
        },
        now,
    );
    let viewer = Circuit::new_trusted(key(2), config(), now);
    (sim, viewer)
}

fn chat(n: u32) -> ChatFromSimulator {
    ChatFromSimulator {
        from_name: "Region".into(),
        source_id: Uuid::nil(),
        owner_id: Uuid::nil(),
        source_type: 2,
        chat_type: 1,
        audible: 1,
        position: glam::Vec3::ZERO,
        message: format!("line {n}"),
    }
}

#[test]
fn reliable_messages_arrive_once_despite_loss() {
    let registry = MessageRegistry::standard().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut now = Instant::now();
    let (mut sim, mut viewer) = pair(now);

    const N: u32 = 40;
    for n in 0..N {
        sim.enqueue(&registry, &chat(n).to_message(), Reliability::Default, None, now)
            .unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..4000 {
        now += Duration::from_millis(50);
        for datagram in sim.tick(&registry, now) {
            if rng.gen_bool(0.25) {
                continue;
            }
            if let Ok(Some(CircuitEvent::Message(m))) = viewer.receive(&registry, &datagram, now) {
                delivered.push(ChatFromSimulator::try_from(&m).unwrap().message);
            }
        }
        for datagram in viewer.tick(&registry, now) {
            if rng.gen_bool(0.25) {
                continue;
            }
            let _ = sim.receive(&registry, &datagram, now);
        }
        if delivered.len() == N as usize && sim.pending_reliable() == 0 {
            break;
        }
    }

    let unique: BTreeSet<_> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), N as usize, "every message exactly once");
    assert_eq!(unique.len(), N as usize);
    assert_eq!(sim.pending_reliable(), 0);
    assert_eq!(sim.state(), CircuitState::Active);
    assert!(sim.stats().resends > 0);
}

#[test]
fn higher_classes_leave_first() {
    let registry = MessageRegistry::standard().unwrap();
    let now = Instant::now();
    let (mut sim, _) = pair(now);

    let texture = chat(1).to_message();
    let urgent = chat(2).to_message();
    sim.enqueue(&registry, &texture, Reliability::Unreliable, Some(OutboundClass::Texture), now)
        .unwrap();
    sim.enqueue(&registry, &urgent, Reliability::Unreliable, Some(OutboundClass::Immediate), now)
        .unwrap();

    let out = sim.tick(&registry, now);
    let texts: Vec<String> = out
        .iter()
        .map(|d| {
            let env = frame::parse_envelope(d).unwrap();
            let decoded = env.decode(&registry, Listener::Peer, 8192).unwrap();
            ChatFromSimulator::try_from(&decoded.message).unwrap().message
        })
        .collect();
    assert_eq!(texts, vec!["line 2".to_string(), "line 1".to_string()]);
}

#[test]
fn terrain_layers_decode_and_skip_bad_patches() {
    let registry = MessageRegistry::standard().unwrap();
    let now = Instant::now();
    let (mut sim, mut viewer) = pair(now);

    let mut hill = [[0.0f32; PATCH_SIZE]; PATCH_SIZE];
    for (y, row) in hill.iter_mut().enumerate() {
        for (x, cell) in row.iter_mut().enumerate() {
            *cell = 20.0 + (x + y) as f32;
        }
    }
    let good = terrain::encode(3, 4, &hill).unwrap();
    let stray = terrain::encode(30, 0, &hill).unwrap();
    let body = terrain::encode_layer(LayerType::Land, 256, &[good, stray]);
    let layer = LayerData {
        layer_type: LayerType::Land.to_byte(),
        data: body,
    };
    sim.enqueue(&registry, &layer.to_message(), Reliability::Default, None, now)
        .unwrap();

    let out = sim.tick(&registry, now);
    assert_eq!(out.len(), 1);
    let event = viewer.receive(&registry, &out[0], now).unwrap();
    let Some(CircuitEvent::Terrain(decoded)) = event else {
        panic!("expected terrain, got {event:?}");
    };
    assert_eq!(decoded.patches.len(), 1);
    assert_eq!((decoded.patches[0].x, decoded.patches[0].y), (3, 4));
    assert_eq!(viewer.stats().patches_rejected, 1);
    assert_eq!(viewer.state(), CircuitState::Active);
}
