//! End-to-end behavior of the server facade.

use simwire_core::{CircuitCode, CircuitKey, RegionHandle};
use simwire_net::message::typed::{ChatFromSimulator, LogoutRequest, PacketAck, TypedMessage};
use simwire_net::message::FieldValue;
use simwire_net::terrain::{QuantParams, DEFAULT_QUANT_BITS};
use simwire_net::{
    frame, ids, Circuit, CircuitConfig, CircuitEvent, CircuitState, DisconnectReason, Listener,
    Message, Reliability,
};
use simwire_server::{InboundEvent, Server, ServerConfig};
use simwire_testkit::{datagram, decode, endpoint, handshake, session, LinkProfile, LossyLink};
use simwire_world::{Heightfield, HeightfieldConfig, TerrainStore};
use std::cell::RefCell;
use std::time::{Duration, Instant};

fn server() -> Server {
    Server::with_standard_messages(ServerConfig::default()).unwrap()
}

fn drain_events(server: &mut Server) -> Vec<InboundEvent> {
    std::iter::from_fn(|| server.poll_decoded()).collect()
}

fn drain_outbound(server: &mut Server) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| server.poll_outbound())
        .map(|d| d.bytes)
        .collect()
}

fn chat(text: &str) -> Message {
    ChatFromSimulator {
        from_name: "Region".into(),
        source_id: Default::default(),
        owner_id: Default::default(),
        source_type: 2,
        chat_type: 1,
        audible: 1,
        position: Default::default(),
        message: text.into(),
    }
    .to_message()
}

fn kick() -> Message {
    Message::new(
        ids::KICK_USER,
        vec![
            vec![vec![FieldValue::U32(0), FieldValue::U16(0)]],
            vec![vec![
                FieldValue::Uuid(Default::default()),
                FieldValue::Uuid(Default::default()),
                FieldValue::Text("maintenance".into()),
            ]],
        ],
    )
}

/// Handshake from `port` and authorize it; returns the circuit key.
fn connect(server: &mut Server, port: u16, code: u32, now: Instant) -> CircuitKey {
    let registry = server.registry().clone();
    let code = CircuitCode(code);
    let bytes = datagram(&registry, &handshake(code, session(u64::from(code.0))), 1, true).unwrap();
    server.handle_datagram(Listener::Client, endpoint(port), &bytes, now);
    server.authorize_circuit(code, session(u64::from(code.0)), now);
    CircuitKey::new(endpoint(port), code)
}

#[test]
fn handshake_waits_for_authorization() {
    let mut server = server();
    let registry = server.registry().clone();
    let now = Instant::now();
    let code = CircuitCode(77);
    let key = CircuitKey::new(endpoint(4000), code);

    let bytes = datagram(&registry, &handshake(code, session(77)), 1, true).unwrap();
    server.handle_datagram(Listener::Client, endpoint(4000), &bytes, now);
    assert!(drain_events(&mut server).is_empty());
    assert_eq!(server.circuit_state(key), Some(CircuitState::Establishing));
    assert!(server
        .enqueue(key, &chat("early"), Reliability::Default, None, now)
        .is_err());

    server.authorize_circuit(code, session(77), now);
    assert_eq!(
        drain_events(&mut server),
        vec![InboundEvent::Connected {
            circuit: key,
            session: Some(session(77)),
        }]
    );
    assert_eq!(server.circuit_state(key), Some(CircuitState::Active));
}

#[test]
fn mismatched_session_is_rejected() {
    let mut server = server();
    let registry = server.registry().clone();
    let now = Instant::now();
    let code = CircuitCode(5);
    server.authorize_circuit(code, session(1), now);

    let bytes = datagram(&registry, &handshake(code, session(2)), 1, true).unwrap();
    server.handle_datagram(Listener::Client, endpoint(4001), &bytes, now);
    assert_eq!(
        drain_events(&mut server),
        vec![InboundEvent::Disconnected {
            circuit: CircuitKey::new(endpoint(4001), code),
            reason: DisconnectReason::Rejected,
        }]
    );
    assert_eq!(server.stats().rejected_handshakes, 1);
    assert_eq!(server.stats().circuits, 0);
}

#[test]
fn logout_drains_then_disconnects() {
    let mut server = server();
    let registry = server.registry().clone();
    let now = Instant::now();
    let key = connect(&mut server, 4002, 9, now);
    drain_events(&mut server);

    let logout = LogoutRequest {
        agent_id: session(9).agent_id,
        session_id: session(9).session_id,
    }
    .to_message();
    let bytes = datagram(&registry, &logout, 2, true).unwrap();
    server.handle_datagram(Listener::Client, endpoint(4002), &bytes, now);
    let events = drain_events(&mut server);
    assert!(matches!(
        &events[..],
        [InboundEvent::Message { message, .. }] if message.id == ids::LOGOUT_REQUEST
    ));
    assert_eq!(server.circuit_state(key), Some(CircuitState::Draining));

    server.tick(now);
    let reply_seq = drain_outbound(&mut server)
        .iter()
        .find_map(|bytes| {
            let message = decode(&registry, bytes, Listener::Peer).ok()?;
            (message.id == ids::LOGOUT_REPLY).then(|| frame::sequence(bytes))?
        })
        .expect("logout reply sent");

    let ack = PacketAck {
        packets: vec![reply_seq],
    }
    .to_message();
    let bytes = datagram(&registry, &ack, 3, false).unwrap();
    server.handle_datagram(Listener::Client, endpoint(4002), &bytes, now);
    server.tick(now);

    assert_eq!(
        drain_events(&mut server),
        vec![InboundEvent::Disconnected {
            circuit: key,
            reason: DisconnectReason::Logout,
        }]
    );
    assert_eq!(server.circuit_state(key), None);
}

#[test]
fn trust_boundary_is_per_listener() {
    let mut server = server();
    let registry = server.registry().clone();
    let now = Instant::now();

    let peer = server.add_trusted_peer(endpoint(9000), CircuitCode(1), now);
    let viewer = connect(&mut server, 4003, 2, now);
    drain_events(&mut server);

    let bytes = datagram(&registry, &kick(), 1, true).unwrap();
    server.handle_datagram(Listener::Peer, peer.endpoint, &bytes, now);
    let bytes = datagram(&registry, &kick(), 2, true).unwrap();
    server.handle_datagram(Listener::Client, viewer.endpoint, &bytes, now);

    let events = drain_events(&mut server);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], InboundEvent::Message { circuit, .. } if *circuit == peer));
    assert_eq!(server.stats().trust_drops, 1);
    assert_eq!(server.circuit_state(viewer), Some(CircuitState::Active));
}

#[test]
fn unknown_endpoints_are_unroutable() {
    let mut server = server();
    let registry = server.registry().clone();
    let bytes = datagram(&registry, &chat("hi"), 1, false).unwrap();
    server.handle_datagram(Listener::Client, endpoint(4100), &bytes, Instant::now());
    assert_eq!(server.stats().unroutable, 1);
    assert!(drain_events(&mut server).is_empty());
}

#[test]
fn establishing_circuits_are_capped() {
    let config = ServerConfig {
        max_pending_handshakes: 3,
        max_pending_per_endpoint: 2,
        ..ServerConfig::default()
    };
    let mut server = Server::with_standard_messages(config).unwrap();
    let registry = server.registry().clone();
    let now = Instant::now();
    let hello = |code: u32| {
        datagram(&registry, &handshake(CircuitCode(code), session(u64::from(code))), 1, true)
            .unwrap()
    };

    for code in 1..=4 {
        server.handle_datagram(Listener::Client, endpoint(4500), &hello(code), now);
    }
    assert_eq!(server.stats().circuits, 2);
    assert_eq!(server.stats().refused_handshakes, 2);

    server.handle_datagram(Listener::Client, endpoint(4501), &hello(10), now);
    server.handle_datagram(Listener::Client, endpoint(4502), &hello(11), now);
    assert_eq!(server.stats().circuits, 3);
    assert_eq!(server.stats().refused_handshakes, 3);

    // a repeated handshake still reaches its circuit
    server.handle_datagram(Listener::Client, endpoint(4500), &hello(1), now);
    assert_eq!(server.stats().refused_handshakes, 3);

    server.authorize_circuit(CircuitCode(1), session(1), now);
    assert_eq!(
        server.circuit_state(CircuitKey::new(endpoint(4500), CircuitCode(1))),
        Some(CircuitState::Active)
    );
    server.handle_datagram(Listener::Client, endpoint(4503), &hello(12), now);
    assert_eq!(server.stats().circuits, 4);
    assert_eq!(server.stats().refused_handshakes, 3);
    assert_eq!(server.stats().unroutable, 0);
}

#[test]
fn queue_wait_follows_the_callers_clock() {
    let mut server = server();
    let t0 = Instant::now();
    let key = connect(&mut server, 4600, 46, t0);
    drain_events(&mut server);
    server.tick(t0);
    drain_outbound(&mut server);
    assert_eq!(server.queue_wait(key, t0), None);

    let later = t0 + Duration::from_secs(30);
    server
        .enqueue(key, &chat("late"), Reliability::Default, None, later)
        .unwrap();
    assert_eq!(
        server.queue_wait(key, later + Duration::from_secs(2)),
        Some(Duration::from_secs(2))
    );
}

/// Drive a server and a viewer circuit over a lossy link until `done`.
fn run_link(
    server: &mut Server,
    viewer: &mut Circuit,
    viewer_port: u16,
    profile: LinkProfile,
    mut now: Instant,
    mut on_event: impl FnMut(CircuitEvent),
    mut done: impl FnMut(&Server) -> bool,
) -> Instant {
    let registry = server.registry().clone();
    let mut down = LossyLink::new(profile.clone(), 11);
    let mut up = LossyLink::new(profile, 12);
    for _ in 0..5000 {
        now += Duration::from_millis(50);
        server.tick(now);
        for bytes in drain_outbound(server) {
            down.send(bytes, now);
        }
        for bytes in down.deliver(now) {
            if let Ok(Some(event)) = viewer.receive(&registry, &bytes, now) {
                on_event(event);
            }
        }
        for bytes in viewer.tick(&registry, now) {
            up.send(bytes, now);
        }
        for bytes in up.deliver(now) {
            server.handle_datagram(Listener::Client, endpoint(viewer_port), &bytes, now);
        }
        if done(server) {
            break;
        }
    }
    now
}

#[test]
fn reliable_traffic_survives_a_lossy_link() {
    let mut config = ServerConfig::default();
    config.reliability.max_attempts = 30;
    let mut server = Server::with_standard_messages(config).unwrap();
    let registry = server.registry().clone();
    let now = Instant::now();

    let code = CircuitCode(31);
    let key = CircuitKey::new(endpoint(4200), code);
    server.authorize_circuit(code, session(31), now);

    let mut viewer_config = CircuitConfig::default();
    viewer_config.reliability.max_attempts = 30;
    let mut viewer = Circuit::new_trusted(CircuitKey::new(endpoint(9), code), viewer_config, now);
    viewer
        .enqueue(&registry, &handshake(code, session(31)), Reliability::Reliable, None, now)
        .unwrap();

    let profile = LinkProfile {
        loss: 0.2,
        duplicate: 0.05,
        reorder: 0.05,
        latency_ms: 40,
    };
    let lines = RefCell::new(Vec::new());
    let collect = |event: CircuitEvent| {
        if let CircuitEvent::Message(m) = event {
            lines
                .borrow_mut()
                .push(ChatFromSimulator::try_from(&m).unwrap().message);
        }
    };

    let now = run_link(
        &mut server,
        &mut viewer,
        4200,
        profile.clone(),
        now,
        collect,
        |server| server.circuit_state(key) == Some(CircuitState::Active),
    );
    assert_eq!(server.circuit_state(key), Some(CircuitState::Active));
    for n in 0..30 {
        server
            .enqueue(key, &chat(&format!("line {n}")), Reliability::Reliable, None, now)
            .unwrap();
    }

    let distinct = || {
        let mut seen = lines.borrow().clone();
        seen.sort();
        seen.dedup();
        seen.len()
    };
    run_link(
        &mut server,
        &mut viewer,
        4200,
        profile,
        now,
        collect,
        |server| {
            distinct() == 30
                && server
                    .circuit_stats(key)
                    .is_some_and(|s| s.pending_reliable == 0)
        },
    );

    assert_eq!(distinct(), 30);
    assert_eq!(server.circuit_stats(key).unwrap().pending_reliable, 0);
    assert_eq!(server.circuit_state(key), Some(CircuitState::Active));
}

#[test]
fn terrain_reaches_the_viewer() {
    let mut server = server();
    let registry = server.registry().clone();
    let now = Instant::now();
    let key = connect(&mut server, 4300, 40, now);
    drain_events(&mut server);

    let field = Heightfield::new(HeightfieldConfig::default());
    let store = TerrainStore::generate(RegionHandle::from_global(256_000, 256_000), 4, &field);
    let all: Vec<(u32, u32)> = (0..4).flat_map(|y| (0..4).map(move |x| (x, y))).collect();
    let messages = server.send_terrain(key, &store, all, now).unwrap();
    assert!(messages >= 1);

    let mut viewer = Circuit::new_trusted(key, CircuitConfig::default(), now);
    let mut received = TerrainStore::flat(store.region(), 4, 0.0);
    let mut patches = 0;
    let mut now = now;
    for _ in 0..20 {
        now += Duration::from_millis(50);
        server.tick(now);
        for bytes in drain_outbound(&mut server) {
            if let Ok(Some(CircuitEvent::Terrain(layer))) = viewer.receive(&registry, &bytes, now) {
                patches += received.apply_layer(&layer);
            }
        }
    }
    assert_eq!(patches, 16);
    let original = store.get_patch(0, 0).unwrap();
    let bound = QuantParams::for_heights(original, DEFAULT_QUANT_BITS).error_bound();
    let sample = received.height_at(10.0, 10.0).unwrap();
    assert!((sample - original[10][10]).abs() <= bound);
}
