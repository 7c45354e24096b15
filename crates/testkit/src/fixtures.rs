//! Ready-made values for transport tests.

use anyhow::{Context, Result};
use simwire_core::{AgentSession, CircuitCode, Uuid};
use simwire_net::message::typed::{TypedMessage, UseCircuitCode};
use simwire_net::{frame, Message, MessageRegistry};
use std::net::SocketAddr;

/// Loopback address on `port`.
pub fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Session whose ids derive from `n`.
pub fn session(n: u64) -> AgentSession {
    AgentSession {
        agent_id: Uuid::from_u64_pair(n, 1),
        session_id: Uuid::from_u64_pair(n, 2),
    }
}

/// Built-in registry.
pub fn registry() -> Result<MessageRegistry> {
    MessageRegistry::standard().context("built-in message registry")
}

/// `UseCircuitCode` for `session`.
pub fn handshake(code: CircuitCode, session: AgentSession) -> Message {
    UseCircuitCode {
        code,
        session_id: session.session_id,
        agent_id: session.agent_id,
    }
    .to_message()
}

/// Serialize `message` as a complete datagram with `sequence`.
pub fn datagram(
    registry: &MessageRegistry,
    message: &Message,
    sequence: u32,
    reliable: bool,
) -> Result<Vec<u8>> {
    let descriptor = registry
        .get(message.id)
        .with_context(|| format!("message {} is not registered", message.id))?;
    let mut bytes = frame::encode_packet(descriptor, message, reliable, 1200)?;
    frame::set_sequence(&mut bytes, sequence);
    Ok(bytes)
}

/// Decode a datagram produced by a circuit, for assertions.
pub fn decode(
    registry: &MessageRegistry,
    bytes: &[u8],
    listener: simwire_net::Listener,
) -> Result<Message> {
    let envelope = frame::parse_envelope(bytes)?;
    Ok(envelope.decode(registry, listener, 8192)?.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simwire_net::{ids, Listener};

    #[test]
    fn handshake_datagram_decodes() {
        let registry = registry().unwrap();
        let bytes = datagram(&registry, &handshake(CircuitCode(5), session(1)), 1, true).unwrap();
        let message = decode(&registry, &bytes, Listener::Client).unwrap();
        assert_eq!(message.id, ids::USE_CIRCUIT_CODE);
    }
}
