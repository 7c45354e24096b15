#![warn(missing_docs)]
//! Core primitives shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

pub use uuid::Uuid;

/// Fixed simulation tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Shared secret handed to a viewer by the login service and presented in the
/// first datagram of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitCode(pub u32);

impl fmt::Display for CircuitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Identity of one circuit: transport address plus circuit code.
///
/// Addresses alone are never enough to find circuit state, since NAT can hand
/// the same address to a different session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitKey {
    /// Remote transport address.
    pub endpoint: SocketAddr,
    /// Circuit code bound to the address.
    pub code: CircuitCode,
}

impl CircuitKey {
    /// Build a key from its parts.
    pub fn new(endpoint: SocketAddr, code: CircuitCode) -> Self {
        Self { endpoint, code }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.code)
    }
}

/// Agent and session identifiers authorized for a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentSession {
    /// Avatar identifier.
    pub agent_id: Uuid,
    /// Login session identifier.
    pub session_id: Uuid,
}

/// Global region handle: the region's south-west corner in meters, packed as
/// `(x << 32) | y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionHandle(pub u64);

impl RegionHandle {
    /// Handle for the region whose corner is at global meters `(x, y)`.
    pub fn from_global(x: u32, y: u32) -> Self {
        Self((u64::from(x) << 32) | u64::from(y))
    }

    /// Global corner coordinates in meters.
    pub fn global(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_handle_packs_corner() {
        let handle = RegionHandle::from_global(256_000, 256_256);
        assert_eq!(handle.global(), (256_000, 256_256));
        assert_eq!(handle.0, (256_000u64 << 32) | 256_256);
    }

    #[test]
    fn circuit_key_display_includes_code() {
        let key = CircuitKey::new("127.0.0.1:9000".parse().unwrap(), CircuitCode(0xabc));
        assert_eq!(key.to_string(), "127.0.0.1:9000#00000abc");
    }

    #[test]
    fn tick_advances() {
        assert_eq!(SimTick::ZERO.advance(3), SimTick(3));
    }
}
