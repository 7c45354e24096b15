use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use simwire_core::{AgentSession, CircuitCode, RegionHandle, Uuid};
use simwire_server::ServerConfig;
use simwire_world::HeightfieldConfig;
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/simwire.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub net: NetConfig,
    pub region: RegionConfig,
    /// Sessions the login service has already handed off.
    #[serde(rename = "login")]
    pub logins: Vec<LoginGrant>,
    /// Neighbouring simulators trusted on the peer socket.
    #[serde(rename = "peer")]
    pub peers: Vec<PeerGrant>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetConfig {
    /// Viewer-facing socket.
    pub client_bind: SocketAddr,
    /// Simulator-to-simulator socket; disabled when absent.
    pub peer_bind: Option<SocketAddr>,
    /// Largest datagram read per `recv_from`.
    pub recv_buffer: usize,
    /// Datagrams read per socket per tick before the tick proceeds.
    pub max_datagrams_per_tick: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            client_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)),
            peer_bind: None,
            recv_buffer: 8192,
            max_datagrams_per_tick: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Global meters of the region's south-west corner.
    pub global_x: u32,
    pub global_y: u32,
    pub heightfield: HeightfieldConfig,
    /// Stream the whole region's terrain to a viewer once its circuit is up.
    pub send_terrain_on_connect: bool,
    /// Relay viewer chat back to every connected viewer.
    pub relay_chat: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            global_x: 256_000,
            global_y: 256_000,
            heightfield: HeightfieldConfig::default(),
            send_terrain_on_connect: true,
            relay_chat: true,
        }
    }
}

impl RegionConfig {
    pub fn handle(&self) -> RegionHandle {
        RegionHandle::from_global(self.global_x, self.global_y)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoginGrant {
    pub circuit_code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl LoginGrant {
    pub fn code(&self) -> CircuitCode {
        CircuitCode(self.circuit_code)
    }

    pub fn session(&self) -> AgentSession {
        AgentSession {
            agent_id: self.agent_id,
            session_id: self.session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PeerGrant {
    pub endpoint: SocketAddr,
    pub circuit_code: u32,
}

impl AppConfig {
    /// Load an explicitly requested file; any failure is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the default file, falling back to defaults when it is missing or
    /// broken.
    pub fn load_default() -> Self {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    AppConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                AppConfig::default()
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = self.to_toml()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}
