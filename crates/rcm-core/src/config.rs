//! Configuration system for the connection manager.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RCM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rcm/config.toml
//!   3. ~/.config/rcm/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CmConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    /// Services the daemon accepts connections on.
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// GID of the local port. Peers address our CM endpoint by this value.
    pub port_gid: Ipv6Addr,
    /// Channel adapter GUID carried in REQ/REP. 0 = derive from the GID.
    #[serde(with = "hex_u64")]
    pub ca_guid: u64,
    /// Partition key index used for new connections.
    pub pkey: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the CM datagram socket binds to.
    pub bind_addr: IpAddr,
    /// UDP port of the CM endpoint, identical on every node.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for a response before retransmitting.
    /// Also bounds the window in which a repeated REQ for an established
    /// connection is treated as a lost RTU rather than a stale peer.
    pub response_timeout_ms: u64,
    /// Retransmissions before a request is abandoned.
    pub max_cm_retries: u8,
    /// How long a disconnected connection lingers to answer repeated DREQs.
    pub timewait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(with = "hex_u64")]
    pub service_id: u64,
    /// Bits of the service id that must match. Defaults to an exact match.
    #[serde(default = "exact_mask", with = "hex_u64")]
    pub service_mask: u64,
}

fn exact_mask() -> u64 {
    u64::MAX
}

/// 64-bit identifiers as "0x..." strings. TOML integers are signed, so
/// masks and GUIDs with the top bit set cannot be written as numbers.
mod hex_u64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{value:016x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let text = String::deserialize(d)?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(&text)
            .replace('_', "");
        u64::from_str_radix(&digits, 16).map_err(D::Error::custom)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            port_gid: Ipv6Addr::LOCALHOST,
            ca_guid: 0,
            pkey: 0xffff,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_CM_PORT,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 500,
            max_cm_retries: 15,
            timewait_ms: 1_000,
        }
    }
}

/// UDP port of the CM endpoint when none is configured.
pub const DEFAULT_CM_PORT: u16 = 4791;

impl TimingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn timewait(&self) -> Duration {
        Duration::from_millis(self.timewait_ms)
    }
}

impl IdentityConfig {
    /// CA GUID to advertise: the configured one, else the low 64 bits of
    /// the port GID (the interface id half).
    pub fn effective_ca_guid(&self) -> u64 {
        if self.ca_guid != 0 {
            return self.ca_guid;
        }
        let octets = self.port_gid.octets();
        let mut low = [0u8; 8];
        low.copy_from_slice(&octets[8..]);
        u64::from_be_bytes(low)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("rcm")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("max_cm_retries must be at most 15, got {0}")]
    RetriesOutOfRange(u8),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CmConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CmConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config document without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RCM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CmConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The retry count travels in a 4-bit REQ field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.max_cm_retries > 15 {
            return Err(ConfigError::RetriesOutOfRange(self.timing.max_cm_retries));
        }
        Ok(())
    }

    /// Apply RCM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RCM_IDENTITY__PORT_GID") {
            if let Ok(gid) = v.parse() {
                self.identity.port_gid = gid;
            }
        }
        if let Ok(v) = std::env::var("RCM_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("RCM_TIMING__MAX_CM_RETRIES") {
            if let Ok(n) = v.parse() {
                self.timing.max_cm_retries = n;
            }
        }
        if let Ok(v) = std::env::var("RCM_TIMING__RESPONSE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.timing.response_timeout_ms = ms;
            }
        }
    }
}
