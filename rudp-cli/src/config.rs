//! Configuration file support for the RUDP CLI tools

use crate::stream::MAX_CHUNK;
use rudp_protocol::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// `[transport]` table, mapped onto [`TransportConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub shard_count: usize,
    pub initial_rtt_ms: u64,
    pub min_rtt_ms: u64,
    pub timeout_ceiling_ms: u64,
    pub retransmit_interval_ms: u64,
    pub drain_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        TransportConfig::default().into()
    }
}

impl From<TransportConfig> for TransportSection {
    fn from(c: TransportConfig) -> Self {
        TransportSection {
            shard_count: c.shard_count,
            initial_rtt_ms: c.initial_rtt_ms,
            min_rtt_ms: c.min_rtt_ms,
            timeout_ceiling_ms: c.timeout_ceiling_ms,
            retransmit_interval_ms: c.retransmit_interval_ms,
            drain_interval_ms: c.drain_interval_ms,
            event_capacity: c.event_capacity,
        }
    }
}

impl From<TransportSection> for TransportConfig {
    fn from(s: TransportSection) -> Self {
        TransportConfig {
            shard_count: s.shard_count,
            initial_rtt_ms: s.initial_rtt_ms,
            min_rtt_ms: s.min_rtt_ms,
            timeout_ceiling_ms: s.timeout_ceiling_ms,
            retransmit_interval_ms: s.retransmit_interval_ms,
            drain_interval_ms: s.drain_interval_ms,
            event_capacity: s.event_capacity,
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Input source (file path or "-" for stdin)
    #[serde(default = "default_stdio")]
    pub input: String,
    /// Receiver address
    pub peer: SocketAddr,
    /// Optional local bind address
    pub bind: Option<SocketAddr>,
    /// Bytes of input per datagram
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Send chunks on the unordered path
    #[serde(default)]
    pub unordered: bool,
    /// How long to wait for room in the send window
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_send_timeout() -> u64 {
    5000
}

fn default_stats_interval() -> u64 {
    1
}

fn default_idle_timeout() -> u64 {
    10
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Output destination (file path or "-" for stdout)
    #[serde(default = "default_stdio")]
    pub output: String,
    /// Listen address
    pub listen: SocketAddr,
    /// Give up after this long without data (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sender configuration
    pub sender: Option<SenderConfig>,
    /// Receiver configuration
    pub receiver: Option<ReceiverConfig>,
    /// Transport tunables shared by both tools
    #[serde(default)]
    pub transport: TransportSection,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Transport settings as engine config
    pub fn transport_config(&self) -> TransportConfig {
        self.transport.clone().into()
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport_config().validate()?;
        if let Some(sender) = &self.sender {
            sender.validate()?;
        }
        Ok(())
    }

    /// Example configuration with both sections filled in
    pub fn example() -> Self {
        Config {
            sender: Some(SenderConfig {
                input: default_stdio(),
                peer: SocketAddr::from(([127, 0, 0, 1], 9000)),
                bind: None,
                chunk_size: default_chunk_size(),
                unordered: false,
                send_timeout_ms: default_send_timeout(),
                stats_interval_secs: default_stats_interval(),
            }),
            receiver: Some(ReceiverConfig {
                output: default_stdio(),
                listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
                idle_timeout_secs: default_idle_timeout(),
                stats_interval_secs: default_stats_interval(),
            }),
            transport: TransportSection::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid transport settings: {0}")]
    Transport(#[from] rudp_protocol::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl SenderConfig {
    /// Sender settings for `peer` with defaults elsewhere
    pub fn for_peer(peer: SocketAddr) -> Self {
        SenderConfig {
            input: default_stdio(),
            peer,
            bind: None,
            chunk_size: default_chunk_size(),
            unordered: false,
            send_timeout_ms: default_send_timeout(),
            stats_interval_secs: default_stats_interval(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {MAX_CHUNK}, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }

    /// Local bind address, defaulting to the peer's address family
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| {
            let loopback = self.peer.ip().is_loopback();
            match (self.peer.is_ipv6(), loopback) {
                (false, true) => SocketAddr::from(([127, 0, 0, 1], 0)),
                (false, false) => SocketAddr::from(([0, 0, 0, 0], 0)),
                (true, true) => SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, 0)),
                (true, false) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
            }
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ReceiverConfig {
    /// Receiver settings for `listen` with defaults elsewhere
    pub fn for_listen(listen: SocketAddr) -> Self {
        ReceiverConfig {
            output: default_stdio(),
            listen,
            idle_timeout_secs: default_idle_timeout(),
            stats_interval_secs: default_stats_interval(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
