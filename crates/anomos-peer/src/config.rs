//! Peer configuration

use anomos_core::{hex_to_hash, InfoHash};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path (identity, state)
    pub data_dir: String,

    /// Tracker configuration
    pub tracker: TrackerConfig,

    /// Neighbor link configuration
    pub network: NetworkConfig,

    /// Swarms this peer takes part in
    #[serde(rename = "swarm")]
    pub swarms: Vec<SwarmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Announce URL, e.g. https://tracker.example:5555/announce
    pub url: String,
    /// PEM certificate of the tracker; without it any self-signed tracker is accepted
    pub certificate: Option<String>,
    /// Seconds between regular announces
    pub rerequest_interval: u64,
    /// First retry delay after a failed announce
    pub min_announce_retry: u64,
    /// Retry delays never grow beyond this
    pub max_announce_retry_interval: u64,
    /// Failing for this long since the last success is an error
    pub announce_retry_window: u64,
    /// Address to report instead of the one the tracker sees
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on
    pub bind: String,
    /// Port for neighbor links
    pub listen_port: u16,
    /// Name placed in a newly generated certificate
    pub hostname: String,
    /// Passphrase protecting the stored private key
    pub key_passphrase: Option<String>,
    /// Idle links are dropped after this many seconds
    pub socket_timeout: u64,
    /// Streams that do not complete setup within this many seconds are closed
    pub completion_timeout: u64,
    /// TLS plus neighbor handshake must finish within this many seconds
    pub handshake_timeout: u64,
    /// Largest message accepted on a link
    pub max_message_length: usize,
    /// Upload limit in bytes per second, 0 for none
    pub max_upload_rate: u64,
    /// Bytes a stream may send per scheduling round
    pub send_quantum: usize,
    /// Outbound queue size that pauses reads on feeding relay links
    pub relay_high_watermark: usize,
    /// Outbound queue size that resumes them
    pub relay_low_watermark: usize,
    /// Most neighbor links this peer dials itself
    pub max_initiate: usize,
    /// Refuse a second neighbor at an IP we are already linked to
    pub one_connection_per_ip: bool,
    /// Dial attempts per neighbor before it is reported failed
    pub dial_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Hex infohash
    pub info_hash: String,
    /// Number of pieces in the torrent
    pub num_pieces: u32,
    /// Bytes still to download, 0 when seeding
    #[serde(default)]
    pub left: u64,
}

impl SwarmConfig {
    pub fn info_hash(&self) -> anyhow::Result<InfoHash> {
        hex_to_hash(&self.info_hash)
            .map_err(|e| anyhow::anyhow!("Invalid infohash {}: {}", self.info_hash, e))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.anomos".to_string(),
            tracker: TrackerConfig::default(),
            network: NetworkConfig::default(),
            swarms: vec![],
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:5555/announce".to_string(),
            certificate: None,
            rerequest_interval: 300,
            min_announce_retry: 50,
            max_announce_retry_interval: 1800,
            announce_retry_window: 3600,
            ip: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            listen_port: 5063,
            hostname: "localhost".to_string(),
            key_passphrase: None,
            socket_timeout: 300,
            completion_timeout: 60,
            handshake_timeout: 30,
            max_message_length: anomos_core::wire::DEFAULT_MAX_MESSAGE_LENGTH,
            max_upload_rate: 0,
            send_quantum: 16 * 1024,
            relay_high_watermark: 1024 * 1024,
            relay_low_watermark: 256 * 1024,
            max_initiate: 200,
            one_connection_per_ip: true,
            dial_retries: 2,
        }
    }
}

impl NetworkConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.network.relay_low_watermark > self.network.relay_high_watermark {
            anyhow::bail!("relay_low_watermark must not exceed relay_high_watermark");
        }
        if self.network.send_quantum == 0 {
            anyhow::bail!("send_quantum must be positive");
        }
        for swarm in &self.swarms {
            swarm.info_hash()?;
        }
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> std::path::PathBuf {
        expand_path(&self.data_dir)
    }
}

pub fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let text = r#"
            data_dir = "/tmp/anomos"

            [tracker]
            url = "https://10.0.0.1:5555/announce"

            [network]
            listen_port = 6000

            [[swarm]]
            info_hash = "0101010101010101010101010101010101010101"
            num_pieces = 12
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.network.listen_port, 6000);
        assert_eq!(config.network.socket_timeout, 300);
        assert_eq!(config.tracker.min_announce_retry, 50);
        assert_eq!(config.swarms.len(), 1);
        assert_eq!(config.swarms[0].info_hash().unwrap(), [1u8; 20]);
        assert_eq!(config.swarms[0].left, 0);
    }

    #[test]
    fn test_rejects_bad_watermarks() {
        let mut config = Config::default();
        config.network.relay_low_watermark = config.network.relay_high_watermark + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_expansion() {
        let config = Config {
            data_dir: "/var/lib/anomos".to_string(),
            ..Config::default()
        };
        assert_eq!(config.data_dir(), std::path::PathBuf::from("/var/lib/anomos"));
    }
}
