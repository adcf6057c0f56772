//! Tracker configuration

use anomos_core::{hex_to_hash, InfoHash};
use anomos_graph::GraphConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path (identity, saved state)
    pub data_dir: String,
    /// Address to listen on
    pub bind: String,
    pub port: u16,
    /// Name placed in a newly generated certificate
    pub hostname: String,
    /// Passphrase protecting the stored private key
    pub key_passphrase: Option<String>,
    /// Seconds peers should wait between announces
    pub reannounce_interval: u64,
    /// Peers silent for this many seconds are dropped
    pub timeout_downloaders_interval: u64,
    /// Seconds between writes of the state file
    pub save_dfile_interval: u64,
    /// Tracking codes handed out per announce
    pub response_size: usize,
    /// Most neighbors listed in one response
    pub max_give: usize,
    /// Longest path, source and destination included
    pub max_path_len: usize,
    /// Shortest path, source and destination included
    pub min_path_len: usize,
    /// Length of every tracking code
    pub tcode_len: usize,
    /// NAT probe attempts per peer address
    pub nat_check: u32,
    /// Seconds allowed for a NAT probe or an idle HTTPS connection
    pub socket_timeout: u64,
    /// Let peers behind the same IP become neighbors
    pub allow_close_neighbors: bool,
    /// Honor the `ip` parameter only from local addresses
    pub only_local_override_ip: bool,
    /// File with one hex infohash per line to refuse
    pub blocked_hashes: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.anomos-tracker".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 5555,
            hostname: "localhost".to_string(),
            key_passphrase: None,
            reannounce_interval: 1800,
            timeout_downloaders_interval: 2700,
            save_dfile_interval: 300,
            response_size: 10,
            max_give: 200,
            max_path_len: anomos_core::DEFAULT_MAX_PATH_LEN,
            min_path_len: anomos_core::MIN_PATH_LEN,
            tcode_len: anomos_core::tcode::DEFAULT_TCODE_LEN,
            nat_check: 3,
            socket_timeout: 15,
            allow_close_neighbors: false,
            only_local_override_ip: true,
            blocked_hashes: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_path_len < anomos_core::MIN_PATH_LEN {
            anyhow::bail!(
                "min_path_len must be at least {}",
                anomos_core::MIN_PATH_LEN
            );
        }
        if self.max_path_len < self.min_path_len {
            anyhow::bail!("max_path_len must not be below min_path_len");
        }
        if self.reannounce_interval == 0 {
            anyhow::bail!("reannounce_interval must be positive");
        }
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn graph(&self) -> GraphConfig {
        GraphConfig {
            max_path_len: self.max_path_len,
            min_path_len: self.min_path_len,
            tcode_len: self.tcode_len,
            allow_close_neighbors: self.allow_close_neighbors,
        }
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    /// Read the blocked infohash list; blank lines and `#` comments are skipped
    pub fn load_blocked(&self) -> anyhow::Result<HashSet<InfoHash>> {
        let Some(path) = &self.blocked_hashes else {
            return Ok(HashSet::new());
        };
        let content = std::fs::read_to_string(expand_path(path))?;
        parse_blocked(&content)
    }
}

pub fn parse_blocked(content: &str) -> anyhow::Result<HashSet<InfoHash>> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| hex_to_hash(l).map_err(|e| anyhow::anyhow!("Invalid infohash {}: {}", l, e)))
        .collect()
}

pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = 6969
            response_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6969);
        assert_eq!(config.response_size, 4);
        assert_eq!(config.reannounce_interval, 1800);
        assert_eq!(config.nat_check, 3);
        assert!(config.only_local_override_ip);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_short_paths() {
        let config = Config {
            min_path_len: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_path_len: 3,
            min_path_len: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blocked_list() {
        let text = format!("# refused\n\n{}\n  {}  \n", "ab".repeat(20), "01".repeat(20));
        let blocked = parse_blocked(&text).unwrap();
        assert_eq!(blocked.len(), 2);
        assert!(blocked.contains(&[0xab; 20]));
        assert!(parse_blocked("not-a-hash").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "data_dir = \"/srv/anomos\"\nnat_check = 5\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.nat_check, 5);
        assert_eq!(config.state_file(), PathBuf::from("/srv/anomos/state.json"));
    }
}
