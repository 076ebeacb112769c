use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration, loadable from TOML and overridable per-flag on
/// the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input directory holding capture files.
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Notification sink endpoint, `tcp://host:port`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Idle timeout for UDP/ICMP flows, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Comma-tolerant list of protocols to skip (`tcp`, `udp`, `icmp`).
    #[serde(default)]
    pub disable: String,

    /// Require full 4-tuple flow matching instead of the loose
    /// shared-endpoint policy.
    #[serde(default)]
    pub strict_match: bool,
}

fn default_directory() -> String {
    "pcaps".to_string()
}

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5555".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            endpoint: default_endpoint(),
            timeout_ms: default_timeout_ms(),
            disable: String::new(),
            strict_match: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from the working directory or fall back to defaults.
    pub fn load_or_default() -> Result<Self> {
        let path = PathBuf::from("capmeta.toml");
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self::default())
    }

    /// Idle timeout in the microseconds the trackers compare against.
    pub fn timeout_us(&self) -> u64 {
        self.timeout_ms * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.directory, "pcaps");
        assert_eq!(config.endpoint, "tcp://127.0.0.1:5555");
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.timeout_us(), 1_000_000);
        assert!(!config.strict_match);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str("timeout_ms = 250\ndisable = \"icmp\"").unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.disable, "icmp");
        assert_eq!(config.directory, "pcaps");
    }
}
