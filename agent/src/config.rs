//! Agent configuration file: loaded from (and defaulted into)
//! `aether_config.json` in the current directory, auto-creating a default
//! file on first run.

use std::path::Path;

use aether_core::AetherError;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "aether_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    pub usewss: bool,
    #[serde(default)]
    pub secret: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8000".to_string(),
            usewss: true,
            secret: String::new(),
        }
    }
}

impl AgentConfig {
    /// Load the config file, writing out the default if it doesn't exist
    /// yet, then validate it.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::read_or_create(Path::new(CONFIG_FILE))?;
        config.validate()?;
        Ok(config)
    }

    fn read_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let default = Self::default();
            let file = std::fs::File::create(path)?;
            serde_json::to_writer_pretty(file, &default)?;
            return Ok(default);
        }

        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn validate(&self) -> Result<(), AetherError> {
        if self.host.is_empty() {
            return Err(AetherError::ConfigInvalid("host is empty".into()));
        }
        if self.host.contains('/') {
            return Err(AetherError::ConfigInvalid(
                "host must not contain slashes".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_url(&self) -> String {
        let scheme = if self.usewss { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.host, aether_core::HANDSHAKE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_host_is_invalid() {
        let mut config = AgentConfig::default();
        config.host.clear();
        assert!(matches!(
            config.validate(),
            Err(AetherError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn host_with_slash_is_invalid() {
        let mut config = AgentConfig::default();
        config.host = "local/host:8000".to_string();
        assert!(matches!(
            config.validate(),
            Err(AetherError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn handshake_url_uses_wss_when_configured() {
        let config = AgentConfig {
            host: "example.com:8000".into(),
            usewss: true,
            secret: String::new(),
        };
        assert_eq!(
            config.handshake_url(),
            "wss://example.com:8000/aether/client/ws"
        );
    }

    #[test]
    fn handshake_url_uses_ws_when_plaintext() {
        let config = AgentConfig {
            host: "example.com:8000".into(),
            usewss: false,
            secret: String::new(),
        };
        assert_eq!(
            config.handshake_url(),
            "ws://example.com:8000/aether/client/ws"
        );
    }
}
