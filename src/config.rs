//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Server-side path to fleetd's Unix control socket
    pub fleet_socket_path: PathBuf,

    /// Identities allowed to connect, each with its own policy settings
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("fleetgate");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            fleet_socket_path: PathBuf::from("/var/run/fleet.sock"),
            identities: Vec::new(),
        }
    }
}

/// One authorized identity and what its policy may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name, used as the policy's debug label.
    pub name: String,

    /// Public key in OpenSSH format ("ssh-ed25519 AAAA... comment").
    pub public_key: String,

    /// Fleet unit names this identity may query.
    #[serde(default)]
    pub allowed_units: Vec<String>,

    /// Program to run for masqueraded shell/exec sessions.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }
        Ok(())
    }
}
