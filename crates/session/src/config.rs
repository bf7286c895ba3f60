// Session client configuration: `~/.tandem/session.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ReconnectPolicy;

/// Root directory for Tandem client state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the session config file: `~/.tandem/session.toml`.
pub fn session_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("session.toml"))
}

/// Client-side settings for a collaboration session.
///
/// Every field has a default so a partial (or empty) file is valid. Durations
/// are stored as milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Replication endpoint base URL (e.g. `wss://collab.example.com/collab`).
    /// When unset the session starts local-only.
    pub endpoint: Option<String>,
    /// Bearer credential appended as the `token` query parameter.
    pub token: Option<String>,
    /// Name shown to peers.
    pub display_name: Option<String>,
    /// Persistence + comment collaborator base URL.
    pub persistence_base_url: Option<String>,
    pub heartbeat_interval_ms: u64,
    /// How long peers stay listed after the transport drops.
    pub presence_grace_ms: u64,
    /// Peers whose awareness clock has not advanced for this long are dropped.
    pub presence_timeout_ms: u64,
    /// Upper bound on how long an external seed waits for the first sync.
    pub seed_timeout_ms: u64,
    /// Consecutive connection failures before falling back to local-only.
    pub local_only_failure_threshold: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Per-request bound on persistence and comment calls.
    pub collaborator_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            display_name: None,
            persistence_base_url: None,
            heartbeat_interval_ms: 15_000,
            presence_grace_ms: 5_000,
            presence_timeout_ms: 30_000,
            seed_timeout_ms: 10_000,
            local_only_failure_threshold: 5,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            collaborator_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Load from `~/.tandem/session.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        session_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories). The file may
    /// hold a bearer token, so it is restricted to the owner.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        restrict_to_owner(path)?;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.local_only_failure_threshold,
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
