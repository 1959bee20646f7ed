use super::HostProfile;
use crate::error::{AppError, AppResult};
use crate::ssh::{KnownHostsPolicy, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub hosts: Vec<HostProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
}

pub fn default_keepalive() -> u32 {
    20 // send keepalives every 20s by default
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            known_hosts_policy: KnownHostsPolicy::default(),
            known_hosts_file: None,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// known_hosts file that new host keys are appended to. Defaults to
    /// `<config>/sshbridge/known_hosts`.
    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        match &self.known_hosts_file {
            Some(path) => Some(crate::ssh::expand_home(path)),
            None => super::get_config_dir().ok().map(|dir| dir.join("known_hosts")),
        }
    }

    /// The user's OpenSSH known_hosts, consulted but never written
    pub fn user_known_hosts_path(&self) -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_timeout() -> u64 {
    10
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Settings {
    /// Load `config.toml` from the config dir, writing defaults when missing
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            Self::load_file(&config_path)
        } else {
            let settings = Settings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    /// Load an explicit settings file
    pub fn load_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn host(&self, name: &str) -> AppResult<&HostProfile> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| AppError::Config(format!("No host profile named {}", name)))
    }
}
