use crate::bootstrap::ServerInstallConfig;
use crate::ssh::{default_port, AuthMethod, ConnectionConfig, ReconnectPolicy};
use crate::tunnel::TunnelSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Named host profile from the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Overrides the global `[reconnect]` section
    #[serde(default)]
    pub reconnect: Option<ReconnectPolicy>,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    #[serde(default)]
    pub server: Option<ServerInstallConfig>,
}

impl HostProfile {
    /// Build the connection config for this profile
    pub fn connection_config(&self, default_reconnect: ReconnectPolicy) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.host.clone(), self.username.clone(), self.auth.clone());
        config.id = format!("{}-{}", self.name, uuid::Uuid::new_v4());
        config.port = self.port;
        config.socket_path = self.socket_path.clone();
        config.reconnect = self.reconnect.unwrap_or(default_reconnect);
        config
    }
}
