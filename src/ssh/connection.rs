use crate::error::{AppError, AppResult};
use crate::keychain;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub fn default_port() -> u16 {
    22
}

fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A credential string that never shows up in Debug output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Authentication method
///
/// Secrets can be given inline or as a reference into the OS keychain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        #[serde(default)]
        password: Option<Secret>,
        /// Keychain key reference
        #[serde(default)]
        password_key: Option<String>,
    },
    Key {
        /// Private key material (PEM / OpenSSH)
        #[serde(default)]
        private_key: Option<Secret>,
        #[serde(default)]
        private_key_path: Option<PathBuf>,
        /// Keychain key reference
        #[serde(default)]
        key_id: Option<String>,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    Agent,
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::Agent
    }
}

/// Credentials after keychain / key-file resolution
#[derive(Debug, Clone)]
pub enum Credentials {
    Password(Secret),
    PrivateKey {
        key: Secret,
        passphrase: Option<Secret>,
    },
    Agent,
}

/// Reconnect policy applied by the session's connect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownHostsPolicy {
    /// Unknown hosts are rejected
    Strict,
    /// Unknown hosts are recorded in known_hosts on first use
    #[default]
    AcceptNew,
    /// No verification
    Accept,
}

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "new_connection_id")]
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth: AuthMethod,
    /// Local Unix socket carrying the SSH stream instead of TCP
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            id: new_connection_id(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            socket_path: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Merge per-call overrides into the stored config
    pub fn merge(&mut self, overrides: ConnectionOverrides) {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(username) = overrides.username {
            self.username = username;
        }
        if let Some(auth) = overrides.auth {
            self.auth = auth;
        }
        if let Some(socket_path) = overrides.socket_path {
            self.socket_path = Some(socket_path);
        }
        if let Some(reconnect) = overrides.reconnect {
            self.reconnect = reconnect;
        }
    }

    /// Check the fields a connection attempt cannot start without
    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() && self.socket_path.is_none() {
            return Err(AppError::Config(
                "a host or socket_path is required".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::Config("a username is required".to_string()));
        }
        if self.socket_path.is_none() && self.port == 0 {
            return Err(AppError::Config("port must not be 0".to_string()));
        }
        Ok(())
    }

    /// Human readable target for log lines
    pub fn target(&self) -> String {
        match &self.socket_path {
            Some(path) => format!("{}@{}", self.username, path.display()),
            None => format!("{}@{}:{}", self.username, self.host, self.port),
        }
    }

    /// Resolve the auth method into concrete credentials
    pub async fn resolve_credentials(&self) -> AppResult<Credentials> {
        match &self.auth {
            AuthMethod::Agent => Ok(Credentials::Agent),
            AuthMethod::Password {
                password,
                password_key,
            } => {
                if let Some(password) = password {
                    return Ok(Credentials::Password(password.clone()));
                }
                let key = password_key.as_deref().ok_or_else(|| {
                    AppError::Config("password auth needs a password or password_key".to_string())
                })?;
                let secret = lookup_secret(key).await?;
                Ok(Credentials::Password(secret))
            }
            AuthMethod::Key {
                private_key,
                private_key_path,
                key_id,
                passphrase,
            } => {
                let key = if let Some(material) = private_key {
                    material.clone()
                } else if let Some(path) = private_key_path {
                    let path = expand_home(path);
                    let material = tokio::fs::read_to_string(&path).await.map_err(|e| {
                        AppError::Config(format!(
                            "Failed to read private key {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    Secret::new(material)
                } else if let Some(key_id) = key_id {
                    lookup_secret(key_id).await?
                } else {
                    return Err(AppError::Config(
                        "key auth needs private_key, private_key_path or key_id".to_string(),
                    ));
                };
                Ok(Credentials::PrivateKey {
                    key,
                    passphrase: passphrase.clone(),
                })
            }
        }
    }
}

/// Partial config applied on each `connect()` call
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth: Option<AuthMethod>,
    pub socket_path: Option<PathBuf>,
    pub reconnect: Option<ReconnectPolicy>,
}

async fn lookup_secret(key: &str) -> AppResult<Secret> {
    let key = key.to_string();
    let secret = tokio::task::spawn_blocking(move || keychain::get_secret(&key))
        .await
        .map_err(|e| AppError::Keychain(e.to_string()))??;
    // A missing keychain entry is a configuration problem, not a transient one
    secret
        .map(Secret::new)
        .ok_or_else(|| AppError::Config("secret not found in keychain".to_string()))
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_host_or_socket() {
        let mut config = ConnectionConfig::new("", "dev", AuthMethod::Agent);
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        config.socket_path = Some(PathBuf::from("/tmp/ssh.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_username() {
        let config = ConnectionConfig::new("example.com", " ", AuthMethod::Agent);
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_merge_overrides() {
        let mut config = ConnectionConfig::new("example.com", "dev", AuthMethod::Agent);
        config.merge(ConnectionOverrides {
            port: Some(2222),
            username: Some("ops".into()),
            ..Default::default()
        });
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "ops");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let auth = AuthMethod::Password {
            password: Some(Secret::new("hunter2")),
            password_key: None,
        };
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_auth_method_from_toml() {
        let auth: AuthMethod =
            toml::from_str("type = \"key\"\nprivate_key_path = \"~/.ssh/id_ed25519\"").unwrap();
        match auth {
            AuthMethod::Key {
                private_key_path, ..
            } => assert_eq!(private_key_path, Some(PathBuf::from("~/.ssh/id_ed25519"))),
            other => panic!("unexpected auth method {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_inline_credentials() {
        let config = ConnectionConfig::new(
            "example.com",
            "dev",
            AuthMethod::Password {
                password: Some(Secret::new("pw")),
                password_key: None,
            },
        );
        match config.resolve_credentials().await.unwrap() {
            Credentials::Password(secret) => assert_eq!(secret.expose(), "pw"),
            other => panic!("unexpected credentials {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_key_file_is_config_error() {
        let config = ConnectionConfig::new(
            "example.com",
            "dev",
            AuthMethod::Key {
                private_key: None,
                private_key_path: Some(PathBuf::from("/nonexistent/id_rsa")),
                key_id: None,
                passphrase: None,
            },
        );
        assert!(matches!(
            config.resolve_credentials().await,
            Err(AppError::Config(_))
        ));
    }
}
