pub mod parse;
pub mod script;

pub use parse::{parse_install_output, InstallResult, ListeningOn};
pub use script::{InstallScriptOptions, SERVER_BIN_DIR, SERVER_DIR};

use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::probe::{Platform, RemoteEnvironmentProbe};
use crate::sftp::upload_dir;
use crate::shell;
use crate::ssh::SessionManager;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

static ENV_VAR_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// How the server binary gets onto the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum DeploymentMethod {
    /// Local package directory containing a `server` executable
    Upload { local_path: PathBuf },
    /// `.tar.gz` package; `{platform}` and `{arch}` are substituted
    Download { url: String },
    /// Binary already present on the remote host
    Existing { binary_path: String },
}

impl DeploymentMethod {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentMethod::Upload { .. } => "upload",
            DeploymentMethod::Download { .. } => "download",
            DeploymentMethod::Existing { .. } => "existing",
        }
    }
}

/// Whether the server listens on a random Unix socket or an ephemeral port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenStrategy {
    #[default]
    SocketPath,
    Port,
}

/// Server install configuration (`[hosts.server]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstallConfig {
    pub deployment: DeploymentMethod,
    #[serde(default)]
    pub listen: ListenStrategy,
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Environment variable names echoed back in the result
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Skips platform detection when set
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl ServerInstallConfig {
    pub fn new(deployment: DeploymentMethod) -> Self {
        Self {
            deployment,
            listen: ListenStrategy::default(),
            extensions: Vec::new(),
            env_vars: Vec::new(),
            platform: None,
        }
    }

    /// Check the config against its deployment method
    pub fn validate(&self) -> AppResult<()> {
        match &self.deployment {
            DeploymentMethod::Upload { local_path } => {
                if local_path.as_os_str().is_empty() {
                    return Err(AppError::Config(
                        "upload deployment needs a local_path".to_string(),
                    ));
                }
                if !local_path.join("server").is_file() {
                    return Err(AppError::Config(format!(
                        "{} does not contain a server executable",
                        local_path.display()
                    )));
                }
            }
            DeploymentMethod::Download { url } => validate_download_url(url)?,
            DeploymentMethod::Existing { binary_path } => {
                if binary_path.trim().is_empty() {
                    return Err(AppError::Config(
                        "existing deployment needs a binary_path".to_string(),
                    ));
                }
            }
        }

        if let Some(name) = self.env_vars.iter().find(|n| !ENV_VAR_NAME.is_match(n)) {
            return Err(AppError::Config(format!(
                "Invalid environment variable name: {:?}",
                name
            )));
        }
        Ok(())
    }
}

fn validate_download_url(url: &str) -> AppResult<()> {
    if url.trim().is_empty() {
        return Err(AppError::Config(
            "download deployment needs a url".to_string(),
        ));
    }
    let parsed = url::Url::parse(&substitute_placeholders(url, "linux", "x64"))
        .map_err(|e| AppError::Config(format!("Invalid download url {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::Config(format!(
            "Download url must be http or https, got {}",
            scheme
        ))),
    }
}

fn substitute_placeholders(url: &str, platform: &str, arch: &str) -> String {
    url.replace("{platform}", platform).replace("{arch}", arch)
}

/// Deploys and (re)starts the remote server over a session
pub struct BootstrapInstaller {
    session: Arc<SessionManager>,
    probe: RemoteEnvironmentProbe,
}

impl BootstrapInstaller {
    pub fn new(session: Arc<SessionManager>, probe: RemoteEnvironmentProbe) -> Self {
        Self { session, probe }
    }

    pub async fn install(&self, config: &ServerInstallConfig) -> AppResult<InstallResult> {
        config.validate()?;

        let platform = match config.platform {
            Some(platform) => platform,
            None => self.probe.detect_platform(&self.session).await,
        };
        let arch = self.probe.detect_architecture(&self.session).await;
        tracing::info!(
            "Installing server via {} on {}/{} (session {})",
            config.deployment.name(),
            platform,
            arch,
            self.session.id()
        );

        let deployment = match &config.deployment {
            DeploymentMethod::Download { url } => DeploymentMethod::Download {
                url: substitute_placeholders(url, platform.as_str(), arch.as_str()),
            },
            other => other.clone(),
        };
        let mut options = InstallScriptOptions::new(deployment, platform, arch);
        options.extensions = config.extensions.clone();
        options.env_vars = config.env_vars.clone();
        options.listen = config.listen;

        if let DeploymentMethod::Upload { local_path } = &options.deployment {
            let fs = self.session.remote_fs().await?;
            let stats = upload_dir(fs.as_ref(), local_path, SERVER_BIN_DIR)
                .await
                .map_err(|e| AppError::Upload(e.to_string()))?;
            tracing::info!(
                "Uploaded server package: {} files, {} bytes (session {})",
                stats.files,
                stats.bytes,
                self.session.id()
            );
        }

        let command = shell::bash_c(&options.render());
        let output = self.session.exec(&command, &[]).await?;

        match parse_install_output(&output.stdout, &output.stderr, &options.marker) {
            Ok(result) => {
                tracing::info!(
                    "Remote server listening on {} (session {})",
                    result.listening_on,
                    self.session.id()
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(
                    "Server install failed (session {}): {}",
                    self.session.id(),
                    sanitize(&e.to_string())
                );
                Err(e)
            }
        }
    }
}
