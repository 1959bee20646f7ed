use crate::config::ProbeSettings;
use crate::error::AppError;
use crate::ssh::SessionManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Remote kernel family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Linux,
    Macos,
    Freebsd,
    Windows,
}

impl Platform {
    /// Classify `uname -s` output
    pub fn from_uname(output: &str) -> Option<Self> {
        let kernel = output.trim().to_ascii_lowercase();
        if kernel.starts_with("linux") {
            Some(Platform::Linux)
        } else if kernel.starts_with("darwin") {
            Some(Platform::Macos)
        } else if kernel.starts_with("freebsd") {
            Some(Platform::Freebsd)
        } else if kernel.starts_with("mingw")
            || kernel.starts_with("msys")
            || kernel.starts_with("cygwin")
        {
            Some(Platform::Windows)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Freebsd => "freebsd",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::Macos),
            "freebsd" => Ok(Platform::Freebsd),
            "windows" => Ok(Platform::Windows),
            other => Err(AppError::Config(format!("Unknown platform: {}", other))),
        }
    }
}

/// Remote CPU architecture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    X64,
    Arm64,
    Armhf,
}

impl Arch {
    /// Classify `uname -m` or `%PROCESSOR_ARCHITECTURE%` output
    pub fn from_machine(output: &str) -> Option<Self> {
        let machine = output.trim().to_ascii_lowercase();
        match machine.as_str() {
            "x86_64" | "amd64" | "x64" => Some(Arch::X64),
            "aarch64" | "arm64" => Some(Arch::Arm64),
            "armv7l" | "armv6l" | "armhf" => Some(Arch::Armhf),
            m if m.starts_with("armv8") || m.starts_with("armv9") => Some(Arch::Arm64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
            Arch::Armhf => "armhf",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs side-effect-free probe commands over a session
#[derive(Debug, Clone)]
pub struct RemoteEnvironmentProbe {
    timeout: Duration,
}

impl Default for RemoteEnvironmentProbe {
    fn default() -> Self {
        Self::new(&ProbeSettings::default())
    }
}

impl RemoteEnvironmentProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            timeout: settings.timeout(),
        }
    }

    pub async fn detect_platform(&self, session: &Arc<SessionManager>) -> Platform {
        if let Some(platform) = self
            .run(session, "uname -s")
            .await
            .and_then(|out| Platform::from_uname(&out))
        {
            return platform;
        }
        if let Some(out) = self.run(session, "cmd /c ver").await {
            if out.to_ascii_lowercase().contains("windows") {
                return Platform::Windows;
            }
        }
        tracing::debug!(
            "Platform detection inconclusive, assuming linux (session {})",
            session.id()
        );
        Platform::default()
    }

    pub async fn detect_architecture(&self, session: &Arc<SessionManager>) -> Arch {
        if let Some(arch) = self
            .run(session, "uname -m")
            .await
            .and_then(|out| Arch::from_machine(&out))
        {
            return arch;
        }
        if let Some(arch) = self
            .run(session, "cmd /c echo %PROCESSOR_ARCHITECTURE%")
            .await
            .and_then(|out| Arch::from_machine(&out))
        {
            return arch;
        }
        tracing::debug!(
            "Architecture detection inconclusive, assuming x64 (session {})",
            session.id()
        );
        Arch::default()
    }

    /// Stdout of a successful command; failures and timeouts yield `None`
    async fn run(&self, session: &Arc<SessionManager>, command: &str) -> Option<String> {
        match tokio::time::timeout(self.timeout, session.exec(command, &[])).await {
            Ok(Ok(output)) if output.exit_code.unwrap_or(0) == 0 => Some(output.stdout),
            Ok(Ok(output)) => {
                tracing::debug!(
                    "Probe `{}` exited with {:?} (session {})",
                    command,
                    output.exit_code,
                    session.id()
                );
                None
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe `{}` failed (session {}): {}", command, session.id(), e);
                None
            }
            Err(_) => {
                tracing::warn!("Probe `{}` timed out (session {})", command, session.id());
                None
            }
        }
    }
}
