//! Multiplexed SSH sessions, port-forward tunnels and remote server bootstrap.
//!
//! One [`SessionManager`] owns one physical SSH connection. Exec, shell and
//! forwarded channels are multiplexed over it, a [`TunnelRegistry`] hangs
//! local listeners off it, and [`BootstrapInstaller`] uses it to deploy and
//! start a server on the remote host.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod keychain;
pub mod logging;
pub mod probe;
pub mod sftp;
pub mod shell;
pub mod ssh;
pub mod tunnel;

pub use bootstrap::{BootstrapInstaller, InstallResult, ListeningOn, ServerInstallConfig};
pub use config::{HostProfile, Settings};
pub use error::{AppError, AppResult};
pub use probe::{Arch, Platform, RemoteEnvironmentProbe};
pub use ssh::{ConnectionConfig, ExecOutput, SessionEvent, SessionManager, SessionState};
pub use tunnel::{TunnelDescriptor, TunnelMode, TunnelRegistry, TunnelSpec};
