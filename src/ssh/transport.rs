use super::connection::{ConnectionConfig, Credentials};
use crate::error::{AppError, AppResult};
use crate::sftp::RemoteFs;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bidirectional byte stream backed by one logical SSH channel
pub type ChannelStream = tokio::io::DuplexStream;

/// Output of an exec channel, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Remote exit status, sent once after the channel closed
    Exit(i32),
    /// The channel broke before it closed cleanly
    Failed(AppError),
}

/// Pseudo-terminal settings for interactive shells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Opens physical SSH connections
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Run TCP setup, handshake, host key check and authentication
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> AppResult<Arc<dyn SshConnection>>;
}

/// One established physical connection; every method opens a new logical
/// channel on it
#[async_trait]
pub trait SshConnection: Send + Sync {
    async fn exec(&self, command: &str) -> AppResult<mpsc::Receiver<ExecEvent>>;

    async fn shell(&self, options: &ShellOptions) -> AppResult<ChannelStream>;

    async fn forward_out(
        &self,
        source_addr: &str,
        source_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> AppResult<ChannelStream>;

    async fn forward_out_unix(&self, socket_path: &str) -> AppResult<ChannelStream>;

    /// SFTP access over the same connection
    async fn remote_fs(&self) -> AppResult<Arc<dyn RemoteFs>>;

    fn is_closed(&self) -> bool;

    /// Resolves once the transport has gone away, for whatever reason
    async fn closed(&self);

    async fn close(&self);
}
