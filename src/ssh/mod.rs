pub mod connection;
pub mod libssh2;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{
    default_port, expand_home, AuthMethod, ConnectionConfig, ConnectionOverrides, Credentials,
    KnownHostsPolicy, ReconnectPolicy, Secret,
};
pub use session::{ExecOutput, SessionEvent, SessionInfo, SessionManager, SessionState};
pub use transport::{ChannelStream, ExecEvent, ShellOptions, SshConnection, SshTransport};
