use serde::Serialize;
use thiserror::Error;

/// libssh2 error codes that classify a failure as an authentication problem
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_FILE: i32 = -16;

/// Application error types
///
/// Cloneable so a single connection attempt's outcome can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Host key rejected: {0}")]
    HostKey(String),

    #[error("Connection error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("File transfer error: {0}")]
    Transfer(String),

    #[error("Failed to upload server package: {0}")]
    Upload(String),

    #[error("Malformed install output: {0}")]
    ProtocolParse(String),

    #[error("Remote server install failed with exit code {code}\n{output}")]
    RemoteProcess { code: i32, output: String },

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session closed")]
    Closed,
}

impl AppError {
    /// Whether the reconnect loop may try again after this error.
    ///
    /// Configuration, authentication, host-key and host-not-found failures are
    /// terminal regardless of the reconnect policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::Io(_))
    }

    /// Exit code reported by the remote install script, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AppError::RemoteProcess { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Serializable error for frontend
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::HostNotFound(_) => "HOST_NOT_FOUND",
            AppError::HostKey(_) => "HOST_KEY_ERROR",
            AppError::Transport(_) => "CONNECTION_ERROR",
            AppError::Channel(_) => "CHANNEL_ERROR",
            AppError::Tunnel(_) => "TUNNEL_ERROR",
            AppError::Transfer(_) => "TRANSFER_ERROR",
            AppError::Upload(_) => "UPLOAD_ERROR",
            AppError::ProtocolParse(_) => "PROTOCOL_PARSE_ERROR",
            AppError::RemoteProcess { .. } => "REMOTE_PROCESS_ERROR",
            AppError::Keychain(_) => "KEYCHAIN_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Closed => "SESSION_CLOSED",
        };
        let details = err.exit_code().map(|code| format!("exit code {}", code));

        SerializableError {
            code: code.to_string(),
            message: err.to_string(),
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<ssh2::Error> for AppError {
    fn from(err: ssh2::Error) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
            | ssh2::ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED)
            | ssh2::ErrorCode::Session(LIBSSH2_ERROR_FILE) => {
                AppError::Auth(err.message().to_string())
            }
            ssh2::ErrorCode::SFTP(code) => {
                AppError::Transfer(format!("{} (sftp status {})", err.message(), code))
            }
            _ => AppError::Transport(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Keychain(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
