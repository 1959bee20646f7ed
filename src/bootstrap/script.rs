//! Install script rendering.
//!
//! The script prints exactly one result block:
//!
//! ```text
//! <marker>: start
//! exitCode==0==
//! listeningOn==...==
//! ...
//! <marker>: end
//! ```
//!
//! Everything else it prints is diagnostics.

use super::{DeploymentMethod, ListenStrategy};
use crate::probe::{Arch, Platform};
use crate::shell;

/// Server directory, relative to the remote user's home
pub const SERVER_DIR: &str = ".sshbridge-server";
/// Uploaded and downloaded packages land here; the binary is `bin/server`
pub const SERVER_BIN_DIR: &str = ".sshbridge-server/bin";

const POLL_ATTEMPTS: u32 = 40;
const POLL_INTERVAL: &str = "0.5";

const TEMPLATE: &str = r#"umask 077

SERVER_DIR="$HOME/__SERVER_DIR__"
SERVER_BIN_DIR="$HOME/__SERVER_BIN_DIR__"
SERVER_LOG="$SERVER_DIR/server.log"
SERVER_PID_FILE="$SERVER_DIR/server.pid"
SERVER_TOKEN_FILE="$SERVER_DIR/server.token"
SERVER_BIN=__SERVER_BIN__
PLATFORM=__PLATFORM__
ARCH=__ARCH__
LISTENING_ON=
SERVER_CONNECTION_TOKEN=

print_install_results_and_exit() {
    echo "__MARKER__: start"
    echo "exitCode==$1=="
    echo "listeningOn==$LISTENING_ON=="
    echo "connectionToken==$SERVER_CONNECTION_TOKEN=="
    echo "logFile==$SERVER_LOG=="
    echo "platform==$PLATFORM=="
    echo "arch==$ARCH=="
    echo "serverPath==$SERVER_BIN=="
__ENV_LINES__
    echo "__MARKER__: end"
    exit 0
}

server_pid() {
    if [ -f "$SERVER_PID_FILE" ]; then
        pid=$(cat "$SERVER_PID_FILE" 2>/dev/null)
        if [ -n "$pid" ] && kill -0 "$pid" 2>/dev/null \
            && ps -o args= -p "$pid" 2>/dev/null | awk -v bin="$SERVER_BIN" '$1 == bin || $2 == bin { found = 1 } END { exit !found }'; then
            echo "$pid"
            return
        fi
    fi
    ps -eo pid=,args= 2>/dev/null | awk -v bin="$SERVER_BIN" '$2 == bin || $3 == bin { print $1; exit }'
}

if ! mkdir -p "$SERVER_BIN_DIR"; then
    echo "Error creating server directory $SERVER_BIN_DIR"
    print_install_results_and_exit 1
fi

__ACQUIRE__

rm -f "$SERVER_TOKEN_FILE"
SERVER_CONNECTION_TOKEN=$(head -c 32 /dev/urandom | od -An -tx1 | tr -d ' \n')
if [ -z "$SERVER_CONNECTION_TOKEN" ]; then
    echo "Error generating connection token"
    print_install_results_and_exit 1
fi
printf '%s' "$SERVER_CONNECTION_TOKEN" > "$SERVER_TOKEN_FILE"
chmod 600 "$SERVER_TOKEN_FILE"

SERVER_PID=$(server_pid)
if [ -n "$SERVER_PID" ]; then
    echo "Server already running with pid $SERVER_PID"
else
    echo "Starting server $SERVER_BIN"
    : > "$SERVER_LOG"
    nohup "$SERVER_BIN" --start-server --host=127.0.0.1 __LISTEN_FLAG__ --connection-token-file="$SERVER_TOKEN_FILE"__EXTENSION_FLAGS__ >> "$SERVER_LOG" 2>&1 < /dev/null &
    echo $! > "$SERVER_PID_FILE"
fi

attempt=0
while [ "$attempt" -lt __POLL_ATTEMPTS__ ]; do
    LISTENING_ON=$(grep -m 1 'listening on' "$SERVER_LOG" 2>/dev/null | sed 's/.*listening on[[:space:]]*//' | tr -d '\r')
    if [ -n "$LISTENING_ON" ]; then
        break
    fi
    attempt=$((attempt + 1))
    sleep __POLL_INTERVAL__
done

if [ -z "$LISTENING_ON" ]; then
    echo "Server did not report listening after __POLL_ATTEMPTS__ attempts, log contents:"
    cat "$SERVER_LOG" 2>/dev/null
    print_install_results_and_exit 1
fi

print_install_results_and_exit 0
"#;

const ACQUIRE_UPLOAD: &str = r#"if [ -f "$SERVER_BIN" ]; then
    chmod +x "$SERVER_BIN"
fi
if [ ! -x "$SERVER_BIN" ]; then
    echo "Uploaded server binary not found at $SERVER_BIN"
    print_install_results_and_exit 1
fi"#;

const ACQUIRE_DOWNLOAD: &str = r#"if [ ! -x "$SERVER_BIN" ]; then
    SERVER_ARCHIVE="$SERVER_DIR/server.tar.gz"
    SERVER_DOWNLOAD_URL=__URL__
    echo "Downloading server from $SERVER_DOWNLOAD_URL"
    if command -v curl >/dev/null 2>&1; then
        curl --retry 3 --connect-timeout 10 --location --fail --show-error --silent --output "$SERVER_ARCHIVE" "$SERVER_DOWNLOAD_URL"
    elif command -v wget >/dev/null 2>&1; then
        wget --tries=3 --timeout=10 --no-verbose -O "$SERVER_ARCHIVE" "$SERVER_DOWNLOAD_URL"
    else
        echo "Error: neither curl nor wget is installed"
        print_install_results_and_exit 1
    fi
    if [ $? -ne 0 ]; then
        echo "Error downloading server from $SERVER_DOWNLOAD_URL"
        rm -f "$SERVER_ARCHIVE"
        print_install_results_and_exit 1
    fi
    if ! tar -xzf "$SERVER_ARCHIVE" -C "$SERVER_BIN_DIR" --strip-components 1; then
        echo "Error extracting server archive"
        rm -f "$SERVER_ARCHIVE"
        print_install_results_and_exit 1
    fi
    rm -f "$SERVER_ARCHIVE"
fi
if [ ! -x "$SERVER_BIN" ]; then
    echo "Server binary not found at $SERVER_BIN after download"
    print_install_results_and_exit 1
fi"#;

const ACQUIRE_EXISTING: &str = r#"if [ ! -x "$SERVER_BIN" ]; then
    echo "Server binary not found at $SERVER_BIN"
    print_install_results_and_exit 1
fi"#;

/// Everything the script is parameterized by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallScriptOptions {
    /// Random text delimiting the result block
    pub marker: String,
    pub platform: Platform,
    pub arch: Arch,
    /// Download URLs must already have their placeholders substituted
    pub deployment: DeploymentMethod,
    pub extensions: Vec<String>,
    /// Names only; values are read on the remote side
    pub env_vars: Vec<String>,
    pub listen: ListenStrategy,
    /// Used with `ListenStrategy::SocketPath`
    pub socket_path: String,
}

impl InstallScriptOptions {
    pub fn new(deployment: DeploymentMethod, platform: Platform, arch: Arch) -> Self {
        Self {
            marker: uuid::Uuid::new_v4().simple().to_string(),
            platform,
            arch,
            deployment,
            extensions: Vec::new(),
            env_vars: Vec::new(),
            listen: ListenStrategy::default(),
            socket_path: format!("/tmp/sshbridge-{}.sock", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn render(&self) -> String {
        let server_bin = match &self.deployment {
            DeploymentMethod::Existing { binary_path } => remote_path(binary_path),
            _ => "\"$SERVER_BIN_DIR/server\"".to_string(),
        };
        let acquire = match &self.deployment {
            DeploymentMethod::Upload { .. } => ACQUIRE_UPLOAD.to_string(),
            DeploymentMethod::Download { url } => ACQUIRE_DOWNLOAD.replace("__URL__", &shell::quote(url)),
            DeploymentMethod::Existing { .. } => ACQUIRE_EXISTING.to_string(),
        };
        let listen_flag = match self.listen {
            ListenStrategy::SocketPath => shell::quote(&format!("--socket-path={}", self.socket_path)),
            ListenStrategy::Port => "--port=0".to_string(),
        };
        let extension_flags: String = self
            .extensions
            .iter()
            .map(|ext| format!(" --install-extension {}", shell::quote(ext)))
            .collect();
        let env_lines: String = self
            .env_vars
            .iter()
            .map(|name| format!("    echo \"{name}==${{{name}:-}}==\"\n"))
            .collect();

        TEMPLATE
            .replace("__ENV_LINES__\n", &env_lines)
            .replace("__ACQUIRE__", &acquire)
            .replace("__SERVER_BIN__", &server_bin)
            .replace("__SERVER_BIN_DIR__", SERVER_BIN_DIR)
            .replace("__SERVER_DIR__", SERVER_DIR)
            .replace("__PLATFORM__", self.platform.as_str())
            .replace("__ARCH__", self.arch.as_str())
            .replace("__LISTEN_FLAG__", &listen_flag)
            .replace("__EXTENSION_FLAGS__", &extension_flags)
            .replace("__POLL_ATTEMPTS__", &POLL_ATTEMPTS.to_string())
            .replace("__POLL_INTERVAL__", POLL_INTERVAL)
            .replace("__MARKER__", &self.marker)
    }
}

/// Shell word for a remote path, keeping a leading `~/` expandable
fn remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell::quote(rest)),
        None => shell::quote(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn existing(path: &str) -> InstallScriptOptions {
        InstallScriptOptions::new(
            DeploymentMethod::Existing {
                binary_path: path.to_string(),
            },
            Platform::Linux,
            Arch::X64,
        )
    }

    #[test]
    fn test_result_block_uses_marker() {
        let options = existing("/opt/arch/server");
        let script = options.render();

        assert_eq!(options.marker.len(), 32);
        assert!(script.contains(&format!("echo \"{}: start\"", options.marker)));
        assert!(script.contains(&format!("echo \"{}: end\"", options.marker)));
        assert!(script.contains("echo \"exitCode==$1==\""));
        assert!(!script.contains("__"));
    }

    #[test]
    fn test_layout_follows_server_dir() {
        let script = existing("/opt/arch/server").render();
        assert!(script.contains(&format!("SERVER_DIR=\"$HOME/{}\"\n", SERVER_DIR)));
        assert!(script.contains(&format!("SERVER_BIN_DIR=\"$HOME/{}\"\n", SERVER_BIN_DIR)));
        assert!(SERVER_BIN_DIR.starts_with(SERVER_DIR));
    }

    #[test]
    fn test_existing_binary_path() {
        let script = existing("/opt/arch/server").render();
        assert!(script.contains("SERVER_BIN=/opt/arch/server\n"));
        assert!(script.contains("Server binary not found at $SERVER_BIN\""));
        assert!(!script.contains("curl"));

        let script = existing("~/my tools/server").render();
        assert!(script.contains("SERVER_BIN=\"$HOME\"/'my tools/server'\n"));
    }

    #[test]
    fn test_download_branch_quotes_url() {
        let options = InstallScriptOptions::new(
            DeploymentMethod::Download {
                url: "https://example.com/server-linux-x64.tar.gz?tag=it's".to_string(),
            },
            Platform::Linux,
            Arch::X64,
        );
        let script = options.render();
        assert!(script.contains(
            "SERVER_DOWNLOAD_URL='https://example.com/server-linux-x64.tar.gz?tag=it'\\''s'"
        ));
        assert!(script.contains("SERVER_BIN=\"$SERVER_BIN_DIR/server\""));
    }

    #[test]
    fn test_upload_branch() {
        let options = InstallScriptOptions::new(
            DeploymentMethod::Upload {
                local_path: PathBuf::from("/build/server"),
            },
            Platform::Macos,
            Arch::Arm64,
        );
        let script = options.render();
        assert!(script.contains("chmod +x \"$SERVER_BIN\""));
        assert!(script.contains("PLATFORM=macos\nARCH=arm64\n"));
    }

    #[test]
    fn test_listen_strategies() {
        let mut options = existing("/opt/arch/server");
        let script = options.render();
        assert!(script.contains(&format!("--socket-path={}", options.socket_path)));
        assert!(options.socket_path.starts_with("/tmp/sshbridge-"));

        options.listen = ListenStrategy::Port;
        let script = options.render();
        assert!(script.contains("--host=127.0.0.1 --port=0 "));
        assert!(!script.contains("--socket-path"));
    }

    #[test]
    fn test_env_vars_and_extensions() {
        let mut options = existing("/opt/arch/server");
        options.env_vars = vec!["RUST_LOG".to_string(), "HTTP_PROXY".to_string()];
        options.extensions = vec!["rust-lang.rust-analyzer".to_string()];
        let script = options.render();

        assert!(script.contains("    echo \"RUST_LOG==${RUST_LOG:-}==\"\n"));
        assert!(script.contains("    echo \"HTTP_PROXY==${HTTP_PROXY:-}==\"\n"));
        assert!(script.contains(
            "--connection-token-file=\"$SERVER_TOKEN_FILE\" --install-extension rust-lang.rust-analyzer >>"
        ));
    }

    #[test]
    fn test_script_parses_under_bash() {
        let mut options = InstallScriptOptions::new(
            DeploymentMethod::Download {
                url: "https://example.com/server.tar.gz".to_string(),
            },
            Platform::Linux,
            Arch::X64,
        );
        options.env_vars = vec!["LANG".to_string()];
        let script = options.render();

        let status = match std::process::Command::new("bash")
            .arg("-n")
            .arg("-c")
            .arg(&script)
            .status()
        {
            Ok(status) => status,
            // no bash on this machine
            Err(_) => return,
        };
        assert!(status.success());
    }
}
