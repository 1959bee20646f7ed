use super::connection::{ConnectionConfig, Credentials, KnownHostsPolicy};
use super::transport::{ChannelStream, ExecEvent, ShellOptions, SshConnection, SshTransport};
use crate::config::SshSettings;
use crate::error::{AppError, AppResult};
use crate::sftp::{RemoteFs, SftpFs};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use ssh2::{Channel, CheckResult, HostKeyType, KnownHostFileKind, Session};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const POLL_INTERVAL: Duration = Duration::from_millis(2);
const READ_BUFFER_BYTES: usize = 32 * 1024; // 32KB read buffer
const PUMP_BUFFER_BYTES: usize = 256 * 1024;

pub(crate) fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Repeat a libssh2 call until it stops reporting EAGAIN
pub(crate) async fn retry_eagain<T, F>(mut op: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    loop {
        match op() {
            Err(e) if would_block(&e) => tokio::time::sleep(POLL_INTERVAL).await,
            other => return other,
        }
    }
}

/// SOCKET_SEND, SOCKET_DISCONNECT, SOCKET_TIMEOUT, SOCKET_RECV
const LIBSSH2_SOCKET_ERRORS: [i32; 4] = [-7, -13, -30, -43];

/// The TCP stream under the session is gone
pub(crate) fn transport_lost(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(code) if LIBSSH2_SOCKET_ERRORS.contains(&code))
}

/// Map a failed channel request; socket errors mark the whole transport closed
fn channel_failure(alive: &watch::Sender<bool>, context: &str, err: ssh2::Error) -> AppError {
    if transport_lost(&err) {
        if alive.send_replace(false) {
            tracing::warn!("Transport lost: {}: {}", context, err);
        }
        AppError::Transport(format!("{}: {}", context, err))
    } else {
        AppError::Channel(format!("{}: {}", context, err))
    }
}

/// Opens connections with libssh2
pub struct Libssh2Transport {
    settings: SshSettings,
}

impl Libssh2Transport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SshTransport for Libssh2Transport {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> AppResult<Arc<dyn SshConnection>> {
        let config = config.clone();
        let credentials = credentials.clone();
        let settings = self.settings.clone();
        let session_id = config.id.clone();

        let session = tokio::task::spawn_blocking(move || {
            open_session(&config, &credentials, &settings)
        })
        .await
        .map_err(|e| AppError::Transport(format!("Connect task failed: {}", e)))??;

        let keepalive = Duration::from_secs(u64::from(self.settings.keepalive_interval.max(1)));
        Ok(Libssh2Connection::start(session_id, session, keepalive))
    }
}

/// Blocking connection setup (runs on the blocking pool)
fn open_session(
    config: &ConnectionConfig,
    credentials: &Credentials,
    settings: &SshSettings,
) -> AppResult<Session> {
    tracing::info!("Connecting to {} (session {})", config.target(), config.id);

    let mut session = Session::new()
        .map_err(|e| AppError::Transport(format!("Failed to create SSH session: {}", e)))?;

    match &config.socket_path {
        Some(path) => attach_socket(&mut session, path)?,
        None => {
            let tcp = connect_tcp(&config.host, config.port, settings.connect_timeout())?;
            session.set_tcp_stream(tcp);
        }
    }

    session.set_timeout(settings.connect_timeout().as_millis() as u32);
    session
        .handshake()
        .map_err(|e| AppError::Transport(format!("SSH handshake failed: {}", e)))?;

    if !config.host.is_empty() {
        verify_host_key(&session, &config.host, config.port, settings)?;
    }

    authenticate(&session, &config.username, credentials)?;
    tracing::info!("SSH authentication successful (session {})", config.id);

    session.set_keepalive(true, settings.keepalive_interval.max(1));
    session.set_blocking(false);
    Ok(session)
}

#[cfg(unix)]
fn attach_socket(session: &mut Session, path: &std::path::Path) -> AppResult<()> {
    let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
        AppError::Transport(format!("Failed to connect to {}: {}", path.display(), e))
    })?;
    session.set_tcp_stream(stream);
    Ok(())
}

#[cfg(not(unix))]
fn attach_socket(_session: &mut Session, path: &std::path::Path) -> AppResult<()> {
    Err(AppError::Config(format!(
        "Socket targets are not supported on this platform: {}",
        path.display()
    )))
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> AppResult<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::HostNotFound(format!("{}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(AppError::HostNotFound(host.to_string()));
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_nodelay(true)?; // Disable Nagle's algorithm for better latency
                return Ok(tcp);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(AppError::Transport(format!(
        "TCP connect to {}:{} failed: {}",
        host,
        port,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Verify the host key against known_hosts
fn verify_host_key(session: &Session, host: &str, port: u16, settings: &SshSettings) -> AppResult<()> {
    if settings.known_hosts_policy == KnownHostsPolicy::Accept {
        return Ok(());
    }

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| AppError::HostKey("No host key received".to_string()))?;
    let fingerprint = compute_sha256_fingerprint(key);

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| AppError::Transport(format!("Failed to create known_hosts: {}", e)))?;
    let known_hosts_path = settings.known_hosts_path();
    let sources = [settings.user_known_hosts_path(), known_hosts_path.clone()];
    for path in sources.iter().flatten().filter(|p| p.exists()) {
        // libssh2 stops at the first line it cannot parse; keep what it read
        if let Err(e) = known_hosts.read_file(path, KnownHostFileKind::OpenSSH) {
            tracing::warn!("Partially read {}: {}", path.display(), e);
        }
    }

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => {
            tracing::debug!("Host key matched for {}:{}", host, port);
            Ok(())
        }
        CheckResult::NotFound => {
            if settings.known_hosts_policy == KnownHostsPolicy::Strict {
                return Err(AppError::HostKey(format!(
                    "Unknown host key for {}:{} ({})",
                    host, port, fingerprint
                )));
            }
            tracing::info!(
                "Recording new host key for {}:{} ({})",
                host,
                port,
                fingerprint
            );
            let Some(path) = known_hosts_path else {
                return Ok(());
            };
            let Some(key_type) = key_type_name(key_type) else {
                tracing::warn!("Not recording host key of unknown type for {}:{}", host, port);
                return Ok(());
            };
            let line = known_hosts_line(
                &known_hosts_entry(host, port),
                key_type,
                key,
                &format!("Added by sshbridge on {}", chrono::Utc::now().format("%Y-%m-%d")),
            );
            append_known_host(&path, &line)
                .map_err(|e| AppError::HostKey(format!("Failed to write {}: {}", path.display(), e)))
        }
        CheckResult::Mismatch => {
            tracing::error!(
                "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                host,
                port
            );
            Err(AppError::HostKey(format!(
                "Host key for {}:{} has changed ({}); remove the old key from known_hosts if the change is expected",
                host, port, fingerprint
            )))
        }
        CheckResult::Failure => Err(AppError::HostKey("Failed to check known hosts".to_string())),
    }
}

fn key_type_name(key_type: HostKeyType) -> Option<&'static str> {
    match key_type {
        HostKeyType::Rsa => Some("ssh-rsa"),
        HostKeyType::Dss => Some("ssh-dss"),
        HostKeyType::Ecdsa256 => Some("ecdsa-sha2-nistp256"),
        HostKeyType::Ecdsa384 => Some("ecdsa-sha2-nistp384"),
        HostKeyType::Ecdsa521 => Some("ecdsa-sha2-nistp521"),
        HostKeyType::Ed25519 => Some("ssh-ed25519"),
        HostKeyType::Unknown => None,
    }
}

fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn known_hosts_line(entry: &str, key_type: &str, key: &[u8], comment: &str) -> String {
    let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
    format!("{} {} {} {}", entry, key_type, key, comment)
}

/// Append one entry, leaving existing lines untouched
fn append_known_host(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let mut needs_newline = false;
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        needs_newline = last[0] != b'\n';
    }
    if needs_newline {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{}", line)
}

/// Authenticate with the SSH server
fn authenticate(session: &Session, username: &str, credentials: &Credentials) -> AppResult<()> {
    match credentials {
        Credentials::Password(password) => {
            session
                .userauth_password(username, password.expose())
                .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
        }
        Credentials::PrivateKey { key, passphrase } => {
            session
                .userauth_pubkey_memory(
                    username,
                    None,
                    key.expose(),
                    passphrase.as_ref().map(|p| p.expose()),
                )
                .map_err(|e| {
                    let msg = e.to_string().to_lowercase();
                    if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                        AppError::Auth(
                            "Invalid passphrase or key format. Ensure the key is in PEM or OpenSSH format."
                                .to_string(),
                        )
                    } else {
                        AppError::Auth("Private key not accepted by server".to_string())
                    }
                })?;
        }
        Credentials::Agent => {
            let mut agent = session.agent().map_err(|_| {
                AppError::Auth("SSH agent not available. Make sure ssh-agent is running.".to_string())
            })?;
            agent
                .connect()
                .map_err(|_| AppError::Auth("Failed to connect to SSH agent. Is it running?".to_string()))?;
            agent
                .list_identities()
                .map_err(|_| AppError::Auth("Failed to list SSH agent identities".to_string()))?;

            let identities = agent.identities().unwrap_or_default();
            if identities.is_empty() {
                return Err(AppError::Auth(
                    "No identities found in SSH agent. Add keys with ssh-add.".to_string(),
                ));
            }
            let accepted = identities
                .iter()
                .any(|identity| agent.userauth(username, identity).is_ok());
            if !accepted {
                return Err(AppError::Auth(
                    "SSH agent authentication failed. No matching key accepted.".to_string(),
                ));
            }
        }
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

/// Compute SHA256 fingerprint of a key
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// An authenticated libssh2 session in non-blocking mode
pub struct Libssh2Connection {
    id: String,
    session: Session,
    alive: Arc<watch::Sender<bool>>,
    keepalive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Libssh2Connection {
    fn start(id: String, session: Session, keepalive: Duration) -> Arc<dyn SshConnection> {
        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);

        let task = tokio::spawn(run_keepalive(
            id.clone(),
            session.clone(),
            Arc::clone(&alive),
            keepalive,
        ));

        Arc::new(Self {
            id,
            session,
            alive,
            keepalive_task: parking_lot::Mutex::new(Some(task)),
        })
    }

    fn ensure_alive(&self) -> AppResult<()> {
        if *self.alive.borrow() {
            Ok(())
        } else {
            Err(AppError::Transport("Connection lost".to_string()))
        }
    }
}

/// Send keepalives; the first failure marks the transport closed
async fn run_keepalive(
    id: String,
    session: Session,
    alive: Arc<watch::Sender<bool>>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if !*alive.borrow() {
            break;
        }
        match retry_eagain(|| session.keepalive_send()).await {
            Ok(_) => tracing::debug!("Keepalive sent (session {})", id),
            Err(e) => {
                tracing::warn!("Keepalive failed, transport lost (session {}): {}", id, e);
                alive.send_replace(false);
                break;
            }
        }
    }
}

#[async_trait]
impl SshConnection for Libssh2Connection {
    async fn exec(&self, command: &str) -> AppResult<mpsc::Receiver<ExecEvent>> {
        self.ensure_alive()?;
        let mut channel = retry_eagain(|| self.session.channel_session())
            .await
            .map_err(|e| channel_failure(&self.alive, "Failed to open channel", e))?;
        retry_eagain(|| channel.exec(command))
            .await
            .map_err(|e| channel_failure(&self.alive, "Failed to start command", e))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_exec(channel, tx));
        Ok(rx)
    }

    async fn shell(&self, options: &ShellOptions) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        let mut channel = retry_eagain(|| self.session.channel_session())
            .await
            .map_err(|e| channel_failure(&self.alive, "Failed to open channel", e))?;
        retry_eagain(|| {
            channel.request_pty(&options.term, None, Some((options.cols, options.rows, 0, 0)))
        })
        .await
        .map_err(|e| channel_failure(&self.alive, "Failed to request PTY", e))?;
        retry_eagain(|| channel.shell())
            .await
            .map_err(|e| channel_failure(&self.alive, "Failed to start shell", e))?;

        tracing::debug!("Shell started (session {})", self.id);
        Ok(spawn_stream_pump(channel, "shell".to_string()))
    }

    async fn forward_out(
        &self,
        source_addr: &str,
        source_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        let channel = retry_eagain(|| {
            self.session
                .channel_direct_tcpip(dest_addr, dest_port, Some((source_addr, source_port)))
        })
        .await
        .map_err(|e| {
            channel_failure(
                &self.alive,
                &format!("Failed to forward to {}:{}", dest_addr, dest_port),
                e,
            )
        })?;
        Ok(spawn_stream_pump(
            channel,
            format!("{}:{}", dest_addr, dest_port),
        ))
    }

    async fn forward_out_unix(&self, socket_path: &str) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        let channel = retry_eagain(|| self.session.channel_direct_streamlocal(socket_path, None))
            .await
            .map_err(|e| {
                channel_failure(
                    &self.alive,
                    &format!("Failed to forward to {}", socket_path),
                    e,
                )
            })?;
        Ok(spawn_stream_pump(channel, socket_path.to_string()))
    }

    async fn remote_fs(&self) -> AppResult<Arc<dyn RemoteFs>> {
        self.ensure_alive()?;
        let sftp = retry_eagain(|| self.session.sftp()).await.map_err(|e| {
            match channel_failure(&self.alive, "Failed to open SFTP", e) {
                AppError::Channel(msg) => AppError::Transfer(msg),
                other => other,
            }
        })?;
        Ok(Arc::new(SftpFs::new(sftp)))
    }

    fn is_closed(&self) -> bool {
        !*self.alive.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn close(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        if *self.alive.borrow() {
            if let Err(e) = retry_eagain(|| {
                self.session
                    .disconnect(None, "sshbridge session closed", None)
            })
            .await
            {
                tracing::debug!("Disconnect failed (session {}): {}", self.id, e);
            }
        }
        self.alive.send_replace(false);
        tracing::info!("SSH transport closed (session {})", self.id);
    }
}

/// Try one non-blocking read; `None` means nothing was available
fn read_available(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_all_channel(channel: &mut Channel, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(POLL_INTERVAL).await
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The parts of an exec channel that `pump_exec` drives
trait ExecChannel: Send + 'static {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    fn at_eof(&self) -> bool;
    fn close(&mut self) -> Result<(), ssh2::Error>;
    fn wait_close(&mut self) -> Result<(), ssh2::Error>;
    fn exit_status(&self) -> Result<i32, ssh2::Error>;
}

impl ExecChannel for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        read_available(self, buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        read_available(&mut self.stderr(), buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }

    fn close(&mut self) -> Result<(), ssh2::Error> {
        Channel::close(self)
    }

    fn wait_close(&mut self) -> Result<(), ssh2::Error> {
        Channel::wait_close(self)
    }

    fn exit_status(&self) -> Result<i32, ssh2::Error> {
        Channel::exit_status(self)
    }
}

async fn pump_exec<C: ExecChannel>(mut channel: C, tx: mpsc::Sender<ExecEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        // Caller stopped listening (exec_until predicate matched)
        if tx.is_closed() {
            let _ = retry_eagain(|| channel.close()).await;
            return;
        }

        let mut progressed = false;

        match channel.read_stdout(&mut buf) {
            Ok(Some(n)) if n > 0 => {
                progressed = true;
                if tx.send(ExecEvent::Stdout(buf[..n].to_vec())).await.is_err() {
                    continue;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(ExecEvent::Failed(AppError::Channel(e.to_string()))).await;
                return;
            }
        }

        match channel.read_stderr(&mut buf) {
            Ok(Some(n)) if n > 0 => {
                progressed = true;
                if tx.send(ExecEvent::Stderr(buf[..n].to_vec())).await.is_err() {
                    continue;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(ExecEvent::Failed(AppError::Channel(e.to_string()))).await;
                return;
            }
        }

        if !progressed {
            if channel.at_eof() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    let _ = retry_eagain(|| channel.close()).await;
    let _ = retry_eagain(|| channel.wait_close()).await;
    let code = channel.exit_status().unwrap_or(-1);
    let _ = tx.send(ExecEvent::Exit(code)).await;
}

/// Bridge a libssh2 channel to a duplex stream handed to the caller
fn spawn_stream_pump(channel: Channel, label: String) -> ChannelStream {
    let (local, remote_side) = tokio::io::duplex(PUMP_BUFFER_BYTES);
    tokio::spawn(async move {
        if let Err(e) = pump_stream(channel, remote_side).await {
            tracing::debug!("Channel [{}] ended with error: {}", label, e);
        }
    });
    local
}

async fn pump_stream(mut channel: Channel, stream: DuplexStream) -> io::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut inbound = vec![0u8; READ_BUFFER_BYTES];
    let mut outbound = vec![0u8; READ_BUFFER_BYTES];
    let mut local_open = true;

    loop {
        // Remote to local: drain until EAGAIN
        let mut progressed = false;
        while let Some(n) = read_available(&mut channel, &mut inbound)? {
            if n == 0 {
                break;
            }
            writer.write_all(&inbound[..n]).await?;
            progressed = true;
        }
        if channel.eof() {
            break;
        }

        let wait = if progressed { Duration::ZERO } else { POLL_INTERVAL };
        if !local_open {
            tokio::time::sleep(wait).await;
            continue;
        }

        tokio::select! {
            read = reader.read(&mut outbound) => {
                match read? {
                    0 => {
                        local_open = false;
                        retry_eagain(|| channel.send_eof()).await.map_err(io::Error::from)?;
                    }
                    n => write_all_channel(&mut channel, &outbound[..n]).await?,
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }

    let _ = writer.shutdown().await;
    let _ = retry_eagain(|| channel.close()).await;
    Ok(())
}
