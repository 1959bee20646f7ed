use super::connection::{ConnectionConfig, ConnectionOverrides};
use super::libssh2::Libssh2Transport;
use super::transport::{ChannelStream, ExecEvent, ShellOptions, SshConnection, SshTransport};
use crate::config::SshSettings;
use crate::error::{AppError, AppResult};
use crate::sftp::RemoteFs;
use crate::shell;
use crate::tunnel::TunnelRegistry;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

type ConnectFuture = Shared<BoxFuture<'static, AppResult<Arc<dyn SshConnection>>>>;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Session info snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub connected_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Lifecycle notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionInfo),
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    Closed,
}

/// Buffered result of an exec channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the caller stopped reading before the channel closed
    pub exit_code: Option<i32>,
}

#[derive(Default)]
struct ExecBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl ExecBuffers {
    fn output(&self) -> ExecOutput {
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code,
        }
    }
}

/// Owns one physical SSH connection and its lifecycle
pub struct SessionManager {
    id: String,
    config: RwLock<ConnectionConfig>,
    transport: Arc<dyn SshTransport>,
    state: RwLock<SessionState>,
    last_error: RwLock<Option<AppError>>,
    connected_at: RwLock<Option<i64>>,
    connection: RwLock<Option<Arc<dyn SshConnection>>>,
    // Guards read/create/clear of the in-flight attempt
    in_flight: Mutex<Option<ConnectFuture>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    tunnels: Mutex<Option<Weak<TunnelRegistry>>>,
}

impl SessionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn SshTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            transport,
            state: RwLock::new(SessionState::Idle),
            last_error: RwLock::new(None),
            connected_at: RwLock::new(None),
            connection: RwLock::new(None),
            in_flight: Mutex::new(None),
            monitor: Mutex::new(None),
            closing: AtomicBool::new(false),
            events,
            tunnels: Mutex::new(None),
        })
    }

    /// Session backed by the libssh2 transport
    pub fn with_libssh2(config: ConnectionConfig, settings: SshSettings) -> Arc<Self> {
        Self::new(config, Arc::new(Libssh2Transport::new(settings)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    pub fn info(&self) -> SessionInfo {
        let config = self.config.read();
        SessionInfo {
            id: self.id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            state: self.state(),
            connected_at: *self.connected_at.read(),
            last_error: self.last_error.read().as_ref().map(|e| e.to_string()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// True once `close()` has started
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// Overrides are merged into the stored config only when no attempt is
    /// running; a running attempt keeps the config it started with.
    pub async fn connect(
        self: &Arc<Self>,
        overrides: Option<ConnectionOverrides>,
    ) -> AppResult<SessionInfo> {
        self.connect_inner(overrides).await?;
        Ok(self.info())
    }

    async fn connect_inner(
        self: &Arc<Self>,
        overrides: Option<ConnectionOverrides>,
    ) -> AppResult<Arc<dyn SshConnection>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(AppError::Closed);
        }

        let attempt = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    if overrides.is_some() {
                        tracing::debug!(
                            "Connect already in flight, overrides ignored (session {})",
                            self.id
                        );
                    }
                    existing.clone()
                }
                None => {
                    if let Some(overrides) = overrides {
                        self.config.write().merge(overrides);
                    }
                    if let Some(conn) = self.live_connection() {
                        return Ok(conn);
                    }
                    if let Err(e) = self.config.read().validate() {
                        *self.last_error.write() = Some(e.clone());
                        return Err(e);
                    }

                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = this.run_attempts().await;
                        this.in_flight.lock().take();
                        result
                    });
                    let attempt: ConnectFuture = async move {
                        task.await.map_err(|e| {
                            AppError::Transport(format!("Connect task failed: {}", e))
                        })?
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Try up to the policy bound; only retryable errors are retried
    async fn run_attempts(self: &Arc<Self>) -> AppResult<Arc<dyn SshConnection>> {
        let config = self.config.read().clone();
        let policy = config.reconnect;
        let max_attempts = if policy.enabled {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(AppError::Closed);
            }
            attempt += 1;
            self.transition(SessionState::Connecting);
            tracing::info!(
                "Connecting to {} attempt {}/{} (session {})",
                config.target(),
                attempt,
                max_attempts,
                self.id
            );

            match self.attempt_once(&config).await {
                Ok(conn) => return self.adopt(conn).await,
                Err(e) => {
                    tracing::warn!("Connect attempt {} failed (session {}): {}", attempt, self.id, e);
                    *self.last_error.write() = Some(e.clone());

                    if !e.is_retryable() || attempt >= max_attempts {
                        self.transition(SessionState::Disconnected);
                        return Err(e);
                    }

                    self.transition(SessionState::Disconnected);
                    let _ = self.events.send(SessionEvent::ReconnectScheduled {
                        attempt: attempt + 1,
                        delay_ms: policy.delay_ms,
                    });
                    tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
                }
            }
        }
    }

    async fn attempt_once(&self, config: &ConnectionConfig) -> AppResult<Arc<dyn SshConnection>> {
        let credentials = config.resolve_credentials().await?;
        self.transport.connect(config, &credentials).await
    }

    /// Install a fresh connection as the live one
    async fn adopt(self: &Arc<Self>, conn: Arc<dyn SshConnection>) -> AppResult<Arc<dyn SshConnection>> {
        *self.connection.write() = Some(Arc::clone(&conn));
        if self.closing.load(Ordering::SeqCst) {
            // close() ran while the handshake was in progress
            let stale = self.connection.write().take();
            if let Some(conn) = stale {
                conn.close().await;
            }
            return Err(AppError::Closed);
        }

        *self.last_error.write() = None;
        *self.connected_at.write() = Some(chrono::Utc::now().timestamp());
        self.transition(SessionState::Connected);
        tracing::info!("SSH connection established (session {})", self.id);
        self.spawn_monitor(Arc::clone(&conn));
        Ok(conn)
    }

    /// Watch the transport and drive reconnects when it goes away
    fn spawn_monitor(self: &Arc<Self>, conn: Arc<dyn SshConnection>) {
        let session = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            conn.closed().await;
            if let Some(session) = session.upgrade() {
                session.on_transport_closed(conn).await;
            }
        });
        // The previous monitor, if any, is the one running this reconnect
        *self.monitor.lock() = Some(handle);
    }

    async fn on_transport_closed(self: Arc<Self>, conn: Arc<dyn SshConnection>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut current = self.connection.write();
            match current.as_ref() {
                Some(live) if same_connection(live, &conn) => *current = None,
                _ => return,
            }
        }

        tracing::warn!("SSH transport closed (session {})", self.id);
        *self.last_error.write() = Some(AppError::Transport("Connection lost".to_string()));
        *self.connected_at.write() = None;
        self.transition(SessionState::Disconnected);

        if !self.config.read().reconnect.enabled {
            self.close_tunnels().await;
            return;
        }

        match self.connect_inner(None).await {
            Ok(_) => tracing::info!("Reconnected (session {})", self.id),
            Err(AppError::Closed) => {}
            Err(e) => {
                tracing::error!("Reconnect failed, giving up (session {}): {}", self.id, e);
                self.close_tunnels().await;
            }
        }
    }

    fn live_connection(&self) -> Option<Arc<dyn SshConnection>> {
        self.connection
            .read()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Live connection, connecting first when needed
    async fn connection(self: &Arc<Self>) -> AppResult<Arc<dyn SshConnection>> {
        match self.live_connection() {
            Some(conn) => Ok(conn),
            None => self.connect_inner(None).await,
        }
    }

    fn transition(&self, state: SessionState) {
        if self.closing.load(Ordering::SeqCst)
            && !matches!(state, SessionState::Disconnecting | SessionState::Disconnected)
        {
            return;
        }
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            tracing::debug!("Session {} state {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
        let _ = self.events.send(SessionEvent::StateChanged(self.info()));
    }

    /// Run a command to completion and collect its output
    pub async fn exec(self: &Arc<Self>, command: &str, args: &[String]) -> AppResult<ExecOutput> {
        self.exec_until(command, args, |_, _| false).await
    }

    /// Run a command until `done(stdout, stderr)` holds or the channel closes
    pub async fn exec_until<F>(
        self: &Arc<Self>,
        command: &str,
        args: &[String],
        done: F,
    ) -> AppResult<ExecOutput>
    where
        F: Fn(&str, &str) -> bool + Send,
    {
        let line = shell::command_line(command, args);
        let conn = self.connection().await?;
        let mut events = conn.exec(&line).await?;
        tracing::debug!("Exec channel opened (session {})", self.id);

        let mut buffers = ExecBuffers::default();
        while let Some(event) = events.recv().await {
            match event {
                ExecEvent::Stdout(data) => buffers.stdout.extend_from_slice(&data),
                ExecEvent::Stderr(data) => buffers.stderr.extend_from_slice(&data),
                ExecEvent::Exit(code) => {
                    buffers.exit_code = Some(code);
                    continue;
                }
                ExecEvent::Failed(e) => return Err(e),
            }

            let output = buffers.output();
            if done(&output.stdout, &output.stderr) {
                // Dropping the receiver closes the remote channel
                return Ok(output);
            }
        }
        Ok(buffers.output())
    }

    /// Open an interactive PTY channel
    pub async fn shell(self: &Arc<Self>, options: Option<ShellOptions>) -> AppResult<ChannelStream> {
        let conn = self.connection().await?;
        conn.shell(&options.unwrap_or_default()).await
    }

    /// Open a direct-tcpip channel to `dest_addr:dest_port`
    pub async fn forward_out(
        self: &Arc<Self>,
        source_addr: &str,
        source_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> AppResult<ChannelStream> {
        let conn = self.connection().await?;
        conn.forward_out(source_addr, source_port, dest_addr, dest_port)
            .await
    }

    /// Open a channel to a Unix socket on the remote host
    pub async fn forward_out_unix(self: &Arc<Self>, socket_path: &str) -> AppResult<ChannelStream> {
        let conn = self.connection().await?;
        conn.forward_out_unix(socket_path).await
    }

    /// SFTP access over the session's connection
    pub async fn remote_fs(self: &Arc<Self>) -> AppResult<Arc<dyn RemoteFs>> {
        let conn = self.connection().await?;
        conn.remote_fs().await
    }

    /// Register the tunnel registry layered on this session
    pub(crate) fn attach_tunnels(&self, registry: &Arc<TunnelRegistry>) -> AppResult<()> {
        let mut slot = self.tunnels.lock();
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, registry) {
                return Err(AppError::Tunnel(format!(
                    "Session {} already has a tunnel registry",
                    self.id
                )));
            }
        }
        *slot = Some(Arc::downgrade(registry));
        Ok(())
    }

    async fn close_tunnels(&self) {
        let registry = self.tunnels.lock().as_ref().and_then(Weak::upgrade);
        if let Some(registry) = registry {
            registry.close_tunnel(None).await;
        }
    }

    /// Close every tunnel, then the transport. Further connects fail.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing session {}", self.id);
        self.transition(SessionState::Disconnecting);

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.close_tunnels().await;

        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            conn.close().await;
        }

        *self.connected_at.write() = None;
        self.transition(SessionState::Disconnected);
        let _ = self.events.send(SessionEvent::Closed);
    }
}

fn same_connection(a: &Arc<dyn SshConnection>, b: &Arc<dyn SshConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
