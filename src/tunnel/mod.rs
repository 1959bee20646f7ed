pub mod socks;

use crate::error::{AppError, AppResult};
use crate::ssh::{ChannelStream, SessionManager};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Unique tunnel name within a registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelName(String);

impl TunnelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Where accepted connections are forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TunnelMode {
    TcpForward { remote_host: String, remote_port: u16 },
    UnixSocketForward { socket_path: String },
    /// Destination negotiated per connection by the SOCKS client
    Socks5,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

/// Requested tunnel, as configured on a host profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub mode: TunnelMode,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// 0 binds an ephemeral port
    #[serde(default)]
    pub local_port: u16,
}

impl TunnelSpec {
    pub fn tcp(remote_host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self::with_mode(
            TunnelMode::TcpForward {
                remote_host: remote_host.into(),
                remote_port,
            },
            local_port,
        )
    }

    pub fn unix(socket_path: impl Into<String>, local_port: u16) -> Self {
        Self::with_mode(
            TunnelMode::UnixSocketForward {
                socket_path: socket_path.into(),
            },
            local_port,
        )
    }

    pub fn socks5(local_port: u16) -> Self {
        Self::with_mode(TunnelMode::Socks5, local_port)
    }

    fn with_mode(mode: TunnelMode, local_port: u16) -> Self {
        Self {
            name: None,
            mode,
            local_host: default_local_host(),
            local_port,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit name, else derived from the remote endpoint
    pub fn name(&self) -> TunnelName {
        if let Some(name) = &self.name {
            return TunnelName::new(name.clone());
        }
        match &self.mode {
            TunnelMode::TcpForward {
                remote_host,
                remote_port,
            } => TunnelName::new(format!("{}:{}", remote_host, remote_port)),
            TunnelMode::UnixSocketForward { socket_path } => TunnelName::new(socket_path.clone()),
            TunnelMode::Socks5 => TunnelName::new(format!("socks5:{}", self.local_port)),
        }
    }

    fn validate(&self) -> AppResult<()> {
        match &self.mode {
            TunnelMode::TcpForward {
                remote_host,
                remote_port,
            } => {
                if remote_host.trim().is_empty() || *remote_port == 0 {
                    return Err(AppError::Config(format!(
                        "tcp-forward tunnel needs a remote host and port, got {}:{}",
                        remote_host, remote_port
                    )));
                }
            }
            TunnelMode::UnixSocketForward { socket_path } => {
                if socket_path.trim().is_empty() {
                    return Err(AppError::Config(
                        "unix-socket-forward tunnel needs a socket_path".to_string(),
                    ));
                }
            }
            TunnelMode::Socks5 => {}
        }
        Ok(())
    }
}

/// A live tunnel; `local_addr` carries the resolved port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDescriptor {
    pub name: TunnelName,
    pub mode: TunnelMode,
    pub local_addr: SocketAddr,
}

impl TunnelDescriptor {
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// Tunnel lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Opened(Arc<TunnelDescriptor>),
    Closed(TunnelName),
    /// One accepted connection could not be forwarded; the tunnel stays up
    ConnectionFailed { name: TunnelName, error: String },
}

struct TunnelHandle {
    descriptor: Arc<TunnelDescriptor>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Stop accepting and wait for the listener to be dropped
    async fn shutdown(self) -> TunnelName {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::debug!("Tunnel {} task ended abnormally: {}", self.descriptor.name, e);
        }
        self.descriptor.name.clone()
    }
}

/// Tunnels layered on one session
pub struct TunnelRegistry {
    session: Arc<SessionManager>,
    tunnels: DashMap<TunnelName, TunnelHandle>,
    // Serializes lookup-then-bind so a name never gets two listeners
    create_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelRegistry {
    /// Create the registry for `session`; a session accepts only one live registry
    pub fn new(session: Arc<SessionManager>) -> AppResult<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Self {
            session: Arc::clone(&session),
            tunnels: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
            events,
        });
        session.attach_tunnels(&registry)?;
        Ok(registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Open a tunnel, or return the existing one with the same name
    pub async fn add_tunnel(&self, spec: TunnelSpec) -> AppResult<Arc<TunnelDescriptor>> {
        let name = spec.name();
        let _guard = self.create_lock.lock().await;
        if self.session.is_closed() {
            return Err(AppError::Closed);
        }
        if let Some(existing) = self.get_tunnel(&name) {
            tracing::debug!("Tunnel {} already open", name);
            return Ok(existing);
        }
        spec.validate()?;

        let listener = TcpListener::bind((spec.local_host.as_str(), spec.local_port))
            .await
            .map_err(|e| {
                AppError::Tunnel(format!(
                    "Failed to bind {}:{} for tunnel {}: {}",
                    spec.local_host, spec.local_port, name, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let descriptor = Arc::new(TunnelDescriptor {
            name: name.clone(),
            mode: spec.mode,
            local_addr,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.session),
            Arc::clone(&descriptor),
            shutdown_rx,
            self.events.clone(),
        ));

        self.tunnels.insert(
            name.clone(),
            TunnelHandle {
                descriptor: Arc::clone(&descriptor),
                shutdown,
                task,
            },
        );
        tracing::info!(
            "Tunnel {} listening on {} (session {})",
            name,
            local_addr,
            self.session.id()
        );
        let _ = self.events.send(TunnelEvent::Opened(Arc::clone(&descriptor)));
        Ok(descriptor)
    }

    pub fn get_tunnel(&self, name: &TunnelName) -> Option<Arc<TunnelDescriptor>> {
        self.tunnels
            .get(name)
            .map(|entry| Arc::clone(&entry.descriptor))
    }

    /// Close one tunnel, or every tunnel when `name` is `None`.
    ///
    /// Waits for any `add_tunnel` in progress, then returns once each
    /// listener is gone. Connections already spliced drain on their own.
    pub async fn close_tunnel(&self, name: Option<&TunnelName>) {
        let _guard = self.create_lock.lock().await;
        let handles: Vec<TunnelHandle> = match name {
            Some(name) => self.tunnels.remove(name).map(|(_, h)| h).into_iter().collect(),
            None => {
                let names: Vec<TunnelName> =
                    self.tunnels.iter().map(|entry| entry.key().clone()).collect();
                names
                    .iter()
                    .filter_map(|name| self.tunnels.remove(name).map(|(_, h)| h))
                    .collect()
            }
        };

        if handles.is_empty() {
            if let Some(name) = name {
                tracing::debug!("No tunnel named {} to close", name);
            }
            return;
        }

        for name in join_all(handles.into_iter().map(TunnelHandle::shutdown)).await {
            tracing::info!("Tunnel {} closed (session {})", name, self.session.id());
            let _ = self.events.send(TunnelEvent::Closed(name));
        }
    }

    /// Live tunnels sorted by name
    pub fn list(&self) -> Vec<Arc<TunnelDescriptor>> {
        let mut tunnels: Vec<_> = self
            .tunnels
            .iter()
            .map(|entry| Arc::clone(&entry.descriptor))
            .collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));
        tunnels
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<SessionManager>,
    descriptor: Arc<TunnelDescriptor>,
    mut shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<TunnelEvent>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Tunnel {} accepted {}", descriptor.name, peer);
                    tokio::spawn(serve_connection(
                        Arc::clone(&session),
                        Arc::clone(&descriptor),
                        stream,
                        peer,
                        events.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Tunnel {} accept failed: {}", descriptor.name, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve_connection(
    session: Arc<SessionManager>,
    descriptor: Arc<TunnelDescriptor>,
    mut stream: TcpStream,
    peer: SocketAddr,
    events: broadcast::Sender<TunnelEvent>,
) {
    let _ = stream.set_nodelay(true);
    let mut channel = match open_channel(&session, &descriptor, &mut stream, peer).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                "Tunnel {} could not forward {} (session {}): {}",
                descriptor.name,
                peer,
                session.id(),
                e
            );
            let _ = events.send(TunnelEvent::ConnectionFailed {
                name: descriptor.name.clone(),
                error: e.to_string(),
            });
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut channel).await {
        Ok((sent, received)) => tracing::debug!(
            "Tunnel {} connection from {} done ({} bytes out, {} bytes in)",
            descriptor.name,
            peer,
            sent,
            received
        ),
        Err(e) => tracing::debug!(
            "Tunnel {} connection from {} ended: {}",
            descriptor.name,
            peer,
            e
        ),
    }
}

async fn open_channel(
    session: &Arc<SessionManager>,
    descriptor: &TunnelDescriptor,
    stream: &mut TcpStream,
    peer: SocketAddr,
) -> AppResult<ChannelStream> {
    let source_addr = peer.ip().to_string();
    match &descriptor.mode {
        TunnelMode::TcpForward {
            remote_host,
            remote_port,
        } => {
            session
                .forward_out(&source_addr, peer.port(), remote_host, *remote_port)
                .await
        }
        TunnelMode::UnixSocketForward { socket_path } => {
            session.forward_out_unix(socket_path).await
        }
        TunnelMode::Socks5 => {
            let dest = socks::negotiate(stream).await?;
            tracing::debug!("SOCKS5 CONNECT {} via tunnel {}", dest, descriptor.name);
            match session
                .forward_out(&source_addr, peer.port(), &dest.host, dest.port)
                .await
            {
                Ok(channel) => {
                    socks::send_reply(stream, socks::Reply::Succeeded).await?;
                    Ok(channel)
                }
                Err(e) => {
                    let reply = match e {
                        AppError::Channel(_) => socks::Reply::HostUnreachable,
                        _ => socks::Reply::GeneralFailure,
                    };
                    let _ = socks::send_reply(stream, reply).await;
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::{MockTransport, UNREACHABLE_HOST};
    use crate::ssh::{AuthMethod, ConnectionConfig, ReconnectPolicy, SessionState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session(transport: Arc<MockTransport>) -> Arc<SessionManager> {
        SessionManager::new(
            ConnectionConfig::new("build.internal", "dev", AuthMethod::Agent),
            transport,
        )
    }

    async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        echoed
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(TunnelSpec::tcp("db", 5432, 0).name().as_str(), "db:5432");
        assert_eq!(
            TunnelSpec::unix("/run/app.sock", 0).name().as_str(),
            "/run/app.sock"
        );
        assert_eq!(TunnelSpec::socks5(1080).name().as_str(), "socks5:1080");
        assert_eq!(
            TunnelSpec::socks5(1080).named("proxy").name().as_str(),
            "proxy"
        );
    }

    #[tokio::test]
    async fn test_add_tunnel_is_idempotent() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport)).unwrap();

        let first = registry
            .add_tunnel(TunnelSpec::tcp("127.0.0.1", 5432, 0))
            .await
            .unwrap();
        let second = registry
            .add_tunnel(TunnelSpec::tcp("127.0.0.1", 5432, 0))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_ne!(first.local_port(), 0);
    }

    #[tokio::test]
    async fn test_tcp_forward_splices_streams() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport.clone())).unwrap();
        let tunnel = registry
            .add_tunnel(TunnelSpec::tcp("10.1.2.3", 6379, 0))
            .await
            .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"PING\r\n").await, b"PING\r\n");
        assert_eq!(transport.forwards(), vec![("10.1.2.3".to_string(), 6379)]);
        assert_eq!(transport.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_unix_socket_forward() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport.clone())).unwrap();
        let tunnel = registry
            .add_tunnel(TunnelSpec::unix("/tmp/server.sock", 0))
            .await
            .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, b"hello").await, b"hello");
        assert_eq!(transport.forwards(), vec![("/tmp/server.sock".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_socks5_forwards_to_requested_destination() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport.clone())).unwrap();
        let tunnel = registry.add_tunnel(TunnelSpec::socks5(0)).await.unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        client
            .write_all(&[5, 1, 0, 1, 10, 0, 0, 5, 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks::Reply::Succeeded as u8);

        assert_eq!(roundtrip(&mut client, b"GET / HTTP/1.1\r\n").await.len(), 16);
        assert_eq!(transport.forwards(), vec![("10.0.0.5".to_string(), 443)]);
    }

    #[tokio::test]
    async fn test_forward_failure_keeps_tunnel_open() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport.clone())).unwrap();
        let mut events = registry.subscribe();
        let tunnel = registry.add_tunnel(TunnelSpec::socks5(0)).await.unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr).await.unwrap();
        let mut request = vec![5, 1, 0, 5, 1, 0, 3, UNREACHABLE_HOST.len() as u8];
        request.extend_from_slice(UNREACHABLE_HOST.as_bytes());
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut answer = [0u8; 12];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[3], socks::Reply::HostUnreachable as u8);

        loop {
            match events.recv().await.unwrap() {
                TunnelEvent::ConnectionFailed { name, .. } => {
                    assert_eq!(name, tunnel.name);
                    break;
                }
                _ => continue,
            }
        }

        // The listener still accepts
        assert!(TcpStream::connect(tunnel.local_addr).await.is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_registers_nothing() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport)).unwrap();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let err = registry
            .add_tunnel(TunnelSpec::tcp("db", 5432, port))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Tunnel(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_tunnel_stops_listening() {
        let transport = MockTransport::new();
        let registry = TunnelRegistry::new(session(transport)).unwrap();
        let tunnel = registry
            .add_tunnel(TunnelSpec::tcp("db", 5432, 0).named("db"))
            .await
            .unwrap();

        registry.close_tunnel(Some(&TunnelName::from("db"))).await;
        assert!(registry.get_tunnel(&tunnel.name).is_none());
        assert!(TcpStream::connect(tunnel.local_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_add_after_session_close_fails() {
        let session = session(MockTransport::new());
        let registry = TunnelRegistry::new(Arc::clone(&session)).unwrap();
        session.close().await;

        assert_eq!(
            registry.add_tunnel(TunnelSpec::socks5(0)).await.unwrap_err(),
            AppError::Closed
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_second_registry_is_rejected() {
        let session = session(MockTransport::new());
        let _registry = TunnelRegistry::new(Arc::clone(&session)).unwrap();
        assert!(matches!(
            TunnelRegistry::new(session),
            Err(AppError::Tunnel(_))
        ));
    }

    #[tokio::test]
    async fn test_unrecovered_transport_loss_closes_tunnels() {
        let exhausted = ReconnectPolicy {
            enabled: true,
            max_attempts: 2,
            delay_ms: 5,
        };
        for policy in [ReconnectPolicy::disabled(), exhausted] {
            let transport = MockTransport::new();
            let mut config = ConnectionConfig::new("build.internal", "dev", AuthMethod::Agent);
            config.reconnect = policy;
            let session = SessionManager::new(config, transport.clone());
            let registry = TunnelRegistry::new(Arc::clone(&session)).unwrap();
            let mut events = registry.subscribe();

            let tunnel = registry
                .add_tunnel(TunnelSpec::tcp("10.0.0.9", 5432, 0))
                .await
                .unwrap();
            session.connect(None).await.unwrap();

            transport.queue_failures(2, AppError::Transport("connection refused".to_string()));
            transport.last_connection().unwrap().drop_transport();

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let TunnelEvent::Closed(name) = events.recv().await.unwrap() {
                        assert_eq!(name, tunnel.name);
                        break;
                    }
                }
            })
            .await
            .unwrap();

            assert!(registry.is_empty());
            assert_eq!(session.state(), SessionState::Disconnected);
            assert!(TcpStream::connect(tunnel.local_addr).await.is_err());
            let expected_handshakes = if policy.enabled { 3 } else { 1 };
            assert_eq!(transport.handshakes(), expected_handshakes);
        }
    }

    #[tokio::test]
    async fn test_session_close_cascades_before_transport_close() {
        let empty_at_close = Arc::new(AtomicBool::new(false));
        let registry_slot: Arc<parking_lot::Mutex<Option<Arc<TunnelRegistry>>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let transport = {
            let empty_at_close = Arc::clone(&empty_at_close);
            let registry_slot = Arc::clone(&registry_slot);
            MockTransport::new().on_close(move || {
                if let Some(registry) = registry_slot.lock().as_ref() {
                    empty_at_close.store(registry.is_empty(), Ordering::SeqCst);
                }
            })
        };
        let session = session(transport);
        let registry = TunnelRegistry::new(Arc::clone(&session)).unwrap();
        *registry_slot.lock() = Some(Arc::clone(&registry));

        let mut addrs = Vec::new();
        for port in [5432, 6379, 9200] {
            let tunnel = registry
                .add_tunnel(TunnelSpec::tcp("10.0.0.9", port, 0))
                .await
                .unwrap();
            addrs.push(tunnel.local_addr);
        }
        session.connect(None).await.unwrap();

        session.close().await;
        assert!(empty_at_close.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        for addr in addrs {
            assert!(TcpStream::connect(addr).await.is_err());
        }
        registry_slot.lock().take();
    }
}
