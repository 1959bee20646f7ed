use super::connection::{ConnectionConfig, Credentials};
use super::transport::{ChannelStream, ExecEvent, ShellOptions, SshConnection, SshTransport};
use crate::error::{AppError, AppResult};
use crate::sftp::{RemoteFs, TransferError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

pub(crate) type ExecHandler = Arc<dyn Fn(&str) -> Vec<ExecEvent> + Send + Sync>;
pub(crate) type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Forward destinations in the order they were opened; Unix sockets use port 0
pub(crate) type ForwardLog = Arc<Mutex<Vec<(String, u16)>>>;

/// Exec commands and file writes in the order they reached the remote
pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

/// Destination that makes `forward_out` fail
pub(crate) const UNREACHABLE_HOST: &str = "unreachable.invalid";

#[derive(Default)]
pub(crate) struct MockTransport {
    handshakes: AtomicUsize,
    delay: Duration,
    scripted_failures: Mutex<VecDeque<AppError>>,
    always_fail: Option<AppError>,
    exec_handler: Option<ExecHandler>,
    on_close: Option<CloseHook>,
    forwards: ForwardLog,
    journal: Journal,
    fs: Arc<MemoryFs>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let journal = Journal::default();
        Arc::new(Self {
            fs: Arc::new(MemoryFs {
                journal: Arc::clone(&journal),
                ..Default::default()
            }),
            journal,
            ..Default::default()
        })
    }

    fn modify(self: Arc<Self>, f: impl FnOnce(&mut Self)) -> Arc<Self> {
        let mut inner = Arc::try_unwrap(self)
            .unwrap_or_else(|_| panic!("configure the mock before sharing it"));
        f(&mut inner);
        Arc::new(inner)
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.modify(|t| t.delay = delay)
    }

    pub fn fail_always(self: Arc<Self>, err: AppError) -> Arc<Self> {
        self.modify(|t| t.always_fail = Some(err))
    }

    pub fn fail_times(self: Arc<Self>, times: usize, err: AppError) -> Arc<Self> {
        self.modify(|t| {
            t.scripted_failures
                .lock()
                .extend(std::iter::repeat(err).take(times))
        })
    }

    /// Make the next `times` handshakes fail, even after the mock is shared
    pub fn queue_failures(&self, times: usize, err: AppError) {
        self.scripted_failures
            .lock()
            .extend(std::iter::repeat(err).take(times));
    }

    pub fn on_exec(
        self: Arc<Self>,
        handler: impl Fn(&str) -> Vec<ExecEvent> + Send + Sync + 'static,
    ) -> Arc<Self> {
        self.modify(|t| t.exec_handler = Some(Arc::new(handler)))
    }

    /// Every remote file write fails with `reason`
    pub fn fail_writes(self: Arc<Self>, reason: &str) -> Arc<Self> {
        let reason = reason.to_string();
        self.modify(|t| {
            t.fs = Arc::new(MemoryFs {
                journal: Arc::clone(&t.journal),
                fail_writes: Some(reason),
                ..Default::default()
            })
        })
    }

    pub fn on_close(self: Arc<Self>, hook: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        self.modify(|t| t.on_close = Some(Arc::new(hook)))
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn forwards(&self) -> Vec<(String, u16)> {
        self.forwards.lock().clone()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn fs(&self) -> Arc<MemoryFs> {
        Arc::clone(&self.fs)
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        _credentials: &Credentials,
    ) -> AppResult<Arc<dyn SshConnection>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }

        let (alive, _) = watch::channel(true);
        let conn = Arc::new(MockConnection {
            alive,
            exec_handler: self.exec_handler.clone(),
            on_close: self.on_close.clone(),
            forwards: Arc::clone(&self.forwards),
            journal: Arc::clone(&self.journal),
            fs: Arc::clone(&self.fs),
        });
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub(crate) struct MockConnection {
    alive: watch::Sender<bool>,
    exec_handler: Option<ExecHandler>,
    on_close: Option<CloseHook>,
    forwards: ForwardLog,
    journal: Journal,
    fs: Arc<MemoryFs>,
}

impl MockConnection {
    /// Simulate the server dropping the connection
    pub fn drop_transport(&self) {
        self.alive.send_replace(false);
    }

    fn ensure_alive(&self) -> AppResult<()> {
        if *self.alive.borrow() {
            Ok(())
        } else {
            Err(AppError::Transport("Connection lost".to_string()))
        }
    }
}

fn echo_stream() -> ChannelStream {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(remote);
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
    });
    local
}

#[async_trait]
impl SshConnection for MockConnection {
    async fn exec(&self, command: &str) -> AppResult<mpsc::Receiver<ExecEvent>> {
        self.ensure_alive()?;
        self.journal.lock().push(format!("exec {}", command));
        let events = match &self.exec_handler {
            Some(handler) => handler(command),
            None => vec![ExecEvent::Exit(0)],
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let finished = events
                .iter()
                .any(|e| matches!(e, ExecEvent::Exit(_) | ExecEvent::Failed(_)));
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if !finished {
                // Long-running process: stay open until the reader goes away
                tx.closed().await;
            }
        });
        Ok(rx)
    }

    async fn shell(&self, _options: &ShellOptions) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        Ok(echo_stream())
    }

    async fn forward_out(
        &self,
        _source_addr: &str,
        _source_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        self.forwards.lock().push((dest_addr.to_string(), dest_port));
        if dest_addr == UNREACHABLE_HOST {
            return Err(AppError::Channel(format!(
                "Failed to forward to {}:{}: connect failed",
                dest_addr, dest_port
            )));
        }
        Ok(echo_stream())
    }

    async fn forward_out_unix(&self, socket_path: &str) -> AppResult<ChannelStream> {
        self.ensure_alive()?;
        self.forwards.lock().push((socket_path.to_string(), 0));
        Ok(echo_stream())
    }

    async fn remote_fs(&self) -> AppResult<Arc<dyn RemoteFs>> {
        self.ensure_alive()?;
        Ok(self.fs.clone())
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
        if let Some(hook) = &self.on_close {
            hook();
        }
        self.alive.send_replace(false);
    }
}

/// Remote filesystem kept in memory
#[derive(Default)]
pub(crate) struct MemoryFs {
    dirs: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, (Vec<u8>, i32)>>,
    journal: Journal,
    fail_writes: Option<String>,
}

impl MemoryFs {
    pub fn dirs(&self) -> Vec<String> {
        self.dirs.lock().clone()
    }

    pub fn file(&self, path: &str) -> Option<(Vec<u8>, i32)> {
        self.files.lock().get(path).cloned()
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn mkdir(&self, path: &str, _mode: i32) -> Result<(), TransferError> {
        let mut dirs = self.dirs.lock();
        if dirs.iter().any(|d| d == path) {
            return Err(TransferError::AlreadyExists(path.to_string()));
        }
        dirs.push(path.to_string());
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: i32) -> Result<(), TransferError> {
        if let Some(reason) = &self.fail_writes {
            return Err(TransferError::Failed(format!("{}: {}", path, reason)));
        }
        self.journal.lock().push(format!("write {}", path));
        self.files
            .lock()
            .insert(path.to_string(), (contents.to_vec(), mode));
        Ok(())
    }
}
