//! SFTP file transfer support
//!
//! Transfers run over the session's existing connection: `RemoteFs` is handed
//! out by the transport, and `upload_dir` mirrors a local directory onto it.

use crate::error::{AppError, AppResult};
use crate::ssh::libssh2::retry_eagain;
use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{OpenFlags, OpenType, Sftp};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// SFTP status codes (draft-ietf-secsh-filexfer)
const SSH_FX_FAILURE: i32 = 4;
const SSH_FX_FILE_ALREADY_EXISTS: i32 = 11;

const WRITE_CHUNK_BYTES: usize = 32 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Failed(String),
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        AppError::Transfer(err.to_string())
    }
}

/// Remote filesystem primitives needed by the directory upload
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), TransferError>;

    async fn write_file(&self, path: &str, contents: &[u8], mode: i32) -> Result<(), TransferError>;
}

/// Summary of a finished upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Mirror `local` onto `remote`, creating directories as needed.
///
/// "Already exists" is tolerated when creating directories; any other error
/// aborts the upload. Only regular files are copied.
pub async fn upload_dir(fs: &dyn RemoteFs, local: &Path, remote: &str) -> AppResult<UploadStats> {
    let mut stats = UploadStats::default();

    let remote = remote.trim_end_matches('/');
    let mut prefix = String::new();
    for component in remote.split('/') {
        if component.is_empty() {
            prefix.push('/');
            continue;
        }
        prefix.push_str(component);
        ensure_dir(fs, &prefix, &mut stats).await?;
        prefix.push('/');
    }

    let mut pending = vec![(local.to_path_buf(), remote.to_string())];
    while let Some((dir, remote_dir)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            AppError::Transfer(format!("Failed to read {}: {}", dir.display(), e))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let remote_path = format!("{}/{}", remote_dir, entry.file_name().to_string_lossy());

            if file_type.is_dir() {
                ensure_dir(fs, &remote_path, &mut stats).await?;
                pending.push((entry.path(), remote_path));
            } else if file_type.is_file() {
                let contents = tokio::fs::read(entry.path()).await?;
                let mode = file_mode(&entry.metadata().await?);
                fs.write_file(&remote_path, &contents, mode).await?;
                tracing::debug!("Uploaded {} ({} bytes)", remote_path, contents.len());
                stats.files += 1;
                stats.bytes += contents.len() as u64;
            }
        }
    }

    tracing::info!(
        "Uploaded {} files ({} bytes) to {}",
        stats.files,
        stats.bytes,
        remote
    );
    Ok(stats)
}

async fn ensure_dir(fs: &dyn RemoteFs, path: &str, stats: &mut UploadStats) -> AppResult<()> {
    match fs.mkdir(path, 0o755).await {
        Ok(()) => {
            stats.directories += 1;
            Ok(())
        }
        Err(TransferError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> i32 {
    0o644
}

/// `RemoteFs` over a libssh2 SFTP subsystem in non-blocking mode
pub struct SftpFs {
    sftp: Mutex<Sftp>,
}

impl SftpFs {
    pub fn new(sftp: Sftp) -> Self {
        Self {
            sftp: Mutex::new(sftp),
        }
    }

    async fn is_dir(&self, path: &str) -> bool {
        retry_eagain(|| self.sftp.lock().stat(Path::new(path)))
            .await
            .map(|stat| stat.is_dir())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), TransferError> {
        match retry_eagain(|| self.sftp.lock().mkdir(Path::new(path), mode)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let exists = match e.code() {
                    ssh2::ErrorCode::SFTP(SSH_FX_FILE_ALREADY_EXISTS) => true,
                    // OpenSSH reports an existing directory as a generic failure
                    ssh2::ErrorCode::SFTP(SSH_FX_FAILURE) => self.is_dir(path).await,
                    _ => false,
                };
                if exists {
                    Err(TransferError::AlreadyExists(path.to_string()))
                } else {
                    Err(TransferError::Failed(format!(
                        "Failed to create directory {}: {}",
                        path, e
                    )))
                }
            }
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: i32) -> Result<(), TransferError> {
        let mut file = retry_eagain(|| {
            self.sftp.lock().open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
        })
        .await
        .map_err(|e| TransferError::Failed(format!("Failed to create file {}: {}", path, e)))?;

        let mut remaining = contents;
        while !remaining.is_empty() {
            let chunk = remaining.len().min(WRITE_CHUNK_BYTES);
            match file.write(&remaining[..chunk]) {
                Ok(0) => tokio::time::sleep(Duration::from_millis(2)).await,
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(2)).await
                }
                Err(e) => {
                    return Err(TransferError::Failed(format!(
                        "Failed to write file {}: {}",
                        path, e
                    )))
                }
            }
        }

        retry_eagain(|| file.close())
            .await
            .map_err(|e| TransferError::Failed(format!("Failed to close file {}: {}", path, e)))
    }
}
