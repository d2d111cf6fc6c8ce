use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::SftpConfig;
use crate::transport::{Session, Transport};

const CHUNK_SIZE: usize = 32 * 1024;

/// Join the remote directory and a file name. Trailing slashes are dropped
/// first, so an empty directory (like "/") means the server root.
pub fn remote_path(remote_dir: &str, name: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), name)
}

/// libssh2 takes its blocking timeout in milliseconds; zero would mean "never".
fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().clamp(1, u32::MAX as u128) as u32
}

/// SFTP over libssh2. The library is blocking, so all calls run on the blocking pool.
pub struct SftpTransport {
    config: SftpConfig,
    op_timeout: Duration,
}

impl SftpTransport {
    /// `op_timeout` bounds every blocking call once the session is up, so a
    /// write abandoned by the relay's delivery timeout also stops on the pool.
    pub fn new(config: SftpConfig, op_timeout: Duration) -> Self {
        Self { config, op_timeout }
    }
}

/// Raised by the async side when it stops waiting for an upload.
#[derive(Clone, Default)]
struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancels the upload when the future awaiting it is dropped.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A remote file handle whose close can fail.
trait RemoteFile: Write {
    fn close_remote(&mut self) -> Result<()>;
}

impl RemoteFile for ssh2::File {
    fn close_remote(&mut self) -> Result<()> {
        self.close().context("Failed to close remote file")
    }
}

/// Stream `data` in chunks and close the handle so the server gets to report
/// deferred write errors. Stops at the next chunk once `cancel` is raised.
fn upload_to<F: RemoteFile>(file: &mut F, data: &[u8], cancel: &CancelFlag) -> Result<()> {
    for chunk in data.chunks(CHUNK_SIZE) {
        if cancel.is_cancelled() {
            anyhow::bail!("Upload cancelled");
        }
        file.write_all(chunk).context("Failed to write remote file")?;
    }
    file.flush().context("Failed to flush remote file")?;
    file.close_remote()
}

fn connect(config: &SftpConfig) -> Result<ssh2::Session> {
    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", config.host, config.port))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = match (tcp, last_err) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) => {
            return Err(e).with_context(|| {
                format!("Failed to connect to {}:{}", config.host, config.port)
            })
        }
        (None, None) => anyhow::bail!("No address found for {}:{}", config.host, config.port),
    };

    let mut session = ssh2::Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(config.connect_timeout()));
    session.handshake().context("SSH handshake failed")?;

    if let Some(key_path) = &config.key_path {
        session
            .userauth_pubkey_file(
                &config.user,
                None,
                key_path,
                config.key_passphrase.as_deref(),
            )
            .with_context(|| format!("Public key authentication failed for {}", config.user))?;
    } else if let Some(password) = &config.password {
        session
            .userauth_password(&config.user, password)
            .with_context(|| format!("Password authentication failed for {}", config.user))?;
    }

    if !session.authenticated() {
        anyhow::bail!("SSH authentication rejected for {}", config.user);
    }

    Ok(session)
}

#[async_trait]
impl Transport for SftpTransport {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let config = self.config.clone();
        info!(
            "SFTP: connecting to {}:{} as {}",
            config.host, config.port, config.user
        );
        let op_timeout = self.op_timeout;
        let session = tokio::task::spawn_blocking(move || -> Result<ssh2::Session> {
            let session = connect(&config)?;
            session.set_timeout(timeout_millis(op_timeout));
            Ok(session)
        })
        .await
        .context("SFTP connect task panicked")??;
        Ok(Box::new(SftpSession {
            session,
            remote_dir: self.config.remote_dir.clone(),
        }))
    }
}

pub struct SftpSession {
    session: ssh2::Session,
    remote_dir: String,
}

#[async_trait]
impl Session for SftpSession {
    async fn write_blob(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let path = remote_path(&self.remote_dir, name);
        let session = self.session.clone();
        let data = data.to_vec();
        let cancel = CancelFlag::default();
        let _cancel_on_drop = CancelOnDrop(cancel.clone());
        info!("SFTP: uploading to {}", path);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let sftp = session.sftp().context("Failed to start SFTP subsystem")?;
            let result = {
                let mut file = sftp
                    .create(Path::new(&path))
                    .with_context(|| format!("Failed to open remote file {}", path))?;
                upload_to(&mut file, &data, &cancel)
            };
            if let Err(e) = result {
                // Leave no partial file behind for the retry to collide with.
                if let Err(unlink_err) = sftp.unlink(Path::new(&path)) {
                    warn!("SFTP: could not remove partial {}: {}", path, unlink_err);
                }
                return Err(e).with_context(|| format!("Upload to {} failed", path));
            }
            debug!("SFTP: wrote {} bytes to {}", data.len(), path);
            Ok(())
        })
        .await
        .context("SFTP upload task panicked")??;

        info!("SFTP: upload complete");
        Ok(())
    }
}
