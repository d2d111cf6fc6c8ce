pub mod sftp;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Why a delivery attempt failed. The relay treats every variant the same way;
/// the split only exists for the logs.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
}

/// An open session on the remote file store
#[async_trait]
pub trait Session: Send {
    /// Write `data` under `name`, relative to the configured remote directory.
    async fn write_blob(&mut self, name: &str, data: &[u8]) -> anyhow::Result<()>;
}

/// Opens sessions on the remote file store
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(&self) -> anyhow::Result<Box<dyn Session>>;
}
