pub mod rename;
pub mod select;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::platform::{ChannelSource, Message};
use crate::relay::rename::{Clock, RenameInputs};
use crate::scheduler::retry::RetryQueue;
use crate::state::{Cursor, StateStore};
use crate::transport::{DeliveryError, Transport};

/// Failed attempts after which a message is given up on.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub channel_id: u64,
    pub rename_pattern: String,
    pub retry_delay: Duration,
    pub delivery_timeout: Duration,
    /// Upper bound on each channel lookup, message fetch, and download.
    pub source_timeout: Duration,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            channel_id: config.discord.channel_id,
            rename_pattern: config.relay.rename_pattern.clone(),
            retry_delay: config.relay.retry_delay(),
            delivery_timeout: config.relay.delivery_timeout(),
            source_timeout: config.discord.request_timeout(),
        }
    }
}

/// A selected image, downloaded and named, waiting to be written to the store.
/// Lives only in memory; retries reuse the same bytes and name.
#[derive(Debug)]
pub struct DeliveryJob {
    pub message_id: u64,
    pub author_id: u64,
    pub channel_id: u64,
    pub created_at: DateTime<Utc>,
    pub original_filename: String,
    pub target_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed `attempts` times so far; another attempt is scheduled.
    RetryPending { attempts: u32 },
    /// Gave up after `attempts` failures; the cursor moved past the message anyway.
    Abandoned { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The previous tick is still running.
    Busy,
    ChannelNotFound,
    NoMessages,
    UpToDate { latest_id: u64 },
    /// The newest message already has a delivery underway in this process.
    InFlight { message_id: u64 },
    /// Newest message had no image; the cursor moved past it.
    Skipped { message_id: u64 },
    Dispatched {
        message_id: u64,
        target_name: String,
        outcome: DeliveryOutcome,
    },
}

/// Watches one channel and relays the newest image to the remote store.
pub struct Relay {
    source: Arc<dyn ChannelSource>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: RelaySettings,
    retries: RetryQueue,
    tick_lock: tokio::sync::Mutex<()>,
    // Serializes load-modify-save so ticks and retries never clobber each other.
    write_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashSet<u64>>,
}

impl Relay {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            source,
            transport,
            store,
            clock,
            settings,
            retries: RetryQueue::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the stored cursor, apply `f`, and save, all under the write lock.
    /// Counters the high-water mark has passed are dropped unless their message
    /// is still being delivered here. Save failures are logged; the next tick
    /// works from whatever was persisted.
    async fn update_cursor<R>(&self, f: impl FnOnce(&mut Cursor) -> R) -> R {
        let _guard = self.write_lock.lock().await;
        let mut cursor = self.store.load().await;
        let result = f(&mut cursor);
        let active = self.in_flight().clone();
        let pruned = cursor.prune_settled(&active);
        if pruned > 0 {
            debug!("Dropped {} retry counters behind the cursor", pruned);
        }
        match self.store.save(&cursor).await {
            Ok(()) => debug!(
                "State saved: last_message_id={} retry_counts={:?}",
                cursor.last_processed_id, cursor.retry_counters
            ),
            Err(e) => error!("Failed to save state: {:#}", e),
        }
        result
    }

    /// Run one call against the channel source, failing it once the source
    /// timeout elapses so a stalled request cannot hold the tick lock.
    async fn from_source<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.source_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("Channel source did not answer within {:?}", limit),
        }
    }

    /// One poll cycle: look at the newest message and act on it.
    pub async fn tick(self: &Arc<Self>) -> Result<TickOutcome> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("Check: previous check still running, skipping");
            return Ok(TickOutcome::Busy);
        };

        info!("Check: starting");
        let last_id = self.store.load().await.last_processed_id;
        info!(
            "Check: last_message_id={} pending_retries={}",
            last_id,
            self.retries.len()
        );

        let channel_id = self.settings.channel_id;
        let channel = match self
            .from_source(self.source.fetch_channel(channel_id))
            .await
            .with_context(|| format!("Failed to fetch channel {}", channel_id))?
        {
            Some(channel) => channel,
            None => {
                warn!(
                    "Check: channel {} not found. Check channel_id and bot permissions.",
                    channel_id
                );
                return Ok(TickOutcome::ChannelNotFound);
            }
        };
        info!("Check: channel found ({}) type={}", channel.id, channel.kind);

        let message = match self
            .from_source(self.source.most_recent_message(&channel))
            .await
            .with_context(|| format!("Failed to fetch latest message in {}", channel.id))?
        {
            Some(message) => message,
            None => {
                info!("Check: no recent messages");
                return Ok(TickOutcome::NoMessages);
            }
        };
        info!(
            "Check: latest message id={} author={} created_at={} attachments={}",
            message.id,
            message.author_id,
            message.created_at.to_rfc3339(),
            message.attachments.len()
        );

        if message.id <= last_id {
            info!("Check: latest message is not newer than last_message_id");
            return Ok(TickOutcome::UpToDate {
                latest_id: message.id,
            });
        }

        if self.in_flight().contains(&message.id) {
            info!("Check: message {} is still being delivered", message.id);
            return Ok(TickOutcome::InFlight {
                message_id: message.id,
            });
        }

        let Some(attachment) = select::select_image(&message) else {
            if message.attachments.is_empty() {
                info!("Check: latest message has no attachments");
            } else {
                info!("Check: latest message has no image attachments");
            }
            self.update_cursor(|c| c.advance_to(message.id)).await;
            info!("Check: state saved last_message_id={}", message.id);
            return Ok(TickOutcome::Skipped {
                message_id: message.id,
            });
        };

        let data = self
            .from_source(self.source.read_attachment(attachment))
            .await
            .with_context(|| {
                format!(
                    "Failed to download {} from message {}",
                    attachment.filename, message.id
                )
            })?;
        info!("Check: downloaded {} bytes", data.len());

        let job = Arc::new(self.prepare_job(&message, &attachment.filename, data)?);
        info!("Check: renaming {} to {}", job.original_filename, job.target_name);

        self.in_flight().insert(job.message_id);
        let outcome = self.clone().attempt(job.clone()).await;

        Ok(TickOutcome::Dispatched {
            message_id: job.message_id,
            target_name: job.target_name.clone(),
            outcome,
        })
    }

    fn prepare_job(&self, message: &Message, filename: &str, data: Vec<u8>) -> Result<DeliveryJob> {
        let inputs = RenameInputs {
            message_id: message.id,
            author_id: message.author_id,
            channel_id: message.channel_id,
            filename,
        };
        let target_name =
            rename::target_name(&self.settings.rename_pattern, &inputs, self.clock.now())
                .context("Failed to render target name")?;

        Ok(DeliveryJob {
            message_id: message.id,
            author_id: message.author_id,
            channel_id: message.channel_id,
            created_at: message.created_at,
            original_filename: filename.to_string(),
            target_name,
            data,
        })
    }

    async fn upload(&self, job: &DeliveryJob) -> Result<()> {
        let mut session = self.transport.open_session().await?;
        session.write_blob(&job.target_name, &job.data).await
    }

    /// Write the job once, bounded by the delivery timeout, then record the
    /// outcome. Failures below the attempt limit schedule another call of this
    /// same step after the retry delay.
    fn attempt(self: Arc<Self>, job: Arc<DeliveryJob>) -> BoxFuture<'static, DeliveryOutcome> {
        Box::pin(async move {
            let id = job.message_id;
            let timeout = self.settings.delivery_timeout;

            let result = match tokio::time::timeout(timeout, self.upload(&job)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeliveryError::Transport(e)),
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            };

            match result {
                Ok(()) => {
                    let advanced = self
                        .update_cursor(|c| {
                            c.set_retry_count(id, 0);
                            c.advance_to(id)
                        })
                        .await;
                    self.in_flight().remove(&id);
                    if !advanced {
                        debug!("Cursor already past message {}, left unchanged", id);
                    }
                    info!(
                        "Delivered {} as {} (message {} by {} in {}, posted {})",
                        job.original_filename,
                        job.target_name,
                        id,
                        job.author_id,
                        job.channel_id,
                        job.created_at.to_rfc3339()
                    );
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    let attempts = self
                        .update_cursor(|c| {
                            let attempts = c.get_retry_count(id) + 1;
                            if attempts >= MAX_ATTEMPTS {
                                c.advance_to(id);
                                c.set_retry_count(id, 0);
                            } else {
                                c.set_retry_count(id, attempts);
                            }
                            attempts
                        })
                        .await;

                    if attempts >= MAX_ATTEMPTS {
                        self.in_flight().remove(&id);
                        error!(
                            "Giving up on message {} ({}) after {} failed attempts: {}",
                            id, job.target_name, attempts, e
                        );
                        return DeliveryOutcome::Abandoned { attempts };
                    }

                    let delay = self.settings.retry_delay;
                    warn!(
                        "Delivery of message {} ({}) failed, attempt {}/{}: {}; retrying in {:?}",
                        id, job.target_name, attempts, MAX_ATTEMPTS, e, delay
                    );
                    let relay = self.clone();
                    let retry_job = job.clone();
                    self.retries.schedule(
                        id,
                        delay,
                        Box::pin(async move {
                            info!("Retrying delivery of message {}", retry_job.message_id);
                            relay.attempt(retry_job).await;
                        }),
                    );
                    DeliveryOutcome::RetryPending { attempts }
                }
            }
        })
    }

    /// Drop outstanding retries on shutdown.
    pub fn shutdown(&self) {
        let aborted = self.retries.abort_all();
        if aborted > 0 {
            warn!("Dropped {} pending retries", aborted);
        }
        self.in_flight().clear();
    }
}
