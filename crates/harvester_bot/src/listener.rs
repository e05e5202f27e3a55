//! Long-poll update loop feeding the command handler.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_logging::{engine_debug, engine_info, engine_warn};
use harvester_engine::{sleep_or_cancel, TelegramClient, TransportError, Update};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;

/// Source of bot updates.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Updates with id `>= offset`, waiting up to `timeout_secs` for the first.
    async fn poll(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TransportError>;
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn poll(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TransportError> {
        self.get_updates(offset, timeout_secs).await
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub poll_timeout_secs: u64,
    /// First pause after a failed poll; doubled per consecutive failure.
    pub error_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            error_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

pub struct Listener {
    source: Arc<dyn UpdateSource>,
    handler: Arc<CommandHandler>,
    settings: ListenerSettings,
}

impl Listener {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        handler: Arc<CommandHandler>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            source,
            handler,
            settings,
        }
    }

    /// Poll until `stop` fires. Returns the report tasks still running so the
    /// caller can wait for them during shutdown.
    pub async fn run(self, stop: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let mut offset = 0_i64;
        let mut backoff = self.settings.error_backoff;
        engine_info!(
            "listener started poll_timeout={}s",
            self.settings.poll_timeout_secs
        );

        loop {
            let polled = tokio::select! {
                _ = stop.cancelled() => break,
                polled = self.source.poll(offset, self.settings.poll_timeout_secs) => polled,
            };

            match polled {
                Ok(updates) => {
                    backoff = self.settings.error_backoff;
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        match update.message {
                            Some(message) => self.handler.handle(&message, &mut tasks).await,
                            None => engine_debug!(
                                "listener ignoring update id={} without message",
                                update.update_id
                            ),
                        }
                    }
                }
                Err(err) => {
                    engine_warn!(
                        "listener poll failed error={}, retrying in {:?}",
                        err,
                        backoff
                    );
                    if sleep_or_cancel(backoff, &stop).await.is_err() {
                        break;
                    }
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(err) = finished {
                    engine_warn!("listener report task failed error={}", err);
                }
            }
        }

        engine_info!(
            "listener stopped offset={} pending_reports={}",
            offset,
            tasks.len()
        );
        tasks
    }
}
