//! Delivery engine: fans undelivered records out to matching destinations.
//!
//! Every (record, destination) pair is checked against the attempt history
//! before sending, and exactly one attempt is appended per send. A record is
//! flagged delivered only when each of its destinations holds a success.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use harvester_core::{
    format_video_message, DestinationId, NewDeliveryAttempt, Subscription, Video,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::{sleep_or_cancel, Cancelled};
use crate::rate_limit::RateLimiter;
use crate::store::{Store, StoreError};
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("delivery cancelled")]
    Cancelled,
}

impl From<Cancelled> for DeliveryError {
    fn from(_: Cancelled) -> Self {
        DeliveryError::Cancelled
    }
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Pause between two sends to the same destination within one sweep.
    pub destination_pacing: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            destination_pacing: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// A success was already on record; nothing was sent.
    AlreadyDelivered,
    Delivered,
    Failed(String),
}

impl PushOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PushOutcome::Failed(_))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub records: usize,
    pub marked_delivered: usize,
    pub sent: usize,
    pub already_delivered: usize,
    pub failed: usize,
    /// Records skipped because a store call failed mid-way.
    pub errors: usize,
}

pub struct DeliveryEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    settings: DeliverySettings,
}

impl DeliveryEngine {
    /// `limiter` caps the transport's total send rate across destinations.
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        limiter: RateLimiter,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            settings,
        }
    }

    /// Destinations with at least one subscription matching `video`, each
    /// listed once, in subscription order.
    pub fn matching_destinations(
        video: &Video,
        subscriptions: &[Subscription],
    ) -> Vec<DestinationId> {
        let mut destinations: Vec<DestinationId> = Vec::new();
        for subscription in subscriptions {
            if subscription.enabled
                && subscription.matches(video)
                && !destinations.contains(&subscription.destination)
            {
                destinations.push(subscription.destination);
            }
        }
        destinations
    }

    /// Deliver every undelivered record, newest first.
    ///
    /// A store failure while handling one record is logged and counted; the
    /// sweep moves on to the next record. Only cancellation and a failure to
    /// load the work list abort the sweep.
    pub async fn sweep_unsent(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, DeliveryError> {
        let videos = self.store.undelivered_videos().await?;
        let mut report = SweepReport {
            records: videos.len(),
            ..SweepReport::default()
        };
        if videos.is_empty() {
            engine_debug!("delivery sweep found nothing to deliver");
            return Ok(report);
        }
        let subscriptions = self.store.enabled_subscriptions().await?;
        engine_info!(
            "delivery sweep start records={} subscriptions={}",
            videos.len(),
            subscriptions.len()
        );

        let mut last_send: HashMap<DestinationId, Instant> = HashMap::new();
        for video in &videos {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            match self
                .deliver_record(video, &subscriptions, &mut last_send, &mut report, cancel)
                .await
            {
                Ok(true) => match self.store.mark_delivered(video.id).await {
                    Ok(()) => report.marked_delivered += 1,
                    Err(err) => {
                        engine_error!("delivery mark failed code={} error={}", video.code, err);
                        report.errors += 1;
                    }
                },
                Ok(false) => {
                    engine_info!("delivery incomplete code={} left undelivered", video.code);
                }
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(err) => {
                    engine_error!("delivery record failed code={} error={}", video.code, err);
                    report.errors += 1;
                }
            }
        }

        engine_info!(
            "delivery sweep finished records={} delivered={} sent={} skipped={} failed={} errors={}",
            report.records,
            report.marked_delivered,
            report.sent,
            report.already_delivered,
            report.failed,
            report.errors
        );
        Ok(report)
    }

    /// Push to every matching destination. `Ok(true)` when all of them now
    /// hold a success for this record.
    async fn deliver_record(
        &self,
        video: &Video,
        subscriptions: &[Subscription],
        last_send: &mut HashMap<DestinationId, Instant>,
        report: &mut SweepReport,
        cancel: &CancellationToken,
    ) -> Result<bool, DeliveryError> {
        let destinations = Self::matching_destinations(video, subscriptions);
        engine_debug!(
            "delivery record code={} destinations={}",
            video.code,
            destinations.len()
        );

        let mut complete = true;
        for destination in destinations {
            match self.push(video, destination, Some(&mut *last_send), cancel).await? {
                PushOutcome::AlreadyDelivered => report.already_delivered += 1,
                PushOutcome::Delivered => report.sent += 1,
                PushOutcome::Failed(_) => {
                    report.failed += 1;
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    /// Deliver `video` to one destination unless a success is already on
    /// record.
    pub async fn push_to_destination(
        &self,
        video: &Video,
        destination: DestinationId,
        cancel: &CancellationToken,
    ) -> Result<PushOutcome, DeliveryError> {
        self.push(video, destination, None, cancel).await
    }

    async fn push(
        &self,
        video: &Video,
        destination: DestinationId,
        mut last_send: Option<&mut HashMap<DestinationId, Instant>>,
        cancel: &CancellationToken,
    ) -> Result<PushOutcome, DeliveryError> {
        if self.store.has_delivered(video.id, destination).await? {
            engine_debug!(
                "delivery skip code={} destination={} already delivered",
                video.code,
                destination
            );
            return Ok(PushOutcome::AlreadyDelivered);
        }

        if let Some(sent_at) = last_send.as_ref().and_then(|map| map.get(&destination)) {
            let remaining = self.settings.destination_pacing.saturating_sub(sent_at.elapsed());
            sleep_or_cancel(remaining, cancel).await?;
        }
        self.limiter.acquire(cancel).await?;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            result = self.send_with_fallback(video, destination) => result,
        };
        if let Some(map) = last_send.as_mut() {
            map.insert(destination, Instant::now());
        }

        let (attempt, outcome) = match result {
            Ok(()) => {
                engine_info!("delivery sent code={} destination={}", video.code, destination);
                (
                    NewDeliveryAttempt::success(video.id, destination),
                    PushOutcome::Delivered,
                )
            }
            Err(err) => {
                let reason = err.to_string();
                engine_warn!(
                    "delivery failed code={} destination={} error={}",
                    video.code,
                    destination,
                    reason
                );
                (
                    NewDeliveryAttempt::failed(video.id, destination, reason.clone()),
                    PushOutcome::Failed(reason),
                )
            }
        };

        match self.store.record_attempt(attempt).await {
            Ok(true) => {}
            Ok(false) => engine_warn!(
                "delivery success already recorded code={} destination={}",
                video.code,
                destination
            ),
            Err(err) => engine_error!(
                "delivery attempt not recorded code={} destination={} error={}",
                video.code,
                destination,
                err
            ),
        }
        Ok(outcome)
    }

    /// Video with cover thumbnail, then photo, then text. The last error
    /// is the one reported.
    async fn send_with_fallback(
        &self,
        video: &Video,
        destination: DestinationId,
    ) -> Result<(), TransportError> {
        let caption = format_video_message(video);
        let cover = video.cover_url.as_deref().filter(|url| !url.is_empty());

        if let Some(preview) = video.preview_url.as_deref().filter(|url| !url.is_empty()) {
            match self
                .transport
                .send_video(destination, preview, cover, &caption)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => engine_debug!(
                    "delivery video send failed code={} error={}, trying photo",
                    video.code,
                    err
                ),
            }
        }
        if let Some(cover) = cover {
            match self.transport.send_photo(destination, cover, &caption).await {
                Ok(()) => return Ok(()),
                Err(err) => engine_debug!(
                    "delivery photo send failed code={} error={}, trying text",
                    video.code,
                    err
                ),
            }
        }
        self.transport.send_markdown(destination, &caption).await
    }
}
