//! Persistence capability consumed by the harvest cycle, the delivery engine
//! and the bot commands, plus an in-memory implementation.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use harvester_core::{
    DeliveryAttempt, DeliveryOutcome, DestinationId, NewDeliveryAttempt, NewSubscription,
    NewVideo, SaveOutcome, SaveSummary, Subscription, SubscriptionKey, Video, VideoId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("video not found: {0}")]
    VideoNotFound(VideoId),
}

/// Storage contract. Duplicate inserts are outcomes, not errors.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_video(&self, video: NewVideo) -> Result<SaveOutcome, StoreError>;

    /// Insert a batch; codes already present are counted as duplicates.
    async fn save_videos(&self, videos: Vec<NewVideo>) -> Result<SaveSummary, StoreError>;

    async fn video_by_code(&self, code: &str) -> Result<Option<Video>, StoreError>;

    async fn video_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Records not yet delivered, newest first.
    async fn undelivered_videos(&self) -> Result<Vec<Video>, StoreError>;

    async fn mark_delivered(&self, id: VideoId) -> Result<(), StoreError>;

    /// Case-insensitive match on code, title, actors or tags, newest first.
    async fn search_videos(&self, keyword: &str, limit: usize) -> Result<Vec<Video>, StoreError>;

    async fn latest_videos(&self, limit: usize, offset: usize) -> Result<Vec<Video>, StoreError>;

    async fn count_videos(&self) -> Result<u64, StoreError>;

    /// Create the subscription, or re-enable the existing one with the same key.
    async fn upsert_subscription(&self, sub: NewSubscription)
        -> Result<Subscription, StoreError>;

    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

    async fn delete_all_subscriptions(
        &self,
        destination: DestinationId,
    ) -> Result<usize, StoreError>;

    /// Enabled subscriptions of one destination, oldest first.
    async fn subscriptions_for(
        &self,
        destination: DestinationId,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Every enabled subscription, oldest first.
    async fn enabled_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Append an attempt. Returns `false` when a second success for the same
    /// pair was refused.
    async fn record_attempt(&self, attempt: NewDeliveryAttempt) -> Result<bool, StoreError>;

    async fn has_delivered(
        &self,
        video: VideoId,
        destination: DestinationId,
    ) -> Result<bool, StoreError>;

    async fn delivery_attempts(&self, video: VideoId) -> Result<Vec<DeliveryAttempt>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    videos: Vec<Video>,
    subscriptions: Vec<Subscription>,
    attempts: Vec<DeliveryAttempt>,
    next_video_id: VideoId,
    next_subscription_id: i64,
    next_attempt_id: i64,
}

impl MemoryState {
    fn insert_video(&mut self, video: NewVideo) -> SaveOutcome {
        if self.videos.iter().any(|v| v.code == video.code) {
            return SaveOutcome::Duplicate;
        }
        self.next_video_id += 1;
        let id = self.next_video_id;
        self.videos.push(Video::from_new(id, video, Utc::now()));
        SaveOutcome::Saved(id)
    }

    fn newest_first(&self) -> Vec<Video> {
        let mut videos = self.videos.clone();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        videos
    }
}

/// Process-local store. Also the test double for the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_video(&self, video: NewVideo) -> Result<SaveOutcome, StoreError> {
        Ok(self.state()?.insert_video(video))
    }

    async fn save_videos(&self, videos: Vec<NewVideo>) -> Result<SaveSummary, StoreError> {
        let mut state = self.state()?;
        let mut summary = SaveSummary::default();
        for video in videos {
            match state.insert_video(video) {
                SaveOutcome::Saved(_) => summary.saved += 1,
                SaveOutcome::Duplicate => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }

    async fn video_by_code(&self, code: &str) -> Result<Option<Video>, StoreError> {
        let code = harvester_core::normalize_code(code);
        Ok(self.state()?.videos.iter().find(|v| v.code == code).cloned())
    }

    async fn video_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.video_by_code(code).await?.is_some())
    }

    async fn undelivered_videos(&self) -> Result<Vec<Video>, StoreError> {
        let state = self.state()?;
        Ok(state
            .newest_first()
            .into_iter()
            .filter(|v| !v.delivered)
            .collect())
    }

    async fn mark_delivered(&self, id: VideoId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let video = state
            .videos
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(StoreError::VideoNotFound(id))?;
        video.delivered = true;
        video.updated_at = Utc::now();
        Ok(())
    }

    async fn search_videos(&self, keyword: &str, limit: usize) -> Result<Vec<Video>, StoreError> {
        let needle = keyword.trim().to_lowercase();
        let state = self.state()?;
        Ok(state
            .newest_first()
            .into_iter()
            .filter(|v| {
                [&v.code, &v.title, &v.actors, &v.tags]
                    .iter()
                    .any(|field| contains_ignore_case(field, &needle))
            })
            .take(limit)
            .collect())
    }

    async fn latest_videos(&self, limit: usize, offset: usize) -> Result<Vec<Video>, StoreError> {
        let state = self.state()?;
        Ok(state
            .newest_first()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count_videos(&self) -> Result<u64, StoreError> {
        Ok(self.state()?.videos.len() as u64)
    }

    async fn upsert_subscription(
        &self,
        sub: NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let mut state = self.state()?;
        let key = sub.key;
        if let Some(existing) = state.subscriptions.iter_mut().find(|s| {
            s.destination == key.destination && s.rule == key.rule && s.keyword == key.keyword
        }) {
            existing.enabled = true;
            existing.destination_kind = sub.destination_kind;
            return Ok(existing.clone());
        }

        state.next_subscription_id += 1;
        let created = Subscription {
            id: state.next_subscription_id,
            destination: key.destination,
            destination_kind: sub.destination_kind,
            rule: key.rule,
            keyword: key.keyword,
            enabled: true,
            created_at: Utc::now(),
        };
        state.subscriptions.push(created.clone());
        Ok(created)
    }

    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| {
            !(s.destination == key.destination && s.rule == key.rule && s.keyword == key.keyword)
        });
        Ok(state.subscriptions.len() < before)
    }

    async fn delete_all_subscriptions(
        &self,
        destination: DestinationId,
    ) -> Result<usize, StoreError> {
        let mut state = self.state()?;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.destination != destination);
        Ok(before - state.subscriptions.len())
    }

    async fn subscriptions_for(
        &self,
        destination: DestinationId,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .state()?
            .subscriptions
            .iter()
            .filter(|s| s.enabled && s.destination == destination)
            .cloned()
            .collect())
    }

    async fn enabled_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .state()?
            .subscriptions
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn record_attempt(&self, attempt: NewDeliveryAttempt) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if attempt.outcome == DeliveryOutcome::Success
            && state.attempts.iter().any(|a| {
                a.video_id == attempt.video_id
                    && a.destination == attempt.destination
                    && a.outcome == DeliveryOutcome::Success
            })
        {
            return Ok(false);
        }
        state.next_attempt_id += 1;
        let id = state.next_attempt_id;
        state.attempts.push(DeliveryAttempt {
            id,
            video_id: attempt.video_id,
            destination: attempt.destination,
            outcome: attempt.outcome,
            failure_reason: attempt.failure_reason,
            delivered_at: Utc::now(),
        });
        Ok(true)
    }

    async fn has_delivered(
        &self,
        video: VideoId,
        destination: DestinationId,
    ) -> Result<bool, StoreError> {
        Ok(self.state()?.attempts.iter().any(|a| {
            a.video_id == video
                && a.destination == destination
                && a.outcome == DeliveryOutcome::Success
        }))
    }

    async fn delivery_attempts(&self, video: VideoId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        Ok(self
            .state()?
            .attempts
            .iter()
            .filter(|a| a.video_id == video)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }
}
