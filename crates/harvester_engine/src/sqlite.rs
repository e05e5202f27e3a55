//! [`SqliteStore`]: the SQLite implementation of [`Store`].
//!
//! All access goes through [`tokio_rusqlite`], which runs the connection on
//! its own thread so queries never block the runtime.
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_logging::engine_info;
use harvester_core::{
    DeliveryAttempt, DeliveryOutcome, DestinationId, NewDeliveryAttempt, NewSubscription,
    NewVideo, SaveOutcome, SaveSummary, Subscription, SubscriptionKey, Video, VideoId,
};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension as _};

use crate::schema::SCHEMA;
use crate::store::{Store, StoreError};

const VIDEO_COLUMNS: &str = "id, code, title, actors, tags, duration_secs, cover_url, \
     preview_url, detail_url, delivered, created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str =
    "id, destination, destination_kind, rule, keyword, enabled, created_at";
const NEWEST_FIRST: &str = "ORDER BY created_at DESC, id DESC";

/// Store backed by one SQLite file. Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        engine_info!("store opened path={}", path.display());
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_videos(
        &self,
        sql: String,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<Video>, StoreError> {
        let videos = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), video_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(videos)
    }

    async fn query_subscriptions(
        &self,
        destination: Option<DestinationId>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE enabled = 1");
                if destination.is_some() {
                    sql.push_str(" AND destination = ?1");
                }
                sql.push_str(" ORDER BY id ASC");
                let mut stmt = conn.prepare(&sql)?;
                let rows = match destination {
                    Some(destination) => stmt
                        .query_map(params![destination], subscription_from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map([], subscription_from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await?;
        Ok(subscriptions)
    }
}

fn video_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        code: row.get(1)?,
        title: row.get(2)?,
        actors: row.get(3)?,
        tags: row.get(4)?,
        duration_secs: row.get(5)?,
        cover_url: row.get(6)?,
        preview_url: row.get(7)?,
        detail_url: row.get(8)?,
        delivered: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let rule: String = row.get(3)?;
    Ok(Subscription {
        id: row.get(0)?,
        destination: row.get(1)?,
        destination_kind: row.get(2)?,
        rule: rule
            .parse()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?,
        keyword: row.get(4)?,
        enabled: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn attempt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryAttempt> {
    let outcome: String = row.get(3)?;
    Ok(DeliveryAttempt {
        id: row.get(0)?,
        video_id: row.get(1)?,
        destination: row.get(2)?,
        outcome: outcome
            .parse()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?,
        failure_reason: row.get(4)?,
        delivered_at: row.get(5)?,
    })
}

fn insert_video(
    conn: &rusqlite::Connection,
    video: &NewVideo,
    now: DateTime<Utc>,
) -> rusqlite::Result<SaveOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO videos (
             code, title, actors, tags, duration_secs,
             cover_url, preview_url, detail_url, delivered, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        params![
            video.code,
            video.title,
            video.actors,
            video.tags,
            video.duration_secs,
            video.cover_url,
            video.preview_url,
            video.detail_url,
            now,
        ],
    )?;
    if changed == 0 {
        Ok(SaveOutcome::Duplicate)
    } else {
        Ok(SaveOutcome::Saved(conn.last_insert_rowid()))
    }
}

fn to_sql_int(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_video(&self, video: NewVideo) -> Result<SaveOutcome, StoreError> {
        let outcome = self
            .conn
            .call(move |conn| Ok(insert_video(conn, &video, Utc::now())?))
            .await?;
        Ok(outcome)
    }

    async fn save_videos(&self, videos: Vec<NewVideo>) -> Result<SaveSummary, StoreError> {
        if videos.is_empty() {
            return Ok(SaveSummary::default());
        }
        let summary = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let mut summary = SaveSummary::default();
                for video in &videos {
                    match insert_video(&tx, video, now)? {
                        SaveOutcome::Saved(_) => summary.saved += 1,
                        SaveOutcome::Duplicate => summary.duplicates += 1,
                    }
                }
                tx.commit()?;
                Ok(summary)
            })
            .await?;
        Ok(summary)
    }

    async fn video_by_code(&self, code: &str) -> Result<Option<Video>, StoreError> {
        let code = harvester_core::normalize_code(code);
        let video = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE code = ?1"),
                        params![code],
                        video_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(video)
    }

    async fn video_exists(&self, code: &str) -> Result<bool, StoreError> {
        let code = harvester_core::normalize_code(code);
        let exists = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM videos WHERE code = ?1)",
                    params![code],
                    |row| row.get::<_, bool>(0),
                )?)
            })
            .await?;
        Ok(exists)
    }

    async fn undelivered_videos(&self) -> Result<Vec<Video>, StoreError> {
        self.query_videos(
            format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE delivered = 0 {NEWEST_FIRST}"),
            Vec::new(),
        )
        .await
    }

    async fn mark_delivered(&self, id: VideoId) -> Result<(), StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE videos SET delivered = 1, updated_at = ?2 WHERE id = ?1",
                    params![id, Utc::now()],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::VideoNotFound(id));
        }
        Ok(())
    }

    async fn search_videos(&self, keyword: &str, limit: usize) -> Result<Vec<Video>, StoreError> {
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos
             WHERE instr(lower(code), lower(?1)) > 0
                OR instr(lower(title), lower(?1)) > 0
                OR instr(lower(actors), lower(?1)) > 0
                OR instr(lower(tags), lower(?1)) > 0
             {NEWEST_FIRST} LIMIT ?2"
        );
        self.query_videos(
            sql,
            vec![
                keyword.trim().to_string().into(),
                to_sql_int(limit).into(),
            ],
        )
        .await
    }

    async fn latest_videos(&self, limit: usize, offset: usize) -> Result<Vec<Video>, StoreError> {
        self.query_videos(
            format!("SELECT {VIDEO_COLUMNS} FROM videos {NEWEST_FIRST} LIMIT ?1 OFFSET ?2"),
            vec![to_sql_int(limit).into(), to_sql_int(offset).into()],
        )
        .await
    }

    async fn count_videos(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM videos", [], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn upsert_subscription(
        &self,
        sub: NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let subscription = self
            .conn
            .call(move |conn| {
                let key = &sub.key;
                conn.execute(
                    "INSERT INTO subscriptions
                         (destination, destination_kind, rule, keyword, enabled, created_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)
                     ON CONFLICT (destination, rule, keyword)
                     DO UPDATE SET enabled = 1, destination_kind = excluded.destination_kind",
                    params![
                        key.destination,
                        sub.destination_kind,
                        key.rule.as_str(),
                        key.keyword,
                        Utc::now(),
                    ],
                )?;
                Ok(conn.query_row(
                    &format!(
                        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                         WHERE destination = ?1 AND rule = ?2 AND keyword = ?3"
                    ),
                    params![key.destination, key.rule.as_str(), key.keyword],
                    subscription_from_row,
                )?)
            })
            .await?;
        Ok(subscription)
    }

    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        let key = key.clone();
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM subscriptions WHERE destination = ?1 AND rule = ?2 AND keyword = ?3",
                    params![key.destination, key.rule.as_str(), key.keyword],
                )?)
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_all_subscriptions(
        &self,
        destination: DestinationId,
    ) -> Result<usize, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM subscriptions WHERE destination = ?1",
                    params![destination],
                )?)
            })
            .await?;
        Ok(deleted)
    }

    async fn subscriptions_for(
        &self,
        destination: DestinationId,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.query_subscriptions(Some(destination)).await
    }

    async fn enabled_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        self.query_subscriptions(None).await
    }

    async fn record_attempt(&self, attempt: NewDeliveryAttempt) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO delivery_attempts
                         (video_id, destination, outcome, failure_reason, delivered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        attempt.video_id,
                        attempt.destination,
                        attempt.outcome.as_str(),
                        attempt.failure_reason,
                        Utc::now(),
                    ],
                )?)
            })
            .await?;
        Ok(inserted > 0)
    }

    async fn has_delivered(
        &self,
        video: VideoId,
        destination: DestinationId,
    ) -> Result<bool, StoreError> {
        let delivered = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(
                         SELECT 1 FROM delivery_attempts
                         WHERE video_id = ?1 AND destination = ?2 AND outcome = ?3
                     )",
                    params![video, destination, DeliveryOutcome::Success.as_str()],
                    |row| row.get::<_, bool>(0),
                )?)
            })
            .await?;
        Ok(delivered)
    }

    async fn delivery_attempts(&self, video: VideoId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let attempts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, video_id, destination, outcome, failure_reason, delivered_at
                     FROM delivery_attempts WHERE video_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![video], attempt_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(attempts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
