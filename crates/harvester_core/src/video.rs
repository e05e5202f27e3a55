use chrono::{DateTime, Utc};

use crate::code::{is_valid_code, normalize_code};

pub type VideoId = i64;

/// A partially-populated record as produced by page extraction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoDraft {
    pub code: String,
    pub title: Option<String>,
    pub actors: Vec<String>,
    pub tags: Vec<String>,
    pub duration_secs: u32,
    pub cover_url: Option<String>,
    pub preview_url: Option<String>,
    pub detail_url: Option<String>,
}

impl VideoDraft {
    pub fn with_code(code: impl AsRef<str>) -> Self {
        Self {
            code: normalize_code(code.as_ref()),
            ..Self::default()
        }
    }

    pub fn has_code(&self) -> bool {
        !self.code.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid video code {0:?}")]
pub struct InvalidCode(pub String);

/// A validated record ready for insertion; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVideo {
    pub code: String,
    pub title: String,
    pub actors: String,
    pub tags: String,
    pub duration_secs: u32,
    pub cover_url: Option<String>,
    pub preview_url: Option<String>,
    pub detail_url: Option<String>,
}

impl NewVideo {
    /// Minimal record with only a code, mostly handy in tests and fixtures.
    pub fn from_code(code: &str) -> Result<Self, InvalidCode> {
        Self::try_from(VideoDraft::with_code(code))
    }
}

impl TryFrom<VideoDraft> for NewVideo {
    type Error = InvalidCode;

    fn try_from(draft: VideoDraft) -> Result<Self, Self::Error> {
        let code = normalize_code(&draft.code);
        if !is_valid_code(&code) {
            return Err(InvalidCode(draft.code));
        }
        Ok(Self {
            code,
            title: draft.title.unwrap_or_default(),
            actors: draft.actors.join(", "),
            tags: draft.tags.join(", "),
            duration_secs: draft.duration_secs,
            cover_url: non_empty(draft.cover_url),
            preview_url: non_empty(draft.preview_url),
            detail_url: non_empty(draft.detail_url),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// A persisted record.
///
/// `code` never changes after creation and `delivered` only ever moves from
/// `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub id: VideoId,
    pub code: String,
    pub title: String,
    pub actors: String,
    pub tags: String,
    pub duration_secs: u32,
    pub cover_url: Option<String>,
    pub preview_url: Option<String>,
    pub detail_url: Option<String>,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// Build the persisted form of `new` with the store-assigned fields.
    pub fn from_new(id: VideoId, new: NewVideo, now: DateTime<Utc>) -> Self {
        Self {
            id,
            code: new.code,
            title: new.title,
            actors: new.actors,
            tags: new.tags,
            duration_secs: new.duration_secs,
            cover_url: new.cover_url,
            preview_url: new.preview_url,
            detail_url: new.detail_url,
            delivered: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a batch insert; duplicates are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveSummary {
    pub saved: usize,
    pub duplicates: usize,
}

/// Outcome of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(VideoId),
    Duplicate,
}

/// Split drafts into insertable records and the drafts whose code is unusable.
pub fn partition_drafts(drafts: Vec<VideoDraft>) -> (Vec<NewVideo>, Vec<InvalidCode>) {
    let mut valid = Vec::with_capacity(drafts.len());
    let mut rejected = Vec::new();
    for draft in drafts {
        match NewVideo::try_from(draft) {
            Ok(video) => valid.push(video),
            Err(err) => rejected.push(err),
        }
    }
    (valid, rejected)
}
