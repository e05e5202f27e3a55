use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::subscription::DestinationId;
use crate::video::VideoId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Success,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "SUCCESS",
            DeliveryOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown delivery outcome {0:?}")]
pub struct UnknownOutcome(pub String);

impl FromStr for DeliveryOutcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(DeliveryOutcome::Success),
            "FAILED" => Ok(DeliveryOutcome::Failed),
            other => Err(UnknownOutcome(other.to_string())),
        }
    }
}

/// Append-only log entry for one send to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub video_id: VideoId,
    pub destination: DestinationId,
    pub outcome: DeliveryOutcome,
    pub failure_reason: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeliveryAttempt {
    pub video_id: VideoId,
    pub destination: DestinationId,
    pub outcome: DeliveryOutcome,
    pub failure_reason: Option<String>,
}

impl NewDeliveryAttempt {
    pub fn success(video_id: VideoId, destination: DestinationId) -> Self {
        Self {
            video_id,
            destination,
            outcome: DeliveryOutcome::Success,
            failure_reason: None,
        }
    }

    pub fn failed(video_id: VideoId, destination: DestinationId, reason: impl Into<String>) -> Self {
        Self {
            video_id,
            destination,
            outcome: DeliveryOutcome::Failed,
            failure_reason: Some(reason.into()),
        }
    }
}
