//! Outbound message transport consumed by the delivery engine and the bot.
use async_trait::async_trait;
use harvester_core::DestinationId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {code:?}: {description}")]
    Api {
        code: Option<i64>,
        description: String,
    },
    #[error("malformed api response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn api(description: impl Into<String>) -> Self {
        TransportError::Api {
            code: None,
            description: description.into(),
        }
    }
}

/// Send primitives keyed by destination. Markdown variants expect text that
/// is already escaped for the transport's formatting mode.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, destination: DestinationId, text: &str)
        -> Result<(), TransportError>;

    async fn send_markdown(
        &self,
        destination: DestinationId,
        text: &str,
    ) -> Result<(), TransportError>;

    async fn send_photo(
        &self,
        destination: DestinationId,
        photo_url: &str,
        caption: &str,
    ) -> Result<(), TransportError>;

    async fn send_video(
        &self,
        destination: DestinationId,
        video_url: &str,
        thumbnail_url: Option<&str>,
        caption: &str,
    ) -> Result<(), TransportError>;
}
