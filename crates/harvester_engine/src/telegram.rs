//! Telegram Bot API client: the production [`Transport`] plus long-poll
//! update retrieval for the command listener.
use std::time::Duration;

use async_trait::async_trait;
use engine_logging::{engine_debug, engine_trace};
use harvester_core::DestinationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::transport::{Transport, TransportError};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const MARKDOWN_V2: &str = "MarkdownV2";
/// Slack added to the long-poll timeout before the HTTP request gives up.
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_base: String,
    pub token: String,
    pub request_timeout: Duration,
}

impl TelegramSettings {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    result: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Chat {
    pub id: DestinationId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl Chat {
    pub fn is_group(&self) -> bool {
        matches!(self.kind.as_str(), "group" | "supergroup")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The endpoint embeds the token.
        f.debug_struct("TelegramClient").finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(settings: &TelegramSettings) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/bot{}",
                settings.api_base.trim_end_matches('/'),
                settings.token
            ),
        })
    }

    async fn call<T, B>(
        &self,
        method: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut request = self
            .http
            .post(format!("{}/{}", self.endpoint, method))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        engine_trace!("telegram method={} status={} bytes={}", method, status, text.len());

        let envelope: ApiResponse<T> = serde_json::from_str(&text)
            .map_err(|err| TransportError::Decode(format!("{method}: {err}")))?;
        if !envelope.ok {
            return Err(TransportError::Api {
                code: envelope.error_code.or(Some(i64::from(status.as_u16()))),
                description: envelope
                    .description
                    .unwrap_or_else(|| format!("{method} failed")),
            });
        }
        envelope
            .result
            .ok_or_else(|| TransportError::Decode(format!("{method}: missing result")))
    }

    /// Identity of the bot behind the token.
    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", &json!({}), None).await
    }

    /// Long-poll for updates with id `>= offset`, waiting up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let body = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: ["message"],
        };
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                &body,
                Some(Duration::from_secs(timeout_secs) + POLL_GRACE),
            )
            .await?;
        if !updates.is_empty() {
            engine_debug!("telegram updates offset={} count={}", offset, updates.len());
        }
        Ok(updates)
    }

    async fn send(&self, method: &str, body: serde_json::Value) -> Result<(), TransportError> {
        let _: serde_json::Value = self.call(method, &body, None).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(
        &self,
        destination: DestinationId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.send("sendMessage", json!({ "chat_id": destination, "text": text }))
            .await
    }

    async fn send_markdown(
        &self,
        destination: DestinationId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.send(
            "sendMessage",
            json!({ "chat_id": destination, "text": text, "parse_mode": MARKDOWN_V2 }),
        )
        .await
    }

    async fn send_photo(
        &self,
        destination: DestinationId,
        photo_url: &str,
        caption: &str,
    ) -> Result<(), TransportError> {
        self.send(
            "sendPhoto",
            json!({
                "chat_id": destination,
                "photo": photo_url,
                "caption": caption,
                "parse_mode": MARKDOWN_V2,
            }),
        )
        .await
    }

    async fn send_video(
        &self,
        destination: DestinationId,
        video_url: &str,
        thumbnail_url: Option<&str>,
        caption: &str,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": destination,
            "video": video_url,
            "caption": caption,
            "parse_mode": MARKDOWN_V2,
        });
        if let Some(thumbnail) = thumbnail_url.filter(|t| !t.is_empty()) {
            body["thumbnail"] = json!(thumbnail);
        }
        self.send("sendVideo", body).await
    }
}
