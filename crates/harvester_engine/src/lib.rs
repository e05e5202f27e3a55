//! Harvester engine: every piece of IO behind the bot.
//!
//! Fetch pipeline (rate limiter, fetcher, rendering fallback, extractor,
//! retrying harvester), persistence, the Telegram transport, the delivery
//! engine and the single-flight scheduler.
mod cancel;
mod decode;
mod delivery;
mod extract;
mod fetch;
mod harvest;
mod rate_limit;
mod render;
mod schedule;
mod schema;
mod sqlite;
mod store;
mod telegram;
mod transport;
mod types;

pub use cancel::{sleep_or_cancel, Cancelled};
pub use decode::{decode_body, DecodeError, DecodedBody};
pub use delivery::{DeliveryEngine, DeliveryError, DeliverySettings, PushOutcome, SweepReport};
pub use extract::{Extractor, SiteExtractor, CARD_SELECTORS};
pub use fetch::{FetchSettings, Fetcher, ReqwestFetcher, DEFAULT_USER_AGENT};
pub use harvest::{HarvestError, HarvestSettings, Harvester, RetryingHarvester};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use render::{
    BrowserBackend, BrowserSession, ChromiumBackend, ChromiumSettings, PageRenderer, RenderError,
    RenderPage, RenderSettings, RenderingFallback,
};
pub use schedule::{
    CycleReport, HarvestReport, ManualHarvestError, Scheduler, SchedulerSettings, SchedulerState,
    TriggerOutcome,
};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, Store, StoreError};
pub use telegram::{Chat, Message, TelegramClient, TelegramSettings, Update, User, DEFAULT_API_BASE};
pub use transport::{Transport, TransportError};
pub use types::{FailureKind, FetchError, FetchMetadata, FetchedPage};
