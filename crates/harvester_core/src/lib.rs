//! Harvester core: the pure domain model shared by the engine and the bot.
mod code;
mod command;
mod delivery;
mod format;
mod paths;
mod subscription;
mod video;

pub use code::{
    code_from_url, derive_code, extract_code, is_valid_code, normalize_code, parse_duration_secs,
};
pub use command::{
    Command, CrawlArgsError, HarvestRequest, LATEST_PAGE_SIZE, MANUAL_HARVEST_LIMIT,
    MANUAL_NEW_PAGES, SEARCH_RESULT_LIMIT,
};
pub use delivery::{DeliveryAttempt, DeliveryOutcome, NewDeliveryAttempt, UnknownOutcome};
pub use format::{escape_markdown, format_duration, format_video_message, truncate_chars};
pub use paths::{
    absolutize, actor_listing_url, decode_path_segment, detail_url_for_code,
    encode_path_segment, host_of, new_listing_url, search_listing_url,
};
pub use subscription::{
    matches_subscription, parse_subscription_arg, DestinationId, NewSubscription, RuleKind,
    Subscription, SubscriptionId, SubscriptionKey, UnknownRule,
};
pub use video::{
    partition_drafts, InvalidCode, NewVideo, SaveOutcome, SaveSummary, Video, VideoDraft, VideoId,
};
