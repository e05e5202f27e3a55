use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::video::Video;

/// Chat (or other destination) identifier on the delivery transport.
pub type DestinationId = i64;
pub type SubscriptionId = i64;

/// What a subscription is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    All,
    Actor,
    Tag,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::All => "ALL",
            RuleKind::Actor => "ACTOR",
            RuleKind::Tag => "TAG",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription rule {0:?}")]
pub struct UnknownRule(pub String);

impl FromStr for RuleKind {
    type Err = UnknownRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(RuleKind::All),
            // Older databases spell the actor rule after the site's wording.
            "ACTOR" | "ACTRESS" => Ok(RuleKind::Actor),
            "TAG" => Ok(RuleKind::Tag),
            _ => Err(UnknownRule(s.to_string())),
        }
    }
}

/// Rule and keyword selected by a subscribe/unsubscribe argument.
///
/// Empty means everything, a leading `#` selects a tag, anything else is an
/// actor name.
pub fn parse_subscription_arg(arg: &str) -> (RuleKind, String) {
    let arg = arg.trim();
    if arg.is_empty() {
        return (RuleKind::All, String::new());
    }
    match arg.strip_prefix('#') {
        Some(tag) => (RuleKind::Tag, tag.trim().to_string()),
        None => (RuleKind::Actor, arg.to_string()),
    }
}

/// Identity of a subscription: one per (destination, rule, keyword).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub destination: DestinationId,
    pub rule: RuleKind,
    pub keyword: String,
}

impl SubscriptionKey {
    pub fn new(destination: DestinationId, rule: RuleKind, keyword: impl Into<String>) -> Self {
        let keyword = match rule {
            RuleKind::All => String::new(),
            RuleKind::Actor | RuleKind::Tag => keyword.into(),
        };
        Self {
            destination,
            rule,
            keyword,
        }
    }
}

/// Subscription request; storing it again re-enables instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub key: SubscriptionKey,
    pub destination_kind: String,
}

impl NewSubscription {
    pub fn new(
        destination: DestinationId,
        destination_kind: impl Into<String>,
        rule: RuleKind,
        keyword: impl Into<String>,
    ) -> Self {
        Self {
            key: SubscriptionKey::new(destination, rule, keyword),
            destination_kind: destination_kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub destination: DestinationId,
    pub destination_kind: String,
    pub rule: RuleKind,
    pub keyword: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// `ALL` matches unconditionally; `ACTOR`/`TAG` are case-insensitive
    /// substring tests against the joined actor/tag lists.
    pub fn matches(&self, video: &Video) -> bool {
        match self.rule {
            RuleKind::All => true,
            RuleKind::Actor => contains_ignore_case(&video.actors, &self.keyword),
            RuleKind::Tag => contains_ignore_case(&video.tags, &self.keyword),
        }
    }
}

/// Matching with absent operands: a missing video or subscription never matches.
pub fn matches_subscription(video: Option<&Video>, subscription: Option<&Subscription>) -> bool {
    match (video, subscription) {
        (Some(video), Some(subscription)) => subscription.matches(video),
        _ => false,
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
