//! Bot command parsing. Pure: turns message text into intents.

/// Results returned by `/search`.
pub const SEARCH_RESULT_LIMIT: usize = 10;
/// Records shown per `/latest` page.
pub const LATEST_PAGE_SIZE: usize = 5;
/// Records collected by an actor or keyword `/crawl`.
pub const MANUAL_HARVEST_LIMIT: usize = 20;
/// Listing pages walked by `/crawl new`.
pub const MANUAL_NEW_PAGES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Subscribe(String),
    Unsubscribe(String),
    List,
    Search(String),
    Latest { page: u32 },
    Crawl(String),
    Status,
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] args...`. Returns `None` for non-command text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let body = text.strip_prefix('/')?;
        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }

        let command = match name.as_str() {
            "start" | "help" => Command::Help,
            "subscribe" => Command::Subscribe(args.to_string()),
            "unsubscribe" => Command::Unsubscribe(args.to_string()),
            "list" => Command::List,
            "search" => Command::Search(args.to_string()),
            "latest" => Command::Latest {
                page: args.parse::<u32>().ok().filter(|p| *p >= 1).unwrap_or(1),
            },
            "crawl" => Command::Crawl(args.to_string()),
            "status" => Command::Status,
            _ => Command::Unknown(name),
        };
        Some(command)
    }
}

/// A manual harvest the command layer may ask the scheduler for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestRequest {
    NewListing { pages: u32 },
    Actor { name: String, limit: usize },
    Code { code: String },
    Keyword { keyword: String, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrawlArgsError {
    #[error("missing crawl kind")]
    MissingKind,
    #[error("unknown crawl kind {0:?}")]
    UnknownKind(String),
    #[error("crawl kind {0:?} needs a keyword")]
    MissingKeyword(String),
}

impl HarvestRequest {
    /// Parse `/crawl` arguments: `new`, `actor NAME`, `code CODE`, `search KW`.
    pub fn from_crawl_args(args: &str) -> Result<Self, CrawlArgsError> {
        let args = args.trim();
        if args.is_empty() {
            return Err(CrawlArgsError::MissingKind);
        }
        let (kind, keyword) = match args.split_once(char::is_whitespace) {
            Some((kind, rest)) => (kind.to_ascii_lowercase(), rest.trim().to_string()),
            None => (args.to_ascii_lowercase(), String::new()),
        };

        if kind == "new" {
            return Ok(HarvestRequest::NewListing {
                pages: MANUAL_NEW_PAGES,
            });
        }
        let known = matches!(
            kind.as_str(),
            "actor" | "actress" | "code" | "search" | "keyword"
        );
        if !known {
            return Err(CrawlArgsError::UnknownKind(kind));
        }
        if keyword.is_empty() {
            return Err(CrawlArgsError::MissingKeyword(kind));
        }

        Ok(match kind.as_str() {
            "actor" | "actress" => HarvestRequest::Actor {
                name: keyword,
                limit: MANUAL_HARVEST_LIMIT,
            },
            "code" => HarvestRequest::Code { code: keyword },
            _ => HarvestRequest::Keyword {
                keyword,
                limit: MANUAL_HARVEST_LIMIT,
            },
        })
    }

    pub fn describe(&self) -> String {
        match self {
            HarvestRequest::NewListing { pages } => format!("new listing ({pages} pages)"),
            HarvestRequest::Actor { name, .. } => format!("actor {name}"),
            HarvestRequest::Code { code } => format!("code {code}"),
            HarvestRequest::Keyword { keyword, .. } => format!("search {keyword}"),
        }
    }
}
