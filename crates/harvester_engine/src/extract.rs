//! Page-to-record extraction for the harvested site layout.
//!
//! Listing pages go through an ordered cascade of strategies; the first one
//! that yields at least one draft wins. Every strategy is a plain function so
//! it can be exercised on its own.
use std::collections::HashSet;
use std::sync::LazyLock;

use engine_logging::{engine_debug, engine_trace};
use harvester_core::{
    absolutize, derive_code, detail_url_for_code, extract_code, host_of, parse_duration_secs,
    VideoDraft,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static DVD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""dvd_id"\s*:\s*"([^"]+)""#).expect("valid regex"));
static UUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""uuid"\s*:\s*"([^"]+)""#).expect("valid regex"));
static MP4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(https?://[^\s"']+\.mp4)"#).expect("valid regex"));

/// Card-like containers, most specific first.
pub const CARD_SELECTORS: &[&str] = &[
    "div.video-card",
    "article.video",
    "div[class*=thumbnail]",
    "div.group",
];

/// Lazy-load attributes checked before `src`.
const IMAGE_ATTRIBUTES: &[&str] = &["data-original", "data-lazy-src", "data-src", "srcset", "src"];

pub trait Extractor: Send + Sync {
    fn extract_listing(&self, html: &str) -> Vec<VideoDraft>;
    fn extract_detail(&self, html: &str, source_url: &str) -> VideoDraft;
}

type ListingStrategy = fn(&SiteExtractor, &Html) -> Vec<VideoDraft>;

const LISTING_STRATEGIES: &[(&str, ListingStrategy)] = &[
    ("embedded-json", SiteExtractor::from_embedded_json),
    ("cards", SiteExtractor::from_cards),
    ("code-links", SiteExtractor::from_code_links),
];

#[derive(Debug, Clone)]
pub struct SiteExtractor {
    base_url: String,
    host: Option<String>,
}

impl SiteExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let host = host_of(&base_url);
        Self { base_url, host }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Identifiers embedded in script data blocks. `dvd_id` is preferred;
    /// `uuid` is only consulted when no script carries a `dvd_id`.
    pub fn from_embedded_json(&self, doc: &Html) -> Vec<VideoDraft> {
        let Some(script_sel) = Selector::parse("script").ok() else {
            return Vec::new();
        };
        let scripts: Vec<String> = doc
            .select(&script_sel)
            .map(|s| s.text().collect::<String>())
            .filter(|text| text.contains("dvd_id") || text.contains("uuid"))
            .collect();

        let mut drafts = Vec::new();
        for text in &scripts {
            for caps in DVD_ID_RE.captures_iter(text) {
                let id = caps[1].trim();
                drafts.push(VideoDraft {
                    detail_url: Some(detail_url_for_code(&self.base_url, id)),
                    ..VideoDraft::with_code(id)
                });
            }
        }
        if !drafts.is_empty() {
            return drafts;
        }

        for text in &scripts {
            for caps in UUID_RE.captures_iter(text) {
                let id = caps[1].trim();
                drafts.push(VideoDraft {
                    detail_url: Some(absolutize(&self.base_url, id)),
                    ..VideoDraft::with_code(id)
                });
            }
        }
        drafts
    }

    /// Parse the matches of the first card selector that matches anything.
    pub fn from_cards(&self, doc: &Html) -> Vec<VideoDraft> {
        for css in CARD_SELECTORS {
            let Some(sel) = Selector::parse(css).ok() else {
                continue;
            };
            let cards: Vec<ElementRef<'_>> = doc.select(&sel).collect();
            if cards.is_empty() {
                continue;
            }
            engine_trace!("extract card selector={} matches={}", css, cards.len());
            return cards
                .into_iter()
                .filter_map(|card| self.parse_card(card))
                .collect();
        }
        Vec::new()
    }

    /// Last resort: every link whose target carries a code.
    pub fn from_code_links(&self, doc: &Html) -> Vec<VideoDraft> {
        let Some(sel) = Selector::parse("a[href]").ok() else {
            return Vec::new();
        };
        doc.select(&sel)
            .filter_map(|link| {
                let href = link.value().attr("href")?;
                let code = extract_code(href)?;
                Some(VideoDraft {
                    detail_url: Some(absolutize(&self.base_url, href)),
                    cover_url: first_image(link).and_then(|img| self.image_url(img)),
                    ..VideoDraft::with_code(code)
                })
            })
            .collect()
    }

    fn parse_card(&self, card: ElementRef<'_>) -> Option<VideoDraft> {
        let link = self.card_link(card);
        let detail_url = link
            .and_then(|a| a.value().attr("href"))
            .map(|href| absolutize(&self.base_url, href))
            .filter(|url| !url.is_empty());

        let title = select_first(card, "h3, h4, .title, [class*=title]")
            .map(element_text)
            .filter(|t| !t.is_empty());

        let code = derive_code(title.as_deref(), detail_url.as_deref())?;
        let duration_secs = duration_element(card)
            .map(|el| parse_duration_secs(&element_text(el)))
            .unwrap_or(0);

        Some(VideoDraft {
            title,
            duration_secs,
            cover_url: first_image(card).and_then(|img| self.image_url(img)),
            detail_url,
            ..VideoDraft::with_code(code)
        })
    }

    fn card_link<'a>(&self, card: ElementRef<'a>) -> Option<ElementRef<'a>> {
        let on_site = self
            .host
            .as_deref()
            .and_then(|host| select_first(card, &format!("a[href*=\"{host}\"]")));
        on_site.or_else(|| select_first(card, "a[href]"))
    }

    fn image_url(&self, img: ElementRef<'_>) -> Option<String> {
        for attr in IMAGE_ATTRIBUTES {
            let Some(value) = img.value().attr(attr).map(str::trim) else {
                continue;
            };
            if value.is_empty() || value.starts_with("data:") {
                continue;
            }
            let candidate = if *attr == "srcset" {
                value.split_whitespace().next().unwrap_or(value)
            } else {
                value
            };
            if candidate.starts_with("http://")
                || candidate.starts_with("https://")
                || candidate.starts_with('/')
            {
                return Some(absolutize(&self.base_url, candidate));
            }
        }
        None
    }
}

impl Extractor for SiteExtractor {
    fn extract_listing(&self, html: &str) -> Vec<VideoDraft> {
        let doc = Html::parse_document(html);
        for (name, strategy) in LISTING_STRATEGIES {
            let drafts = dedup_by_code(strategy(self, &doc));
            if !drafts.is_empty() {
                engine_debug!("extract listing strategy={} drafts={}", name, drafts.len());
                return drafts;
            }
        }
        engine_debug!("extract listing found nothing bytes={}", html.len());
        Vec::new()
    }

    fn extract_detail(&self, html: &str, source_url: &str) -> VideoDraft {
        let doc = Html::parse_document(html);
        let root = doc.root_element();

        let title = select_first(root, "h1, .video-title, [class*=title]")
            .map(element_text)
            .filter(|t| !t.is_empty());
        let code = derive_code(title.as_deref(), Some(source_url)).unwrap_or_default();

        let actors = collect_texts(root, "a[href*=actress], a[href*=actor], .actress");
        let tags = collect_texts(root, "a[href*=tag], a[href*=genre], .tag");

        let cover_url = select_first(
            root,
            "meta[property='og:image'], img.cover, .video-cover img",
        )
        .and_then(|el| {
            non_empty_attr(el, "content").or_else(|| non_empty_attr(el, "src"))
        })
        .map(|url| absolutize(&self.base_url, &url));

        let preview_url = select_first(root, "video")
            .and_then(video_source)
            .or_else(|| preview_from_scripts(&doc))
            .map(|url| absolutize(&self.base_url, &url));

        let duration_secs = duration_element(root)
            .map(|el| parse_duration_secs(&element_text(el)))
            .unwrap_or(0);

        VideoDraft {
            code,
            title,
            actors,
            tags,
            duration_secs,
            cover_url,
            preview_url,
            detail_url: Some(source_url.to_string()),
        }
    }
}

fn select_first<'a>(scope: ElementRef<'a>, css: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(css).ok()?;
    scope.select(&sel).next()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_image(scope: ElementRef<'_>) -> Option<ElementRef<'_>> {
    select_first(scope, "img")
}

fn non_empty_attr(el: ElementRef<'_>, name: &str) -> Option<String> {
    el.value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Trimmed, de-duplicated texts of every match, in document order.
fn collect_texts(scope: ElementRef<'_>, css: &str) -> Vec<String> {
    let Some(sel) = Selector::parse(css).ok() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    scope
        .select(&sel)
        .map(element_text)
        .filter(|text| !text.is_empty() && seen.insert(text.clone()))
        .collect()
}

/// Dedicated duration element, else the first span mentioning minutes.
fn duration_element(scope: ElementRef<'_>) -> Option<ElementRef<'_>> {
    select_first(scope, ".duration, [class*=duration]").or_else(|| {
        let sel = Selector::parse("span").ok()?;
        scope
            .select(&sel)
            .find(|span| span.text().any(|t| t.contains('分')))
    })
}

fn video_source(video: ElementRef<'_>) -> Option<String> {
    non_empty_attr(video, "data-src")
        .or_else(|| non_empty_attr(video, "src"))
        .or_else(|| {
            let source = select_first(video, "source")?;
            non_empty_attr(source, "src").or_else(|| non_empty_attr(source, "data-src"))
        })
}

fn preview_from_scripts(doc: &Html) -> Option<String> {
    let sel = Selector::parse("script").ok()?;
    doc.select(&sel).find_map(|script| {
        let text = script.text().collect::<String>();
        if !text.contains(".mp4") {
            return None;
        }
        MP4_RE.captures(&text).map(|caps| caps[1].to_string())
    })
}

fn dedup_by_code(drafts: Vec<VideoDraft>) -> Vec<VideoDraft> {
    let mut seen = HashSet::new();
    drafts
        .into_iter()
        .filter(|draft| draft.has_code() && seen.insert(draft.code.clone()))
        .collect()
}
