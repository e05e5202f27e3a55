//! Path templates of the harvested site, relative to a configured origin.
use std::borrow::Cow;

const NEW_LISTING_PATH: &str = "/new";
const ACTOR_LISTING_PATH: &str = "/actresses/";
const SEARCH_LISTING_PATH: &str = "/search/";

/// Percent-encode one path segment (every byte outside the unreserved set).
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

pub fn decode_path_segment(segment: &str) -> Result<String, std::string::FromUtf8Error> {
    urlencoding::decode(segment).map(Cow::into_owned)
}

fn with_page(url: String, page: u32) -> String {
    if page > 1 {
        format!("{url}?page={page}")
    } else {
        url
    }
}

fn origin(base: &str) -> &str {
    base.trim_end_matches('/')
}

/// `/new`, then `/new?page=N` from page 2 on.
pub fn new_listing_url(base: &str, page: u32) -> String {
    with_page(format!("{}{NEW_LISTING_PATH}", origin(base)), page)
}

pub fn actor_listing_url(base: &str, actor: &str, page: u32) -> String {
    with_page(
        format!(
            "{}{ACTOR_LISTING_PATH}{}",
            origin(base),
            encode_path_segment(actor)
        ),
        page,
    )
}

pub fn search_listing_url(base: &str, keyword: &str, page: u32) -> String {
    with_page(
        format!(
            "{}{SEARCH_LISTING_PATH}{}",
            origin(base),
            encode_path_segment(keyword)
        ),
        page,
    )
}

/// Detail pages live at the lower-cased code.
pub fn detail_url_for_code(base: &str, code: &str) -> String {
    format!("{}/{}", origin(base), code.trim().to_lowercase())
}

/// Resolve `href` against `base`: absolute URLs pass through, rooted paths
/// get the origin, bare relative paths get the origin plus `/`.
pub fn absolutize(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        let scheme = base.split("://").next().unwrap_or("https");
        return format!("{scheme}://{rest}");
    }
    if href.starts_with('/') {
        return format!("{}{href}", origin(base));
    }
    format!("{}/{href}", origin(base))
}

/// Host component of `base`, used to recognise on-site links.
pub fn host_of(base: &str) -> Option<String> {
    url::Url::parse(base)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
