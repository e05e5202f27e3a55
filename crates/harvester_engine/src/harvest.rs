//! Harvest operations over the fetch pipeline.
//!
//! Every page goes through the same ladder: rate-limiter permit, plain fetch
//! with exponential backoff, then one browser render when the plain fetch is
//! exhausted (or, on the first listing page, when it parses to nothing).
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_logging::{engine_debug, engine_info, engine_trace, engine_warn};
use harvester_core::{
    actor_listing_url, detail_url_for_code, new_listing_url, search_listing_url, VideoDraft,
};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::{sleep_or_cancel, Cancelled};
use crate::extract::Extractor;
use crate::fetch::Fetcher;
use crate::rate_limit::RateLimiter;
use crate::render::PageRenderer;
use crate::{FailureKind, FetchError};

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("harvest cancelled with {} partial records", partial.len())]
    Cancelled { partial: Vec<VideoDraft> },
    #[error("page unavailable: {0}")]
    Unavailable(String),
    #[error("no record found at {0}")]
    NoRecord(String),
}

impl HarvestError {
    fn cancelled(partial: Vec<VideoDraft>) -> Self {
        HarvestError::Cancelled { partial }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarvestError::Cancelled { .. })
    }
}

#[async_trait]
pub trait Harvester: Send + Sync {
    /// Walk `pages` pages of the newest-first listing.
    async fn harvest_new_listing(
        &self,
        pages: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError>;

    async fn harvest_detail(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError>;

    /// At most `limit` records from the actor's listing.
    async fn harvest_by_actor(
        &self,
        name: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError>;

    /// At most `limit` records from the keyword search listing.
    async fn harvest_by_keyword(
        &self,
        keyword: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError>;

    async fn harvest_by_code(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError>;

    /// Release long-lived resources such as the rendering session.
    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub base_url: String,
    /// Retries after the first plain-fetch attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub initial_backoff: Duration,
    /// Pause between consecutive listing pages.
    pub page_pacing: Duration,
    /// Random pre-request delay drawn from `jitter_min..jitter_max`.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub warmup_requests: u32,
    pub warmup_spacing: Duration,
    /// A warm session older than this is warmed again.
    pub warmup_ttl: Duration,
    pub listing_selector: String,
    pub detail_selector: String,
    pub render_timeout: Duration,
    /// Records per listing page, used to turn a limit into a page count.
    pub page_size_hint: usize,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            base_url: "https://missav.ai".to_string(),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            page_pacing: Duration::from_secs(2),
            jitter_min: Duration::from_secs(1),
            jitter_max: Duration::from_secs(3),
            warmup_requests: 3,
            warmup_spacing: Duration::from_secs(1),
            warmup_ttl: Duration::from_secs(10 * 60),
            listing_selector: "div.group".to_string(),
            detail_selector: "body".to_string(),
            render_timeout: Duration::from_secs(20),
            page_size_hint: 12,
        }
    }
}

/// What to do after a listing page could be neither fetched nor rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnPageFailure {
    NextPage,
    Stop,
}

struct ListingWalk<'a> {
    label: &'a str,
    max_pages: u32,
    limit: Option<usize>,
    on_failure: OnPageFailure,
}

pub struct RetryingHarvester {
    fetcher: Arc<dyn Fetcher>,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn Extractor>,
    limiter: RateLimiter,
    settings: HarvestSettings,
    warmed_at: Mutex<Option<Instant>>,
}

impl RetryingHarvester {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        renderer: Arc<dyn PageRenderer>,
        extractor: Arc<dyn Extractor>,
        limiter: RateLimiter,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            fetcher,
            renderer,
            extractor,
            limiter,
            settings,
            warmed_at: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    /// Pages needed to collect `limit` records.
    fn pages_for_limit(&self, limit: usize) -> u32 {
        let per_page = self.settings.page_size_hint.max(1);
        u32::try_from(limit.div_ceil(per_page)).unwrap_or(u32::MAX)
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.settings.jitter_min, self.settings.jitter_max);
        if max <= min {
            return min;
        }
        rand::rng().random_range(min..max)
    }

    /// Establish the cookie state the site expects before real requests.
    ///
    /// Serialised so concurrent harvests warm up once. Failures are logged
    /// and never abort the harvest that triggered the warm-up.
    async fn ensure_warm(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let mut warmed_at = self.warmed_at.lock().await;
        if let Some(at) = *warmed_at {
            if at.elapsed() < self.settings.warmup_ttl {
                engine_trace!("harvest warm-up skipped age={:?}", at.elapsed());
                return Ok(());
            }
        }
        if self.settings.warmup_requests == 0 {
            *warmed_at = Some(Instant::now());
            return Ok(());
        }

        let url = new_listing_url(&self.settings.base_url, 2);
        engine_info!(
            "harvest warm-up start url={} requests={}",
            url,
            self.settings.warmup_requests
        );
        let mut succeeded = 0;
        for attempt in 0..self.settings.warmup_requests {
            if attempt > 0 {
                sleep_or_cancel(self.settings.warmup_spacing, cancel).await?;
            }
            self.limiter.acquire(cancel).await?;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                result = self.fetcher.fetch(&url) => result,
            };
            match result {
                Ok(_) => succeeded += 1,
                Err(err) => engine_warn!("harvest warm-up request failed url={} error={}", url, err),
            }
        }

        // Stamped whatever the outcome; a failed warm-up waits out the window too.
        *warmed_at = Some(Instant::now());
        engine_info!(
            "harvest warm-up finished succeeded={}/{}",
            succeeded,
            self.settings.warmup_requests
        );
        Ok(())
    }

    /// Plain fetch with the retry budget. Cancellation surfaces as a
    /// `FailureKind::Cancelled` error.
    async fn fetch_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let mut last_error = FetchError::new(FailureKind::Network, "no attempt made");
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let backoff = self.settings.initial_backoff * 2u32.saturating_pow(attempt - 1);
                engine_info!(
                    "harvest retry url={} attempt={} backoff={:?}",
                    url,
                    attempt,
                    backoff
                );
                sleep_or_cancel(backoff, cancel)
                    .await
                    .map_err(|_| FetchError::cancelled())?;
            }

            self.limiter
                .acquire(cancel)
                .await
                .map_err(|_| FetchError::cancelled())?;
            sleep_or_cancel(self.jitter(), cancel)
                .await
                .map_err(|_| FetchError::cancelled())?;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::cancelled()),
                result = self.fetcher.fetch(url) => result,
            };
            match result {
                Ok(page) => {
                    engine_debug!(
                        "harvest fetched url={} bytes={} attempt={}",
                        url,
                        page.metadata.byte_len,
                        attempt
                    );
                    return Ok(page.html);
                }
                Err(err) if err.kind == FailureKind::InvalidUrl => return Err(err),
                Err(err) => {
                    engine_warn!("harvest fetch failed url={} attempt={} error={}", url, attempt, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Render `url` in the browser session. `None` when rendering failed.
    async fn render(
        &self,
        url: &str,
        selector: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Cancelled> {
        engine_info!("harvest escalating to rendering url={}", url);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled),
            result = self.renderer.render_url(url, Some(selector), self.settings.render_timeout) => result,
        };
        match result {
            Ok(html) => Ok(Some(html)),
            Err(err) => {
                engine_warn!("harvest rendering failed url={} error={}", url, err);
                Ok(None)
            }
        }
    }

    async fn walk_listing(
        &self,
        walk: ListingWalk<'_>,
        url_for_page: impl Fn(u32) -> String + Send + Sync,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let mut drafts: Vec<VideoDraft> = Vec::new();
        if walk.max_pages == 0 || walk.limit == Some(0) {
            return Ok(drafts);
        }
        if self.ensure_warm(cancel).await.is_err() {
            return Err(HarvestError::cancelled(drafts));
        }

        for page in 1..=walk.max_pages {
            if page > 1 && sleep_or_cancel(self.settings.page_pacing, cancel).await.is_err() {
                return Err(HarvestError::cancelled(drafts));
            }
            let url = url_for_page(page);

            let (html, plain) = match self.fetch_with_retry(&url, cancel).await {
                Ok(html) => (html, true),
                Err(err) if err.is_cancelled() => return Err(HarvestError::cancelled(drafts)),
                Err(err) => {
                    engine_warn!(
                        "harvest {} page={} plain fetch exhausted error={}",
                        walk.label,
                        page,
                        err
                    );
                    match self.render(&url, &self.settings.listing_selector, cancel).await {
                        Err(Cancelled) => return Err(HarvestError::cancelled(drafts)),
                        Ok(Some(html)) => (html, false),
                        Ok(None) => match walk.on_failure {
                            OnPageFailure::NextPage => continue,
                            OnPageFailure::Stop => break,
                        },
                    }
                }
            };

            let mut found = self.extractor.extract_listing(&html);
            if found.is_empty() && plain && page == 1 {
                engine_info!(
                    "harvest {} first page parsed empty, escalating url={}",
                    walk.label,
                    url
                );
                match self.render(&url, &self.settings.listing_selector, cancel).await {
                    Err(Cancelled) => return Err(HarvestError::cancelled(drafts)),
                    Ok(Some(rendered)) => found = self.extractor.extract_listing(&rendered),
                    Ok(None) => {}
                }
            }

            if found.is_empty() {
                engine_info!("harvest {} page={} empty, stopping", walk.label, page);
                break;
            }
            engine_info!(
                "harvest {} page={} records={} source={}",
                walk.label,
                page,
                found.len(),
                if plain { "fetch" } else { "render" }
            );
            drafts.extend(found);

            if let Some(limit) = walk.limit {
                if drafts.len() >= limit {
                    drafts.truncate(limit);
                    break;
                }
            }
        }

        engine_info!("harvest {} finished records={}", walk.label, drafts.len());
        Ok(drafts)
    }
}

#[async_trait]
impl Harvester for RetryingHarvester {
    async fn harvest_new_listing(
        &self,
        pages: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let base = self.settings.base_url.clone();
        let walk = ListingWalk {
            label: "new",
            max_pages: pages,
            limit: None,
            on_failure: OnPageFailure::NextPage,
        };
        self.walk_listing(walk, |page| new_listing_url(&base, page), cancel)
            .await
    }

    async fn harvest_detail(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError> {
        if self.ensure_warm(cancel).await.is_err() {
            return Err(HarvestError::cancelled(Vec::new()));
        }

        let html = match self.fetch_with_retry(url, cancel).await {
            Ok(html) => html,
            Err(err) if err.is_cancelled() => return Err(HarvestError::cancelled(Vec::new())),
            Err(err) => {
                engine_warn!("harvest detail plain fetch exhausted url={} error={}", url, err);
                match self.render(url, &self.settings.detail_selector, cancel).await {
                    Err(Cancelled) => return Err(HarvestError::cancelled(Vec::new())),
                    Ok(Some(html)) => html,
                    Ok(None) => return Err(HarvestError::Unavailable(err.to_string())),
                }
            }
        };

        let draft = self.extractor.extract_detail(&html, url);
        if !draft.has_code() {
            return Err(HarvestError::NoRecord(url.to_string()));
        }
        engine_info!("harvest detail url={} code={}", url, draft.code);
        Ok(draft)
    }

    async fn harvest_by_actor(
        &self,
        name: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let base = self.settings.base_url.clone();
        let walk = ListingWalk {
            label: "actor",
            max_pages: self.pages_for_limit(limit),
            limit: Some(limit),
            on_failure: OnPageFailure::Stop,
        };
        self.walk_listing(walk, |page| actor_listing_url(&base, name, page), cancel)
            .await
    }

    async fn harvest_by_keyword(
        &self,
        keyword: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }
        let base = self.settings.base_url.clone();
        let walk = ListingWalk {
            label: "search",
            max_pages: self.pages_for_limit(limit),
            limit: Some(limit),
            on_failure: OnPageFailure::Stop,
        };
        self.walk_listing(walk, |page| search_listing_url(&base, keyword, page), cancel)
            .await
    }

    async fn harvest_by_code(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError> {
        let url = detail_url_for_code(&self.settings.base_url, code);
        self.harvest_detail(&url, cancel).await
    }

    async fn close(&self) {
        if let Err(err) = self.renderer.close().await {
            engine_warn!("harvest renderer close failed error={}", err);
        }
    }
}

