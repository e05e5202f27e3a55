//! Test doubles shared by the engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harvester_core::{DestinationId, Video, VideoDraft, VideoId};
use harvester_engine::{
    FailureKind, FetchError, FetchMetadata, FetchedPage, Fetcher, HarvestError, Harvester,
    PageRenderer, RenderError, Transport, TransportError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

pub const BASE: &str = "https://site.example";

/// Listing page whose cards carry the given codes.
pub fn listing_html(codes: &[&str]) -> String {
    let cards: String = codes
        .iter()
        .map(|code| {
            format!(
                r#"<div class="video-card"><a href="{BASE}/{lower}"><img data-src="https://cdn.example/{lower}.jpg"></a><h3>{code} sample title</h3></div>"#,
                lower = code.to_lowercase()
            )
        })
        .collect();
    format!("<html><body>{cards}</body></html>")
}

pub fn detail_html(code: &str) -> String {
    format!(
        r#"<html><head><meta property="og:image" content="https://cdn.example/{lower}.jpg"></head>
<body><h1>{code} detail title</h1>
<a href="/actresses/someone">Someone</a>
<a href="/tags/drama">Drama</a>
<span>120分</span>
<video src="https://cdn.example/{lower}.mp4"></video></body></html>"#,
        lower = code.to_lowercase()
    )
}

pub fn video(id: VideoId, code: &str) -> Video {
    let now = Utc::now();
    Video {
        id,
        code: code.to_string(),
        title: format!("{code} title"),
        actors: "Someone".to_string(),
        tags: "Drama".to_string(),
        duration_secs: 0,
        cover_url: None,
        preview_url: None,
        detail_url: None,
        delivered: false,
        created_at: now,
        updated_at: now,
    }
}

fn page(url: &str, html: String) -> FetchedPage {
    FetchedPage {
        metadata: FetchMetadata {
            original_url: url.to_string(),
            final_url: url.to_string(),
            content_type: Some("text/html".to_string()),
            byte_len: html.len() as u64,
            encoding: "UTF-8".to_string(),
        },
        html,
    }
}

type Scripted = Result<String, FailureKind>;

/// Fetcher answering from per-URL scripts. Queued responses are consumed
/// first, then the sticky response; unknown URLs get a 404.
#[derive(Default)]
pub struct FakeFetcher {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sticky: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn always(&self, url: impl Into<String>, response: Scripted) {
        self.sticky.lock().unwrap().insert(url.into(), response);
    }

    pub fn then(&self, url: impl Into<String>, response: Scripted) {
        self.queued
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        let scripted = queued.or_else(|| self.sticky.lock().unwrap().get(url).cloned());
        match scripted {
            Some(Ok(html)) => Ok(page(url, html)),
            Some(Err(kind)) => Err(FetchError::new(kind, "scripted failure")),
            None => Err(FetchError::new(FailureKind::HttpStatus(404), "unscripted url")),
        }
    }
}

/// Renderer answering from a URL map; unknown URLs fail.
#[derive(Default)]
pub struct FakeRenderer {
    pages: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl FakeRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: impl Into<String>, html: String) {
        self.pages.lock().unwrap().insert(url.into(), html);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render_url(
        &self,
        url: &str,
        _wait_selector: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, RenderError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RenderError::Browser("no page".to_string()))
    }

    async fn reconnect(&self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(DestinationId, String),
    Markdown(DestinationId, String),
    Photo(DestinationId, String),
    Video(DestinationId, String, Option<String>),
}

impl Sent {
    pub fn destination(&self) -> DestinationId {
        match self {
            Sent::Text(d, _) | Sent::Markdown(d, _) | Sent::Photo(d, _) => *d,
            Sent::Video(d, _, _) => *d,
        }
    }
}

/// Transport that records every successful send. Sends of a kind listed in
/// `failing` fail, as do all sends to a destination in `failing_destinations`.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<Sent>>,
    failing_kinds: Mutex<Vec<&'static str>>,
    failing_destinations: Mutex<Vec<DestinationId>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_kind(&self, kind: &'static str) {
        self.failing_kinds.lock().unwrap().push(kind);
    }

    pub fn fail_destination(&self, destination: DestinationId) {
        self.failing_destinations.lock().unwrap().push(destination);
    }

    pub fn heal_destination(&self, destination: DestinationId) {
        self.failing_destinations
            .lock()
            .unwrap()
            .retain(|d| *d != destination);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn deliver(&self, kind: &'static str, sent: Sent) -> Result<(), TransportError> {
        if self.failing_kinds.lock().unwrap().contains(&kind)
            || self
                .failing_destinations
                .lock()
                .unwrap()
                .contains(&sent.destination())
        {
            return Err(TransportError::api(format!("{kind} rejected")));
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&self, destination: DestinationId, text: &str) -> Result<(), TransportError> {
        self.deliver("text", Sent::Text(destination, text.to_string()))
    }

    async fn send_markdown(
        &self,
        destination: DestinationId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.deliver("markdown", Sent::Markdown(destination, text.to_string()))
    }

    async fn send_photo(
        &self,
        destination: DestinationId,
        photo_url: &str,
        _caption: &str,
    ) -> Result<(), TransportError> {
        self.deliver("photo", Sent::Photo(destination, photo_url.to_string()))
    }

    async fn send_video(
        &self,
        destination: DestinationId,
        video_url: &str,
        thumbnail_url: Option<&str>,
        _caption: &str,
    ) -> Result<(), TransportError> {
        self.deliver(
            "video",
            Sent::Video(
                destination,
                video_url.to_string(),
                thumbnail_url.map(str::to_string),
            ),
        )
    }
}

/// Harvester returning fixed drafts. With `hold` set, every call waits for
/// `release` so tests can observe a cycle in flight.
#[derive(Default)]
pub struct FakeHarvester {
    drafts: Mutex<Vec<VideoDraft>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hold: AtomicBool,
    release: Notify,
    started: Notify,
    /// Drafts handed back as the partial result when cancelled.
    kept_on_cancel: AtomicUsize,
}

impl FakeHarvester {
    pub fn returning(codes: &[&str]) -> Arc<Self> {
        let harvester = Self::default();
        *harvester.drafts.lock().unwrap() = codes
            .iter()
            .map(|code| VideoDraft {
                title: Some(format!("{code} title")),
                ..VideoDraft::with_code(code)
            })
            .collect();
        Arc::new(harvester)
    }

    pub fn holding(codes: &[&str]) -> Arc<Self> {
        let harvester = Self::returning(codes);
        harvester.hold.store(true, Ordering::SeqCst);
        harvester
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn keep_on_cancel(&self, count: usize) {
        self.kept_on_cancel.store(count, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<Vec<VideoDraft>, HarvestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        let drafts = self.drafts.lock().unwrap().clone();

        let released = self.release.notified();
        tokio::pin!(released);
        released.as_mut().enable();
        let outcome = if self.hold.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let kept = self.kept_on_cancel.load(Ordering::SeqCst);
                    let partial = drafts.into_iter().take(kept).collect();
                    Err(HarvestError::Cancelled { partial })
                }
                _ = released => Ok(drafts),
            }
        } else {
            Ok(drafts)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl Harvester for FakeHarvester {
    async fn harvest_new_listing(
        &self,
        _pages: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        self.run(cancel).await
    }

    async fn harvest_detail(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError> {
        self.run(cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::NoRecord(url.to_string()))
    }

    async fn harvest_by_actor(
        &self,
        _name: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let mut drafts = self.run(cancel).await?;
        drafts.truncate(limit);
        Ok(drafts)
    }

    async fn harvest_by_keyword(
        &self,
        _keyword: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VideoDraft>, HarvestError> {
        let mut drafts = self.run(cancel).await?;
        drafts.truncate(limit);
        Ok(drafts)
    }

    async fn harvest_by_code(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoDraft, HarvestError> {
        self.harvest_detail(code, cancel).await
    }

    async fn close(&self) {}
}
