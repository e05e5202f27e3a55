//! Bot command handling: subscriptions, browsing the store, manual harvests.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_logging::{engine_error, engine_info, engine_warn};
use harvester_core::{
    escape_markdown, parse_subscription_arg, truncate_chars, Command, DestinationId,
    HarvestRequest, NewSubscription, RuleKind, SubscriptionKey, LATEST_PAGE_SIZE,
    SEARCH_RESULT_LIMIT,
};
use harvester_engine::{
    Chat, HarvestReport, ManualHarvestError, Message, Scheduler, SchedulerState, Store, Transport,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const HELP_TEXT: &str = r"🤖 *Harvester bot*

*Subscriptions*
/subscribe \- every new release
/subscribe name \- releases featuring an actor
/subscribe \#tag \- releases carrying a tag
/unsubscribe \- drop all subscriptions
/unsubscribe name or \#tag \- drop one subscription
/list \- show your subscriptions

*Browsing*
/search keyword \- search stored releases \(up to 10\)
/latest \[page\] \- newest stored releases

*Harvesting*
/crawl new \| actor name \| code ABC\-123 \| search keyword \- harvest now
/status \- bot statistics

_Groups are subscribed to everything on their first message\._";

const CRAWL_USAGE: &str = "Usage: /crawl new | actor NAME | code CODE | search KEYWORD";
const TITLE_PREVIEW_CHARS: usize = 50;

pub struct CommandHandler {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<Scheduler>,
    /// Handed to manual harvests so shutdown can interrupt them.
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<Scheduler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            scheduler,
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Handle one incoming message. Manual harvest reports are spawned onto
    /// `tasks`.
    pub async fn handle(&self, message: &Message, tasks: &mut JoinSet<()>) {
        let chat = &message.chat;
        match message.text.as_deref().and_then(Command::parse) {
            Some(command) => {
                engine_info!("command chat={} command={:?}", chat.id, command);
                self.dispatch(command, chat, tasks).await;
            }
            None if chat.is_group() => self.auto_subscribe(chat).await,
            None => {}
        }
    }

    async fn dispatch(&self, command: Command, chat: &Chat, tasks: &mut JoinSet<()>) {
        match command {
            Command::Help => self.reply_markdown(chat.id, HELP_TEXT).await,
            Command::Subscribe(args) => self.subscribe(chat, &args).await,
            Command::Unsubscribe(args) => self.unsubscribe(chat.id, &args).await,
            Command::List => self.list(chat.id).await,
            Command::Search(keyword) => self.search(chat.id, keyword.trim()).await,
            Command::Latest { page } => self.latest(chat.id, page).await,
            Command::Crawl(args) => self.crawl(chat.id, &args, tasks).await,
            Command::Status => self.status(chat.id).await,
            Command::Unknown(name) => {
                engine_info!("command chat={} unknown={}", chat.id, name);
                self.reply_error(chat.id, "Unknown command. Use /help to see what I can do.")
                    .await;
            }
        }
    }

    async fn subscribe(&self, chat: &Chat, args: &str) {
        let (rule, keyword) = parse_subscription_arg(args);
        if rule != RuleKind::All && keyword.is_empty() {
            self.reply_error(chat.id, "Give an actor name or a #tag to subscribe to.")
                .await;
            return;
        }

        let request = NewSubscription::new(chat.id, chat.kind.clone(), rule, keyword.clone());
        if let Err(err) = self.store.upsert_subscription(request).await {
            engine_error!("subscribe failed chat={} error={}", chat.id, err);
            self.reply_error(chat.id, "Could not save the subscription. Please try again.")
                .await;
            return;
        }

        let confirmation = match rule {
            RuleKind::All => "✅ Subscribed to all new releases.".to_string(),
            RuleKind::Actor => format!("✅ Subscribed to actor: {keyword}"),
            RuleKind::Tag => format!("✅ Subscribed to tag: #{keyword}"),
        };
        self.reply_text(chat.id, &confirmation).await;
    }

    async fn unsubscribe(&self, destination: DestinationId, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            match self.store.delete_all_subscriptions(destination).await {
                Ok(removed) => {
                    engine_info!("unsubscribed chat={} removed={}", destination, removed);
                    self.reply_text(destination, "✅ Unsubscribed from all notifications.")
                        .await;
                }
                Err(err) => {
                    engine_error!("unsubscribe failed chat={} error={}", destination, err);
                    self.reply_error(destination, "Could not unsubscribe. Please try again.")
                        .await;
                }
            }
            return;
        }

        let (rule, keyword) = parse_subscription_arg(args);
        let key = SubscriptionKey::new(destination, rule, keyword);
        match self.store.delete_subscription(&key).await {
            Ok(true) => {
                self.reply_text(destination, &format!("✅ Unsubscribed from: {args}"))
                    .await;
            }
            Ok(false) => {
                self.reply_text(destination, &format!("ℹ️ No subscription matches: {args}"))
                    .await;
            }
            Err(err) => {
                engine_error!("unsubscribe failed chat={} error={}", destination, err);
                self.reply_error(destination, "Could not unsubscribe. Please try again.")
                    .await;
            }
        }
    }

    async fn list(&self, destination: DestinationId) {
        let subscriptions = match self.store.subscriptions_for(destination).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                engine_error!("list failed chat={} error={}", destination, err);
                self.reply_error(destination, "Could not load your subscriptions.")
                    .await;
                return;
            }
        };
        if subscriptions.is_empty() {
            self.reply_text(
                destination,
                "📭 You have no active subscriptions.\nUse /subscribe to start receiving releases.",
            )
            .await;
            return;
        }

        let mut lines = vec!["📋 *Your subscriptions*\n".to_string()];
        for (i, subscription) in subscriptions.iter().enumerate() {
            let keyword = escape_markdown(&subscription.keyword);
            let entry = match subscription.rule {
                RuleKind::All => "🌐 All releases".to_string(),
                RuleKind::Actor => format!("👩 Actor: {keyword}"),
                RuleKind::Tag => format!("🏷 Tag: \\#{keyword}"),
            };
            lines.push(format!("{}\\. {entry}", i + 1));
        }
        self.reply_markdown(destination, &lines.join("\n")).await;
    }

    async fn search(&self, destination: DestinationId, keyword: &str) {
        if keyword.is_empty() {
            self.reply_error(destination, "Give a keyword, for example: /search ABC-123")
                .await;
            return;
        }
        let videos = match self.store.search_videos(keyword, SEARCH_RESULT_LIMIT).await {
            Ok(videos) => videos,
            Err(err) => {
                engine_error!("search failed chat={} keyword={} error={}", destination, keyword, err);
                self.reply_error(destination, "Search failed. Please try again.")
                    .await;
                return;
            }
        };
        if videos.is_empty() {
            self.reply_text(destination, &format!("🔍 Nothing found for: {keyword}"))
                .await;
            return;
        }

        let mut lines = vec![format!("🔍 *Results for {}*\n", escape_markdown(keyword))];
        for (i, video) in videos.iter().enumerate() {
            let mut line = format!("{}\\. *{}*", i + 1, escape_markdown(&video.code));
            if !video.title.is_empty() {
                let title = truncate_chars(&video.title, TITLE_PREVIEW_CHARS);
                line.push_str(&format!("\n   {}", escape_markdown(&title)));
            }
            lines.push(line);
        }
        self.reply_markdown(destination, &lines.join("\n")).await;
    }

    async fn latest(&self, destination: DestinationId, page: u32) {
        let page = page.max(1);
        let offset = (page as usize - 1) * LATEST_PAGE_SIZE;
        let videos = match self.store.latest_videos(LATEST_PAGE_SIZE, offset).await {
            Ok(videos) => videos,
            Err(err) => {
                engine_error!("latest failed chat={} error={}", destination, err);
                self.reply_error(destination, "Could not load the latest releases.")
                    .await;
                return;
            }
        };
        if videos.is_empty() {
            self.reply_text(destination, "📭 No releases found.").await;
            return;
        }

        let mut lines = vec![format!("📺 *Latest releases \\(page {page}\\)*\n")];
        for (i, video) in videos.iter().enumerate() {
            let mut line = format!("{}\\. *{}*", i + 1, escape_markdown(&video.code));
            if !video.actors.is_empty() {
                line.push_str(&format!(" \\- {}", escape_markdown(&video.actors)));
            }
            if let Some(url) = video.detail_url.as_deref() {
                line.push_str(&format!("\n   🔗 {}", escape_markdown(url)));
            }
            lines.push(line);
        }
        if videos.len() == LATEST_PAGE_SIZE {
            lines.push(format!("\n_Use /latest {} for the next page_", page + 1));
        }
        self.reply_markdown(destination, &lines.join("\n")).await;
    }

    async fn crawl(&self, destination: DestinationId, args: &str, tasks: &mut JoinSet<()>) {
        let request = match HarvestRequest::from_crawl_args(args) {
            Ok(request) => request,
            Err(err) => {
                self.reply_error(destination, &format!("{err}. {CRAWL_USAGE}"))
                    .await;
                return;
            }
        };
        let description = request.describe();
        let Some(handle) = self
            .scheduler
            .spawn_harvest(request, self.shutdown.child_token())
        else {
            self.reply_text(
                destination,
                "⏳ A harvest is already running. Try again in a few minutes.",
            )
            .await;
            return;
        };

        engine_info!("crawl accepted chat={} request={}", destination, description);
        self.reply_text(
            destination,
            &format!("🔄 Harvesting {description}. This may take a moment."),
        )
        .await;
        tasks.spawn(report_harvest(
            Arc::clone(&self.transport),
            destination,
            handle,
        ));
    }

    async fn status(&self, destination: DestinationId) {
        let stored = match self.store.count_videos().await {
            Ok(count) => count.to_string(),
            Err(err) => {
                engine_error!("status count failed error={}", err);
                "unknown".to_string()
            }
        };
        let harvester = match self.scheduler.state() {
            SchedulerState::Running => "harvesting now",
            SchedulerState::Idle => "idle",
        };
        let interval_mins = self.scheduler.settings().interval.as_secs() / 60;
        let lines = [
            "📊 *Bot status*\n".to_string(),
            format!("🎬 Releases stored: {}", escape_markdown(&stored)),
            format!(
                "⏱ Uptime: {}",
                escape_markdown(&format_uptime(Utc::now() - self.started_at))
            ),
            format!(
                "🕐 Started: {}",
                escape_markdown(&self.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            ),
            format!(
                "🔁 Harvester: {harvester}, every {interval_mins} min"
            ),
        ];
        self.reply_markdown(destination, &lines.join("\n")).await;
    }

    /// Subscribe a group to everything the first time it talks, unless it
    /// already holds a subscription.
    async fn auto_subscribe(&self, chat: &Chat) {
        match self.store.subscriptions_for(chat.id).await {
            Ok(existing) if !existing.is_empty() => {}
            Ok(_) => {
                let request = NewSubscription::new(chat.id, chat.kind.clone(), RuleKind::All, "");
                match self.store.upsert_subscription(request).await {
                    Ok(_) => engine_info!("auto-subscribed group chat={}", chat.id),
                    Err(err) => {
                        engine_error!("auto-subscribe failed chat={} error={}", chat.id, err)
                    }
                }
            }
            Err(err) => engine_error!(
                "auto-subscribe lookup failed chat={} error={}",
                chat.id,
                err
            ),
        }
    }

    async fn reply_text(&self, destination: DestinationId, text: &str) {
        if let Err(err) = self.transport.send_text(destination, text).await {
            engine_warn!("reply failed chat={} error={}", destination, err);
        }
    }

    async fn reply_markdown(&self, destination: DestinationId, text: &str) {
        if let Err(err) = self.transport.send_markdown(destination, text).await {
            engine_warn!("reply failed chat={} error={}", destination, err);
        }
    }

    async fn reply_error(&self, destination: DestinationId, text: &str) {
        self.reply_text(destination, &format!("❌ {text}")).await;
    }
}

/// Wait for a manual harvest and tell the requesting chat how it went.
async fn report_harvest(
    transport: Arc<dyn Transport>,
    destination: DestinationId,
    handle: JoinHandle<Result<HarvestReport, ManualHarvestError>>,
) {
    let text = match handle.await {
        Ok(Ok(report)) if report.found == 0 => {
            format!("📭 No releases found for {}.", report.request.describe())
        }
        Ok(Ok(report)) => format!(
            "✅ Harvest complete: {}\n📊 Found: {}\n💾 Saved: {} new\n🔄 Duplicates: {}",
            report.request.describe(),
            report.found,
            report.saved,
            report.duplicates
        ),
        Ok(Err(ManualHarvestError::Cancelled(report))) => format!(
            "⏹ Harvest interrupted: {}\n📊 Found: {}\n💾 Saved: {} new",
            report.request.describe(),
            report.found,
            report.saved
        ),
        Ok(Err(err)) => {
            engine_warn!("crawl failed chat={} error={}", destination, err);
            format!("❌ Harvest failed: {err}")
        }
        Err(err) => {
            engine_error!("crawl task ended abnormally chat={} error={}", destination, err);
            "❌ Harvest failed unexpectedly.".to_string()
        }
    };
    if let Err(err) = transport.send_text(destination, &text).await {
        engine_warn!("crawl report failed chat={} error={}", destination, err);
    }
}

/// `Xd Yh Zm`, leading zero units dropped.
fn format_uptime(elapsed: chrono::Duration) -> String {
    let total_mins = elapsed.num_minutes().max(0);
    let days = total_mins / (24 * 60);
    let hours = (total_mins / 60) % 24;
    let mins = total_mins % 60;
    if days > 0 {
        format!("{days}d {hours}h {mins}m")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, Once};

    use async_trait::async_trait;
    use harvester_core::VideoDraft;
    use harvester_engine::{
        DeliveryEngine, DeliverySettings, HarvestError, Harvester, MemoryStore, RateLimiter,
        SchedulerSettings, TransportError,
    };
    use tokio::sync::Notify;

    use super::*;

    pub fn init_logging() {
        static INIT: Once = Once::new();
        INIT.call_once(engine_logging::initialize_for_tests);
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Reply {
        Text(DestinationId, String),
        Markdown(DestinationId, String),
    }

    impl Reply {
        pub fn text(&self) -> &str {
            match self {
                Reply::Text(_, text) | Reply::Markdown(_, text) => text,
            }
        }
    }

    #[derive(Default)]
    pub struct RecordingTransport {
        replies: Mutex<Vec<Reply>>,
    }

    impl RecordingTransport {
        pub fn replies(&self) -> Vec<Reply> {
            self.replies.lock().unwrap().clone()
        }

        pub fn last(&self) -> Reply {
            self.replies().pop().expect("at least one reply")
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_text(
            &self,
            destination: DestinationId,
            text: &str,
        ) -> Result<(), TransportError> {
            self.replies
                .lock()
                .unwrap()
                .push(Reply::Text(destination, text.to_string()));
            Ok(())
        }

        async fn send_markdown(
            &self,
            destination: DestinationId,
            text: &str,
        ) -> Result<(), TransportError> {
            self.replies
                .lock()
                .unwrap()
                .push(Reply::Markdown(destination, text.to_string()));
            Ok(())
        }

        async fn send_photo(
            &self,
            _destination: DestinationId,
            _photo_url: &str,
            _caption: &str,
        ) -> Result<(), TransportError> {
            Err(TransportError::api("photos are not expected here"))
        }

        async fn send_video(
            &self,
            _destination: DestinationId,
            _video_url: &str,
            _thumbnail_url: Option<&str>,
            _caption: &str,
        ) -> Result<(), TransportError> {
            Err(TransportError::api("videos are not expected here"))
        }
    }

    /// Harvester returning fixed drafts, optionally held until released.
    #[derive(Default)]
    pub struct StubHarvester {
        drafts: Vec<VideoDraft>,
        held: AtomicBool,
        released: Notify,
        calls: AtomicUsize,
    }

    impl StubHarvester {
        pub fn hold(&self) {
            self.held.store(true, Ordering::SeqCst);
        }

        pub fn release(&self) {
            self.held.store(false, Ordering::SeqCst);
            self.released.notify_waiters();
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn drafts(
            &self,
            limit: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<VideoDraft>, HarvestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                if !self.held.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(HarvestError::Cancelled { partial: Vec::new() });
                    }
                    _ = released => {}
                }
            }
            Ok(self.drafts.iter().take(limit).cloned().collect())
        }
    }

    #[async_trait]
    impl Harvester for StubHarvester {
        async fn harvest_new_listing(
            &self,
            _pages: u32,
            cancel: &CancellationToken,
        ) -> Result<Vec<VideoDraft>, HarvestError> {
            self.drafts(usize::MAX, cancel).await
        }

        async fn harvest_detail(
            &self,
            url: &str,
            cancel: &CancellationToken,
        ) -> Result<VideoDraft, HarvestError> {
            self.drafts(1, cancel)
                .await?
                .pop()
                .ok_or_else(|| HarvestError::NoRecord(url.to_string()))
        }

        async fn harvest_by_actor(
            &self,
            _name: &str,
            limit: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<VideoDraft>, HarvestError> {
            self.drafts(limit, cancel).await
        }

        async fn harvest_by_keyword(
            &self,
            _keyword: &str,
            limit: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<VideoDraft>, HarvestError> {
            self.drafts(limit, cancel).await
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

    pub struct Fixture {
        pub handler: Arc<CommandHandler>,
        pub store: Arc<MemoryStore>,
        pub transport: Arc<RecordingTransport>,
        pub harvester: Arc<StubHarvester>,
        pub scheduler: Arc<Scheduler>,
    }

    pub fn handler_fixture(codes: &[&str]) -> Fixture {
        init_logging();
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let harvester = Arc::new(StubHarvester {
            drafts: codes
                .iter()
                .map(|code| VideoDraft {
                    title: Some(format!("{code} title")),
                    ..VideoDraft::with_code(code)
                })
                .collect(),
            ..StubHarvester::default()
        });
        let delivery = Arc::new(DeliveryEngine::new(
            store.clone(),
            transport.clone(),
            RateLimiter::new(1_000_000.0).expect("limiter"),
            DeliverySettings::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            harvester.clone(),
            store.clone(),
            delivery,
            SchedulerSettings::default(),
        ));
        let handler = Arc::new(CommandHandler::new(
            store.clone(),
            transport.clone(),
            scheduler.clone(),
            CancellationToken::new(),
        ));
        Fixture {
            handler,
            store,
            transport,
            harvester,
            scheduler,
        }
    }
}
