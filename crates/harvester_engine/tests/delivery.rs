mod support;

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{DeliveryOutcome, NewSubscription, NewVideo, RuleKind, Video};
use harvester_engine::{
    DeliveryEngine, DeliveryError, DeliverySettings, MemoryStore, PushOutcome, RateLimiter,
    Store, SweepReport,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use support::{init_logging, FakeTransport, Sent};

const PREVIEW: &str = "https://cdn.example/abc-001.mp4";
const COVER: &str = "https://cdn.example/abc-001.jpg";

struct Fixture {
    store: Arc<MemoryStore>,
    transport: Arc<FakeTransport>,
    engine: DeliveryEngine,
}

fn fixture() -> Fixture {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = FakeTransport::new();
    let engine = DeliveryEngine::new(
        store.clone(),
        transport.clone(),
        RateLimiter::new(1_000_000.0).expect("limiter"),
        DeliverySettings::default(),
    );
    Fixture {
        store,
        transport,
        engine,
    }
}

async fn saved(store: &MemoryStore, code: &str, media: bool) -> Video {
    let lower = code.to_lowercase();
    let new = NewVideo {
        title: format!("{code} title"),
        actors: "Someone, Other".to_string(),
        tags: "Drama".to_string(),
        cover_url: media.then(|| format!("https://cdn.example/{lower}.jpg")),
        preview_url: media.then(|| format!("https://cdn.example/{lower}.mp4")),
        ..NewVideo::from_code(code).expect("valid code")
    };
    store.save_video(new).await.expect("save");
    store
        .video_by_code(code)
        .await
        .expect("lookup")
        .expect("present")
}

async fn subscribe(store: &MemoryStore, destination: i64, rule: RuleKind, keyword: &str) {
    store
        .upsert_subscription(NewSubscription::new(destination, "private", rule, keyword))
        .await
        .expect("subscribe");
}

#[tokio::test]
async fn preview_clip_is_sent_with_the_cover_as_thumbnail() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", true).await;

    let outcome = fx
        .engine
        .push_to_destination(&video, 10, &CancellationToken::new())
        .await
        .expect("push");

    assert_eq!(outcome, PushOutcome::Delivered);
    assert_eq!(
        fx.transport.sent(),
        vec![Sent::Video(10, PREVIEW.to_string(), Some(COVER.to_string()))]
    );
}

#[tokio::test]
async fn rejected_clip_falls_back_to_photo_then_text() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", true).await;
    let cancel = CancellationToken::new();

    fx.transport.fail_kind("video");
    fx.engine
        .push_to_destination(&video, 10, &cancel)
        .await
        .expect("push");

    fx.transport.fail_kind("photo");
    fx.engine
        .push_to_destination(&video, 11, &cancel)
        .await
        .expect("push");

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], Sent::Photo(10, COVER.to_string()));
    assert!(matches!(&sent[1], Sent::Markdown(11, text) if text.contains("ABC\\-001")));
}

#[tokio::test]
async fn record_without_media_goes_straight_to_text() {
    let fx = fixture();
    let video = saved(&fx.store, "XYZ-999", false).await;

    fx.engine
        .push_to_destination(&video, 10, &CancellationToken::new())
        .await
        .expect("push");

    let sent = fx.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0], Sent::Markdown(10, _)));
}

#[tokio::test]
async fn each_push_records_exactly_one_attempt() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", true).await;
    let cancel = CancellationToken::new();

    for kind in ["video", "photo", "markdown"] {
        fx.transport.fail_kind(kind);
    }
    let failed = fx
        .engine
        .push_to_destination(&video, 10, &cancel)
        .await
        .expect("push");
    assert!(matches!(failed, PushOutcome::Failed(ref reason) if reason.contains("markdown")));
    assert!(!failed.is_success());

    let attempts = fx.store.delivery_attempts(video.id).await.expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, DeliveryOutcome::Failed);
    assert_eq!(attempts[0].destination, 10);
}

#[tokio::test]
async fn delivered_pair_is_never_sent_again() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", true).await;
    let cancel = CancellationToken::new();

    let first = fx
        .engine
        .push_to_destination(&video, 10, &cancel)
        .await
        .expect("push");
    let second = fx
        .engine
        .push_to_destination(&video, 10, &cancel)
        .await
        .expect("push");

    assert_eq!(first, PushOutcome::Delivered);
    assert_eq!(second, PushOutcome::AlreadyDelivered);
    assert!(second.is_success());
    assert_eq!(fx.transport.sent().len(), 1);
    assert_eq!(
        fx.store.delivery_attempts(video.id).await.expect("attempts").len(),
        1
    );
}

#[tokio::test]
async fn destinations_are_matched_once_each() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", false).await;
    subscribe(&fx.store, 1, RuleKind::All, "").await;
    subscribe(&fx.store, 1, RuleKind::Tag, "drama").await;
    subscribe(&fx.store, 2, RuleKind::Actor, "someone").await;
    subscribe(&fx.store, 3, RuleKind::Actor, "nobody").await;

    let subs = fx.store.enabled_subscriptions().await.expect("subs");
    assert_eq!(DeliveryEngine::matching_destinations(&video, &subs), vec![1, 2]);
}

#[tokio::test]
async fn sweep_delivers_and_marks_complete_records() {
    let fx = fixture();
    saved(&fx.store, "ABC-001", false).await;
    subscribe(&fx.store, 1, RuleKind::All, "").await;
    subscribe(&fx.store, 1, RuleKind::Tag, "drama").await;
    subscribe(&fx.store, 2, RuleKind::Actor, "someone").await;

    let report = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect("sweep");

    assert_eq!(
        report,
        SweepReport {
            records: 1,
            marked_delivered: 1,
            sent: 2,
            ..SweepReport::default()
        }
    );
    let destinations: Vec<i64> = fx.transport.sent().iter().map(Sent::destination).collect();
    assert_eq!(destinations, vec![1, 2]);
    assert!(fx.store.undelivered_videos().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_failure_is_retried_only_where_it_failed() {
    let fx = fixture();
    let video = saved(&fx.store, "ABC-001", false).await;
    subscribe(&fx.store, 1, RuleKind::All, "").await;
    subscribe(&fx.store, 2, RuleKind::All, "").await;
    fx.transport.fail_destination(2);
    let cancel = CancellationToken::new();

    let first = fx.engine.sweep_unsent(&cancel).await.expect("sweep");
    assert_eq!((first.sent, first.failed, first.marked_delivered), (1, 1, 0));
    assert_eq!(fx.store.undelivered_videos().await.expect("list").len(), 1);

    fx.transport.heal_destination(2);
    let second = fx.engine.sweep_unsent(&cancel).await.expect("sweep");
    assert_eq!(
        (second.already_delivered, second.sent, second.marked_delivered),
        (1, 1, 1)
    );

    let destinations: Vec<i64> = fx.transport.sent().iter().map(Sent::destination).collect();
    assert_eq!(destinations, vec![1, 2]);
    assert!(fx.store.has_delivered(video.id, 2).await.expect("lookup"));
    assert!(fx.store.undelivered_videos().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn sends_to_one_destination_are_paced() {
    let fx = fixture();
    saved(&fx.store, "AAA-001", false).await;
    saved(&fx.store, "AAA-002", false).await;
    saved(&fx.store, "AAA-003", false).await;
    subscribe(&fx.store, 1, RuleKind::All, "").await;

    let started = tokio::time::Instant::now();
    let report = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect("sweep");

    assert_eq!(report.sent, 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn different_destinations_are_not_paced() {
    let fx = fixture();
    saved(&fx.store, "AAA-001", false).await;
    for destination in 1..=3 {
        subscribe(&fx.store, destination, RuleKind::All, "").await;
    }

    let started = tokio::time::Instant::now();
    let report = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect("sweep");

    assert_eq!(report.sent, 3);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn record_without_subscribers_is_marked_delivered() {
    let fx = fixture();
    saved(&fx.store, "ABC-001", false).await;

    let report = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect("sweep");

    assert_eq!(report.marked_delivered, 1);
    assert_eq!(report.sent, 0);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test]
async fn empty_backlog_is_a_no_op() {
    let fx = fixture();
    let report = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect("sweep");
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn unavailable_store_aborts_the_sweep() {
    let fx = fixture();
    saved(&fx.store, "ABC-001", false).await;
    fx.store.set_unavailable(true);

    let err = fx
        .engine
        .sweep_unsent(&CancellationToken::new())
        .await
        .expect_err("store down");

    assert!(matches!(err, DeliveryError::Store(_)));
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test]
async fn cancelled_sweep_sends_nothing() {
    let fx = fixture();
    saved(&fx.store, "ABC-001", false).await;
    subscribe(&fx.store, 1, RuleKind::All, "").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx.engine.sweep_unsent(&cancel).await.expect_err("cancelled");

    assert!(matches!(err, DeliveryError::Cancelled));
    assert!(fx.transport.sent().is_empty());
    assert_eq!(fx.store.undelivered_videos().await.expect("list").len(), 1);
}
