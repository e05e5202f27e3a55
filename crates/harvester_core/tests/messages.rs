use std::sync::Once;

use chrono::Utc;
use harvester_core::{
    absolutize, actor_listing_url, decode_path_segment, detail_url_for_code, encode_path_segment,
    escape_markdown, format_duration, format_video_message, new_listing_url, search_listing_url,
    NewVideo, Video,
};
use pretty_assertions::assert_eq;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

#[test]
fn markdown_specials_are_escaped() {
    init_logging();
    assert_eq!(escape_markdown("SSIS-001 (4K)!"), r"SSIS\-001 \(4K\)\!");
    assert_eq!(escape_markdown("plain"), "plain");
}

#[test]
fn durations_render_as_minutes_and_seconds() {
    init_logging();
    assert_eq!(format_duration(7231), "120:31");
    assert_eq!(format_duration(59), "0:59");
}

#[test]
fn message_skips_unknown_fields() {
    init_logging();
    let video = Video::from_new(
        1,
        NewVideo::from_code("SSIS-001").expect("valid code"),
        Utc::now(),
    );
    assert_eq!(format_video_message(&video), r"🎬 *SSIS\-001*");

    let mut full = video.clone();
    full.title = "Title.".to_string();
    full.actors = "A".to_string();
    full.tags = "T".to_string();
    full.duration_secs = 7200;
    full.detail_url = Some("https://example.com/ssis-001".to_string());
    assert_eq!(
        format_video_message(&full),
        [
            r"🎬 *SSIS\-001*",
            r"📝 Title\.",
            "👩 A",
            "🏷 T",
            "⏱ 120:00",
            r"🔗 https://example\.com/ssis\-001",
        ]
        .join("\n")
    );
}

#[test]
fn path_segments_round_trip_through_percent_encoding() {
    init_logging();
    let encoded = encode_path_segment("三上悠亜");
    assert_eq!(encoded, "%E4%B8%89%E4%B8%8A%E6%82%A0%E4%BA%9C");
    assert_eq!(decode_path_segment(&encoded).expect("utf-8"), "三上悠亜");
}

#[test]
fn listing_urls_follow_site_layout() {
    init_logging();
    let base = "https://example.com/";
    assert_eq!(new_listing_url(base, 1), "https://example.com/new");
    assert_eq!(new_listing_url(base, 3), "https://example.com/new?page=3");
    assert_eq!(
        actor_listing_url(base, "a b", 2),
        "https://example.com/actresses/a%20b?page=2"
    );
    assert_eq!(
        search_listing_url(base, "drama", 1),
        "https://example.com/search/drama"
    );
    assert_eq!(
        detail_url_for_code(base, "SSIS-001"),
        "https://example.com/ssis-001"
    );
}

#[test]
fn relative_links_are_made_absolute() {
    init_logging();
    let base = "https://example.com";
    assert_eq!(absolutize(base, "/v/1"), "https://example.com/v/1");
    assert_eq!(absolutize(base, "v/1"), "https://example.com/v/1");
    assert_eq!(
        absolutize(base, "//cdn.example.com/a.jpg"),
        "https://cdn.example.com/a.jpg"
    );
    assert_eq!(absolutize(base, "http://other/x"), "http://other/x");
    assert_eq!(absolutize(base, ""), "");
}
