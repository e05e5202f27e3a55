use std::sync::Once;

use harvester_core::{
    derive_code, extract_code, is_valid_code, normalize_code, parse_duration_secs,
    partition_drafts, NewVideo, VideoDraft,
};
use pretty_assertions::assert_eq;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

#[test]
fn normalization_is_idempotent() {
    init_logging();
    for raw in ["  ssis-001 ", "ABP-123", "fc2-ppv-99", "", "  "] {
        let once = normalize_code(raw);
        assert_eq!(normalize_code(&once), once);
    }
    assert_eq!(normalize_code("  ssis-001 "), "SSIS-001");
}

#[test]
fn codes_are_found_in_free_text() {
    init_logging();
    assert_eq!(
        extract_code("[4K] ssis-001 Lorem ipsum"),
        Some("SSIS-001".to_string())
    );
    assert_eq!(extract_code("no code in here"), None);
    assert!(is_valid_code("SSIS-001"));
    assert!(!is_valid_code("ssis-001"));
    assert!(!is_valid_code("SSIS001"));
}

#[test]
fn derivation_prefers_title_then_url_then_segment() {
    init_logging();
    assert_eq!(
        derive_code(Some("ABP-123 title"), Some("https://example.com/ssis-001")),
        Some("ABP-123".to_string())
    );
    assert_eq!(
        derive_code(Some("untitled"), Some("https://example.com/ssis-001")),
        Some("SSIS-001".to_string())
    );
    assert_eq!(
        derive_code(None, Some("https://example.com/videos/special")),
        Some("SPECIAL".to_string())
    );
    assert_eq!(derive_code(None, None), None);
}

#[test]
fn durations_are_stored_in_seconds() {
    init_logging();
    assert_eq!(parse_duration_secs("120分"), 7200);
    assert_eq!(parse_duration_secs("収録時間: 95 分"), 5700);
    assert_eq!(parse_duration_secs("2:00:31"), 7231);
    assert_eq!(parse_duration_secs("59:12"), 3552);
    assert_eq!(parse_duration_secs("150"), 9000);
    assert_eq!(parse_duration_secs("unknown"), 0);
}

#[test]
fn drafts_with_unusable_codes_are_rejected() {
    init_logging();
    let drafts = vec![
        VideoDraft {
            title: Some("ok".to_string()),
            actors: vec!["A".to_string(), "B".to_string()],
            cover_url: Some(" ".to_string()),
            ..VideoDraft::with_code("ssis-001")
        },
        VideoDraft::with_code("SPECIAL"),
        VideoDraft::default(),
    ];

    let (valid, rejected) = partition_drafts(drafts);

    assert_eq!(valid.len(), 1);
    assert_eq!(rejected.len(), 2);
    let video = &valid[0];
    assert_eq!(video.code, "SSIS-001");
    assert_eq!(video.actors, "A, B");
    assert_eq!(video.cover_url, None);
}

#[test]
fn minimal_record_from_code() {
    init_logging();
    let video = NewVideo::from_code("abp-1").expect("valid code");
    assert_eq!(video.code, "ABP-1");
    assert_eq!(video.title, "");
    assert!(NewVideo::from_code("not a code").is_err());
}
