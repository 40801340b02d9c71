mod common;

use std::sync::Arc;
use std::time::Duration;

use clipfetch::{BatchItemResult, HistoryStore, MatchStrategy, ProgressEvent, RequestOutcome};
use common::{coordinator, drain, files_in, payload, test_config, RangedFile};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_file(server: &MockServer, file_path: &str, data: Vec<u8>) {
    Mock::given(method("HEAD"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(RangedFile::new(data))
        .mount(server)
        .await;
}

async fn answer(server: &MockServer, source_url: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/download"))
        .and(body_partial_json(json!({ "url": source_url })))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn posts(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .count()
}

#[tokio::test]
async fn same_video_id_is_skipped_before_transfer() {
    let server = MockServer::start().await;
    answer(
        &server,
        "https://share.example/a",
        json!({ "filename": "clip_12345678901234567890.mp4" }),
    )
    .await;
    answer(
        &server,
        "https://share.example/b",
        json!({ "filename": "Another title_12345678901234567890.mp4" }),
    )
    .await;
    Mock::given(method("HEAD"))
        .and(path("/files/clip_12345678901234567890.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(2048)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/clip_12345678901234567890.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(2048)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let history = Arc::new(HistoryStore::in_memory());
    let coordinator = coordinator(&config, history.clone());

    let first = coordinator.submit("https://share.example/a").outcome().await;
    assert!(first.is_success(), "{:?}", first);
    let records = history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].video_id.as_deref(), Some("12345678901234567890"));

    let second = coordinator.submit("https://share.example/b").outcome().await;
    match second {
        RequestOutcome::Duplicate { matched_by, .. } => assert_eq!(matched_by, MatchStrategy::VideoId),
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(files_in(dir.path()), vec!["clip_12345678901234567890.mp4".to_string()]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    answer(&server, "https://share.example/retry", json!({ "filename": "retry_clip.mp4" })).await;
    serve_file(&server, "/files/retry_clip.mp4", payload(4096)).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let history = Arc::new(HistoryStore::in_memory());
    let coordinator = coordinator(&config, history.clone());

    let outcome = coordinator.submit("https://share.example/retry").outcome().await;
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(posts(&server).await, 3);
    assert_eq!(history.records().len(), 1);
    assert_eq!(std::fs::read(dir.path().join("retry_clip.mp4")).unwrap(), payload(4096));
}

#[tokio::test]
async fn retries_stop_at_the_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let history = Arc::new(HistoryStore::in_memory());
    let coordinator = coordinator(&config, history.clone());

    let outcome = coordinator.submit("https://share.example/down").outcome().await;
    assert!(matches!(outcome, RequestOutcome::Failed { .. }), "{:?}", outcome);
    assert_eq!(posts(&server).await, 3);
    assert!(history.records().is_empty());
}

#[tokio::test]
async fn photo_post_is_rejected_without_retry() {
    let server = MockServer::start().await;
    answer(
        &server,
        "https://share.example/photo",
        json!({ "error": "Only video posts can be downloaded, not photo posts" }),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let coordinator = coordinator(&config, Arc::new(HistoryStore::in_memory()));
    let mut rx = coordinator.subscribe();

    let outcome = coordinator.submit("https://share.example/photo").outcome().await;
    match &outcome {
        RequestOutcome::Unsupported { message, .. } => assert!(message.contains("photo")),
        other => panic!("expected unsupported, got {:?}", other),
    }
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    assert!(files_in(dir.path()).is_empty());

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Started { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn multi_file_post_reports_partial_success() {
    let server = MockServer::start().await;
    answer(
        &server,
        "https://share.example/carousel",
        json!({
            "type": "multi_image",
            "platform": "Instagram",
            "files": [
                { "filename": "post_image_1.jpg", "download_url": "/files/post_image_1.jpg", "type": "image" },
                { "filename": "post_image_2.jpg", "download_url": "/files/post_image_2.jpg", "type": "image" },
                { "filename": "post_image_3.jpg", "download_url": "/files/post_image_3.jpg", "type": "image" }
            ]
        }),
    )
    .await;
    serve_file(&server, "/files/post_image_1.jpg", payload(1000)).await;
    serve_file(&server, "/files/post_image_3.jpg", payload(3000)).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let history = Arc::new(HistoryStore::in_memory());
    let coordinator = coordinator(&config, history.clone());
    let mut rx = coordinator.subscribe();

    let outcome = coordinator.submit("https://share.example/carousel").outcome().await;
    match &outcome {
        RequestOutcome::PartialSuccess { files, summary } => {
            assert_eq!(files.len(), 2);
            assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 1, 0));
        }
        other => panic!("expected partial success, got {:?}", other),
    }
    assert_eq!(
        files_in(dir.path()),
        vec!["post_image_1.jpg".to_string(), "post_image_3.jpg".to_string()]
    );
    assert_eq!(history.records().len(), 2);

    // One terminal event per file, one Finished for the request.
    let events = drain(&mut rx);
    let terminal = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Completed { .. } | ProgressEvent::Error { .. }))
        .count();
    assert_eq!(terminal, 3);
    assert!(matches!(events.last(), Some(ProgressEvent::Finished { .. })));
}

#[tokio::test]
async fn concurrency_never_exceeds_the_bound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "filename": "tiktok.mp4" }))
                .set_delay(Duration::from_millis(150)),
        )
        .mount(&server)
        .await;
    serve_file(&server, "/files/tiktok.mp4", payload(512)).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), dir.path());
    config.max_concurrent_downloads = 2;
    let coordinator = coordinator(&config, Arc::new(HistoryStore::in_memory()));

    let urls: Vec<String> = (0..6).map(|i| format!("https://share.example/v{}", i)).collect();
    let results = coordinator.submit_batch(urls).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| matches!(r, BatchItemResult::Success { .. })));
    assert_eq!(coordinator.peak_running(), 2);
    assert_eq!(coordinator.in_flight(), 0);
    // Generic names never dedup, so every copy lands under its own name.
    assert_eq!(files_in(dir.path()).len(), 6);
}

#[tokio::test]
async fn cancelling_a_queued_request_finishes_it_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), dir.path());
    config.max_concurrent_downloads = 1;
    let coordinator = coordinator(&config, Arc::new(HistoryStore::in_memory()));
    let mut rx = coordinator.subscribe();

    let running = coordinator.submit("https://share.example/first");
    let queued = coordinator.submit("https://share.example/second");
    let queued_id = queued.id;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.cancel(queued_id));
    assert_eq!(queued.outcome().await, RequestOutcome::Cancelled);

    coordinator.cancel_all();
    assert_eq!(running.outcome().await, RequestOutcome::Cancelled);
    coordinator.shutdown().await;

    let finished: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
        .collect();
    assert_eq!(finished.len(), 2);
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test]
async fn long_name_from_another_url_matches_by_prefix() {
    let server = MockServer::start().await;
    answer(
        &server,
        "https://share.example/hike",
        json!({ "filename": "Weekend hiking trip in the mountains part one.mp4" }),
    )
    .await;
    answer(
        &server,
        "https://mirror.example/hike",
        json!({ "filename": "Weekend hiking trip in the mountains - remastered.mp4" }),
    )
    .await;
    Mock::given(method("HEAD"))
        .and(path("/files/Weekend%20hiking%20trip%20in%20the%20mountains%20part%20one.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/Weekend%20hiking%20trip%20in%20the%20mountains%20part%20one.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let coordinator = coordinator(&config, Arc::new(HistoryStore::in_memory()));

    let first = coordinator.submit("https://share.example/hike").outcome().await;
    assert!(first.is_success(), "{:?}", first);

    let second = coordinator.submit("https://mirror.example/hike").outcome().await;
    match second {
        RequestOutcome::Duplicate { matched_by, .. } => assert_eq!(matched_by, MatchStrategy::FilenamePrefix),
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(files_in(dir.path()).len(), 1);
}

#[tokio::test]
async fn generic_name_is_caught_by_url_hash() {
    let server = MockServer::start().await;
    answer(&server, "https://share.example/same", json!({ "filename": "video.mp4" })).await;
    Mock::given(method("HEAD"))
        .and(path("/files/video.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/video.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let coordinator = coordinator(&config, Arc::new(HistoryStore::in_memory()));

    let first = coordinator.submit("https://share.example/same").outcome().await;
    assert!(first.is_success(), "{:?}", first);

    let second = coordinator.submit("https://share.example/same").outcome().await;
    match second {
        RequestOutcome::Duplicate { matched_by, .. } => assert_eq!(matched_by, MatchStrategy::UrlHash),
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(files_in(dir.path()), vec!["video.mp4".to_string()]);
}

#[tokio::test]
async fn multi_file_post_ignores_url_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .and(body_partial_json(json!({ "url": "https://share.example/post" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "filename": "Morning run along the river bank.mp4" })),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    answer(
        &server,
        "https://share.example/post",
        json!({
            "type": "multi_image",
            "files": [
                { "filename": "river_image_1.jpg", "download_url": "/files/river_image_1.jpg", "type": "image" },
                { "filename": "river_image_2.jpg", "download_url": "/files/river_image_2.jpg", "type": "image" }
            ]
        }),
    )
    .await;
    serve_file(&server, "/files/Morning%20run%20along%20the%20river%20bank.mp4", payload(2048)).await;
    serve_file(&server, "/files/river_image_1.jpg", payload(100)).await;
    serve_file(&server, "/files/river_image_2.jpg", payload(200)).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path());
    let history = Arc::new(HistoryStore::in_memory());
    let coordinator = coordinator(&config, history.clone());

    let single = coordinator.submit("https://share.example/post").outcome().await;
    assert!(single.is_success(), "{:?}", single);
    assert!(history.is_duplicate_by_url_hash("https://share.example/post"));

    let multi = coordinator.submit("https://share.example/post").outcome().await;
    match &multi {
        RequestOutcome::Completed { files } => assert_eq!(files.len(), 2),
        other => panic!("expected both frames downloaded, got {:?}", other),
    }
    assert_eq!(files_in(dir.path()).len(), 3);
    assert_eq!(history.records().len(), 3);
}

#[tokio::test]
async fn history_file_survives_a_restart() {
    let server = MockServer::start().await;
    answer(
        &server,
        "https://share.example/keep",
        json!({ "filename": "clip_kJ4bR7xQ2mZ.mp4" }),
    )
    .await;
    serve_file(&server, "/files/clip_kJ4bR7xQ2mZ.mp4", payload(2048)).await;

    let dir = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let history_path = state.path().join("history.json");
    let config = test_config(&server.uri(), dir.path());
    let coordinator = coordinator(&config, Arc::new(HistoryStore::open(&history_path).unwrap()));

    let outcome = coordinator.submit("https://share.example/keep").outcome().await;
    assert!(outcome.is_success(), "{:?}", outcome);
    coordinator.shutdown().await;

    let reopened = HistoryStore::open(&history_path).unwrap();
    assert!(reopened.is_duplicate_by_url_hash("https://share.example/keep"));
    assert_eq!(
        reopened
            .is_duplicate_by_video_id("other_kJ4bR7xQ2mZ.mp4")
            .map(|r| r.filename),
        Some("clip_kJ4bR7xQ2mZ.mp4".to_string())
    );
}
