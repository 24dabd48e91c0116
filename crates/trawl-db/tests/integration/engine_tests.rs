use trawl_core::engine::{EngineConfig, FetchEngine};
use trawl_core::options::{FetchOptions, FileTarget};

use crate::integration::common::{CountingClient, open_in, row_count, setup_test_cache};

#[tokio::test]
async fn engine_serves_second_fetch_from_sqlite() {
    let (cache, dir) = setup_test_cache().await;
    let client = CountingClient::default();
    let engine =
        FetchEngine::new(client.clone(), cache.clone(), EngineConfig::new(dir.path())).unwrap();
    let options = FetchOptions::default();

    let first = engine.fetch_text("https://example.com/page", &options).await.unwrap();
    let second = engine.fetch_text("https://example.com/page", &options).await.unwrap();

    assert_eq!(first, "body of https://example.com/page");
    assert_eq!(second, first);
    assert_eq!(client.calls(), 1);
    assert_eq!(row_count(&cache).await, 1);
}

#[tokio::test]
async fn cache_is_shared_across_engine_restarts() {
    let (cache, dir) = setup_test_cache().await;
    let first_client = CountingClient::default();
    let engine =
        FetchEngine::new(first_client.clone(), cache, EngineConfig::new(dir.path())).unwrap();
    engine
        .fetch_text("https://example.com/restart", &FetchOptions::default())
        .await
        .unwrap();
    engine.close().await.unwrap();

    let second_client = CountingClient::default();
    let engine = FetchEngine::new(
        second_client.clone(),
        open_in(dir.path()).await,
        EngineConfig::new(dir.path()),
    )
    .unwrap();
    let response = engine
        .fetch("https://example.com/restart", &FetchOptions::default())
        .await
        .unwrap();

    assert!(response.from_cache);
    assert_eq!(second_client.calls(), 0);
}

#[tokio::test]
async fn file_fetch_is_cached_by_path() {
    let (cache, dir) = setup_test_cache().await;
    let client = CountingClient::default();
    let engine = FetchEngine::new(client.clone(), cache, EngineConfig::new(dir.path())).unwrap();
    let options = FetchOptions::default();

    let path = engine
        .fetch_file("https://example.com/files/data.csv", &options)
        .await
        .unwrap();
    let again = engine
        .fetch_file("https://example.com/files/data.csv", &options)
        .await
        .unwrap();

    assert_eq!(path, again);
    assert!(path.ends_with("data.csv"));
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "body of https://example.com/files/data.csv"
    );
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn deleted_body_file_is_rewritten_in_place() {
    let (cache, dir) = setup_test_cache().await;
    let client = CountingClient::default();
    let engine =
        FetchEngine::new(client.clone(), cache.clone(), EngineConfig::new(dir.path())).unwrap();
    let url = "https://example.com/files/report.csv";
    let to = |name: &str| FetchOptions::default().write_to(FileTarget::Path(name.into()));

    let first = engine.fetch_file(url, &to("a.csv")).await.unwrap();
    std::fs::remove_file(&first).unwrap();

    let second = engine.fetch_file(url, &to("b.csv")).await.unwrap();
    assert_eq!(second, dir.path().join("b.csv"));
    assert!(first.exists());
    assert_eq!(client.calls(), 2);
    assert_eq!(row_count(&cache).await, 1);

    let response = engine.fetch(url, &FetchOptions::default()).await.unwrap();
    assert!(response.from_cache);
    assert_eq!(client.calls(), 2);
}
