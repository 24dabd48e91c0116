use std::path::PathBuf;

use chrono::{Duration, Utc};
use trawl_core::error::AppError;
use trawl_core::models::{NewCacheEntry, RequestDescriptor, ResponseBody};
use trawl_core::traits::RequestCache;
use trawl_db::{CacheConfig, SqliteRequestCache};

use crate::integration::common::{bytes_entry, headers, open_in, row_count, setup_test_cache};

#[tokio::test]
async fn store_and_lookup_bytes_entry() {
    let (cache, _dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/a");

    cache
        .store(&bytes_entry(&descriptor, "hello", None))
        .await
        .unwrap();

    let entry = cache
        .lookup(&descriptor, Utc::now())
        .await
        .unwrap()
        .expect("Should find the entry");
    assert_eq!(entry.status, 200);
    assert_eq!(entry.request_key, descriptor.canonical_key());
    assert_eq!(entry.response_headers["content-type"], "text/plain");
    assert_eq!(entry.body, ResponseBody::Bytes("hello".into()));
    assert!(entry.expires_on.is_none());
}

#[tokio::test]
async fn lookup_misses_unknown_request() {
    let (cache, _dir) = setup_test_cache().await;
    let found = cache
        .lookup(&RequestDescriptor::get("https://example.com/none"), Utc::now())
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn different_headers_occupy_different_slots() {
    let (cache, _dir) = setup_test_cache().await;
    let mut english = RequestDescriptor::get("https://example.com/");
    english.headers = headers(&[("accept-language", "en")]);
    let mut french = english.clone();
    french.headers = headers(&[("accept-language", "fr")]);

    cache.store(&bytes_entry(&english, "hello", None)).await.unwrap();

    assert!(cache.lookup(&english, Utc::now()).await.unwrap().is_some());
    assert!(cache.lookup(&french, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_entry_is_a_miss_but_row_remains() {
    let (cache, _dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/ttl");
    let now = Utc::now();

    cache
        .store(&bytes_entry(&descriptor, "stale", Some(now - Duration::minutes(1))))
        .await
        .unwrap();

    assert!(cache.lookup(&descriptor, now).await.unwrap().is_none());
    assert_eq!(row_count(&cache).await, 1);
}

#[tokio::test]
async fn newest_expiry_wins_and_null_sorts_last() {
    let (cache, _dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/variants");
    let now = Utc::now();

    cache.store(&bytes_entry(&descriptor, "forever", None)).await.unwrap();
    cache
        .store(&bytes_entry(&descriptor, "one hour", Some(now + Duration::hours(1))))
        .await
        .unwrap();
    cache
        .store(&bytes_entry(&descriptor, "five hours", Some(now + Duration::hours(5))))
        .await
        .unwrap();

    let entry = cache.lookup(&descriptor, now).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::Bytes("five hours".into()));

    let later = now + Duration::hours(6);
    let entry = cache.lookup(&descriptor, later).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::Bytes("forever".into()));
}

#[tokio::test]
async fn duplicate_request_and_expiry_is_ignored() {
    let (cache, _dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/dup");
    let expiry = Utc::now() + Duration::hours(1);

    cache.store(&bytes_entry(&descriptor, "first", None)).await.unwrap();
    cache.store(&bytes_entry(&descriptor, "second", None)).await.unwrap();
    cache
        .store(&bytes_entry(&descriptor, "ttl first", Some(expiry)))
        .await
        .unwrap();
    cache
        .store(&bytes_entry(&descriptor, "ttl second", Some(expiry)))
        .await
        .unwrap();

    assert_eq!(row_count(&cache).await, 2);
    let entry = cache.lookup(&descriptor, Utc::now()).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::Bytes("ttl first".into()));
}

#[tokio::test]
async fn file_entry_records_path_only() {
    let (cache, dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/report.pdf");
    let path = dir.path().join("files").join("report.pdf");

    cache
        .store(&NewCacheEntry {
            request_key: descriptor.canonical_key(),
            status: 200,
            response_headers: headers(&[]),
            body: ResponseBody::File(path.clone()),
            expires_on: None,
        })
        .await
        .unwrap();

    let entry = cache.lookup(&descriptor, Utc::now()).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::File(path.clone()));
    assert!(!path.exists(), "the cache must not write body files");

    let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT response_body FROM requests")
        .fetch_one(cache.pool())
        .await
        .unwrap();
    assert!(blob.is_none());
}

#[tokio::test]
async fn entries_survive_reopen() {
    let (cache, dir) = setup_test_cache().await;
    let descriptor = RequestDescriptor::get("https://example.com/persist");
    cache
        .store(&bytes_entry(&descriptor, "kept", None))
        .await
        .unwrap();
    cache.close().await.unwrap();

    let reopened = open_in(dir.path()).await;
    let entry = reopened.lookup(&descriptor, Utc::now()).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::Bytes("kept".into()));
}

#[tokio::test]
async fn closed_cache_reports_database_error() {
    let (cache, _dir) = setup_test_cache().await;
    cache.close().await.unwrap();

    let err = cache
        .lookup(&RequestDescriptor::get("https://example.com/"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DatabaseError(_)));
}

#[tokio::test]
async fn connect_creates_missing_parent_folder() {
    let dir = tempfile::tempdir().unwrap();
    let nested: PathBuf = dir.path().join("scrapers").join("news");
    let cache = SqliteRequestCache::open(&CacheConfig::in_folder(&nested))
        .await
        .unwrap();

    assert!(nested.join("requests.db").exists());
    assert_eq!(row_count(&cache).await, 0);
}

#[tokio::test]
async fn in_memory_cache_round_trips() {
    let cache = SqliteRequestCache::open(&CacheConfig::in_memory())
        .await
        .unwrap();
    let descriptor = RequestDescriptor::get("https://example.com/mem");

    cache
        .store(&bytes_entry(&descriptor, "ephemeral", None))
        .await
        .unwrap();

    let entry = cache.lookup(&descriptor, Utc::now()).await.unwrap().unwrap();
    assert_eq!(entry.body, ResponseBody::Bytes("ephemeral".into()));
}
