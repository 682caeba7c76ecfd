mod common;

use std::time::Duration;

use common::TempDir;
use feedhook_core::storage::DEFAULT_SENT_CAP;
use feedhook_core::{PruneScope, SentStore};

fn ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("article-{i}")).collect()
}

#[tokio::test]
async fn default_cap_evicts_oldest_first() {
    let tmp = TempDir::new("cap");
    let store = SentStore::open(tmp.0.join("sent_articles.json"), Duration::from_secs(5));

    store.seed("f", "hook", ids(0..DEFAULT_SENT_CAP)).await.unwrap();
    assert_eq!(store.len().await.unwrap(), DEFAULT_SENT_CAP);

    store
        .seed("f", "hook", ids(DEFAULT_SENT_CAP..DEFAULT_SENT_CAP + 40))
        .await
        .unwrap();
    assert!(store.mark_sent("f", "hook", "latest").await.unwrap());

    let snapshot = store.load().await.unwrap();
    assert_eq!(snapshot.len(), DEFAULT_SENT_CAP);
    assert!(!snapshot.has_sent("f", "hook", "article-0"));
    assert!(!snapshot.has_sent("f", "hook", "article-40"));
    assert!(snapshot.has_sent("f", "hook", "article-41"));
    assert!(snapshot.has_sent("f", "hook", "latest"));
}

#[tokio::test]
async fn per_pair_cap_leaves_other_pairs_alone() {
    let tmp = TempDir::new("cap_pair");
    let store = SentStore::open(tmp.0.join("sent_articles.json"), Duration::from_secs(5))
        .with_cap(5, PruneScope::PerPair);

    store.seed("f", "quiet", ids(0..3)).await.unwrap();
    store.seed("f", "busy", ids(0..20)).await.unwrap();

    let snapshot = store.load().await.unwrap();
    assert_eq!(snapshot.history("f", "quiet").len(), 3);
    assert_eq!(snapshot.history("f", "busy"), ids(15..20).as_slice());
}

#[tokio::test]
async fn marking_twice_reports_known_article() {
    let tmp = TempDir::new("twice");
    let store = SentStore::open(tmp.0.join("sent_articles.json"), Duration::from_secs(5));
    assert!(store.mark_sent("f", "hook", "a").await.unwrap());
    assert!(!store.mark_sent("f", "hook", "a").await.unwrap());
    assert!(store.mark_sent("f", "other", "a").await.unwrap());
    assert_eq!(store.len().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_writers_lose_no_updates() {
    let tmp = TempDir::new("writers");
    let path = tmp.0.join("sent_articles.json");

    let mut handles = Vec::new();
    for writer in 0..8 {
        // separate handles share only the file lock, like separate processes
        let store = SentStore::open(&path, Duration::from_secs(30));
        handles.push(tokio::spawn(async move {
            for n in 0..25 {
                store
                    .mark_sent(&format!("feed-{writer}"), "hook", &format!("a-{n}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let raw = std::fs::read(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(parsed["entries"].as_array().unwrap().len(), 200);

    let snapshot = SentStore::open(&path, Duration::from_secs(5)).load().await.unwrap();
    for writer in 0..8 {
        assert_eq!(snapshot.history(&format!("feed-{writer}"), "hook").len(), 25);
    }
    assert!(!tmp.0.join("sent_articles.json.tmp").exists());
}

#[tokio::test]
async fn corrupt_file_falls_back_to_tmp_copy() {
    let tmp = TempDir::new("corrupt");
    let path = tmp.0.join("sent_articles.json");
    let store = SentStore::open(&path, Duration::from_secs(5));
    store.seed("f", "hook", ids(0..3)).await.unwrap();

    let good = std::fs::read(&path).unwrap();
    std::fs::write(tmp.0.join("sent_articles.json.tmp"), &good).unwrap();
    std::fs::write(&path, b"{ this is not JSON }").unwrap();

    let snapshot = store.load().await.unwrap();
    assert_eq!(snapshot.history("f", "hook"), ids(0..3).as_slice());

    // the next write repairs the target
    store.mark_sent("f", "hook", "fresh").await.unwrap();
    let repaired: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(repaired["entries"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn corrupt_file_without_tmp_starts_empty() {
    let tmp = TempDir::new("corrupt_empty");
    let path = tmp.0.join("sent_articles.json");
    std::fs::write(&path, b"[[[").unwrap();

    let store = SentStore::open(&path, Duration::from_secs(5));
    assert!(store.load().await.unwrap().is_empty());

    std::fs::write(&path, b"   \n").unwrap();
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn forgetting_a_webhook_keeps_siblings() {
    let tmp = TempDir::new("forget");
    let store = SentStore::open(tmp.0.join("sent_articles.json"), Duration::from_secs(5));
    store.seed("f", "one", ids(0..2)).await.unwrap();
    store.seed("f", "two", ids(0..2)).await.unwrap();
    store.seed("g", "one", ids(0..2)).await.unwrap();

    assert_eq!(store.forget_webhook("f", "one").await.unwrap(), 2);
    assert_eq!(store.forget_feed("g").await.unwrap(), 2);
    let snapshot = store.load().await.unwrap();
    assert!(!snapshot.has_history("f", "one"));
    assert!(snapshot.has_history("f", "two"));
    assert!(!snapshot.has_history("g", "one"));
}
